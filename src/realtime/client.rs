//! Pool-side handle of one live connection.

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use super::envelope::Envelope;

pub type ConnectionId = Uuid;

/// Why the pool asked a connection to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection registered under the same login.
    Superseded,
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Superseded => "superseded",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Registry entry for a connection. Owned by the pool loop.
#[derive(Debug)]
pub struct Client {
    id: ConnectionId,
    login: String,
    outbound: mpsc::Sender<Envelope>,
    close: Option<oneshot::Sender<CloseReason>>,
}

/// Connection-side ends of a [`Client`]: the outbound queue to write to the
/// socket and the close signal from the pool.
#[derive(Debug)]
pub struct ClientSession {
    pub id: ConnectionId,
    pub login: String,
    pub outbound: mpsc::Receiver<Envelope>,
    pub closed: oneshot::Receiver<CloseReason>,
}

impl Client {
    /// New client with an outbound queue of `buffer` envelopes (at least one).
    pub fn new(login: impl Into<String>, buffer: usize) -> (Self, ClientSession) {
        let login = login.into();
        let id = Uuid::new_v4();
        let (outbound_tx, outbound_rx) = mpsc::channel(buffer.max(1));
        let (close_tx, close_rx) = oneshot::channel();

        let client = Self {
            id,
            login: login.clone(),
            outbound: outbound_tx,
            close: Some(close_tx),
        };
        let session = ClientSession {
            id,
            login,
            outbound: outbound_rx,
            closed: close_rx,
        };
        (client, session)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub(crate) fn try_send(
        &self,
        envelope: Envelope,
    ) -> Result<(), mpsc::error::TrySendError<Envelope>> {
        self.outbound.try_send(envelope)
    }

    /// Ask the connection to close. The socket is closed by its own task.
    pub(crate) fn close(mut self, reason: CloseReason) {
        if let Some(close) = self.close.take() {
            let _ = close.send(reason);
        }
    }
}
