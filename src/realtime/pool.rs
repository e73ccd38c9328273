//! Registry of live connections, owned by a single control loop.
//!
//! Every mutation of the login → client map happens on the loop task; other
//! tasks talk to it through [`PoolHandle`]. The loop never awaits a client:
//! outbound envelopes go through `try_send` and are dropped when the
//! client's queue is full. Control messages are taken in a fixed priority
//! order, so a query observes every registration and notification queued
//! before it.

use std::collections::HashMap;

use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::client::{Client, CloseReason, ConnectionId};
use super::envelope::Envelope;

const METRIC_DROPPED: &str = "murmur_realtime_dropped_total";
const METRIC_CONNECTIONS: &str = "murmur_realtime_connections";

/// Default capacity of each control channel.
pub const DEFAULT_CONTROL_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
#[error("connection pool is not accepting registrations")]
pub struct PoolClosed;

/// Message received from a client, forwarded to the loop for logging.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub login: String,
    pub connection: ConnectionId,
    pub envelope: Envelope,
}

#[derive(Debug)]
struct Notification {
    login: String,
    envelope: Envelope,
}

#[derive(Debug)]
enum PoolQuery {
    Connection {
        login: String,
        reply: oneshot::Sender<Option<ConnectionId>>,
    },
    Len(oneshot::Sender<usize>),
}

/// Cloneable sending side of the pool's control channels.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    register: mpsc::Sender<Client>,
    unregister: mpsc::Sender<(String, ConnectionId)>,
    inbound: mpsc::Sender<InboundMessage>,
    notify: mpsc::Sender<Notification>,
    query: mpsc::Sender<PoolQuery>,
}

impl PoolHandle {
    pub async fn register(&self, client: Client) -> Result<(), PoolClosed> {
        self.register.send(client).await.map_err(|_| PoolClosed)
    }

    /// Remove `login` if `connection` is still the one registered for it.
    pub async fn unregister(&self, login: &str, connection: ConnectionId) {
        let _ = self
            .unregister
            .send((login.to_string(), connection))
            .await;
    }

    pub async fn inbound(&self, message: InboundMessage) {
        let _ = self.inbound.send(message).await;
    }

    /// Queue `envelope` for the connection registered under `login`, if any.
    pub async fn notify(&self, login: &str, envelope: Envelope) {
        let notification = Notification {
            login: login.to_string(),
            envelope,
        };
        if self.notify.send(notification).await.is_err() {
            debug!(login, "Connection pool stopped; notification discarded");
        }
    }

    /// Connection currently registered for `login`.
    pub async fn connection_for(&self, login: &str) -> Option<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        let query = PoolQuery::Connection {
            login: login.to_string(),
            reply,
        };
        self.query.send(query).await.ok()?;
        rx.await.ok().flatten()
    }

    pub async fn is_connected(&self, login: &str) -> bool {
        self.connection_for(login).await.is_some()
    }

    /// Number of registered connections; zero once the pool has stopped.
    pub async fn len(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.query.send(PoolQuery::Len(reply)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

pub struct ConnectionPool {
    register: mpsc::Receiver<Client>,
    unregister: mpsc::Receiver<(String, ConnectionId)>,
    inbound: mpsc::Receiver<InboundMessage>,
    notify: mpsc::Receiver<Notification>,
    query: mpsc::Receiver<PoolQuery>,
    shutdown: watch::Receiver<bool>,
    clients: HashMap<String, Client>,
}

impl ConnectionPool {
    pub fn new(shutdown: watch::Receiver<bool>) -> (Self, PoolHandle) {
        Self::with_buffer(DEFAULT_CONTROL_BUFFER, shutdown)
    }

    pub fn with_buffer(buffer: usize, shutdown: watch::Receiver<bool>) -> (Self, PoolHandle) {
        let buffer = buffer.max(1);
        let (register_tx, register_rx) = mpsc::channel(buffer);
        let (unregister_tx, unregister_rx) = mpsc::channel(buffer);
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer);
        let (notify_tx, notify_rx) = mpsc::channel(buffer);
        let (query_tx, query_rx) = mpsc::channel(buffer);

        let pool = Self {
            register: register_rx,
            unregister: unregister_rx,
            inbound: inbound_rx,
            notify: notify_rx,
            query: query_rx,
            shutdown,
            clients: HashMap::new(),
        };
        let handle = PoolHandle {
            register: register_tx,
            unregister: unregister_tx,
            inbound: inbound_tx,
            notify: notify_tx,
            query: query_tx,
        };
        (pool, handle)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve control messages until shutdown is signalled or its sender is dropped.
    pub async fn run(mut self) {
        info!("Connection pool started");
        loop {
            if *self.shutdown.borrow_and_update() {
                break;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(client) = self.register.recv() => self.register(client),
                Some((login, connection)) = self.unregister.recv() => {
                    self.unregister(&login, connection)
                }
                Some(notification) = self.notify.recv() => self.deliver(notification),
                Some(message) = self.inbound.recv() => {
                    debug!(
                        login = %message.login,
                        connection = %message.connection,
                        kind = message.envelope.kind,
                        data = %message.envelope.data,
                        "Inbound client message"
                    );
                }
                Some(query) = self.query.recv() => self.answer(query),
            }
        }
        self.close_all();
    }

    fn register(&mut self, client: Client) {
        let login = client.login().to_string();
        let connection = client.id();
        if let Some(previous) = self.clients.insert(login.clone(), client) {
            info!(login = %login, previous = %previous.id(), "Closing superseded connection");
            previous.close(CloseReason::Superseded);
        }
        info!(login = %login, connection = %connection, "Client registered");
        gauge!(METRIC_CONNECTIONS).set(self.clients.len() as f64);
    }

    fn unregister(&mut self, login: &str, connection: ConnectionId) {
        match self.clients.get(login) {
            Some(current) if current.id() == connection => {
                self.clients.remove(login);
                info!(login, connection = %connection, "Client unregistered");
                gauge!(METRIC_CONNECTIONS).set(self.clients.len() as f64);
            }
            Some(_) => debug!(login, connection = %connection, "Ignoring stale unregister"),
            None => debug!(login, "Unregister for unknown login"),
        }
    }

    fn deliver(&mut self, notification: Notification) {
        let Some(client) = self.clients.get(&notification.login) else {
            return;
        };
        match client.try_send(notification.envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(METRIC_DROPPED).increment(1);
                warn!(login = %notification.login, "Outbound queue full; envelope dropped");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(login = %notification.login, "Connection writer gone; envelope dropped");
            }
        }
    }

    fn answer(&self, query: PoolQuery) {
        match query {
            PoolQuery::Connection { login, reply } => {
                let _ = reply.send(self.clients.get(&login).map(Client::id));
            }
            PoolQuery::Len(reply) => {
                let _ = reply.send(self.clients.len());
            }
        }
    }

    fn close_all(&mut self) {
        let closed = self.clients.len();
        for (_, client) in self.clients.drain() {
            client.close(CloseReason::Shutdown);
        }
        gauge!(METRIC_CONNECTIONS).set(0.0);
        info!(closed, "Connection pool stopped");
    }
}
