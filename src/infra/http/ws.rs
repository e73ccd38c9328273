//! Live connection endpoint.
//!
//! Only registered logins are upgraded. Each socket gets two halves: this
//! task reads client frames and forwards them to the pool, a spawned writer
//! drains the client's outbound queue and closes the socket when the pool
//! says so.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::application::error::{HttpError, repo_to_http};
use crate::application::repos::{RepoError, UserStore};
use crate::realtime::client::{Client, ClientSession, CloseReason};
use crate::realtime::envelope::Envelope;
use crate::realtime::pool::InboundMessage;

use super::HttpState;

const CONNECT_ERROR_SOURCE: &str = "infra::http::ws::connect";

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("no user with login `{0}`")]
    UnknownLogin(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<ConnectError> for HttpError {
    fn from(error: ConnectError) -> Self {
        match &error {
            ConnectError::UnknownLogin(_) => HttpError::new(
                CONNECT_ERROR_SOURCE,
                StatusCode::NOT_FOUND,
                "User not found",
                error.to_string(),
            ),
            ConnectError::Repo(err) => repo_to_http(CONNECT_ERROR_SOURCE, err),
        }
    }
}

async fn ensure_registered(users: &dyn UserStore, login: &str) -> Result<(), ConnectError> {
    match users.author_by_login(login).await? {
        Some(_) => Ok(()),
        None => Err(ConnectError::UnknownLogin(login.to_string())),
    }
}

pub async fn connect(
    State(state): State<HttpState>,
    Path(login): Path<String>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, HttpError> {
    ensure_registered(state.users.as_ref(), &login).await?;

    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return Ok(rejection.into_response()),
    };
    Ok(ws.on_upgrade(move |socket| serve_connection(socket, login, state)))
}

/// Envelope for a client frame that carries data. Binary payloads are read as
/// lossy UTF-8.
fn inbound_envelope(message: &Message) -> Option<Envelope> {
    match message {
        Message::Text(text) => Some(Envelope::inbound(text.as_str())),
        Message::Binary(bytes) => Some(Envelope::inbound(&String::from_utf8_lossy(bytes))),
        _ => None,
    }
}

async fn serve_connection(socket: WebSocket, login: String, state: HttpState) {
    let (client, session) = Client::new(login, state.outbound_buffer);
    if state.connections.register(client).await.is_err() {
        debug!(login = %session.login, "Pool closed; refusing connection");
        return;
    }

    let ClientSession {
        id,
        login,
        outbound,
        closed,
    } = session;
    info!(login = %login, connection = %id, "Live connection opened");

    let (sink, mut stream) = socket.split();
    let mut writer = tokio::spawn(write_loop(sink, outbound, closed));

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(message)) => {
                    if let Some(envelope) = inbound_envelope(&message) {
                        let message = InboundMessage {
                            login: login.clone(),
                            connection: id,
                            envelope,
                        };
                        state.connections.inbound(message).await;
                    }
                }
                Some(Err(err)) => {
                    debug!(login = %login, error = %err, "Live connection read failed");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    state.connections.unregister(&login, id).await;
    writer.abort();
    info!(login = %login, connection = %id, "Live connection closed");
}

/// Forward queued envelopes to `sink` until the pool closes the connection or
/// the socket stops accepting frames.
async fn write_loop<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Envelope>,
    mut closed: oneshot::Receiver<CloseReason>,
) where
    S: Sink<Message> + Unpin,
{
    loop {
        tokio::select! {
            reason = &mut closed => {
                let reason = reason.unwrap_or(CloseReason::Shutdown);
                if reason == CloseReason::Superseded {
                    let notice = Envelope::notice(reason.as_str());
                    if let Ok(text) = serde_json::to_string(&notice) {
                        let _ = sink.send(Message::Text(text.into())).await;
                    }
                }
                let frame = CloseFrame {
                    code: close_code::NORMAL,
                    reason: Utf8Bytes::from_static(reason.as_str()),
                };
                let _ = sink.send(Message::Close(Some(frame))).await;
                break;
            }
            envelope = outbound.recv() => {
                let Some(envelope) = envelope else {
                    break;
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = %err, "Dropping unserializable envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
