//! `GET /ws`: the live connection of a client.
//!
//! The credential is verified before the upgrade is accepted. After that
//! the socket task forwards frames queued by the [`SocketHub`] and feeds
//! client heartbeats into presence. Whatever ends the task, the
//! [`SessionGuard`] tells the lifecycle the connection is gone.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header::AUTHORIZATION, HeaderMap},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use parley_shared::protocol::{ClientEvent, ServerEvent};
use parley_shared::ConnectionId;

use crate::api::{ApiQuery, AppState};
use crate::error::ServerError;
use crate::identity::IdentityError;
use crate::lifecycle::ConnectionLifecycle;
use crate::transport::{Outbound, SocketHub};

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// Runs the disconnect side of the lifecycle when dropped.
struct SessionGuard {
    connection_id: ConnectionId,
    lifecycle: Arc<ConnectionLifecycle>,
    hub: Arc<SocketHub>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.detach(&self.connection_id);
        self.lifecycle.on_disconnect(&self.connection_id);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SocketQuery>,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    // Browsers cannot set headers on a WebSocket handshake, so the query
    // parameter comes first.
    let token = query
        .token
        .or_else(|| {
            headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .filter(|t| !t.trim().is_empty())
        .ok_or(IdentityError::MissingCredential)?;

    let connection_id = ConnectionId::generate();
    let outbox = state.hub.attach(&connection_id);
    let guard = SessionGuard {
        connection_id: connection_id.clone(),
        lifecycle: state.lifecycle.clone(),
        hub: state.hub.clone(),
    };

    state.lifecycle.on_connect(&connection_id, &token).await?;

    Ok(ws.on_upgrade(move |socket| run_socket(socket, guard, outbox)))
}

async fn run_socket(socket: WebSocket, guard: SessionGuard, mut outbox: mpsc::Receiver<Outbound>) {
    let connection_id = guard.connection_id.clone();
    let (mut sink, mut stream) = socket.split();

    let hello = ServerEvent::Connected {
        connection_id: connection_id.clone(),
    };
    match hello.to_json() {
        Ok(frame) => {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                return;
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode connected event"),
    }

    loop {
        tokio::select! {
            outbound = outbox.recv() => match outbound {
                Some(Outbound::Frame(frame)) => {
                    if let Err(e) = sink.send(WsMessage::Text(frame)).await {
                        debug!(connection = %connection_id, error = %e, "Socket write failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_client_frame(&guard.lifecycle, &connection_id, &text);
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = %connection_id, error = %e, "Socket read failed");
                    break;
                }
            },
        }
    }

    drop(guard);
}

fn handle_client_frame(lifecycle: &ConnectionLifecycle, connection_id: &ConnectionId, text: &str) {
    match ClientEvent::from_json(text) {
        Ok(ClientEvent::Heartbeat) => {
            if lifecycle.heartbeat(connection_id).is_none() {
                debug!(connection = %connection_id, "Heartbeat on a closed connection");
            }
        }
        Err(_) => debug!(connection = %connection_id, "Ignoring unknown client frame"),
    }
}
