//! WebSocket Handlers
//!
//! Upgrade handlers for the three socket endpoints and the per-connection
//! drivers behind them. Every driver follows the same shape: split the
//! socket, hand the sink to a single writer task, run the handshake, then
//! consume frames sequentially until the transport ends. Teardown always
//! stops the keepalive, drops the registry entry, cancels owned
//! background work, and lets the writer drain before the socket goes away.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::state::AppState;
use crate::connection::{generate_connection_id, spawn_keepalive, spawn_writer, Outbound};
use crate::handshake::{HubHandshake, HandshakeStep, ServiceHandshake};
use crate::hub::{DispatchOutcome, HubConnection};
use crate::protocol::hub::split_records;
use crate::protocol::FrameReader;
use crate::registry::ConnectionHandle;
use crate::relay::UpstreamHandle;

/// Connection id supplied by the negotiate step; generated when absent
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub id: Option<String>,
}

/// GET /server — the upstream relay endpoint attaches here
pub async fn upstream_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let connection_id = query.id.unwrap_or_else(generate_connection_id);
    ws.on_upgrade(move |socket| run_upstream(socket, state, connection_id))
}

/// GET /client — downstream clients of the service variant
pub async fn client_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let connection_id = query.id.unwrap_or_else(generate_connection_id);
    ws.on_upgrade(move |socket| run_client(socket, state, connection_id))
}

/// GET on the hub path — browser-style hub clients
pub async fn hub_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let connection_id = query.id.unwrap_or_else(generate_connection_id);
    ws.on_upgrade(move |socket| run_hub(socket, state, connection_id))
}

/// Service-protocol ping frame; the wire bytes are fixed (length 2,
/// one-element array, type 3).
fn service_ping() -> Outbound {
    Outbound::Binary(Bytes::from_static(&[0x02, 0x91, 0x03]))
}

/// Hub-protocol ping record
fn hub_ping() -> Outbound {
    Outbound::Text("{\"type\":6}\u{1e}".to_string())
}

/// Pull the next data-bearing message off the socket, skipping transport
/// ping/pong. `None` means the connection is gone.
async fn next_payload(stream: &mut SplitStream<WebSocket>) -> Option<Vec<u8>> {
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(data)) => return Some(data),
            Ok(Message::Text(text)) => return Some(text.into_bytes()),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket receive error");
                return None;
            }
        }
    }
    None
}

/// Drive the upstream side of the service variant.
async fn run_upstream(socket: WebSocket, state: Arc<AppState>, connection_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(sink, rx);

    let first = match next_payload(&mut stream).await {
        Some(payload) => payload,
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let mut handshake =
        ServiceHandshake::new(state.config.relay.supported_protocol_versions.clone());
    match handshake.handle_message(&first) {
        Ok(HandshakeStep::Accepted { response }) => {
            let _ = tx.send(Outbound::Binary(response.into()));
        }
        Ok(HandshakeStep::Rejected { response, reason }) => {
            tracing::warn!(connection_id = %connection_id, reason = %reason, "upstream handshake rejected");
            let _ = tx.send(Outbound::Binary(response.into()));
            let _ = tx.send(Outbound::Close {
                reason: Some(reason),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "upstream handshake failed");
            let _ = tx.send(Outbound::Close {
                reason: Some(e.to_string()),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
    }
    tracing::info!(connection_id = %connection_id, "upstream connection negotiated");

    state.relay.set_upstream(UpstreamHandle {
        id: connection_id.clone(),
        sender: tx.clone(),
    });
    let keepalive = spawn_keepalive(tx.clone(), service_ping(), state.keepalive_interval());

    'read: while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "upstream receive error");
                break;
            }
        };

        for frame in FrameReader::new(&data) {
            match frame {
                Ok(payload) => {
                    if let Err(e) = state.relay.handle_upstream_frame(payload).await {
                        tracing::warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "dropping malformed upstream frame"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "upstream framing error");
                    break 'read;
                }
            }
        }
    }

    state.relay.clear_upstream(&connection_id);
    keepalive.abort();
    // Clients still holding the upstream handle keep the queue alive; an
    // explicit close lets the writer exit without waiting for them.
    let _ = tx.send(Outbound::Close { reason: None });
    drop(tx);
    let _ = writer.await;
    tracing::info!(connection_id = %connection_id, "upstream connection closed");
}

/// Drive a downstream client of the service variant.
async fn run_client(socket: WebSocket, state: Arc<AppState>, connection_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(sink, rx);

    // Rendezvous: no client traffic flows until an upstream is paired.
    let upstream = match state.relay.wait_for_upstream().await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "failing client connection");
            let _ = tx.send(Outbound::Close {
                reason: Some(e.to_string()),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    if let Err(e) = state.relay.announce_open(&upstream, &connection_id) {
        tracing::warn!(connection_id = %connection_id, error = %e, "failed to announce client");
        let _ = tx.send(Outbound::Close {
            reason: Some(e.to_string()),
        });
        drop(tx);
        let _ = writer.await;
        return;
    }

    if let Err(e) = state
        .registry
        .register(&connection_id, ConnectionHandle { sender: tx.clone() })
        .await
    {
        tracing::warn!(connection_id = %connection_id, error = %e, "failed to register client");
        state.relay.announce_close(&upstream, &connection_id);
        let _ = tx.send(Outbound::Close {
            reason: Some(e.to_string()),
        });
        drop(tx);
        let _ = writer.await;
        return;
    }
    tracing::info!(connection_id = %connection_id, "client connection established");

    while let Some(message) = stream.next().await {
        let payload: Bytes = match message {
            Ok(Message::Binary(data)) => data.into(),
            Ok(Message::Text(text)) => text.into_bytes().into(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "client receive error");
                break;
            }
        };

        if let Err(e) = state
            .relay
            .forward_client_payload(&upstream, &connection_id, payload)
        {
            tracing::warn!(connection_id = %connection_id, error = %e, "upstream gone, closing client");
            break;
        }
    }

    state.relay.announce_close(&upstream, &connection_id);
    state.registry.unregister(&connection_id).await;
    let _ = tx.send(Outbound::Close { reason: None });
    drop(tx);
    let _ = writer.await;
    tracing::info!(connection_id = %connection_id, "client connection closed");
}

/// Drive a hub-variant connection.
async fn run_hub(socket: WebSocket, state: Arc<AppState>, connection_id: String) {
    let (sink, mut stream) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = spawn_writer(sink, rx);

    let first = match next_payload(&mut stream).await {
        Some(payload) => payload,
        None => {
            drop(tx);
            let _ = writer.await;
            return;
        }
    };

    let mut handshake = HubHandshake::new(state.config.hub.supported_protocols.clone());
    match handshake.handle_message(&first) {
        Ok(HandshakeStep::Accepted { response }) => {
            let _ = tx.send(Outbound::Text(response));
        }
        Ok(HandshakeStep::Rejected { response, reason }) => {
            tracing::warn!(connection_id = %connection_id, reason = %reason, "hub handshake rejected");
            let _ = tx.send(Outbound::Text(response));
            let _ = tx.send(Outbound::Close {
                reason: Some(reason),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
        Err(e) => {
            tracing::warn!(connection_id = %connection_id, error = %e, "hub handshake failed");
            let _ = tx.send(Outbound::Close {
                reason: Some(e.to_string()),
            });
            drop(tx);
            let _ = writer.await;
            return;
        }
    }

    if let Err(e) = state
        .registry
        .register(&connection_id, ConnectionHandle { sender: tx.clone() })
        .await
    {
        tracing::warn!(connection_id = %connection_id, error = %e, "failed to register hub connection");
        let _ = tx.send(Outbound::Close {
            reason: Some(e.to_string()),
        });
        drop(tx);
        let _ = writer.await;
        return;
    }
    tracing::info!(connection_id = %connection_id, "hub connection negotiated");

    let cancel = CancellationToken::new();
    let keepalive = spawn_keepalive(tx.clone(), hub_ping(), state.keepalive_interval());
    let connection = HubConnection {
        id: connection_id.clone(),
        sender: tx.clone(),
        cancel: cancel.clone(),
    };

    'read: while let Some(message) = stream.next().await {
        let data = match message {
            Ok(Message::Text(text)) => text.into_bytes(),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "hub receive error");
                break;
            }
        };

        for record in split_records(&data) {
            match record {
                Ok(record) => match state.dispatcher.dispatch_record(&connection, record).await {
                    Ok(DispatchOutcome::Continue) => {}
                    Ok(DispatchOutcome::Close) => {
                        let _ = tx.send(Outbound::Close { reason: None });
                        break 'read;
                    }
                    Err(e) => {
                        tracing::warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "dropping malformed hub record"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "hub framing error");
                    break 'read;
                }
            }
        }
    }

    // Teardown order matters: cancel owned work before the writer drains
    // so nothing tries to queue frames for a dead socket.
    cancel.cancel();
    keepalive.abort();
    state.registry.unregister(&connection_id).await;
    let _ = tx.send(Outbound::Close { reason: None });
    drop(connection);
    drop(tx);
    let _ = writer.await;
    tracing::info!(connection_id = %connection_id, "hub connection closed");
}
