//! Per-Connection Plumbing
//!
//! Broadcast fan-out, the connection's own reply path, and the keepalive
//! task may all want to write to the same socket. Writes are serialized
//! through one unbounded queue per connection, drained by a single writer
//! task; everything else only ever holds the queue's sender.

use std::borrow::Cow;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One queued outbound frame
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Text WebSocket frame
    Text(String),
    /// Binary WebSocket frame
    Binary(Bytes),
    /// Close the connection after draining everything queued before it
    Close { reason: Option<String> },
}

/// Sender half of a connection's outbound queue
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Generate an opaque connection identifier: 16 random bytes, standard
/// base64.
pub fn generate_connection_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    BASE64_STANDARD.encode(bytes)
}

/// Spawn the single writer task for a connection.
///
/// The task drains the queue into the WebSocket sink and exits when the
/// queue closes, a `Close` frame is sent, or the sink errors. Once it
/// returns, nothing writes to the socket again.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            let message = match frame {
                Outbound::Text(text) => Message::Text(text),
                Outbound::Binary(payload) => Message::Binary(payload.to_vec()),
                Outbound::Close { reason } => {
                    let close = CloseFrame {
                        code: close_code::NORMAL,
                        reason: reason.map(Cow::Owned).unwrap_or(Cow::Borrowed("")),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
    })
}

/// Spawn the keepalive task for a negotiated connection.
///
/// Sends the protocol-specific ping frame through the connection's queue
/// on a fixed interval. The task exits on its own when the queue closes;
/// teardown aborts it before the transport goes away.
pub fn spawn_keepalive(
    sender: OutboundSender,
    ping: Outbound,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The immediate first tick; peers expect pings only after a full
        // interval of silence.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if sender.send(ping.clone()).is_err() {
                return;
            }
        }
    })
}
