//! Service Relay Router
//!
//! Holds the single current upstream connection and routes frames between
//! it and the registered client connections. Client handlers rendezvous
//! with the upstream through a watch slot: they wait (bounded) until an
//! upstream is present, then pin it for the life of their connection.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;

use crate::connection::{Outbound, OutboundSender};
use crate::protocol::{ProtocolError, ServiceMessage};
use crate::registry::{ConnectionId, ConnectionRegistry, RegistryError};

/// Handle to the currently paired upstream connection
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    pub id: ConnectionId,
    /// The upstream connection's outbound queue
    pub sender: OutboundSender,
}

/// Errors raised by relay routing
#[derive(Debug, Error)]
pub enum RelayError {
    /// No upstream connection appeared within the rendezvous window
    #[error("no upstream connection became available within {0:?}")]
    UpstreamWaitTimeout(Duration),

    /// The paired upstream connection is gone
    #[error("upstream connection lost")]
    UpstreamGone,

    /// A frame could not be encoded for forwarding
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Routes frames between the upstream connection and registered clients
pub struct RelayRouter {
    registry: Arc<ConnectionRegistry>,
    upstream: watch::Sender<Option<UpstreamHandle>>,
    upstream_wait: Duration,
}

impl RelayRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, upstream_wait: Duration) -> Self {
        let (upstream, _) = watch::channel(None);
        Self {
            registry,
            upstream,
            upstream_wait,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Install a negotiated upstream connection. A later upstream
    /// supersedes the current one.
    pub fn set_upstream(&self, handle: UpstreamHandle) {
        let id = handle.id.clone();
        if let Some(previous) = self.upstream.send_replace(Some(handle)) {
            tracing::warn!(
                connection_id = %id,
                superseded = %previous.id,
                "new upstream connection supersedes the current one"
            );
        } else {
            tracing::info!(connection_id = %id, "upstream connection paired");
        }
    }

    /// Drop the upstream slot, but only if `id` is still the one paired.
    pub fn clear_upstream(&self, id: &str) {
        self.upstream.send_if_modified(|slot| {
            if slot.as_ref().is_some_and(|current| current.id == id) {
                *slot = None;
                tracing::info!(connection_id = %id, "upstream connection unpaired");
                true
            } else {
                false
            }
        });
    }

    /// Wait for an upstream connection to become available.
    ///
    /// The wait is bounded by the configured rendezvous window and is
    /// cancel-safe: dropping the future (client gone) or the router going
    /// away (shutdown) both end it cleanly.
    pub async fn wait_for_upstream(&self) -> Result<UpstreamHandle, RelayError> {
        let mut slot = self.upstream.subscribe();
        let result = match tokio::time::timeout(self.upstream_wait, slot.wait_for(Option::is_some)).await {
            Ok(Ok(current)) => current.as_ref().cloned().ok_or(RelayError::UpstreamGone),
            Ok(Err(_)) => Err(RelayError::UpstreamGone),
            Err(_) => Err(RelayError::UpstreamWaitTimeout(self.upstream_wait)),
        };
        result
    }

    /// Announce a newly connected client to the upstream.
    pub fn announce_open(
        &self,
        upstream: &UpstreamHandle,
        connection_id: &str,
    ) -> Result<(), RelayError> {
        let frame = ServiceMessage::OpenConnection {
            connection_id: connection_id.to_string(),
            headers: Vec::new(),
        }
        .encode()?;
        upstream
            .sender
            .send(Outbound::Binary(frame.into()))
            .map_err(|_| RelayError::UpstreamGone)
    }

    /// Forward one raw client payload to the upstream as ConnectionData.
    pub fn forward_client_payload(
        &self,
        upstream: &UpstreamHandle,
        connection_id: &str,
        payload: Bytes,
    ) -> Result<(), RelayError> {
        let frame = ServiceMessage::ConnectionData {
            connection_id: connection_id.to_string(),
            payload,
        }
        .encode()?;
        upstream
            .sender
            .send(Outbound::Binary(frame.into()))
            .map_err(|_| RelayError::UpstreamGone)
    }

    /// Tell the upstream a client is gone. Best-effort: teardown proceeds
    /// whether or not the upstream is still listening.
    pub fn announce_close(&self, upstream: &UpstreamHandle, connection_id: &str) {
        let frame = ServiceMessage::CloseConnection {
            connection_id: connection_id.to_string(),
            error_message: String::new(),
        }
        .encode();
        match frame {
            Ok(frame) => {
                if upstream.sender.send(Outbound::Binary(frame.into())).is_err() {
                    tracing::debug!(
                        connection_id = %connection_id,
                        "upstream gone before close announcement"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "failed to encode close announcement");
            }
        }
    }

    /// Route one decoded frame payload arriving from the upstream.
    ///
    /// Codec errors propagate to the caller, which logs and keeps the
    /// connection alive; routing misses are silent no-ops.
    pub async fn handle_upstream_frame(&self, payload: &[u8]) -> Result<(), ProtocolError> {
        let message = match ServiceMessage::decode(payload)? {
            Some(message) => message,
            None => {
                tracing::debug!("skipping frame with unknown message type");
                return Ok(());
            }
        };

        match message {
            ServiceMessage::Ping => {
                tracing::trace!("upstream ping");
            }
            ServiceMessage::BroadcastData {
                excluded_connection_ids,
                payloads,
            } => {
                let Some((codec, payload)) = payloads.into_iter().next() else {
                    tracing::debug!("broadcast frame carried no payloads");
                    return Ok(());
                };
                let exclude: HashSet<ConnectionId> =
                    excluded_connection_ids.into_iter().collect();
                let delivered = self
                    .registry
                    .broadcast(payload_frame(payload), &exclude)
                    .await;
                tracing::debug!(codec = %codec, delivered, "fanned out broadcast payload");
            }
            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => match self
                .registry
                .send_to(&connection_id, payload_frame(payload))
                .await
            {
                Ok(()) => {}
                Err(RegistryError::NotFound(_)) => {
                    tracing::trace!(connection_id = %connection_id, "dropping data for unknown connection");
                }
                Err(e) => {
                    tracing::warn!(connection_id = %connection_id, error = %e, "failed to deliver connection data");
                }
            },
            ServiceMessage::CloseConnection {
                connection_id,
                error_message,
            } => {
                let reason = if error_message.is_empty() {
                    None
                } else {
                    Some(error_message)
                };
                if !self.registry.close(&connection_id, reason).await {
                    tracing::trace!(connection_id = %connection_id, "close for unknown connection");
                }
            }
            ServiceMessage::HandshakeRequest { .. }
            | ServiceMessage::HandshakeResponse { .. }
            | ServiceMessage::OpenConnection { .. } => {
                tracing::warn!("ignoring handshake-phase message after negotiation");
            }
        }

        Ok(())
    }
}

/// Client deliveries keep the upstream's text framing when the payload is
/// UTF-8 and fall back to binary otherwise.
fn payload_frame(payload: Bytes) -> Outbound {
    match std::str::from_utf8(&payload) {
        Ok(text) => Outbound::Text(text.to_string()),
        Err(_) => Outbound::Binary(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameReader;
    use crate::registry::{ConnectionHandle, RegistryConfig};
    use tokio::sync::mpsc;

    fn router() -> RelayRouter {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig::default()));
        RelayRouter::new(registry, Duration::from_secs(5))
    }

    fn payload_of(message: &ServiceMessage) -> Vec<u8> {
        let frame = message.encode().unwrap();
        FrameReader::new(&frame).next().unwrap().unwrap().to_vec()
    }

    fn decode_sent(frame: Outbound) -> ServiceMessage {
        match frame {
            Outbound::Binary(bytes) => {
                let payload = FrameReader::new(&bytes).next().unwrap().unwrap();
                ServiceMessage::decode(payload).unwrap().unwrap()
            }
            other => panic!("expected binary frame, got {:?}", other),
        }
    }

    async fn register(
        router: &RelayRouter,
        id: &str,
    ) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        router
            .registry()
            .register(id, ConnectionHandle { sender: tx })
            .await
            .unwrap();
        rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_upstream_times_out() {
        let router = router();
        let err = router.wait_for_upstream().await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamWaitTimeout(_)));
    }

    #[tokio::test]
    async fn test_wait_for_upstream_sees_pairing() {
        let router = Arc::new(router());
        let (tx, _rx) = mpsc::unbounded_channel();

        let waiter = {
            let router = Arc::clone(&router);
            tokio::spawn(async move { router.wait_for_upstream().await })
        };

        router.set_upstream(UpstreamHandle {
            id: "up".to_string(),
            sender: tx,
        });

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.id, "up");
    }

    #[tokio::test]
    async fn test_clear_upstream_only_for_matching_id() {
        let router = router();
        let (tx, _rx) = mpsc::unbounded_channel();
        router.set_upstream(UpstreamHandle {
            id: "up".to_string(),
            sender: tx,
        });

        router.clear_upstream("someone-else");
        assert!(router.wait_for_upstream().await.is_ok());

        router.clear_upstream("up");
        let err = router.wait_for_upstream().await.unwrap_err();
        assert!(matches!(err, RelayError::UpstreamWaitTimeout(_)));
    }

    #[tokio::test]
    async fn test_client_lifecycle_frames_to_upstream() {
        let router = router();
        let (tx, mut upstream_rx) = mpsc::unbounded_channel();
        let upstream = UpstreamHandle {
            id: "up".to_string(),
            sender: tx,
        };

        router.announce_open(&upstream, "client-1").unwrap();
        router
            .forward_client_payload(&upstream, "client-1", Bytes::from_static(b"hello"))
            .unwrap();
        router.announce_close(&upstream, "client-1");

        match decode_sent(upstream_rx.try_recv().unwrap()) {
            ServiceMessage::OpenConnection {
                connection_id,
                headers,
            } => {
                assert_eq!(connection_id, "client-1");
                assert!(headers.is_empty());
            }
            other => panic!("expected open, got {:?}", other),
        }
        match decode_sent(upstream_rx.try_recv().unwrap()) {
            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => {
                assert_eq!(connection_id, "client-1");
                assert_eq!(&payload[..], b"hello");
            }
            other => panic!("expected data, got {:?}", other),
        }
        match decode_sent(upstream_rx.try_recv().unwrap()) {
            ServiceMessage::CloseConnection {
                connection_id,
                error_message,
            } => {
                assert_eq!(connection_id, "client-1");
                assert!(error_message.is_empty());
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_forwarding_to_dead_upstream_errors() {
        let router = router();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let upstream = UpstreamHandle {
            id: "up".to_string(),
            sender: tx,
        };

        let err = router
            .forward_client_payload(&upstream, "client-1", Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(err, RelayError::UpstreamGone));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let router = router();
        let mut rx_b = register(&router, "b").await;
        let mut rx_c = register(&router, "c").await;

        let payload = payload_of(&ServiceMessage::BroadcastData {
            excluded_connection_ids: vec![],
            payloads: vec![("json".to_string(), Bytes::from_static(b"payload"))],
        });
        router.handle_upstream_frame(&payload).await.unwrap();

        for rx in [&mut rx_b, &mut rx_c] {
            match rx.try_recv().unwrap() {
                Outbound::Text(text) => assert_eq!(text, "payload"),
                other => panic!("expected text, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_broadcast_honors_exclude_list() {
        let router = router();
        let mut rx_b = register(&router, "b").await;
        let mut rx_c = register(&router, "c").await;

        let payload = payload_of(&ServiceMessage::BroadcastData {
            excluded_connection_ids: vec!["b".to_string()],
            payloads: vec![("json".to_string(), Bytes::from_static(b"payload"))],
        });
        router.handle_upstream_frame(&payload).await.unwrap();

        assert!(rx_b.try_recv().is_err());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_connection_data_routes_to_one_client() {
        let router = router();
        let mut rx_b = register(&router, "b").await;
        let mut rx_c = register(&router, "c").await;

        let payload = payload_of(&ServiceMessage::ConnectionData {
            connection_id: "c".to_string(),
            payload: Bytes::from_static(b"just for c"),
        });
        router.handle_upstream_frame(&payload).await.unwrap();

        assert!(rx_b.try_recv().is_err());
        match rx_c.try_recv().unwrap() {
            Outbound::Text(text) => assert_eq!(text, "just for c"),
            other => panic!("expected text, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connection_data_for_unknown_id_is_silent() {
        let router = router();
        let payload = payload_of(&ServiceMessage::ConnectionData {
            connection_id: "ghost".to_string(),
            payload: Bytes::from_static(b"x"),
        });
        // No error, no panic: a routing miss is not a failure.
        router.handle_upstream_frame(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_connection_tears_down_client() {
        let router = router();
        let mut rx_b = register(&router, "b").await;

        let payload = payload_of(&ServiceMessage::CloseConnection {
            connection_id: "b".to_string(),
            error_message: "upstream said so".to_string(),
        });
        router.handle_upstream_frame(&payload).await.unwrap();

        match rx_b.try_recv().unwrap() {
            Outbound::Close { reason } => {
                assert_eq!(reason.as_deref(), Some("upstream said so"));
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert!(router.registry().lookup("b").await.is_none());
    }

    #[tokio::test]
    async fn test_non_utf8_payload_delivered_as_binary() {
        let router = router();
        let mut rx_b = register(&router, "b").await;

        let payload = payload_of(&ServiceMessage::ConnectionData {
            connection_id: "b".to_string(),
            payload: Bytes::from_static(&[0xff, 0xfe, 0x00]),
        });
        router.handle_upstream_frame(&payload).await.unwrap();

        match rx_b.try_recv().unwrap() {
            Outbound::Binary(bytes) => assert_eq!(&bytes[..], &[0xff, 0xfe, 0x00]),
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_frame_type_is_skipped() {
        let router = router();
        let mut payload = Vec::new();
        rmpv::encode::write_value(
            &mut payload,
            &rmpv::Value::Array(vec![rmpv::Value::from(42)]),
        )
        .unwrap();
        router.handle_upstream_frame(&payload).await.unwrap();
    }
}
