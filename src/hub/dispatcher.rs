//! Hub Invocation Dispatcher
//!
//! One dispatcher serves every hub connection. Per-connection state (the
//! outbound queue and the cancellation token bounding owned background
//! work) travels in a [`HubConnection`] built by the socket driver.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::handlers::{SendHandler, StreamHandler};
use super::HubError;
use crate::connection::{Outbound, OutboundSender};
use crate::protocol::hub::{self, CompletionMessage, Envelope, InboundKind, InvocationMessage};
use crate::protocol::{MessageTypeTable, ProtocolError};
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Per-connection context handed to the dispatcher with every record
#[derive(Debug, Clone)]
pub struct HubConnection {
    pub id: ConnectionId,
    /// The connection's outbound queue (reply path)
    pub sender: OutboundSender,
    /// Cancelled when the connection tears down; background work spawned
    /// for this connection must watch a child of it
    pub cancel: CancellationToken,
}

/// Everything a handler may need: identity, correlation, reply path,
/// registry access for broadcasts, and the connection lifetime signal
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub connection_id: ConnectionId,
    pub invocation_id: String,
    pub sender: OutboundSender,
    pub registry: Arc<ConnectionRegistry>,
    pub cancel: CancellationToken,
}

/// What a handler produced
#[derive(Debug)]
pub enum HandlerResult {
    /// An immediate result; the dispatcher sends the completion
    Value(Option<Value>),
    /// The handler spawned work that owns the rest of the exchange,
    /// including the terminal completion
    Detached,
}

/// A named remotely invocable operation
#[async_trait]
pub trait InvocationHandler: Send + Sync {
    /// Target name; matched case-insensitively
    fn name(&self) -> &str;

    /// Execute the invocation
    async fn invoke(
        &self,
        context: InvocationContext,
        arguments: &[Value],
    ) -> Result<HandlerResult, HubError>;
}

/// What the socket driver should do after a record is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Continue,
    Close,
}

/// Decodes hub records and routes invocations to handlers
pub struct HubDispatcher {
    registry: Arc<ConnectionRegistry>,
    handlers: HashMap<String, Arc<dyn InvocationHandler>>,
    types: MessageTypeTable,
}

impl HubDispatcher {
    /// Dispatcher with no handlers and the legacy type table.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self::with_table(registry, MessageTypeTable::legacy())
    }

    pub fn with_table(registry: Arc<ConnectionRegistry>, types: MessageTypeTable) -> Self {
        Self {
            registry,
            handlers: HashMap::new(),
            types,
        }
    }

    /// Dispatcher with the built-in `send` and `stream` targets.
    pub fn with_builtin_handlers(registry: Arc<ConnectionRegistry>) -> Self {
        let mut dispatcher = Self::new(registry);
        dispatcher.register_handler(Arc::new(SendHandler));
        dispatcher.register_handler(Arc::new(StreamHandler::default()));
        dispatcher
    }

    /// Register a handler under its case-folded name.
    pub fn register_handler(&mut self, handler: Arc<dyn InvocationHandler>) {
        self.handlers
            .insert(handler.name().to_lowercase(), handler);
    }

    pub fn message_types(&self) -> &MessageTypeTable {
        &self.types
    }

    /// Decode and dispatch one record from a negotiated connection.
    ///
    /// Errors are codec-level: the caller logs them and keeps reading.
    pub async fn dispatch_record(
        &self,
        connection: &HubConnection,
        record: &[u8],
    ) -> Result<DispatchOutcome, ProtocolError> {
        let envelope: Envelope = serde_json::from_slice(record)?;

        match self.types.classify(envelope.message_type) {
            Some(InboundKind::Invocation { expects_completion }) => {
                let invocation: InvocationMessage = serde_json::from_slice(record)?;
                self.dispatch_invocation(connection, invocation, expects_completion)
                    .await;
                Ok(DispatchOutcome::Continue)
            }
            Some(InboundKind::Ping) => {
                tracing::trace!(connection_id = %connection.id, "client ping");
                Ok(DispatchOutcome::Continue)
            }
            Some(InboundKind::Close) => {
                tracing::debug!(connection_id = %connection.id, "client requested close");
                Ok(DispatchOutcome::Close)
            }
            Some(InboundKind::StreamItem) | Some(InboundKind::Completion) => {
                tracing::debug!(
                    connection_id = %connection.id,
                    message_type = envelope.message_type,
                    "ignoring client-originated response message"
                );
                Ok(DispatchOutcome::Continue)
            }
            None => {
                tracing::debug!(
                    connection_id = %connection.id,
                    message_type = envelope.message_type,
                    table_revision = self.types.revision(),
                    "skipping record with unknown message type"
                );
                Ok(DispatchOutcome::Continue)
            }
        }
    }

    async fn dispatch_invocation(
        &self,
        connection: &HubConnection,
        invocation: InvocationMessage,
        expects_completion: bool,
    ) {
        let target = invocation.target.to_lowercase();
        let context = InvocationContext {
            connection_id: connection.id.clone(),
            invocation_id: invocation.invocation_id.clone(),
            sender: connection.sender.clone(),
            registry: Arc::clone(&self.registry),
            cancel: connection.cancel.clone(),
        };

        let outcome = match self.handlers.get(&target) {
            Some(handler) => handler.invoke(context, &invocation.arguments).await,
            None => Err(HubError::UnknownTarget(invocation.target.clone())),
        };

        let wants_reply = expects_completion && !invocation.invocation_id.is_empty();
        match outcome {
            Ok(HandlerResult::Detached) => {}
            Ok(HandlerResult::Value(result)) => {
                if wants_reply {
                    self.send_completion(
                        connection,
                        CompletionMessage::success(&invocation.invocation_id, result),
                    );
                }
            }
            Err(e) => {
                if wants_reply {
                    self.send_completion(
                        connection,
                        CompletionMessage::error(&invocation.invocation_id, e.to_string()),
                    );
                } else {
                    tracing::warn!(
                        connection_id = %connection.id,
                        target = %invocation.target,
                        error = %e,
                        "dropping failed fire-and-forget invocation"
                    );
                }
            }
        }
    }

    fn send_completion(&self, connection: &HubConnection, completion: CompletionMessage) {
        match hub::encode_record(&completion) {
            Ok(record) => {
                if connection.sender.send(Outbound::Text(record)).is_err() {
                    tracing::debug!(
                        connection_id = %connection.id,
                        "connection gone before completion could be sent"
                    );
                }
            }
            Err(e) => {
                tracing::error!(connection_id = %connection.id, error = %e, "failed to encode completion");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, RegistryConfig};
    use tokio::sync::mpsc;

    fn registry() -> Arc<ConnectionRegistry> {
        Arc::new(ConnectionRegistry::new(RegistryConfig::default()))
    }

    async fn connect(
        registry: &Arc<ConnectionRegistry>,
        id: &str,
    ) -> (HubConnection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        registry
            .register(id, ConnectionHandle { sender: tx.clone() })
            .await
            .unwrap();
        let connection = HubConnection {
            id: id.to_string(),
            sender: tx,
            cancel: CancellationToken::new(),
        };
        (connection, rx)
    }

    fn text_of(frame: Outbound) -> String {
        match frame {
            Outbound::Text(text) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_target_gets_error_completion() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx) = connect(&registry, "c").await;

        let outcome = dispatcher
            .dispatch_record(
                &connection,
                br#"{"type":1,"target":"nope","invocationId":"1","arguments":[]}"#,
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Continue);

        let completion: CompletionMessage =
            serde_json::from_str(text_of(rx.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(completion.invocation_id, "1");
        assert!(completion.error.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_unknown_target_fire_and_forget_is_dropped() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx) = connect(&registry, "c").await;

        dispatcher
            .dispatch_record(&connection, br#"{"type":1,"target":"nope","arguments":[]}"#)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_broadcasts_and_completes() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx_c) = connect(&registry, "c").await;
        let (_other, mut rx_b) = connect(&registry, "b").await;

        dispatcher
            .dispatch_record(
                &connection,
                br#"{"type":1,"target":"send","invocationId":"1","arguments":["hi"]}"#,
            )
            .await
            .unwrap();

        // Every registered connection, the caller included, receives the
        // re-encoded invocation.
        let broadcast: InvocationMessage =
            serde_json::from_str(text_of(rx_b.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(broadcast.target, "send");
        assert_eq!(broadcast.arguments, vec![Value::from("hi")]);

        let first_for_caller: InvocationMessage =
            serde_json::from_str(text_of(rx_c.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(first_for_caller.target, "send");

        // The caller additionally gets the completion, with no error.
        let completion: CompletionMessage =
            serde_json::from_str(text_of(rx_c.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(completion.invocation_id, "1");
        assert!(completion.error.is_none());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_type_4_invocation_never_completes() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx) = connect(&registry, "c").await;

        dispatcher
            .dispatch_record(
                &connection,
                br#"{"type":4,"target":"send","invocationId":"9","arguments":["hi"]}"#,
            )
            .await
            .unwrap();

        // The broadcast still happens...
        let broadcast: InvocationMessage =
            serde_json::from_str(text_of(rx.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(broadcast.target, "send");
        // ...but no completion follows, despite the invocation id.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_target_is_case_insensitive() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx) = connect(&registry, "c").await;

        dispatcher
            .dispatch_record(
                &connection,
                br#"{"type":1,"target":"SEND","invocationId":"1","arguments":[]}"#,
            )
            .await
            .unwrap();

        let broadcast: InvocationMessage =
            serde_json::from_str(text_of(rx.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(broadcast.target, "send");
    }

    #[tokio::test]
    async fn test_ping_and_unknown_types_are_ignored() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, mut rx) = connect(&registry, "c").await;

        let outcome = dispatcher
            .dispatch_record(&connection, br#"{"type":6}"#)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Continue);

        let outcome = dispatcher
            .dispatch_record(&connection, br#"{"type":42}"#)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Continue);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_record_ends_connection() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, _rx) = connect(&registry, "c").await;

        let outcome = dispatcher
            .dispatch_record(&connection, br#"{"type":7}"#)
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Close);
    }

    #[tokio::test]
    async fn test_malformed_record_is_codec_error() {
        let registry = registry();
        let dispatcher = HubDispatcher::with_builtin_handlers(Arc::clone(&registry));
        let (connection, _rx) = connect(&registry, "c").await;

        let err = dispatcher
            .dispatch_record(&connection, b"not json")
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_custom_handler_result_value() {
        struct EchoHandler;

        #[async_trait]
        impl InvocationHandler for EchoHandler {
            fn name(&self) -> &str {
                "echo"
            }

            async fn invoke(
                &self,
                _context: InvocationContext,
                arguments: &[Value],
            ) -> Result<HandlerResult, HubError> {
                Ok(HandlerResult::Value(arguments.first().cloned()))
            }
        }

        let registry = registry();
        let mut dispatcher = HubDispatcher::new(Arc::clone(&registry));
        dispatcher.register_handler(Arc::new(EchoHandler));
        let (connection, mut rx) = connect(&registry, "c").await;

        dispatcher
            .dispatch_record(
                &connection,
                br#"{"type":1,"target":"echo","invocationId":"5","arguments":["back"]}"#,
            )
            .await
            .unwrap();

        let completion: CompletionMessage =
            serde_json::from_str(text_of(rx.try_recv().unwrap()).trim_end_matches('\u{1e}'))
                .unwrap();
        assert_eq!(completion.invocation_id, "5");
        assert_eq!(completion.result, Some(Value::from("back")));
    }
}
