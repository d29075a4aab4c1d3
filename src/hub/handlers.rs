//! Built-in Invocation Handlers

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::dispatcher::{HandlerResult, InvocationContext, InvocationHandler};
use super::HubError;
use crate::connection::Outbound;
use crate::protocol::hub::{self, CompletionMessage, InvocationMessage, StreamItemMessage};

/// `send`: re-encode the invocation and fan it out to every registered
/// connection, the caller included.
pub struct SendHandler;

#[async_trait]
impl InvocationHandler for SendHandler {
    fn name(&self) -> &str {
        "send"
    }

    async fn invoke(
        &self,
        context: InvocationContext,
        arguments: &[Value],
    ) -> Result<HandlerResult, HubError> {
        let record = hub::encode_record(&InvocationMessage::outbound("send", arguments.to_vec()))?;
        let delivered = context
            .registry
            .broadcast(Outbound::Text(record), &HashSet::new())
            .await;
        tracing::debug!(
            connection_id = %context.connection_id,
            delivered,
            "broadcast send invocation"
        );
        Ok(HandlerResult::Value(None))
    }
}

/// `stream`: push a fixed number of timestamped items to the caller on a
/// fixed interval, then complete.
///
/// The emitting task is bound to the owning connection: it watches a
/// child of the connection's cancellation token between items and stops
/// without further writes once the connection is gone.
pub struct StreamHandler {
    item_count: u32,
    item_interval: Duration,
}

impl Default for StreamHandler {
    fn default() -> Self {
        Self {
            item_count: 10,
            item_interval: Duration::from_secs(2),
        }
    }
}

#[async_trait]
impl InvocationHandler for StreamHandler {
    fn name(&self) -> &str {
        "stream"
    }

    async fn invoke(
        &self,
        context: InvocationContext,
        _arguments: &[Value],
    ) -> Result<HandlerResult, HubError> {
        if context.invocation_id.is_empty() {
            return Err(HubError::InvalidInvocation(
                "stream requires an invocation id".to_string(),
            ));
        }

        let invocation_id = context.invocation_id.clone();
        let connection_id = context.connection_id.clone();
        let sender = context.sender.clone();
        let cancel = context.cancel.child_token();
        let count = self.item_count;
        let interval = self.item_interval;

        tokio::spawn(async move {
            for _ in 0..count {
                let item = Value::String(Utc::now().to_rfc3339());
                let record =
                    match hub::encode_record(&StreamItemMessage::new(&invocation_id, item)) {
                        Ok(record) => record,
                        Err(e) => {
                            tracing::error!(error = %e, "failed to encode stream item");
                            return;
                        }
                    };
                if sender.send(Outbound::Text(record)).is_err() {
                    tracing::debug!(
                        connection_id = %connection_id,
                        "connection gone mid-stream, stopping"
                    );
                    return;
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!(
                            connection_id = %connection_id,
                            invocation_id = %invocation_id,
                            "stream cancelled"
                        );
                        return;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            match hub::encode_record(&CompletionMessage::success(&invocation_id, None)) {
                Ok(record) => {
                    let _ = sender.send(Outbound::Text(record));
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode stream completion");
                }
            }
        });

        Ok(HandlerResult::Detached)
    }
}
