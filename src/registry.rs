//! Connection Registry
//!
//! The one piece of state shared across connections: a concurrent map
//! from connection id to the connection's outbound queue. Both protocol
//! variants consult it to route and fan out frames.

use std::collections::{HashMap, HashSet};

use thiserror::Error;
use tokio::sync::RwLock;

use crate::connection::{Outbound, OutboundSender};

/// Unique identifier for a connection
pub type ConnectionId = String;

/// Registry limits
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of concurrent registered connections
    pub max_connections: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

/// Handle for sending frames to a registered connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// The connection's outbound queue
    pub sender: OutboundSender,
}

/// Concurrent map of live connections
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    config: RegistryConfig,
}

/// Errors that can occur in the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    #[error("failed to queue frame for connection {0}")]
    SendFailed(ConnectionId),
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a connection under `id`.
    ///
    /// A later register for the same id supersedes the earlier entry; the
    /// capacity limit applies only to genuinely new ids.
    pub async fn register(
        &self,
        id: &str,
        handle: ConnectionHandle,
    ) -> Result<(), RegistryError> {
        let mut connections = self.connections.write().await;
        if !connections.contains_key(id) && connections.len() >= self.config.max_connections {
            return Err(RegistryError::TooManyConnections(
                self.config.max_connections,
            ));
        }

        if connections.insert(id.to_string(), handle).is_some() {
            tracing::debug!(connection_id = %id, "connection re-registered, superseding earlier entry");
        } else {
            tracing::info!(connection_id = %id, "connection registered");
        }
        Ok(())
    }

    /// Remove a connection. Returns whether an entry existed.
    pub async fn unregister(&self, id: &str) -> bool {
        let removed = self.connections.write().await.remove(id).is_some();
        if removed {
            tracing::info!(connection_id = %id, "connection unregistered");
        }
        removed
    }

    /// Look up a connection's outbound queue.
    pub async fn lookup(&self, id: &str) -> Option<OutboundSender> {
        self.connections
            .read()
            .await
            .get(id)
            .map(|handle| handle.sender.clone())
    }

    /// Send one frame to a specific connection.
    pub async fn send_to(&self, id: &str, frame: Outbound) -> Result<(), RegistryError> {
        let sender = self
            .lookup(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        sender
            .send(frame)
            .map_err(|_| RegistryError::SendFailed(id.to_string()))
    }

    /// Ask a connection's writer to close the socket, then drop the entry.
    ///
    /// Returns whether the connection was registered.
    pub async fn close(&self, id: &str, reason: Option<String>) -> bool {
        match self.lookup(id).await {
            Some(sender) => {
                let _ = sender.send(Outbound::Close { reason });
                self.unregister(id).await
            }
            None => false,
        }
    }

    /// Fan one frame out to every registered connection not in `exclude`.
    ///
    /// Handles are snapshotted under the read lock and sends happen
    /// outside it, so registration churn during a fan-out is tolerated
    /// and no lock is held across the whole delivery. A failed send is
    /// logged and never aborts delivery to the remaining connections.
    /// Returns the number of connections the frame was queued for.
    pub async fn broadcast(&self, frame: Outbound, exclude: &HashSet<ConnectionId>) -> usize {
        let targets: Vec<(ConnectionId, OutboundSender)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .filter(|(id, _)| !exclude.contains(*id))
                .map(|(id, handle)| (id.clone(), handle.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, sender) in targets {
            if sender.send(frame.clone()).is_ok() {
                delivered += 1;
            } else {
                tracing::warn!(connection_id = %id, "dropping broadcast frame for dead connection");
            }
        }
        delivered
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}
