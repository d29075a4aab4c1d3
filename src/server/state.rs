//! Application State
//!
//! Shared state handed to every handler and socket driver. The registry
//! is the single connection table both protocol variants consult; it is
//! owned here and passed by reference everywhere, never ambient.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::hub::HubDispatcher;
use crate::registry::{ConnectionRegistry, RegistryConfig};
use crate::relay::RelayRouter;

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// Full server configuration
    pub config: Arc<Config>,
    /// The connection table shared by both protocol variants
    pub registry: Arc<ConnectionRegistry>,
    /// Service-variant router (upstream pairing and fan-out)
    pub relay: Arc<RelayRouter>,
    /// Hub-variant invocation dispatcher
    pub dispatcher: Arc<HubDispatcher>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(RegistryConfig {
            max_connections: config.connection.max_connections,
        }));
        let relay = Arc::new(RelayRouter::new(
            Arc::clone(&registry),
            Duration::from_secs(config.relay.upstream_wait_secs),
        ));
        let dispatcher = Arc::new(HubDispatcher::with_builtin_handlers(Arc::clone(&registry)));

        Self {
            config: Arc::new(config),
            registry,
            relay,
            dispatcher,
            start_time: Instant::now(),
        }
    }

    /// Keepalive interval shared by both variants
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.config.connection.keepalive_interval_secs)
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
