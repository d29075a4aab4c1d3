//! # Wirehub
//!
//! Real-time messaging relay speaking two variants of a
//! persistent-connection hub protocol over WebSocket transport:
//!
//! - a binary **service** variant that bridges one upstream relay
//!   endpoint to many downstream client sockets (a fan-out gateway), and
//! - a direct **hub** variant that talks JSON-framed remote-invocation
//!   messages straight to browser-style clients.
//!
//! ## Modules
//!
//! - [`protocol`]: wire codecs (varint-prefixed msgpack frames, 0x1E-terminated JSON records)
//! - [`handshake`]: per-connection negotiation state machines
//! - [`registry`]: the shared connection table with fan-out
//! - [`relay`]: service-variant routing between the upstream and clients
//! - [`hub`]: hub-variant invocation dispatch with completions and streams
//! - [`server`]: axum wiring (negotiate, WebSocket upgrades, health)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use wirehub::config::Config;
//! use wirehub::server::{serve, AppState};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = AppState::new(Config::default());
//!     serve(state).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod handshake;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;

// Re-export top-level types for convenience
pub use config::{Config, ConfigError};

pub use connection::{generate_connection_id, Outbound, OutboundSender};

pub use handshake::{HandshakeError, HandshakeState, HandshakeStep, HubHandshake, ServiceHandshake};

pub use hub::{HubDispatcher, HubError, InvocationContext, InvocationHandler};

pub use protocol::{MessageTypeTable, ProtocolError, ServiceMessage};

pub use registry::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, RegistryConfig, RegistryError,
};

pub use relay::{RelayError, RelayRouter, UpstreamHandle};

pub use server::{build_router, serve, AppState, ServerError};
