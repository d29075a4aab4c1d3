//! Service Relay Routing
//!
//! The binary service variant pairs one upstream relay endpoint with many
//! downstream client sockets. Client traffic is wrapped in service frames
//! and forwarded to the upstream; upstream frames are routed back out to
//! one client (ConnectionData), every client (BroadcastData), or a
//! client's teardown (CloseConnection).

mod router;

pub use router::{RelayError, RelayRouter, UpstreamHandle};
