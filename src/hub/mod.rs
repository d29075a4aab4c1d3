//! Hub Invocation Dispatching
//!
//! The hub variant speaks JSON records straight to clients: named
//! invocations come in, completions and stream items go out. The
//! dispatcher decodes each record, case-folds the target, and hands it to
//! a registered [`InvocationHandler`]. Built-in targets:
//!
//! - `send`: re-broadcast the invocation to every registered connection
//! - `stream`: push ten timestamped items to the caller, two seconds
//!   apart, then a completion

mod dispatcher;
mod handlers;

pub use dispatcher::{
    DispatchOutcome, HandlerResult, HubConnection, HubDispatcher, InvocationContext,
    InvocationHandler,
};
pub use handlers::{SendHandler, StreamHandler};

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors surfaced to callers through completion records
#[derive(Debug, Error)]
pub enum HubError {
    /// No handler is registered for the invocation target
    #[error("unknown invocation target '{0}'")]
    UnknownTarget(String),

    /// The invocation itself is unusable
    #[error("invalid invocation: {0}")]
    InvalidInvocation(String),

    /// A reply or broadcast record could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
