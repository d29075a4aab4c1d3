//! Wire Protocol Codecs
//!
//! Wirehub speaks two framings over WebSocket transport:
//!
//! - **Service variant** ([`service`]): varint length prefix followed by a
//!   msgpack array whose first element is an integer message type. Used
//!   between the upstream relay endpoint and this gateway.
//! - **Hub variant** ([`hub`]): one UTF-8 JSON object per record,
//!   terminated by a single 0x1E byte. Used by browser-style clients.
//!
//! Errors split into two severities, mirroring the error design of the
//! server: *framing* errors (the byte stream itself is broken) fail the
//! connection, while *codec* errors (one recognized message with a bad
//! body) drop that frame and keep the connection alive.

pub mod hub;
pub mod service;
pub mod varint;

pub use hub::{
    CompletionMessage, Envelope, HubHandshakeRequest, HubHandshakeResponse, InboundKind,
    InvocationMessage, MessageTypeTable, StreamItemMessage, RECORD_SEPARATOR,
};
pub use service::{FrameReader, ServiceMessage};

use thiserror::Error;

/// Errors raised by the wire codecs
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Length prefix is malformed (overlong or truncated continuation chain)
    #[error("malformed length prefix: {0}")]
    MalformedLength(String),

    /// Frame payload is shorter than its declared length
    #[error("truncated frame: declared {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },

    /// A JSON record buffer ended without the 0x1E terminator
    #[error("unterminated record: {0} trailing bytes without a terminator")]
    UnterminatedRecord(usize),

    /// A recognized message type carried a malformed body
    #[error("malformed message body: {0}")]
    MalformedBody(String),

    /// JSON encoding or decoding failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Msgpack encoding or decoding failed
    #[error("msgpack error: {0}")]
    MsgPack(String),
}

impl ProtocolError {
    /// Whether this error breaks framing and must fail the connection.
    ///
    /// Non-fatal errors abort the current frame only; the read loop keeps
    /// consuming subsequent frames.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::MalformedLength(_)
                | ProtocolError::Truncated { .. }
                | ProtocolError::UnterminatedRecord(_)
        )
    }
}

impl From<rmpv::decode::Error> for ProtocolError {
    fn from(err: rmpv::decode::Error) -> Self {
        ProtocolError::MsgPack(err.to_string())
    }
}

impl From<rmpv::encode::Error> for ProtocolError {
    fn from(err: rmpv::encode::Error) -> Self {
        ProtocolError::MsgPack(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framing_errors_are_fatal() {
        assert!(ProtocolError::MalformedLength("x".into()).is_fatal());
        assert!(ProtocolError::Truncated {
            declared: 10,
            available: 2
        }
        .is_fatal());
        assert!(ProtocolError::UnterminatedRecord(4).is_fatal());
    }

    #[test]
    fn test_codec_errors_are_recoverable() {
        assert!(!ProtocolError::MalformedBody("x".into()).is_fatal());
        assert!(!ProtocolError::MsgPack("x".into()).is_fatal());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(!ProtocolError::Json(json_err).is_fatal());
    }
}
