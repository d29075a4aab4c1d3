//! Per-Connection Handshake State Machines
//!
//! Every connection starts in `AwaitingRequest` and must complete a
//! protocol negotiation before normal traffic is accepted:
//!
//! ```text
//! AwaitingRequest ──ok──> Negotiated
//!        │
//!        └──mismatch/garbage──> Rejected (terminal, socket closed)
//! ```
//!
//! The state machines are pure: they consume the first inbound transport
//! message and return the response frame to write plus the transition.
//! The socket drivers in `server::ws` execute the result.

use thiserror::Error;

use crate::protocol::hub::{HubHandshakeRequest, HubHandshakeResponse};
use crate::protocol::service::{FrameReader, ServiceMessage};
use crate::protocol::{hub, ProtocolError};

/// Handshake lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// No request seen yet; normal traffic is not accepted
    AwaitingRequest,
    /// Negotiation succeeded; the connection is live
    Negotiated,
    /// Negotiation failed; the socket must be closed
    Rejected,
}

/// Outcome of feeding the first message to a handshake machine
#[derive(Debug)]
pub enum HandshakeStep<R> {
    /// Send `response`, then start normal traffic
    Accepted { response: R },
    /// Send `response`, then close the socket
    Rejected { response: R, reason: String },
}

/// Errors that end a handshake without a structured reply
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The machine is terminal; no more input is accepted
    #[error("handshake already completed")]
    AlreadyComplete,

    /// The first message could not be decoded at all
    #[error("malformed handshake: {0}")]
    Protocol(#[from] ProtocolError),

    /// The first message decoded to something other than a request
    #[error("expected a handshake request, got {0}")]
    UnexpectedMessage(String),

    /// The transport message carried no frame
    #[error("empty handshake message")]
    Empty,
}

/// Handshake for the binary service variant.
///
/// The first frame must be a HandshakeRequest; its protocol version is
/// validated against the supported set. Version mismatches are reported
/// back with a descriptive HandshakeResponse before the socket closes.
#[derive(Debug)]
pub struct ServiceHandshake {
    supported_versions: Vec<i64>,
    state: HandshakeState,
}

impl ServiceHandshake {
    pub fn new(supported_versions: Vec<i64>) -> Self {
        Self {
            supported_versions,
            state: HandshakeState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Process the first transport message of an upstream connection.
    pub fn handle_message(
        &mut self,
        buf: &[u8],
    ) -> Result<HandshakeStep<Vec<u8>>, HandshakeError> {
        if self.state != HandshakeState::AwaitingRequest {
            return Err(HandshakeError::AlreadyComplete);
        }

        let step = self.negotiate(buf);
        self.state = match &step {
            Ok(HandshakeStep::Accepted { .. }) => HandshakeState::Negotiated,
            _ => HandshakeState::Rejected,
        };
        step
    }

    fn negotiate(&self, buf: &[u8]) -> Result<HandshakeStep<Vec<u8>>, HandshakeError> {
        let payload = FrameReader::new(buf)
            .next()
            .ok_or(HandshakeError::Empty)??;

        let version = match ServiceMessage::decode(payload)? {
            Some(ServiceMessage::HandshakeRequest { protocol_version }) => protocol_version,
            Some(other) => {
                return Err(HandshakeError::UnexpectedMessage(format!("{:?}", other)))
            }
            None => {
                return Err(HandshakeError::UnexpectedMessage(
                    "unknown message type".to_string(),
                ))
            }
        };

        if self.supported_versions.contains(&version) {
            let response = ServiceMessage::HandshakeResponse {
                error_message: String::new(),
            }
            .encode()?;
            Ok(HandshakeStep::Accepted { response })
        } else {
            let reason = format!("unsupported protocol version {}", version);
            let response = ServiceMessage::HandshakeResponse {
                error_message: reason.clone(),
            }
            .encode()?;
            Ok(HandshakeStep::Rejected { response, reason })
        }
    }
}

/// Handshake for the JSON hub variant.
///
/// The first record must be `{"protocol", "version"}`; only the protocol
/// name is constrained. Success is acknowledged with an empty object.
#[derive(Debug)]
pub struct HubHandshake {
    supported_protocols: Vec<String>,
    state: HandshakeState,
}

impl HubHandshake {
    pub fn new(supported_protocols: Vec<String>) -> Self {
        Self {
            supported_protocols,
            state: HandshakeState::AwaitingRequest,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Process the first transport message of a hub connection.
    pub fn handle_message(&mut self, buf: &[u8]) -> Result<HandshakeStep<String>, HandshakeError> {
        if self.state != HandshakeState::AwaitingRequest {
            return Err(HandshakeError::AlreadyComplete);
        }

        let step = self.negotiate(buf);
        self.state = match &step {
            Ok(HandshakeStep::Accepted { .. }) => HandshakeState::Negotiated,
            _ => HandshakeState::Rejected,
        };
        step
    }

    fn negotiate(&self, buf: &[u8]) -> Result<HandshakeStep<String>, HandshakeError> {
        let record = hub::split_records(buf)
            .next()
            .ok_or(HandshakeError::Empty)??;

        let request: HubHandshakeRequest =
            serde_json::from_slice(record).map_err(ProtocolError::from)?;

        if self.supported_protocols.iter().any(|p| p == &request.protocol) {
            let response = hub::encode_record(&HubHandshakeResponse::default())?;
            Ok(HandshakeStep::Accepted { response })
        } else {
            let reason = format!("protocol \"{}\" is not supported", request.protocol);
            let response = hub::encode_record(&HubHandshakeResponse {
                error: Some(reason.clone()),
            })?;
            Ok(HandshakeStep::Rejected { response, reason })
        }
    }
}
