//! JSON Record Codec
//!
//! Hub-variant messages are UTF-8 JSON objects, each terminated by a
//! single 0x1E byte. One transport message may carry several records.
//!
//! Message type numbering is deliberately kept as data rather than
//! hard-coded: published hub protocols disagree on what type 4 means, so
//! the inbound mapping lives in a versioned [`MessageTypeTable`] the
//! dispatcher consults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ProtocolError;

/// Record terminator byte appended to every hub-variant message.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// Outbound wire discriminators for the hub protocol
pub mod outbound_type {
    pub const INVOCATION: u32 = 1;
    pub const STREAM_ITEM: u32 = 2;
    pub const COMPLETION: u32 = 3;
    pub const PING: u32 = 6;
}

/// First record sent by a hub client: `{"protocol": "json", "version": 1}`
#[derive(Debug, Clone, Deserialize)]
pub struct HubHandshakeRequest {
    pub protocol: String,
    #[serde(default)]
    pub version: i32,
}

/// Handshake reply; serializes to `{}` on success
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubHandshakeResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Minimal envelope used to discriminate inbound records
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: u32,
}

/// A request to execute a named remote operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationMessage {
    #[serde(rename = "type")]
    pub message_type: u32,
    #[serde(default)]
    pub target: String,
    #[serde(
        rename = "invocationId",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub invocation_id: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

impl InvocationMessage {
    /// Build a server-originated invocation for broadcast delivery.
    pub fn outbound(target: &str, arguments: Vec<Value>) -> Self {
        Self {
            message_type: outbound_type::INVOCATION,
            target: target.to_string(),
            invocation_id: String::new(),
            arguments,
        }
    }
}

/// One incremental element of a multi-value response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamItemMessage {
    #[serde(rename = "type")]
    pub message_type: u32,
    #[serde(rename = "invocationId")]
    pub invocation_id: String,
    pub item: Value,
}

impl StreamItemMessage {
    pub fn new(invocation_id: &str, item: Value) -> Self {
        Self {
            message_type: outbound_type::STREAM_ITEM,
            invocation_id: invocation_id.to_string(),
            item,
        }
    }
}

/// Terminal reply to an invocation, correlated by invocation id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    #[serde(rename = "type")]
    pub message_type: u32,
    #[serde(rename = "invocationId")]
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionMessage {
    pub fn success(invocation_id: &str, result: Option<Value>) -> Self {
        Self {
            message_type: outbound_type::COMPLETION,
            invocation_id: invocation_id.to_string(),
            result,
            error: None,
        }
    }

    pub fn error(invocation_id: &str, message: String) -> Self {
        Self {
            message_type: outbound_type::COMPLETION,
            invocation_id: invocation_id.to_string(),
            result: None,
            error: Some(message),
        }
    }
}

/// Keepalive record, `{"type":6}`
#[derive(Debug, Clone, Serialize)]
pub struct PingMessage {
    #[serde(rename = "type")]
    pub message_type: u32,
}

impl Default for PingMessage {
    fn default() -> Self {
        Self {
            message_type: outbound_type::PING,
        }
    }
}

/// Serialize a message and append the record terminator.
pub fn encode_record<T: Serialize>(message: &T) -> Result<String, ProtocolError> {
    let mut record = serde_json::to_string(message)?;
    record.push(RECORD_SEPARATOR as char);
    Ok(record)
}

/// Split a buffer into terminated records.
///
/// Each item is the JSON bytes of one record, terminator excluded. A
/// non-empty tail with no terminator is a framing error: with WebSocket
/// transport every message must carry only complete records.
pub fn split_records(buf: &[u8]) -> RecordIter<'_> {
    RecordIter { buf, failed: false }
}

/// Iterator over the records of one transport message
pub struct RecordIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<&'a [u8], ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        match self.buf.iter().position(|&b| b == RECORD_SEPARATOR) {
            Some(index) => {
                let record = &self.buf[..index];
                self.buf = &self.buf[index + 1..];
                Some(Ok(record))
            }
            None => {
                self.failed = true;
                Some(Err(ProtocolError::UnterminatedRecord(self.buf.len())))
            }
        }
    }
}

/// How the dispatcher should treat one inbound message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    /// Named invocation; completion is sent when the id is non-empty
    Invocation { expects_completion: bool },
    /// Stream item (client-to-server streaming is not dispatched)
    StreamItem,
    /// Completion (client-originated, ignored)
    Completion,
    /// Liveness signal
    Ping,
    /// Graceful close request
    Close,
}

/// Versioned mapping from wire message type to meaning.
///
/// Revision 1 is the legacy numbering this relay grew up with: both 1 and
/// 4 are invocations, with 4 never receiving a completion.
#[derive(Debug, Clone)]
pub struct MessageTypeTable {
    revision: u32,
    entries: HashMap<u32, InboundKind>,
}

impl MessageTypeTable {
    /// The legacy revision-1 numbering.
    pub fn legacy() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            1,
            InboundKind::Invocation {
                expects_completion: true,
            },
        );
        entries.insert(2, InboundKind::StreamItem);
        entries.insert(3, InboundKind::Completion);
        entries.insert(
            4,
            InboundKind::Invocation {
                expects_completion: false,
            },
        );
        entries.insert(6, InboundKind::Ping);
        entries.insert(7, InboundKind::Close);
        Self {
            revision: 1,
            entries,
        }
    }

    /// Build a custom revision from explicit entries.
    pub fn new(revision: u32, entries: HashMap<u32, InboundKind>) -> Self {
        Self { revision, entries }
    }

    pub fn revision(&self) -> u32 {
        self.revision
    }

    /// Classify an inbound message type; `None` means unknown.
    pub fn classify(&self, message_type: u32) -> Option<InboundKind> {
        self.entries.get(&message_type).copied()
    }
}

impl Default for MessageTypeTable {
    fn default() -> Self {
        Self::legacy()
    }
}
