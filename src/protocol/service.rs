//! Binary Service Frame Codec
//!
//! Frames exchanged with the upstream relay endpoint are msgpack arrays
//! prefixed with a varint length. The first array element is an integer
//! message type; the remaining elements are type-specific fields:
//!
//! | Type | Message | Fields |
//! |------|---------|--------|
//! | 1 | HandshakeRequest | protocolVersion:int |
//! | 2 | HandshakeResponse | errorMessage:string (empty = success) |
//! | 3 | Ping | (none) |
//! | 4 | OpenConnection | connectionId:string, headers:map |
//! | 5 | CloseConnection | connectionId:string, errorMessage:string |
//! | 6 | ConnectionData | connectionId:string, payload:bytes |
//! | 10 | BroadcastData | excludedConnectionIds:list, protocolPayloads:map |
//!
//! Unknown message types are skipped rather than treated as errors, so new
//! upstream message kinds never kill a connection.

use bytes::Bytes;
use rmpv::Value;

use super::{varint, ProtocolError};

/// Wire discriminators for the service protocol
mod message_type {
    pub const HANDSHAKE_REQUEST: i64 = 1;
    pub const HANDSHAKE_RESPONSE: i64 = 2;
    pub const PING: i64 = 3;
    pub const OPEN_CONNECTION: i64 = 4;
    pub const CLOSE_CONNECTION: i64 = 5;
    pub const CONNECTION_DATA: i64 = 6;
    pub const BROADCAST_DATA: i64 = 10;
}

/// One decoded service-protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceMessage {
    /// Protocol version proposal, first frame on an upstream connection
    HandshakeRequest { protocol_version: i64 },
    /// Handshake reply; an empty error message means success
    HandshakeResponse { error_message: String },
    /// Liveness signal, no payload
    Ping,
    /// Announces a new downstream client to the upstream
    OpenConnection {
        connection_id: String,
        headers: Vec<(String, String)>,
    },
    /// Closes the named downstream client
    CloseConnection {
        connection_id: String,
        error_message: String,
    },
    /// Raw payload addressed to a single connection
    ConnectionData {
        connection_id: String,
        payload: Bytes,
    },
    /// Payloads fanned out to every connection not in the exclude list,
    /// keyed by codec name
    BroadcastData {
        excluded_connection_ids: Vec<String>,
        payloads: Vec<(String, Bytes)>,
    },
}

impl ServiceMessage {
    /// Encode this message as a complete length-prefixed frame.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &self.to_value())?;

        let mut frame = Vec::with_capacity(payload.len() + varint::MAX_LENGTH_PREFIX_BYTES);
        varint::write_len(payload.len() as u64, &mut frame)?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn to_value(&self) -> Value {
        match self {
            ServiceMessage::HandshakeRequest { protocol_version } => Value::Array(vec![
                Value::from(message_type::HANDSHAKE_REQUEST),
                Value::from(*protocol_version),
            ]),
            ServiceMessage::HandshakeResponse { error_message } => Value::Array(vec![
                Value::from(message_type::HANDSHAKE_RESPONSE),
                Value::String(error_message.clone().into()),
            ]),
            ServiceMessage::Ping => Value::Array(vec![Value::from(message_type::PING)]),
            ServiceMessage::OpenConnection {
                connection_id,
                headers,
            } => Value::Array(vec![
                Value::from(message_type::OPEN_CONNECTION),
                Value::String(connection_id.clone().into()),
                Value::Map(
                    headers
                        .iter()
                        .map(|(k, v)| {
                            (
                                Value::String(k.clone().into()),
                                Value::String(v.clone().into()),
                            )
                        })
                        .collect(),
                ),
            ]),
            ServiceMessage::CloseConnection {
                connection_id,
                error_message,
            } => Value::Array(vec![
                Value::from(message_type::CLOSE_CONNECTION),
                Value::String(connection_id.clone().into()),
                Value::String(error_message.clone().into()),
            ]),
            ServiceMessage::ConnectionData {
                connection_id,
                payload,
            } => Value::Array(vec![
                Value::from(message_type::CONNECTION_DATA),
                Value::String(connection_id.clone().into()),
                Value::Binary(payload.to_vec()),
            ]),
            ServiceMessage::BroadcastData {
                excluded_connection_ids,
                payloads,
            } => Value::Array(vec![
                Value::from(message_type::BROADCAST_DATA),
                Value::Array(
                    excluded_connection_ids
                        .iter()
                        .map(|id| Value::String(id.clone().into()))
                        .collect(),
                ),
                Value::Map(
                    payloads
                        .iter()
                        .map(|(codec, payload)| {
                            (
                                Value::String(codec.clone().into()),
                                Value::Binary(payload.to_vec()),
                            )
                        })
                        .collect(),
                ),
            ]),
        }
    }

    /// Decode one frame payload (the msgpack array, without length prefix).
    ///
    /// Returns `Ok(None)` for unknown message types.
    pub fn decode(payload: &[u8]) -> Result<Option<ServiceMessage>, ProtocolError> {
        let value = rmpv::decode::read_value(&mut &payload[..])?;
        let fields = match value {
            Value::Array(fields) => fields,
            other => {
                return Err(ProtocolError::MalformedBody(format!(
                    "expected msgpack array, got {}",
                    type_name(&other)
                )))
            }
        };

        let kind = fields
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| ProtocolError::MalformedBody("missing message type".to_string()))?;

        let message = match kind {
            message_type::HANDSHAKE_REQUEST => ServiceMessage::HandshakeRequest {
                protocol_version: int_field(&fields, 1, "protocolVersion")?,
            },
            message_type::HANDSHAKE_RESPONSE => ServiceMessage::HandshakeResponse {
                error_message: str_field(&fields, 1, "errorMessage")?,
            },
            message_type::PING => ServiceMessage::Ping,
            message_type::OPEN_CONNECTION => ServiceMessage::OpenConnection {
                connection_id: str_field(&fields, 1, "connectionId")?,
                headers: map_field(&fields, 2, "headers")?
                    .iter()
                    .map(|(k, v)| Ok((value_str(k, "header name")?, value_str(v, "header value")?)))
                    .collect::<Result<_, ProtocolError>>()?,
            },
            message_type::CLOSE_CONNECTION => ServiceMessage::CloseConnection {
                connection_id: str_field(&fields, 1, "connectionId")?,
                error_message: str_field(&fields, 2, "errorMessage")?,
            },
            message_type::CONNECTION_DATA => ServiceMessage::ConnectionData {
                connection_id: str_field(&fields, 1, "connectionId")?,
                payload: bytes_field(&fields, 2, "payload")?,
            },
            message_type::BROADCAST_DATA => {
                let excluded = match fields.get(1) {
                    Some(Value::Array(items)) => items
                        .iter()
                        .map(|v| value_str(v, "excluded connection id"))
                        .collect::<Result<_, _>>()?,
                    _ => {
                        return Err(ProtocolError::MalformedBody(
                            "excludedConnectionIds is not an array".to_string(),
                        ))
                    }
                };
                let payloads = map_field(&fields, 2, "protocolPayloads")?
                    .iter()
                    .map(|(k, v)| {
                        Ok((
                            value_str(k, "payload codec name")?,
                            value_bytes(v, "payload")?,
                        ))
                    })
                    .collect::<Result<_, ProtocolError>>()?;
                ServiceMessage::BroadcastData {
                    excluded_connection_ids: excluded,
                    payloads,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(message))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "bool",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}

fn int_field(fields: &[Value], index: usize, name: &str) -> Result<i64, ProtocolError> {
    fields
        .get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| ProtocolError::MalformedBody(format!("{} is not an integer", name)))
}

fn str_field(fields: &[Value], index: usize, name: &str) -> Result<String, ProtocolError> {
    let value = fields
        .get(index)
        .ok_or_else(|| ProtocolError::MalformedBody(format!("{} is missing", name)))?;
    value_str(value, name)
}

fn bytes_field(fields: &[Value], index: usize, name: &str) -> Result<Bytes, ProtocolError> {
    let value = fields
        .get(index)
        .ok_or_else(|| ProtocolError::MalformedBody(format!("{} is missing", name)))?;
    value_bytes(value, name)
}

fn map_field<'a>(
    fields: &'a [Value],
    index: usize,
    name: &str,
) -> Result<&'a [(Value, Value)], ProtocolError> {
    match fields.get(index) {
        Some(Value::Map(pairs)) => Ok(pairs),
        _ => Err(ProtocolError::MalformedBody(format!(
            "{} is not a map",
            name
        ))),
    }
}

fn value_str(value: &Value, name: &str) -> Result<String, ProtocolError> {
    match value {
        Value::String(s) => s
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProtocolError::MalformedBody(format!("{} is not valid UTF-8", name))),
        _ => Err(ProtocolError::MalformedBody(format!(
            "{} is not a string",
            name
        ))),
    }
}

/// Payload fields accept both msgpack bin and str encodings; some peers
/// encode text payloads as strings.
fn value_bytes(value: &Value, name: &str) -> Result<Bytes, ProtocolError> {
    match value {
        Value::Binary(b) => Ok(Bytes::from(b.clone())),
        Value::String(s) => Ok(Bytes::from(s.as_bytes().to_vec())),
        _ => Err(ProtocolError::MalformedBody(format!(
            "{} is not binary",
            name
        ))),
    }
}

/// Walks a buffer of consecutive length-prefixed frames.
///
/// A single transport message may carry several frames; each `next()`
/// yields one frame payload (without its length prefix). Framing errors
/// (bad prefix, truncated payload) are yielded once and end iteration.
pub struct FrameReader<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, failed: false }
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<&'a [u8], ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.buf.is_empty() {
            return None;
        }

        let (declared, consumed) = match varint::read_len(self.buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
        };

        let declared = declared as usize;
        let rest = &self.buf[consumed..];
        if rest.len() < declared {
            self.failed = true;
            return Some(Err(ProtocolError::Truncated {
                declared,
                available: rest.len(),
            }));
        }

        let (payload, remaining) = rest.split_at(declared);
        self.buf = remaining;
        Some(Ok(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: ServiceMessage) -> ServiceMessage {
        let frame = message.encode().unwrap();
        let mut reader = FrameReader::new(&frame);
        let payload = reader.next().unwrap().unwrap();
        assert!(reader.next().is_none());
        ServiceMessage::decode(payload).unwrap().unwrap()
    }

    #[test]
    fn test_handshake_request_round_trip() {
        let message = ServiceMessage::HandshakeRequest {
            protocol_version: 1,
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_handshake_response_round_trip() {
        let ok = ServiceMessage::HandshakeResponse {
            error_message: String::new(),
        };
        assert_eq!(round_trip(ok.clone()), ok);

        let rejected = ServiceMessage::HandshakeResponse {
            error_message: "unsupported protocol version 9".to_string(),
        };
        assert_eq!(round_trip(rejected.clone()), rejected);
    }

    #[test]
    fn test_ping_wire_bytes() {
        let frame = ServiceMessage::Ping.encode().unwrap();
        // Length 2, fixarray of one element, positive fixint 3.
        assert_eq!(frame, vec![0x02, 0x91, 0x03]);
        assert_eq!(round_trip(ServiceMessage::Ping), ServiceMessage::Ping);
    }

    #[test]
    fn test_open_connection_round_trip() {
        let message = ServiceMessage::OpenConnection {
            connection_id: "abc123".to_string(),
            headers: vec![],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_close_connection_round_trip() {
        let message = ServiceMessage::CloseConnection {
            connection_id: "abc123".to_string(),
            error_message: "gone".to_string(),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_connection_data_round_trip() {
        let message = ServiceMessage::ConnectionData {
            connection_id: "abc123".to_string(),
            payload: Bytes::from_static(b"{\"type\":1}\x1e"),
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_broadcast_data_round_trip() {
        let message = ServiceMessage::BroadcastData {
            excluded_connection_ids: vec!["a".to_string(), "b".to_string()],
            payloads: vec![("json".to_string(), Bytes::from_static(b"payload"))],
        };
        assert_eq!(round_trip(message.clone()), message);
    }

    #[test]
    fn test_unknown_type_is_skipped() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(
            &mut payload,
            &Value::Array(vec![Value::from(99), Value::from("whatever")]),
        )
        .unwrap();
        assert_eq!(ServiceMessage::decode(&payload).unwrap(), None);
    }

    #[test]
    fn test_malformed_body_is_codec_error() {
        // ConnectionData with an integer where the connection id belongs.
        let mut payload = Vec::new();
        rmpv::encode::write_value(
            &mut payload,
            &Value::Array(vec![Value::from(6), Value::from(42), Value::Binary(vec![])]),
        )
        .unwrap();

        let err = ServiceMessage::decode(&payload).unwrap_err();
        assert!(matches!(err, ProtocolError::MalformedBody(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_string_payload_accepted_as_bytes() {
        let mut payload = Vec::new();
        rmpv::encode::write_value(
            &mut payload,
            &Value::Array(vec![
                Value::from(6),
                Value::from("abc123"),
                Value::from("text payload"),
            ]),
        )
        .unwrap();

        match ServiceMessage::decode(&payload).unwrap().unwrap() {
            ServiceMessage::ConnectionData { payload, .. } => {
                assert_eq!(&payload[..], b"text payload");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_frame_reader_multiple_frames() {
        let mut buf = ServiceMessage::Ping.encode().unwrap();
        buf.extend(
            ServiceMessage::CloseConnection {
                connection_id: "abc".to_string(),
                error_message: String::new(),
            }
            .encode()
            .unwrap(),
        );

        let frames: Vec<_> = FrameReader::new(&buf)
            .map(|frame| ServiceMessage::decode(frame.unwrap()).unwrap().unwrap())
            .collect();

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ServiceMessage::Ping);
        assert!(matches!(frames[1], ServiceMessage::CloseConnection { .. }));
    }

    #[test]
    fn test_frame_reader_truncated_payload() {
        let frame = ServiceMessage::Ping.encode().unwrap();
        let mut reader = FrameReader::new(&frame[..frame.len() - 1]);
        let err = reader.next().unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { .. }));
        assert!(err.is_fatal());
        assert!(reader.next().is_none());
    }
}
