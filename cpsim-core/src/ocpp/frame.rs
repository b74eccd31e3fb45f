//! OCPP-J frame codec
//!
//! OCPP-J carries every message as a positional JSON array:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! Besides the three wire shapes, [`Frame`] has transport pseudo-frames (open, close,
//! transport error, undecodable input) so the frame log can record the whole life of a
//! connection in one sequence. Pseudo-frames have a log encoding but never come off
//! the wire: [`decode`] only accepts the numeric type tags.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// OCPP-J message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries
    fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// CALLERROR error codes.
///
/// Codes this engine does not know are kept verbatim in `Other` so a reply from the
/// central system is logged exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
            ErrorCode::Other(code) => code,
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(s: &str) -> Self {
        match s {
            "NotImplemented" => ErrorCode::NotImplemented,
            "NotSupported" => ErrorCode::NotSupported,
            "InternalError" => ErrorCode::InternalError,
            "ProtocolError" => ErrorCode::ProtocolError,
            "SecurityError" => ErrorCode::SecurityError,
            "FormationViolation" => ErrorCode::FormationViolation,
            "PropertyConstraintViolation" => ErrorCode::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => ErrorCode::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => ErrorCode::TypeConstraintViolation,
            "GenericError" => ErrorCode::GenericError,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        Ok(ErrorCode::from(code.as_str()))
    }
}

/// Why a byte sequence is not a well-formed frame
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a non-empty JSON array")]
    NotAnArray,

    #[error("unrecognized message type tag: {0}")]
    UnknownType(Value),

    #[error("{kind:?} frame needs {expected} elements, got {actual}")]
    WrongArity {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("{0} must be a string")]
    NotAString(&'static str),
}

/// Display category of a frame, as used by the frame log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    Call,
    CallResult,
    CallError,
    Open,
    Close,
    Error,
    ParseErr,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Call => "CALL",
            FrameKind::CallResult => "CALLRESULT",
            FrameKind::CallError => "CALLERROR",
            FrameKind::Open => "OPEN",
            FrameKind::Close => "CLOSE",
            FrameKind::Error => "ERROR",
            FrameKind::ParseErr => "PARSE_ERR",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame observed on, or sent over, a charge point connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Request expecting exactly one CALLRESULT or CALLERROR
    Call {
        id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        id: String,
        payload: Value,
    },
    CallError {
        id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    },
    Opened {
        url: String,
        subprotocol: String,
    },
    Closed {
        code: u16,
        reason: String,
    },
    TransportError {
        message: String,
    },
    DecodeError {
        message: String,
    },
}

impl Frame {
    /// CALL with a fresh UUID v4 correlation id
    pub fn call(action: impl Into<String>, payload: Value) -> Self {
        Frame::Call {
            id: Uuid::new_v4().to_string(),
            action: action.into(),
            payload,
        }
    }

    pub fn result(id: impl Into<String>, payload: Value) -> Self {
        Frame::CallResult {
            id: id.into(),
            payload,
        }
    }

    /// CALLERROR with empty details
    pub fn error(id: impl Into<String>, code: ErrorCode, description: impl Into<String>) -> Self {
        Frame::CallError {
            id: id.into(),
            code,
            description: description.into(),
            details: Value::Object(Map::new()),
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Call { .. } => FrameKind::Call,
            Frame::CallResult { .. } => FrameKind::CallResult,
            Frame::CallError { .. } => FrameKind::CallError,
            Frame::Opened { .. } => FrameKind::Open,
            Frame::Closed { .. } => FrameKind::Close,
            Frame::TransportError { .. } => FrameKind::Error,
            Frame::DecodeError { .. } => FrameKind::ParseErr,
        }
    }

    /// Correlation id for wire frames; the closest identifying field otherwise
    pub fn id(&self) -> &str {
        match self {
            Frame::Call { id, .. } | Frame::CallResult { id, .. } | Frame::CallError { id, .. } => id,
            Frame::Opened { subprotocol, .. } => subprotocol,
            Frame::Closed { reason, .. } => reason,
            Frame::TransportError { .. } | Frame::DecodeError { .. } => "",
        }
    }

    /// Short description shown next to the kind in traffic listings
    pub fn action(&self) -> Cow<'_, str> {
        match self {
            Frame::Call { action, .. } => Cow::Borrowed(action),
            Frame::CallResult { .. } => Cow::Borrowed("(result)"),
            Frame::CallError { code, .. } => Cow::Borrowed(code.as_str()),
            Frame::Opened { url, .. } => Cow::Borrowed(url),
            Frame::Closed { code, .. } => Cow::Owned(code.to_string()),
            Frame::TransportError { message } | Frame::DecodeError { message } => {
                Cow::Borrowed(message)
            }
        }
    }

    /// True for the three shapes that travel over the wire
    pub fn is_wire(&self) -> bool {
        matches!(
            self,
            Frame::Call { .. } | Frame::CallResult { .. } | Frame::CallError { .. }
        )
    }

    /// Positional array form of the frame
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Call {
                id,
                action,
                payload,
            } => json!([MessageType::Call as i32, id, action, payload]),
            Frame::CallResult { id, payload } => {
                let payload = if payload.is_null() {
                    Value::Object(Map::new())
                } else {
                    payload.clone()
                };
                json!([MessageType::CallResult as i32, id, payload])
            }
            Frame::CallError {
                id,
                code,
                description,
                details,
            } => {
                let details = if details.is_null() {
                    Value::Object(Map::new())
                } else {
                    details.clone()
                };
                json!([MessageType::CallError as i32, id, code.as_str(), description, details])
            }
            Frame::Opened { url, subprotocol } => json!(["OPEN", url, subprotocol]),
            Frame::Closed { code, reason } => json!(["CLOSE", code, reason]),
            Frame::TransportError { message } => json!(["ERROR", message]),
            Frame::DecodeError { message } => json!(["PARSE_ERR", message]),
        }
    }
}

/// Serialize a frame to its JSON array bytes
pub fn encode(frame: &Frame) -> Vec<u8> {
    frame.to_value().to_string().into_bytes()
}

/// Parse a wire frame from JSON bytes
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let mut array = match value {
        Value::Array(array) if !array.is_empty() => array,
        _ => return Err(FrameError::NotAnArray),
    };

    let kind = array[0]
        .as_u64()
        .and_then(MessageType::from_tag)
        .ok_or_else(|| FrameError::UnknownType(array[0].clone()))?;

    if array.len() != kind.arity() {
        return Err(FrameError::WrongArity {
            kind,
            expected: kind.arity(),
            actual: array.len(),
        });
    }

    let id = take_string(&mut array[1], "messageId")?;

    match kind {
        MessageType::Call => {
            let action = take_string(&mut array[2], "action")?;
            Ok(Frame::Call {
                id,
                action,
                payload: array[3].take(),
            })
        }
        MessageType::CallResult => Ok(Frame::CallResult {
            id,
            payload: array[2].take(),
        }),
        MessageType::CallError => {
            let code = take_string(&mut array[2], "errorCode")?;
            let description = take_string(&mut array[3], "errorDescription")?;
            Ok(Frame::CallError {
                id,
                code: ErrorCode::from(code.as_str()),
                description,
                details: array[4].take(),
            })
        }
    }
}

fn take_string(value: &mut Value, field: &'static str) -> Result<String, FrameError> {
    match value.take() {
        Value::String(s) => Ok(s),
        _ => Err(FrameError::NotAString(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Frame::call("Heartbeat", json!({}));
        let text = String::from_utf8(encode(&call)).unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        match decode(json.as_bytes()).unwrap() {
            Frame::Call { id, action, .. } => {
                assert_eq!(id, "msg-123");
                assert_eq!(action, "Heartbeat");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let frame = decode(br#"[2, "x", "Foo", {"a": 1}]"#).unwrap();
        assert_eq!(frame.action(), "Foo");
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        match decode(json.as_bytes()).unwrap() {
            Frame::CallResult { id, payload } => {
                assert_eq!(id, "msg-123");
                assert_eq!(payload["currentTime"], "2026-01-20T12:00:00Z");
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        match decode(json.as_bytes()).unwrap() {
            Frame::CallError { id, code, description, .. } => {
                assert_eq!(id, "msg-123");
                assert_eq!(code, ErrorCode::NotImplemented);
                assert_eq!(description, "Action not supported");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_error_code_preserved() {
        let frame = decode(br#"[4, "e1", "VendorSpecific", "", {}]"#).unwrap();
        let text = String::from_utf8(encode(&frame)).unwrap();
        assert!(text.contains("\"VendorSpecific\""));
    }

    #[test]
    fn test_malformed_input() {
        assert!(matches!(decode(b"not json"), Err(FrameError::Json(_))));
        assert!(matches!(decode(b"{}"), Err(FrameError::NotAnArray)));
        assert!(matches!(decode(b"[]"), Err(FrameError::NotAnArray)));
        assert!(matches!(
            decode(br#"[9, "id", {}]"#),
            Err(FrameError::UnknownType(_))
        ));
        assert!(matches!(
            decode(br#"["OPEN", "ws://x", "ocpp1.6"]"#),
            Err(FrameError::UnknownType(_))
        ));
        assert!(matches!(
            decode(br#"[2, "id", "Heartbeat"]"#),
            Err(FrameError::WrongArity { expected: 4, actual: 3, .. })
        ));
        assert!(matches!(
            decode(br#"[3, 17, {}]"#),
            Err(FrameError::NotAString("messageId"))
        ));
    }

    #[test]
    fn test_null_result_payload_encodes_as_object() {
        let frame = Frame::result("r1", Value::Null);
        assert_eq!(encode(&frame), br#"[3,"r1",{}]"#.to_vec());
    }

    #[test]
    fn test_pseudo_frame_summaries() {
        let closed = Frame::Closed {
            code: 1000,
            reason: "Client disconnect".into(),
        };
        assert_eq!(closed.kind(), FrameKind::Close);
        assert_eq!(closed.action(), "1000");
        assert_eq!(closed.id(), "Client disconnect");
        assert_eq!(
            closed.to_value(),
            json!(["CLOSE", 1000, "Client disconnect"])
        );
        assert!(!closed.is_wire());

        let result = Frame::result("r1", json!({}));
        assert_eq!(result.action(), "(result)");
        assert_eq!(result.kind().as_str(), "CALLRESULT");
    }
}
