//! JSON-RPC 2.0 wire codec
//!
//! Encodes and decodes single messages and batches. Decoding distinguishes
//! between text that is not JSON at all ([`McpError::Parse`]) and JSON that is
//! not a valid JSON-RPC 2.0 message ([`McpError::InvalidRequest`]).
//!
//! Payloads stay generic (`serde_json::Value`); per-method shapes are imposed
//! later by [`crate::protocol::methods`].

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{McpError, McpResult};

/// JSON-RPC version marker carried by every message
pub const JSONRPC_VERSION: &str = "2.0";

// ============================================================================
// Request Identifiers
// ============================================================================

/// Request identifier; numbers keep their textual form through a round trip
#[derive(Debug, Clone)]
pub enum RequestId {
    Number(serde_json::Number),
    String(String),
}

impl RequestId {
    /// Interpret a JSON value as a request id (strings and numbers only)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(RequestId::Number(n.clone())),
            Value::String(s) => Some(RequestId::String(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RequestId::Number(n) => Value::Number(n.clone()),
            RequestId::String(s) => Value::String(s.clone()),
        }
    }

    /// Placeholder id used when an error cannot be tied to a request
    pub fn unknown() -> Self {
        RequestId::String("unknown".to_string())
    }
}

impl PartialEq for RequestId {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RequestId::Number(a), RequestId::Number(b)) => a.to_string() == b.to_string(),
            (RequestId::String(a), RequestId::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for RequestId {}

impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            RequestId::Number(n) => {
                0u8.hash(state);
                n.to_string().hash(state);
            }
            RequestId::String(s) => {
                1u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "\"{s}\""),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        RequestId::Number(value.into())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        RequestId::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        RequestId::String(value)
    }
}

impl Serialize for RequestId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RequestId::Number(n) => n.serialize(serializer),
            RequestId::String(s) => s.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        RequestId::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom("request id must be a string or a number"))
    }
}

// ============================================================================
// Messages
// ============================================================================

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Value,
}

/// Error response; `id` is `None` only when the failing request's id was unreadable
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub id: Option<RequestId>,
    pub error: ErrorObject,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// Any single JSON-RPC 2.0 message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Error(ErrorResponse),
    Notification(Notification),
}

impl Message {
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, result: Value) -> Self {
        Message::Response(Response { id, result })
    }

    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Message::Error(ErrorResponse { id, error })
    }

    /// Correlation id, absent for notifications
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Message::Request(r) => Some(&r.id),
            Message::Response(r) => Some(&r.id),
            Message::Error(e) => e.id.as_ref(),
            Message::Notification(_) => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Notification(n) => Some(&n.method),
            _ => None,
        }
    }

    /// True for responses and error responses
    pub fn is_reply(&self) -> bool {
        matches!(self, Message::Response(_) | Message::Error(_))
    }

    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification(_))
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Message::Request(r) => {
                map.serialize_entry("id", &r.id)?;
                map.serialize_entry("method", &r.method)?;
                if let Some(params) = &r.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Message::Response(r) => {
                map.serialize_entry("id", &r.id)?;
                map.serialize_entry("result", &r.result)?;
            }
            Message::Error(e) => {
                map.serialize_entry("id", &e.id)?;
                map.serialize_entry("error", &e.error)?;
            }
            Message::Notification(n) => {
                map.serialize_entry("method", &n.method)?;
                if let Some(params) = &n.params {
                    map.serialize_entry("params", params)?;
                }
            }
        }
        map.end()
    }
}

/// A decoded unit of wire traffic: one message or an ordered batch
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Single(Message),
    Batch(Vec<Message>),
}

impl Payload {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            Payload::Single(message) => vec![message],
            Payload::Batch(messages) => messages,
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Payload::Batch(_))
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode one message as a compact JSON document (never contains a newline)
pub fn encode_message(message: &Message) -> McpResult<String> {
    Ok(serde_json::to_string(message)?)
}

/// Encode a batch as a JSON array
pub fn encode_batch(messages: &[Message]) -> McpResult<String> {
    if messages.is_empty() {
        return Err(McpError::validation("a batch must contain at least one message"));
    }
    Ok(serde_json::to_string(messages)?)
}

pub fn encode_payload(payload: &Payload) -> McpResult<String> {
    match payload {
        Payload::Single(message) => encode_message(message),
        Payload::Batch(messages) => encode_batch(messages),
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a single message or a batch from JSON text
pub fn decode(input: &str) -> McpResult<Payload> {
    let value: Value =
        serde_json::from_str(input.trim()).map_err(|e| McpError::Parse(e.to_string()))?;
    decode_value(value)
}

/// Decode from raw bytes, rejecting invalid UTF-8 as a parse error
pub fn decode_slice(input: &[u8]) -> McpResult<Payload> {
    let text = std::str::from_utf8(input)
        .map_err(|e| McpError::Parse(format!("invalid UTF-8: {e}")))?;
    decode(text)
}

/// Decode an already parsed JSON value
///
/// Strict: one malformed batch member fails the whole value. A peer that
/// must answer every member uses [`decode_tolerant`] instead.
pub fn decode_value(value: Value) -> McpResult<Payload> {
    let decoded = decode_value_tolerant(value)?;
    if let Some(rejected) = decoded.rejected.into_iter().next() {
        return Err(rejected.error);
    }
    decoded
        .payload
        .ok_or_else(|| McpError::InvalidRequest("empty batch".to_string()))
}

/// A batch member that did not decode
#[derive(Debug, Clone)]
pub struct Rejected {
    /// Id recovered from the member, when it carried a usable one
    pub id: Option<RequestId>,
    pub error: McpError,
}

/// Decoded input with per-member failures kept apart
#[derive(Debug, Clone)]
pub struct Decoded {
    /// Members that decoded; `None` when every batch member was rejected
    pub payload: Option<Payload>,
    pub rejected: Vec<Rejected>,
}

/// Decode text, keeping the valid members of a batch
///
/// Input that is not JSON, a single malformed message and an empty batch
/// still fail as a whole.
pub fn decode_tolerant(input: &str) -> McpResult<Decoded> {
    let value: Value =
        serde_json::from_str(input.trim()).map_err(|e| McpError::Parse(e.to_string()))?;
    decode_value_tolerant(value)
}

pub fn decode_slice_tolerant(input: &[u8]) -> McpResult<Decoded> {
    let text = std::str::from_utf8(input)
        .map_err(|e| McpError::Parse(format!("invalid UTF-8: {e}")))?;
    decode_tolerant(text)
}

pub fn decode_value_tolerant(value: Value) -> McpResult<Decoded> {
    let Value::Array(items) = value else {
        return Ok(Decoded {
            payload: Some(Payload::Single(decode_message(value)?)),
            rejected: Vec::new(),
        });
    };
    if items.is_empty() {
        return Err(McpError::InvalidRequest("empty batch".to_string()));
    }

    let mut messages = Vec::with_capacity(items.len());
    let mut rejected = Vec::new();
    for item in items {
        let id = item.get("id").and_then(RequestId::from_value);
        match decode_message(item) {
            Ok(message) => messages.push(message),
            Err(error) => rejected.push(Rejected { id, error }),
        }
    }
    Ok(Decoded {
        payload: (!messages.is_empty()).then_some(Payload::Batch(messages)),
        rejected,
    })
}

/// Decode one JSON object into a [`Message`]
pub fn decode_message(value: Value) -> McpResult<Message> {
    let Value::Object(mut object) = value else {
        return Err(McpError::InvalidRequest(
            "message must be a JSON object".to_string(),
        ));
    };

    match object.get("jsonrpc") {
        Some(Value::String(version)) if version == JSONRPC_VERSION => {}
        _ => {
            return Err(McpError::InvalidRequest(
                "missing or unsupported \"jsonrpc\" version".to_string(),
            ));
        }
    }

    let id = take_id(&mut object)?;

    if let Some(method) = object.remove("method") {
        let Value::String(method) = method else {
            return Err(McpError::InvalidRequest(
                "\"method\" must be a string".to_string(),
            ));
        };
        let params = object.remove("params");
        if let Some(params) = &params
            && !(params.is_object() || params.is_array())
        {
            return Err(McpError::InvalidRequest(
                "\"params\" must be an object or an array".to_string(),
            ));
        }
        return match id {
            IdField::Absent => Ok(Message::Notification(Notification { method, params })),
            IdField::Present(id) => Ok(Message::Request(Request { id, method, params })),
            IdField::Null => Err(McpError::InvalidRequest(
                "request id must not be null".to_string(),
            )),
        };
    }

    if let Some(result) = object.remove("result") {
        return match id {
            IdField::Present(id) => Ok(Message::Response(Response { id, result })),
            _ => Err(McpError::InvalidRequest(
                "response is missing its id".to_string(),
            )),
        };
    }

    if let Some(error) = object.remove("error") {
        let error: ErrorObject = serde_json::from_value(error)
            .map_err(|e| McpError::InvalidRequest(format!("malformed error object: {e}")))?;
        return match id {
            IdField::Present(id) => Ok(Message::Error(ErrorResponse {
                id: Some(id),
                error,
            })),
            IdField::Null => Ok(Message::Error(ErrorResponse { id: None, error })),
            IdField::Absent => Err(McpError::InvalidRequest(
                "error response is missing its id".to_string(),
            )),
        };
    }

    Err(McpError::InvalidRequest(
        "message has no method, result or error".to_string(),
    ))
}

enum IdField {
    Absent,
    Null,
    Present(RequestId),
}

fn take_id(object: &mut Map<String, Value>) -> McpResult<IdField> {
    match object.remove("id") {
        None => Ok(IdField::Absent),
        Some(Value::Null) => Ok(IdField::Null),
        Some(value) => RequestId::from_value(&value)
            .map(IdField::Present)
            .ok_or_else(|| {
                McpError::InvalidRequest("id must be a string or a number".to_string())
            }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_decode_request_and_notification() {
        let payload =
            decode(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo"}}"#)
                .unwrap();
        match payload {
            Payload::Single(Message::Request(request)) => {
                assert_eq!(request.id, RequestId::from(1i64));
                assert_eq!(request.method, "tools/call");
                assert_eq!(request.params, Some(json!({"name": "echo"})));
            }
            other => panic!("Expected request, got {other:?}"),
        }

        let payload = decode(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        match payload {
            Payload::Single(message) => {
                assert!(message.is_notification());
                assert!(message.id().is_none());
            }
            other => panic!("Expected notification, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_versus_invalid_request() {
        let err = decode("{not json").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);

        let err = decode(r#"{"id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = decode(r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = decode(r#"{"jsonrpc":"2.0","id":1}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = decode("[]").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);

        let err = decode(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_ids_preserved_textually() {
        for raw in [
            r#"{"jsonrpc":"2.0","id":18446744073709551615,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":-7,"result":{}}"#,
            r#"{"jsonrpc":"2.0","id":"abc-123","result":{}}"#,
        ] {
            let message = match decode(raw).unwrap() {
                Payload::Single(m) => m,
                other => panic!("Expected single message, got {other:?}"),
            };
            assert_eq!(encode_message(&message).unwrap(), raw);
        }
    }

    #[test]
    fn test_string_and_number_ids_are_distinct() {
        assert_ne!(RequestId::from(1i64), RequestId::from("1"));
        assert_eq!(RequestId::from(5u64), RequestId::from(5i64));
    }

    #[test]
    fn test_encode_field_order_and_omitted_params() {
        let encoded = encode_message(&Message::request(1i64, "ping", None)).unwrap();
        assert_eq!(encoded, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);

        let encoded =
            encode_message(&Message::notification("notifications/initialized", None)).unwrap();
        assert_eq!(
            encoded,
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#
        );
    }

    #[test]
    fn test_batch_fixed_point() {
        let batch = vec![
            Message::request(1i64, "tools/list", Some(json!({}))),
            Message::notification("notifications/progress", Some(json!({"progress": 1}))),
            Message::request("b", "prompts/get", Some(json!({"name": "x"}))),
        ];
        let encoded = encode_batch(&batch).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.is_batch());
        let reencoded = encode_payload(&decoded).unwrap();
        assert_eq!(encoded, reencoded);

        let messages = decoded.into_messages();
        assert_eq!(messages, batch);
        assert!(messages[1].id().is_none());
    }

    #[test]
    fn test_error_response_with_null_id() {
        let raw = r#"{"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"Parse error"}}"#;
        match decode(raw).unwrap() {
            Payload::Single(Message::Error(e)) => {
                assert!(e.id.is_none());
                assert_eq!(e.error.code, -32700);
            }
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_slice_rejects_bad_utf8() {
        let err = decode_slice(&[0xff, 0xfe]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);
    }

    #[test]
    fn test_tolerant_batch_keeps_valid_members() {
        let decoded = decode_tolerant(
            r#"[{"jsonrpc":"2.0","id":7,"method":"ping"},{"foo":1},{"jsonrpc":"2.0","id":"x"}]"#,
        )
        .unwrap();
        match decoded.payload {
            Some(Payload::Batch(messages)) => {
                assert_eq!(messages.len(), 1);
                assert_eq!(messages[0].id(), Some(&RequestId::from(7i64)));
            }
            other => panic!("Expected batch of one, got {other:?}"),
        }
        assert_eq!(decoded.rejected.len(), 2);
        assert_eq!(decoded.rejected[0].id, None);
        assert_eq!(decoded.rejected[1].id, Some(RequestId::from("x")));
        assert!(
            decoded
                .rejected
                .iter()
                .all(|r| r.error.kind() == ErrorKind::InvalidRequest)
        );

        // strict decoding still refuses the mixed batch
        let err = decode(r#"[{"jsonrpc":"2.0","id":7,"method":"ping"},{"foo":1}]"#).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    }

    #[test]
    fn test_tolerant_batch_of_only_garbage() {
        let decoded = decode_tolerant("[1, 2]").unwrap();
        assert!(decoded.payload.is_none());
        assert_eq!(decoded.rejected.len(), 2);

        assert_eq!(decode_tolerant("[]").unwrap_err().kind(), ErrorKind::InvalidRequest);
        assert_eq!(decode_tolerant("{oops").unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(
            decode_tolerant(r#"{"foo":1}"#).unwrap_err().kind(),
            ErrorKind::InvalidRequest
        );
    }
}
