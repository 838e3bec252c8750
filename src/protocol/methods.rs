//! Method namespace and typed per-method parameters
//!
//! The codec keeps params as raw JSON. At the router boundary they are parsed
//! into [`ClientRequest`] / [`ClientNotification`], so handlers receive
//! required fields already checked.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{McpError, McpResult};
use crate::protocol::codec::RequestId;

// ============================================================================
// Protocol Versions
// ============================================================================

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

/// Revision that used the separate SSE + POST endpoint pair
pub const LEGACY_SSE_PROTOCOL_VERSION: &str = "2024-11-05";

pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &[LATEST_PROTOCOL_VERSION, "2025-03-26", LEGACY_SSE_PROTOCOL_VERSION];

// ============================================================================
// Method Names
// ============================================================================

pub mod method {
    pub const INITIALIZE: &str = "initialize";
    pub const PING: &str = "ping";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
    pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";
    pub const PROMPTS_LIST: &str = "prompts/list";
    pub const PROMPTS_GET: &str = "prompts/get";
}

pub mod notification {
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const PROGRESS: &str = "notifications/progress";
    pub const CANCELLED: &str = "notifications/cancelled";
    pub const MESSAGE: &str = "notifications/message";
    pub const RESOURCES_UPDATED: &str = "notifications/resources/updated";
    pub const RESOURCES_LIST_CHANGED: &str = "notifications/resources/list_changed";
    pub const TOOLS_LIST_CHANGED: &str = "notifications/tools/list_changed";
    pub const PROMPTS_LIST_CHANGED: &str = "notifications/prompts/list_changed";
}

// ============================================================================
// Handshake Types
// ============================================================================

/// Name and version of a peer implementation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub client_info: Implementation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: Value,
    pub server_info: Implementation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

// ============================================================================
// Request Params
// ============================================================================

/// Pagination params shared by every `*/list` method
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceParams {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPromptParams {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    pub request_id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    pub progress_token: Value,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Typed Requests
// ============================================================================

/// Client-to-server requests, one variant per method
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Initialize(InitializeParams),
    Ping,
    ListTools(ListParams),
    CallTool(CallToolParams),
    ListResources(ListParams),
    ReadResource(ResourceParams),
    Subscribe(ResourceParams),
    Unsubscribe(ResourceParams),
    ListPrompts(ListParams),
    GetPrompt(GetPromptParams),
}

impl ClientRequest {
    /// Parse method + raw params; unknown methods and bad params fail here
    pub fn parse(method: &str, params: Option<Value>) -> McpResult<Self> {
        let request = match method {
            method::INITIALIZE => ClientRequest::Initialize(required(method, params)?),
            method::PING => ClientRequest::Ping,
            method::TOOLS_LIST => ClientRequest::ListTools(optional(method, params)?),
            method::TOOLS_CALL => ClientRequest::CallTool(required(method, params)?),
            method::RESOURCES_LIST => ClientRequest::ListResources(optional(method, params)?),
            method::RESOURCES_READ => ClientRequest::ReadResource(required(method, params)?),
            method::RESOURCES_SUBSCRIBE => ClientRequest::Subscribe(required(method, params)?),
            method::RESOURCES_UNSUBSCRIBE => {
                ClientRequest::Unsubscribe(required(method, params)?)
            }
            method::PROMPTS_LIST => ClientRequest::ListPrompts(optional(method, params)?),
            method::PROMPTS_GET => ClientRequest::GetPrompt(required(method, params)?),
            other => return Err(McpError::MethodNotFound(other.to_string())),
        };
        Ok(request)
    }

    pub fn method(&self) -> &'static str {
        match self {
            ClientRequest::Initialize(_) => method::INITIALIZE,
            ClientRequest::Ping => method::PING,
            ClientRequest::ListTools(_) => method::TOOLS_LIST,
            ClientRequest::CallTool(_) => method::TOOLS_CALL,
            ClientRequest::ListResources(_) => method::RESOURCES_LIST,
            ClientRequest::ReadResource(_) => method::RESOURCES_READ,
            ClientRequest::Subscribe(_) => method::RESOURCES_SUBSCRIBE,
            ClientRequest::Unsubscribe(_) => method::RESOURCES_UNSUBSCRIBE,
            ClientRequest::ListPrompts(_) => method::PROMPTS_LIST,
            ClientRequest::GetPrompt(_) => method::PROMPTS_GET,
        }
    }
}

/// Client-to-server notifications
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotification {
    Initialized,
    Cancelled(CancelledParams),
    Progress(ProgressParams),
    /// Any other notification; kept so the router can decide what to do
    Other { method: String, params: Option<Value> },
}

impl ClientNotification {
    pub fn parse(method: &str, params: Option<Value>) -> McpResult<Self> {
        let parsed = match method {
            notification::INITIALIZED => ClientNotification::Initialized,
            notification::CANCELLED => ClientNotification::Cancelled(required(method, params)?),
            notification::PROGRESS => ClientNotification::Progress(required(method, params)?),
            other => ClientNotification::Other {
                method: other.to_string(),
                params,
            },
        };
        Ok(parsed)
    }
}

fn required<T: for<'de> Deserialize<'de>>(method: &str, params: Option<Value>) -> McpResult<T> {
    let params = params.ok_or_else(|| McpError::InvalidParams(format!("{method} requires params")))?;
    serde_json::from_value(params).map_err(|e| McpError::InvalidParams(format!("{method}: {e}")))
}

fn optional<T: for<'de> Deserialize<'de> + Default>(
    method: &str,
    params: Option<Value>,
) -> McpResult<T> {
    match params {
        None | Some(Value::Null) => Ok(T::default()),
        Some(params) => serde_json::from_value(params)
            .map_err(|e| McpError::InvalidParams(format!("{method}: {e}"))),
    }
}

/// Whether a protocol version string is one this crate speaks
pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_parse_typed_requests() {
        let request = ClientRequest::parse(
            method::TOOLS_CALL,
            Some(json!({"name": "echo", "arguments": {"message": "hi"}})),
        )
        .unwrap();
        assert_eq!(
            request,
            ClientRequest::CallTool(CallToolParams {
                name: "echo".into(),
                arguments: Some(json!({"message": "hi"})),
            })
        );
        assert_eq!(request.method(), "tools/call");

        let request = ClientRequest::parse(method::TOOLS_LIST, None).unwrap();
        assert_eq!(request, ClientRequest::ListTools(ListParams::default()));
    }

    #[test]
    fn test_missing_required_field_is_invalid_params() {
        let err = ClientRequest::parse(method::RESOURCES_READ, Some(json!({}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);

        let err = ClientRequest::parse(method::PROMPTS_GET, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParams);
    }

    #[test]
    fn test_unknown_method() {
        let err = ClientRequest::parse("tools/explode", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);
    }

    #[test]
    fn test_initialize_params_camel_case() {
        let request = ClientRequest::parse(
            method::INITIALIZE,
            Some(json!({
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {"roots": {}},
                "clientInfo": {"name": "test", "version": "1.0"}
            })),
        )
        .unwrap();
        match request {
            ClientRequest::Initialize(params) => {
                assert_eq!(params.protocol_version, LATEST_PROTOCOL_VERSION);
                assert_eq!(params.client_info.name, "test");
            }
            other => panic!("Expected Initialize, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_notifications() {
        let parsed = ClientNotification::parse(
            notification::CANCELLED,
            Some(json!({"requestId": 7, "reason": "user abort"})),
        )
        .unwrap();
        assert_eq!(
            parsed,
            ClientNotification::Cancelled(CancelledParams {
                request_id: RequestId::from(7i64),
                reason: Some("user abort".into()),
            })
        );

        let parsed = ClientNotification::parse("notifications/custom", None).unwrap();
        assert!(matches!(parsed, ClientNotification::Other { .. }));
    }
}
