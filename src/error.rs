//! Error taxonomy shared by every layer of the engine
//!
//! Every failure that leaves a component is expressed as an [`McpError`].
//! Each variant belongs to an [`ErrorKind`], which is what recovery strategies
//! and statistics key on, and maps to exactly one wire code from
//! [`crate::protocol::codes`].

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use crate::protocol::codec::ErrorObject;
use crate::protocol::codes;

// ============================================================================
// Error Kinds
// ============================================================================

/// Coarse classification of an [`McpError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Protocol,
    Transport,
    Authentication,
    Authorization,
    Timeout,
    Cancelled,
    Session,
    NotFound,
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Remote,
    System,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Transport => "transport",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Session => "session",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Parse => "parse",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::MethodNotFound => "method_not_found",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::Remote => "remote",
            ErrorKind::System => "system",
        };
        f.write_str(name)
    }
}

/// Which catalog a lookup failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogKind {
    Tool,
    Resource,
    Prompt,
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogKind::Tool => f.write_str("Tool"),
            CatalogKind::Resource => f.write_str("Resource"),
            CatalogKind::Prompt => f.write_str("Prompt"),
        }
    }
}

// ============================================================================
// McpError
// ============================================================================

/// Crate-wide error type
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    /// Malformed input caught before any I/O; never sent on the wire as such
    #[error("Validation error: {0}")]
    Validation(String),

    /// Handshake, version or sequencing violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Spawn failure, broken pipe, connection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// SSE stream dropped and could not be resumed
    #[error("Stream lost: {0}")]
    StreamLost(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization denied: {0}")]
    Authorization(String),

    /// Correlator deadline exceeded
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Request removed locally before a response arrived
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Session expired: {0}")]
    SessionExpired(String),

    #[error("Invalid session: {0}")]
    InvalidSession(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: CatalogKind, name: String },

    #[error("Capability not supported: {0}")]
    CapabilityUnsupported(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Error response received from the peer that maps to no local variant
    #[error("Remote error ({code}): {message}")]
    Remote {
        code: i32,
        message: String,
        data: Option<Value>,
    },

    /// Uncategorized internal fault
    #[error("System error: {0}")]
    System(String),
}

pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    pub fn validation(message: impl Into<String>) -> Self {
        McpError::Validation(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        McpError::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        McpError::Transport(message.into())
    }

    pub fn system(message: impl Into<String>) -> Self {
        McpError::System(message.into())
    }

    pub fn tool_not_found(name: impl Into<String>) -> Self {
        McpError::NotFound {
            kind: CatalogKind::Tool,
            name: name.into(),
        }
    }

    pub fn resource_not_found(uri: impl Into<String>) -> Self {
        McpError::NotFound {
            kind: CatalogKind::Resource,
            name: uri.into(),
        }
    }

    pub fn prompt_not_found(name: impl Into<String>) -> Self {
        McpError::NotFound {
            kind: CatalogKind::Prompt,
            name: name.into(),
        }
    }

    /// Classification used by recovery filters and statistics
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Validation(_) => ErrorKind::Validation,
            McpError::Protocol(_) | McpError::CapabilityUnsupported(_) => ErrorKind::Protocol,
            McpError::Transport(_) | McpError::StreamLost(_) => ErrorKind::Transport,
            McpError::Authentication(_) => ErrorKind::Authentication,
            McpError::Authorization(_) => ErrorKind::Authorization,
            McpError::Timeout(_) => ErrorKind::Timeout,
            McpError::Cancelled(_) => ErrorKind::Cancelled,
            McpError::SessionExpired(_) | McpError::InvalidSession(_) => ErrorKind::Session,
            McpError::NotFound { .. } => ErrorKind::NotFound,
            McpError::Parse(_) => ErrorKind::Parse,
            McpError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            McpError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            McpError::InvalidParams(_) => ErrorKind::InvalidParams,
            McpError::Remote { .. } => ErrorKind::Remote,
            McpError::System(_) => ErrorKind::System,
        }
    }

    /// Wire code for this error
    pub fn code(&self) -> i32 {
        match self {
            McpError::Validation(_) => codes::VALIDATION_ERROR,
            McpError::Protocol(_) => codes::PROTOCOL_VIOLATION,
            McpError::CapabilityUnsupported(_) => codes::CAPABILITY_UNSUPPORTED,
            McpError::Transport(_) | McpError::Timeout(_) => codes::TRANSPORT_ERROR,
            McpError::StreamLost(_) => codes::STREAM_LOST,
            McpError::Authentication(_) => codes::AUTHENTICATION_ERROR,
            McpError::Authorization(_) => codes::AUTHORIZATION_ERROR,
            McpError::Cancelled(_) => codes::MCP_ERROR,
            McpError::SessionExpired(_) => codes::SESSION_EXPIRED,
            McpError::InvalidSession(_) => codes::INVALID_SESSION,
            McpError::NotFound { kind, .. } => match kind {
                CatalogKind::Tool => codes::TOOL_NOT_FOUND,
                CatalogKind::Resource => codes::RESOURCE_NOT_FOUND,
                CatalogKind::Prompt => codes::PROMPT_NOT_FOUND,
            },
            McpError::Parse(_) => codes::PARSE_ERROR,
            McpError::InvalidRequest(_) => codes::INVALID_REQUEST,
            McpError::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => codes::INVALID_PARAMS,
            McpError::Remote { code, .. } => *code,
            McpError::System(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Whether a retry of the same operation could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::Timeout | ErrorKind::Session
        )
    }

    /// Build the wire error object for this error
    pub fn to_error_object(&self) -> ErrorObject {
        let data = match self {
            McpError::Remote { data, .. } => data.clone(),
            McpError::NotFound { name, .. } => Some(json!({ "name": name })),
            McpError::Timeout(duration) => {
                Some(json!({ "timeoutMs": duration.as_millis() as u64 }))
            }
            _ => None,
        };
        let message = match self {
            McpError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorObject {
            code: self.code(),
            message,
            data,
        }
    }

    /// Map an error object received from a peer back into the taxonomy
    pub fn from_error_object(error: ErrorObject) -> Self {
        let ErrorObject {
            code,
            message,
            data,
        } = error;
        match code {
            codes::PARSE_ERROR => McpError::Parse(message),
            codes::INVALID_REQUEST => McpError::InvalidRequest(message),
            codes::METHOD_NOT_FOUND => McpError::MethodNotFound(message),
            codes::INVALID_PARAMS => McpError::InvalidParams(message),
            codes::AUTHENTICATION_ERROR => McpError::Authentication(message),
            codes::AUTHORIZATION_ERROR => McpError::Authorization(message),
            codes::PROTOCOL_VIOLATION => McpError::Protocol(message),
            codes::TRANSPORT_ERROR => McpError::Transport(message),
            codes::STREAM_LOST => McpError::StreamLost(message),
            codes::SESSION_EXPIRED => McpError::SessionExpired(message),
            codes::INVALID_SESSION => McpError::InvalidSession(message),
            _ => McpError::Remote {
                code,
                message,
                data,
            },
        }
    }
}

impl From<serde_json::Error> for McpError {
    fn from(error: serde_json::Error) -> Self {
        McpError::System(format!("JSON serialization failed: {error}"))
    }
}

// ============================================================================
// Tests
// ============================================================================
