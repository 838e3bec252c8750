//! Reserved JSON-RPC error codes
//!
//! Three ranges are in use:
//!
//! - **Standard JSON-RPC**: -32700 and -32600..-32603
//! - **Protocol specific**: -32000..-32009
//! - **Transport / session**: -32100..-32103

// ============================================================================
// Standard JSON-RPC 2.0
// ============================================================================

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// ============================================================================
// Protocol specific
// ============================================================================

pub const MCP_ERROR: i32 = -32000;
pub const TRANSPORT_ERROR: i32 = -32001;
pub const RESOURCE_NOT_FOUND: i32 = -32002;
pub const TOOL_NOT_FOUND: i32 = -32003;
pub const PROMPT_NOT_FOUND: i32 = -32004;
pub const AUTHENTICATION_ERROR: i32 = -32005;
pub const AUTHORIZATION_ERROR: i32 = -32006;
pub const VALIDATION_ERROR: i32 = -32007;
pub const PROTOCOL_VIOLATION: i32 = -32008;
pub const CAPABILITY_UNSUPPORTED: i32 = -32009;

// ============================================================================
// Transport and session
// ============================================================================

pub const CONNECTION_FAILED: i32 = -32100;
pub const SESSION_EXPIRED: i32 = -32101;
pub const STREAM_LOST: i32 = -32102;
pub const INVALID_SESSION: i32 = -32103;

/// Human readable name for a reserved code, if it is one
pub fn code_name(code: i32) -> Option<&'static str> {
    let name = match code {
        PARSE_ERROR => "parse error",
        INVALID_REQUEST => "invalid request",
        METHOD_NOT_FOUND => "method not found",
        INVALID_PARAMS => "invalid params",
        INTERNAL_ERROR => "internal error",
        MCP_ERROR => "mcp error",
        TRANSPORT_ERROR => "transport error",
        RESOURCE_NOT_FOUND => "resource not found",
        TOOL_NOT_FOUND => "tool not found",
        PROMPT_NOT_FOUND => "prompt not found",
        AUTHENTICATION_ERROR => "authentication error",
        AUTHORIZATION_ERROR => "authorization error",
        VALIDATION_ERROR => "validation error",
        PROTOCOL_VIOLATION => "protocol violation",
        CAPABILITY_UNSUPPORTED => "capability unsupported",
        CONNECTION_FAILED => "connection failed",
        SESSION_EXPIRED => "session expired",
        STREAM_LOST => "stream lost",
        INVALID_SESSION => "invalid session",
        _ => return None,
    };
    Some(name)
}

/// Check if the given code is in the implementation-defined server range
pub fn is_server_error(code: i32) -> bool {
    (-32099..=-32000).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_ranges() {
        assert!(is_server_error(MCP_ERROR));
        assert!(is_server_error(CAPABILITY_UNSUPPORTED));
        assert!(!is_server_error(INVALID_SESSION));
        assert!(!is_server_error(PARSE_ERROR));
        assert_eq!(code_name(SESSION_EXPIRED), Some("session expired"));
        assert_eq!(code_name(-1), None);
    }
}
