//! Configuration for clients, transports and servers
//!
//! Every config has a `Default`, builder-style `with_*` methods and a
//! `validate()` that fails with [`ConfigError`] before any I/O happens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tracing::warn;

use crate::error::McpError;
use crate::io::process::ProcessExitHandler;
use crate::protocol::methods::{Implementation, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Default timeout for a single request/response exchange (30 seconds)
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the `initialize` exchange (30 seconds)
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Maximum length of one line on the stdio carrier (16MB)
pub const DEFAULT_STDIO_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Time a child process gets to exit after SIGTERM before it is killed
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Idle timeout for the long-lived SSE stream (5 minutes)
pub const DEFAULT_SSE_TIMEOUT_SECS: u64 = 300;

/// Idle time after which a server session expires (30 minutes)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 1800;

/// Events retained per session by the in-memory event store
pub const DEFAULT_MAX_EVENTS_PER_SESSION: usize = 1000;

/// Interval between SSE keep-alive comments
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 15;

// ============================================================================
// Errors
// ============================================================================

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Missing required configuration field
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    /// Field present but unusable
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Invalid timeout value
    #[error("Invalid timeout for {field}: {reason}")]
    InvalidTimeout { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ConfigError> for McpError {
    fn from(error: ConfigError) -> Self {
        McpError::Validation(error.to_string())
    }
}

fn require_nonzero(field: &str, timeout: Duration) -> Result<(), ConfigError> {
    if timeout.is_zero() {
        return Err(ConfigError::InvalidTimeout {
            field: field.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Client
// ============================================================================

/// Handshake and request settings for a client session
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity sent in `initialize`
    pub client_info: Implementation,

    /// Protocol version requested; the server must answer with exactly this
    pub protocol_version: String,

    /// Declared client capabilities
    pub capabilities: Value,

    /// Timeout for ordinary requests
    pub request_timeout: Duration,

    /// Timeout for the `initialize` request
    pub initialization_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: json!({}),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            initialization_timeout: Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS),
        }
    }
}

impl ClientConfig {
    pub fn with_client_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.client_info = Implementation::new(name, version);
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_initialization_timeout(mut self, timeout: Duration) -> Self {
        self.initialization_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.client_info.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "client_info.name".to_string(),
            });
        }
        if self.protocol_version.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "protocol_version".to_string(),
            });
        }
        if !self.capabilities.is_object() {
            return Err(ConfigError::invalid("capabilities", "must be a JSON object"));
        }
        require_nonzero("request_timeout", self.request_timeout)?;
        require_nonzero("initialization_timeout", self.initialization_timeout)?;
        Ok(())
    }
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Child process and framing settings for the stdio carrier
#[derive(Clone)]
pub struct StdioConfig {
    /// Executable to spawn
    pub command: String,

    /// Argument vector
    pub args: Vec<String>,

    /// Working directory for the child (inherits ours if unset)
    pub working_directory: Option<PathBuf>,

    /// Extra environment variables
    pub env: HashMap<String, String>,

    /// Maximum length of one protocol line
    pub buffer_size: usize,

    /// Per-line read timeout; `None` waits indefinitely
    pub read_timeout: Option<Duration>,

    /// Grace period between SIGTERM and SIGKILL
    pub shutdown_timeout: Duration,

    /// Optional consumer for the child's stderr lines
    pub stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,

    /// Told when the child exits without being asked to
    pub exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl std::fmt::Debug for StdioConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioConfig")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("working_directory", &self.working_directory)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("buffer_size", &self.buffer_size)
            .field("read_timeout", &self.read_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field(
                "stderr_handler",
                &self.stderr_handler.as_ref().map(|_| "Fn(String)"),
            )
            .field("exit_handler", &self.exit_handler.is_some())
            .finish()
    }
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_directory: None,
            env: HashMap::new(),
            buffer_size: DEFAULT_STDIO_BUFFER_SIZE,
            read_timeout: None,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            stderr_handler: None,
            exit_handler: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stderr_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.stderr_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_exit_handler(mut self, handler: Arc<dyn ProcessExitHandler>) -> Self {
        self.exit_handler = Some(handler);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "command".to_string(),
            });
        }
        if self.buffer_size < 1024 {
            return Err(ConfigError::invalid("buffer_size", "must be at least 1024 bytes"));
        }
        if let Some(timeout) = self.read_timeout {
            require_nonzero("read_timeout", timeout)?;
        }
        if let Some(dir) = &self.working_directory
            && !dir.is_dir()
        {
            return Err(ConfigError::invalid(
                "working_directory",
                format!("{} is not a directory", dir.display()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// HTTP Client Transport
// ============================================================================

/// Reconnect policy for the long-lived SSE stream
#[derive(Debug, Clone, PartialEq)]
pub enum RetryPolicy {
    /// Fixed interval between retries
    Fixed {
        interval: Duration,
        max_attempts: Option<u32>,
    },
    /// Exponential backoff capped at `max_delay`
    Exponential {
        base: Duration,
        max_delay: Duration,
        max_attempts: Option<u32>,
    },
    /// Never reconnect
    Never,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Exponential {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based), or `None` to give up
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        match self {
            RetryPolicy::Fixed {
                interval,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| attempt >= max) {
                    return None;
                }
                Some(*interval)
            }
            RetryPolicy::Exponential {
                base,
                max_delay,
                max_attempts,
            } => {
                if max_attempts.is_some_and(|max| attempt >= max) {
                    return None;
                }
                let factor = 2u32.saturating_pow(attempt.min(16));
                Some(base.saturating_mul(factor).min(*max_delay))
            }
            RetryPolicy::Never => None,
        }
    }
}

/// Settings for the HTTP client carrier
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Server origin, e.g. `http://127.0.0.1:8080`
    pub base_url: String,

    /// Streamable endpoint path
    pub endpoint_path: String,

    /// SSE endpoint path of legacy (2024-11-05) servers
    pub legacy_sse_path: String,

    /// Timeout for each POST exchange
    pub request_timeout: Duration,

    /// Idle timeout for the SSE stream, independent of `request_timeout`
    pub sse_timeout: Duration,

    /// Open a GET stream for server-initiated messages after the handshake
    pub open_event_stream: bool,

    /// Reconnect policy for the GET stream
    pub retry_policy: RetryPolicy,

    /// Fall back to the legacy SSE carrier if `initialize` is rejected
    pub legacy_fallback: bool,

    /// Bearer token sent on every request
    pub bearer_token: Option<String>,

    /// Additional headers sent on every request
    pub headers: HashMap<String, String>,

    /// Value of the protocol version header
    pub protocol_version: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            endpoint_path: "/mcp".to_string(),
            legacy_sse_path: "/sse".to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            sse_timeout: Duration::from_secs(DEFAULT_SSE_TIMEOUT_SECS),
            open_event_stream: true,
            retry_policy: RetryPolicy::default(),
            legacy_fallback: true,
            bearer_token: None,
            headers: HashMap::new(),
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
        }
    }
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_endpoint_path(mut self, path: impl Into<String>) -> Self {
        self.endpoint_path = path.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_sse_timeout(mut self, timeout: Duration) -> Self {
        self.sse_timeout = timeout;
        self
    }

    pub fn with_event_stream(mut self, enabled: bool) -> Self {
        self.open_event_stream = enabled;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_legacy_fallback(mut self, enabled: bool) -> Self {
        self.legacy_fallback = enabled;
        self
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Full URL of the streamable endpoint
    pub fn endpoint_url(&self) -> String {
        join_url(&self.base_url, &self.endpoint_path)
    }

    /// Full URL of the legacy SSE endpoint
    pub fn legacy_sse_url(&self) -> String {
        join_url(&self.base_url, &self.legacy_sse_path)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "base_url",
                format!("'{}' is not an http(s) URL", self.base_url),
            ));
        }
        if !self.endpoint_path.starts_with('/') {
            return Err(ConfigError::invalid("endpoint_path", "must start with '/'"));
        }
        require_nonzero("request_timeout", self.request_timeout)?;
        require_nonzero("sse_timeout", self.sse_timeout)?;
        Ok(())
    }
}

/// Join an origin and a path (or pass through an absolute URL)
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

// ============================================================================
// Server
// ============================================================================

/// Backend used to persist SSE events for resumption
#[derive(Debug, Clone, PartialEq)]
pub enum EventStoreBackend {
    Memory { max_events_per_session: usize },
    File { directory: PathBuf },
}

impl Default for EventStoreBackend {
    fn default() -> Self {
        EventStoreBackend::Memory {
            max_events_per_session: DEFAULT_MAX_EVENTS_PER_SESSION,
        }
    }
}

/// How POST responses are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseMode {
    /// SSE when the client accepts `text/event-stream`, JSON otherwise
    #[default]
    Sse,
    /// Always a plain JSON body
    Json,
}

/// Server-side settings shared by the stdio loop and the HTTP server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_info: Implementation,
    pub capabilities: Value,
    pub instructions: Option<String>,
    pub supported_versions: Vec<String>,
    pub session_ttl: Duration,
    pub reap_interval: Duration,
    pub event_store: EventStoreBackend,
    pub response_mode: ResponseMode,
    pub endpoint_path: String,
    pub enable_legacy_sse: bool,
    pub keep_alive: Duration,
    pub bind_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_info: Implementation::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            capabilities: json!({ "tools": {}, "resources": {}, "prompts": {} }),
            instructions: None,
            supported_versions: SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| v.to_string())
                .collect(),
            session_ttl: Duration::from_secs(DEFAULT_SESSION_TTL_SECS),
            reap_interval: Duration::from_secs(60),
            event_store: EventStoreBackend::default(),
            response_mode: ResponseMode::default(),
            endpoint_path: "/mcp".to_string(),
            enable_legacy_sse: true,
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

impl ServerConfig {
    pub fn with_server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info = Implementation::new(name, version);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Value) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_event_store(mut self, backend: EventStoreBackend) -> Self {
        self.event_store = backend;
        self
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn with_bind_address(mut self, address: SocketAddr) -> Self {
        self.bind_address = address;
        self
    }

    pub fn with_legacy_sse(mut self, enabled: bool) -> Self {
        self.enable_legacy_sse = enabled;
        self
    }

    /// Latest version this server speaks
    pub fn latest_version(&self) -> &str {
        self.supported_versions
            .first()
            .map(String::as_str)
            .unwrap_or(LATEST_PROTOCOL_VERSION)
    }

    /// Pick the version to answer `initialize` with
    pub fn negotiate_version(&self, requested: &str) -> String {
        if self.supported_versions.iter().any(|v| v == requested) {
            requested.to_string()
        } else {
            self.latest_version().to_string()
        }
    }

    /// Load from environment variables on top of the defaults
    ///
    /// # Environment Variables
    ///
    /// - `MCP_CONDUIT_BIND` (default: 127.0.0.1:8080)
    /// - `MCP_CONDUIT_SESSION_TTL_SECS` (default: 1800)
    /// - `MCP_CONDUIT_EVENT_STORE_DIR` (file-backed event store when set)
    /// - `MCP_CONDUIT_RESPONSE_MODE` (`sse` or `json`, default: sse)
    /// - `MCP_CONDUIT_LEGACY_SSE` (default: true)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(bind) = env_value("MCP_CONDUIT_BIND") {
            match bind.parse::<SocketAddr>() {
                Ok(address) => config.bind_address = address,
                Err(_) => warn!(
                    var = "MCP_CONDUIT_BIND",
                    value = %bind,
                    "Invalid socket address, using default"
                ),
            }
        }

        config.session_ttl = duration_from(
            "MCP_CONDUIT_SESSION_TTL_SECS",
            env_value("MCP_CONDUIT_SESSION_TTL_SECS"),
            config.session_ttl,
        );

        if let Some(dir) = env_value("MCP_CONDUIT_EVENT_STORE_DIR") {
            config.event_store = EventStoreBackend::File {
                directory: PathBuf::from(dir),
            };
        }

        if let Some(mode) = env_value("MCP_CONDUIT_RESPONSE_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "json" => config.response_mode = ResponseMode::Json,
                "sse" => config.response_mode = ResponseMode::Sse,
                _ => warn!(
                    var = "MCP_CONDUIT_RESPONSE_MODE",
                    value = %mode,
                    "Unknown response mode, using default"
                ),
            }
        }

        if let Some(flag) = env_value("MCP_CONDUIT_LEGACY_SSE") {
            config.enable_legacy_sse = flag.eq_ignore_ascii_case("true") || flag == "1";
        }

        config
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_info.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "server_info.name".to_string(),
            });
        }
        if self.supported_versions.is_empty() {
            return Err(ConfigError::invalid(
                "supported_versions",
                "at least one protocol version is required",
            ));
        }
        if !self.endpoint_path.starts_with('/') {
            return Err(ConfigError::invalid("endpoint_path", "must start with '/'"));
        }
        require_nonzero("session_ttl", self.session_ttl)?;
        require_nonzero("reap_interval", self.reap_interval)?;
        require_nonzero("keep_alive", self.keep_alive)?;
        if let EventStoreBackend::Memory {
            max_events_per_session,
        } = self.event_store
            && max_events_per_session == 0
        {
            return Err(ConfigError::invalid(
                "event_store.max_events_per_session",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse seconds with a warning and fallback on invalid values
fn duration_from(var_name: &str, value: Option<String>, default: Duration) -> Duration {
    match value {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => {
                warn!(
                    var = var_name,
                    value = %value,
                    default_secs = default.as_secs(),
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        None => default,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_validation() {
        assert!(ClientConfig::default().validate().is_ok());

        let config = ClientConfig::default().with_client_info("", "1.0");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));

        let config = ClientConfig::default().with_request_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout { .. })
        ));

        let config = ClientConfig::default().with_capabilities(json!([1, 2]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stdio_config_validation() {
        assert!(StdioConfig::new("cat").validate().is_ok());
        assert!(StdioConfig::new("  ").validate().is_err());
        assert!(StdioConfig::new("cat").with_buffer_size(10).validate().is_err());
        assert!(
            StdioConfig::new("cat")
                .with_working_directory("/definitely/not/here")
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_http_config_urls() {
        let config = HttpClientConfig::new("http://localhost:9000/");
        assert_eq!(config.endpoint_url(), "http://localhost:9000/mcp");
        assert_eq!(config.legacy_sse_url(), "http://localhost:9000/sse");
        assert!(config.validate().is_ok());

        assert!(HttpClientConfig::new("ftp://x").validate().is_err());
        assert_eq!(
            join_url("http://a", "http://b/messages?sessionId=1"),
            "http://b/messages?sessionId=1"
        );
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::Exponential {
            base: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: Some(4),
        };
        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay(4), None);

        assert_eq!(RetryPolicy::Never.delay(0), None);
        let fixed = RetryPolicy::Fixed {
            interval: Duration::from_secs(1),
            max_attempts: None,
        };
        assert_eq!(fixed.delay(100), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_server_version_negotiation() {
        let config = ServerConfig::default();
        assert_eq!(config.negotiate_version("2025-03-26"), "2025-03-26");
        assert_eq!(
            config.negotiate_version("1999-01-01"),
            LATEST_PROTOCOL_VERSION
        );
    }

    #[test]
    fn test_server_config_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let config = ServerConfig::default().with_event_store(EventStoreBackend::Memory {
            max_events_per_session: 0,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_from_env_value() {
        let default = Duration::from_secs(10);
        assert_eq!(duration_from("X", None, default), default);
        assert_eq!(
            duration_from("X", Some("42".into()), default),
            Duration::from_secs(42)
        );
        assert_eq!(duration_from("X", Some("abc".into()), default), default);
        assert_eq!(duration_from("X", Some("0".into()), default), default);
    }
}
