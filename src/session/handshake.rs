//! Client session and initialization handshake
//!
//! `Uninitialized -> Initializing -> Ready`, with `Initializing -> Error` on
//! any handshake failure and `close()` leading to `Closed` from every phase.
//! Everything except `initialize` and `close` requires `Ready`.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{Level, info, warn};

use crate::config::ClientConfig;
use crate::error::{McpError, McpResult};
use crate::io::transport::Transport;
use crate::log_timing;
use crate::protocol::codec::{Message, RequestId};
use crate::protocol::methods::{
    Implementation, InitializeParams, InitializeResult, method, notification,
};
use crate::rpc::RequestCorrelator;
use crate::session::id::generate_session_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Default)]
struct NegotiatedState {
    session_id: Option<String>,
    protocol_version: Option<String>,
    server_capabilities: Option<Value>,
    server_info: Option<Implementation>,
    instructions: Option<String>,
    last_error: Option<String>,
}

/// Client side of one protocol session
pub struct ClientSession {
    config: ClientConfig,
    correlator: Arc<RequestCorrelator>,
    phase: Mutex<SessionPhase>,
    state: RwLock<NegotiatedState>,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("phase", &self.phase())
            .field("session_id", &self.session_id())
            .field("protocol_version", &self.protocol_version())
            .finish()
    }
}

impl ClientSession {
    /// Validate the config, start the transport and wrap it in a session
    pub async fn connect<T>(transport: T, config: ClientConfig) -> McpResult<Self>
    where
        T: Transport + 'static,
    {
        config.validate()?;
        let correlator = RequestCorrelator::start(transport, config.request_timeout).await?;
        Ok(Self::with_correlator(Arc::new(correlator), config))
    }

    pub fn with_correlator(correlator: Arc<RequestCorrelator>, config: ClientConfig) -> Self {
        Self {
            config,
            correlator,
            phase: Mutex::new(SessionPhase::Uninitialized),
            state: RwLock::new(NegotiatedState::default()),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.lock()
    }

    pub fn is_ready(&self) -> bool {
        self.phase() == SessionPhase::Ready
    }

    pub fn session_id(&self) -> Option<String> {
        self.state.read().session_id.clone()
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.state.read().protocol_version.clone()
    }

    pub fn server_capabilities(&self) -> Option<Value> {
        self.state.read().server_capabilities.clone()
    }

    pub fn server_info(&self) -> Option<Implementation> {
        self.state.read().server_info.clone()
    }

    pub fn instructions(&self) -> Option<String> {
        self.state.read().instructions.clone()
    }

    pub fn client_capabilities(&self) -> &Value {
        &self.config.capabilities
    }

    /// Last handshake failure, kept for diagnostics
    pub fn last_error(&self) -> Option<String> {
        self.state.read().last_error.clone()
    }

    pub fn correlator(&self) -> &Arc<RequestCorrelator> {
        &self.correlator
    }

    /// Whether the server declared a top-level capability
    pub fn server_supports(&self, capability: &str) -> bool {
        self.state
            .read()
            .server_capabilities
            .as_ref()
            .and_then(|caps| caps.get(capability))
            .is_some_and(|value| !value.is_null())
    }

    /// Run the handshake
    pub async fn initialize(&self) -> McpResult<InitializeResult> {
        {
            let mut phase = self.phase.lock();
            if *phase != SessionPhase::Uninitialized {
                return Err(McpError::protocol(format!(
                    "initialize called in phase {}",
                    *phase
                )));
            }
            *phase = SessionPhase::Initializing;
        }

        let started = Instant::now();
        match self.run_handshake().await {
            Ok(result) => {
                let transition = {
                    let mut phase = self.phase.lock();
                    if *phase == SessionPhase::Initializing {
                        *phase = SessionPhase::Ready;
                        Ok(())
                    } else {
                        Err(McpError::protocol(format!(
                            "session moved to {} during initialize",
                            *phase
                        )))
                    }
                };
                transition?;
                log_timing!(Level::INFO, "initialize", started.elapsed());
                info!(
                    session_id = ?self.session_id(),
                    protocol_version = %result.protocol_version,
                    server = %result.server_info.name,
                    "Session ready"
                );
                Ok(result)
            }
            Err(e) => {
                warn!("Handshake failed: {}", e);
                self.state.write().last_error = Some(e.to_string());
                let mut phase = self.phase.lock();
                if *phase == SessionPhase::Initializing {
                    *phase = SessionPhase::Error;
                }
                Err(e)
            }
        }
    }

    async fn run_handshake(&self) -> McpResult<InitializeResult> {
        let params = InitializeParams {
            protocol_version: self.config.protocol_version.clone(),
            capabilities: self.config.capabilities.clone(),
            client_info: self.config.client_info.clone(),
        };
        let raw = self
            .correlator
            .send_request(
                method::INITIALIZE,
                Some(serde_json::to_value(&params)?),
                Some(self.config.initialization_timeout),
            )
            .await?;

        let result: InitializeResult = serde_json::from_value(raw)
            .map_err(|e| McpError::protocol(format!("malformed initialize result: {e}")))?;

        if result.protocol_version != self.config.protocol_version {
            return Err(McpError::protocol(format!(
                "server negotiated protocol version {} but {} was requested",
                result.protocol_version, self.config.protocol_version
            )));
        }

        {
            let mut state = self.state.write();
            state.protocol_version = Some(result.protocol_version.clone());
            state.server_capabilities = Some(result.capabilities.clone());
            state.server_info = Some(result.server_info.clone());
            state.instructions = result.instructions.clone();
        }

        self.correlator
            .notify(notification::INITIALIZED, None)
            .await?;

        // a server-assigned id (HTTP) wins over a locally generated one
        let session_id = self
            .correlator
            .session_id()
            .unwrap_or_else(generate_session_id);
        self.state.write().session_id = Some(session_id);

        Ok(result)
    }

    /// Close the session and its transport; safe from any phase
    pub async fn close(&self) -> McpResult<()> {
        {
            let mut phase = self.phase.lock();
            if *phase == SessionPhase::Closed {
                return Ok(());
            }
            *phase = SessionPhase::Closed;
        }
        self.correlator.close().await
    }

    fn require_ready(&self) -> McpResult<()> {
        match self.phase() {
            SessionPhase::Ready => Ok(()),
            phase => Err(McpError::protocol(format!(
                "operation requires a ready session, current phase is {phase}"
            ))),
        }
    }

    fn require_capability(&self, capability: &str) -> McpResult<()> {
        if self.server_supports(capability) {
            Ok(())
        } else {
            Err(McpError::CapabilityUnsupported(format!(
                "server did not declare the '{capability}' capability"
            )))
        }
    }

    // ------------------------------------------------------------------------
    // Generic operations
    // ------------------------------------------------------------------------

    pub async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.require_ready()?;
        self.correlator.send_request(method, params, None).await
    }

    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> McpResult<Value> {
        self.require_ready()?;
        self.correlator
            .send_request(method, params, Some(timeout))
            .await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        self.require_ready()?;
        self.correlator.notify(method, params).await
    }

    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> McpResult<bool> {
        self.require_ready()?;
        Ok(self.correlator.cancel(id, reason).await)
    }

    pub async fn send_batch(&self, messages: Vec<Message>) -> McpResult<Vec<McpResult<Value>>> {
        self.require_ready()?;
        self.correlator.send_batch(messages, None).await
    }

    /// Server-initiated requests and notifications land here
    pub fn on_unexpected<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        self.correlator.on_unexpected(handler);
    }

    // ------------------------------------------------------------------------
    // Conveniences
    // ------------------------------------------------------------------------

    pub async fn ping(&self) -> McpResult<()> {
        self.request(method::PING, None).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<&str>) -> McpResult<Value> {
        self.require_capability("tools")?;
        self.request(method::TOOLS_LIST, cursor_params(cursor)).await
    }

    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> McpResult<Value> {
        self.require_capability("tools")?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request(method::TOOLS_CALL, Some(params)).await
    }

    pub async fn list_resources(&self, cursor: Option<&str>) -> McpResult<Value> {
        self.require_capability("resources")?;
        self.request(method::RESOURCES_LIST, cursor_params(cursor))
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> McpResult<Value> {
        self.require_capability("resources")?;
        self.request(method::RESOURCES_READ, Some(json!({ "uri": uri })))
            .await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_capability("resources")?;
        self.request(method::RESOURCES_SUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> McpResult<()> {
        self.require_capability("resources")?;
        self.request(method::RESOURCES_UNSUBSCRIBE, Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    pub async fn list_prompts(&self, cursor: Option<&str>) -> McpResult<Value> {
        self.require_capability("prompts")?;
        self.request(method::PROMPTS_LIST, cursor_params(cursor))
            .await
    }

    pub async fn get_prompt(&self, name: &str, arguments: Option<Value>) -> McpResult<Value> {
        self.require_capability("prompts")?;
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.request(method::PROMPTS_GET, Some(params)).await
    }
}

fn cursor_params(cursor: Option<&str>) -> Option<Value> {
    cursor.map(|cursor| json!({ "cursor": cursor }))
}

// ============================================================================
// Tests
// ============================================================================
