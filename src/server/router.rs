//! Router contract and per-request context
//!
//! The core never interprets tool, resource or prompt bodies. It parses the
//! method and its params into a [`ClientRequest`] and hands that to a
//! [`Router`] together with the session it belongs to.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{McpError, McpResult};
use crate::protocol::codec::{Message, RequestId};
use crate::protocol::methods::{ClientNotification, ClientRequest, notification};
use crate::server::auth::AuthInfo;
use crate::session::store::SessionMetadata;

/// Pushes server-initiated notifications to one session
#[derive(Debug, Clone)]
pub struct Notifier {
    session_id: String,
    sink: Option<mpsc::UnboundedSender<Message>>,
}

impl Notifier {
    pub fn new(session_id: impl Into<String>, sink: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            session_id: session_id.into(),
            sink: Some(sink),
        }
    }

    /// A notifier with nowhere to deliver; every send fails
    pub fn detached(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            sink: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let sink = self.sink.as_ref().ok_or_else(|| {
            McpError::transport(format!("session {} has no event stream", self.session_id))
        })?;
        sink.send(Message::notification(method, params))
            .map_err(|_| McpError::transport(format!("session {} is closed", self.session_id)))
    }

    pub fn progress(&self, token: Value, progress: f64, total: Option<f64>) -> McpResult<()> {
        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = Value::from(total);
        }
        self.notify(notification::PROGRESS, Some(params))
    }

    /// `notifications/message` log entry for the client
    pub fn log(&self, level: &str, data: Value) -> McpResult<()> {
        self.notify(
            notification::MESSAGE,
            Some(json!({ "level": level, "data": data })),
        )
    }
}

/// Everything a handler knows about the call it is serving
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub session_id: String,
    /// `None` while handling a notification
    pub request_id: Option<RequestId>,
    pub metadata: SessionMetadata,
    pub notifier: Notifier,
}

impl RequestContext {
    pub fn auth(&self) -> Option<&AuthInfo> {
        self.metadata.auth.as_ref()
    }
}

#[async_trait]
pub trait Router: Send + Sync {
    /// Serve one request; `initialize` and `ping` never get here
    async fn route(&self, request: ClientRequest, ctx: &RequestContext) -> McpResult<Value>;

    /// Notifications other than `initialized` and `cancelled`
    async fn on_notification(
        &self,
        _notification: ClientNotification,
        _ctx: &RequestContext,
    ) -> McpResult<()> {
        Ok(())
    }
}

// ============================================================================
// Demo Router
// ============================================================================

/// Small catalog used by the binary and the tests
///
/// Tools: `echo` (returns `{"response": message}`), `slow` (sleeps for
/// `millis` while reporting progress). Resource: `conduit://session`.
/// Prompt: `greeting`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRouter;

const SESSION_RESOURCE_URI: &str = "conduit://session";

impl EchoRouter {
    fn tools() -> Value {
        json!({
            "tools": [
                {
                    "name": "echo",
                    "description": "Return the message unchanged",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "message": { "type": "string" } },
                        "required": ["message"]
                    }
                },
                {
                    "name": "slow",
                    "description": "Sleep for the given number of milliseconds",
                    "inputSchema": {
                        "type": "object",
                        "properties": { "millis": { "type": "integer" } }
                    }
                }
            ]
        })
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
        ctx: &RequestContext,
    ) -> McpResult<Value> {
        let arguments = arguments.unwrap_or_else(|| json!({}));
        match name {
            "echo" => {
                let message = arguments
                    .get("message")
                    .and_then(Value::as_str)
                    .ok_or_else(|| McpError::InvalidParams("echo requires 'message'".into()))?;
                Ok(json!({ "response": message }))
            }
            "slow" => {
                let millis = arguments.get("millis").and_then(Value::as_u64).unwrap_or(100);
                let request_id = ctx
                    .request_id
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                let token = json!(format!("slow-{request_id}"));
                // best effort: a detached session has no stream
                let _ = ctx.notifier.progress(token.clone(), 0.0, Some(1.0));
                tokio::time::sleep(Duration::from_millis(millis)).await;
                let _ = ctx.notifier.progress(token, 1.0, Some(1.0));
                Ok(json!({ "response": format!("slept {millis}ms") }))
            }
            other => Err(McpError::tool_not_found(other)),
        }
    }
}

#[async_trait]
impl Router for EchoRouter {
    async fn route(&self, request: ClientRequest, ctx: &RequestContext) -> McpResult<Value> {
        match request {
            ClientRequest::ListTools(_) => Ok(Self::tools()),
            ClientRequest::CallTool(params) => {
                self.call_tool(&params.name, params.arguments, ctx).await
            }
            ClientRequest::ListResources(_) => Ok(json!({
                "resources": [{
                    "uri": SESSION_RESOURCE_URI,
                    "name": "session",
                    "mimeType": "application/json"
                }]
            })),
            ClientRequest::ReadResource(params) if params.uri == SESSION_RESOURCE_URI => {
                let text = serde_json::to_string(&json!({
                    "sessionId": ctx.session_id,
                    "metadata": ctx.metadata,
                }))?;
                Ok(json!({
                    "contents": [{
                        "uri": SESSION_RESOURCE_URI,
                        "mimeType": "application/json",
                        "text": text
                    }]
                }))
            }
            ClientRequest::Subscribe(params) | ClientRequest::Unsubscribe(params)
                if params.uri == SESSION_RESOURCE_URI =>
            {
                Ok(json!({}))
            }
            ClientRequest::ReadResource(params)
            | ClientRequest::Subscribe(params)
            | ClientRequest::Unsubscribe(params) => Err(McpError::resource_not_found(params.uri)),
            ClientRequest::ListPrompts(_) => Ok(json!({
                "prompts": [{
                    "name": "greeting",
                    "arguments": [{ "name": "name", "required": false }]
                }]
            })),
            ClientRequest::GetPrompt(params) if params.name == "greeting" => {
                let who = params
                    .arguments
                    .as_ref()
                    .and_then(|args| args.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("there");
                Ok(json!({
                    "messages": [{
                        "role": "user",
                        "content": { "type": "text", "text": format!("Hello, {who}!") }
                    }]
                }))
            }
            ClientRequest::GetPrompt(params) => Err(McpError::prompt_not_found(params.name)),
            ClientRequest::Initialize(_) | ClientRequest::Ping => Err(McpError::InvalidRequest(
                format!("{} is handled by the core", request.method()),
            )),
        }
    }

    async fn on_notification(
        &self,
        notification: ClientNotification,
        ctx: &RequestContext,
    ) -> McpResult<()> {
        debug!(session_id = %ctx.session_id, ?notification, "Notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::methods::{CallToolParams, GetPromptParams, ListParams, ResourceParams};

    fn context() -> (RequestContext, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = RequestContext {
            session_id: "s-1".into(),
            request_id: Some(RequestId::from(1u64)),
            metadata: SessionMetadata::default(),
            notifier: Notifier::new("s-1", tx),
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_echo_tool() {
        let (ctx, _rx) = context();
        let result = EchoRouter
            .route(
                ClientRequest::CallTool(CallToolParams {
                    name: "echo".into(),
                    arguments: Some(json!({"message": "hi"})),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"response": "hi"}));

        let err = EchoRouter
            .route(
                ClientRequest::CallTool(CallToolParams {
                    name: "missing".into(),
                    arguments: None,
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_slow_tool_reports_progress() {
        let (ctx, mut rx) = context();
        EchoRouter
            .route(
                ClientRequest::CallTool(CallToolParams {
                    name: "slow".into(),
                    arguments: Some(json!({"millis": 5})),
                }),
                &ctx,
            )
            .await
            .unwrap();

        for expected in [0.0, 1.0] {
            let Some(Message::Notification(n)) = rx.recv().await else {
                panic!("expected a progress notification");
            };
            assert_eq!(n.method, notification::PROGRESS);
            assert_eq!(n.params.unwrap()["progress"], json!(expected));
        }
    }

    #[tokio::test]
    async fn test_resources_and_prompts() {
        let (ctx, _rx) = context();
        let listed = EchoRouter
            .route(ClientRequest::ListResources(ListParams::default()), &ctx)
            .await
            .unwrap();
        assert_eq!(listed["resources"][0]["uri"], SESSION_RESOURCE_URI);

        let read = EchoRouter
            .route(
                ClientRequest::ReadResource(ResourceParams {
                    uri: SESSION_RESOURCE_URI.into(),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert!(read["contents"][0]["text"].as_str().unwrap().contains("s-1"));

        let err = EchoRouter
            .route(
                ClientRequest::Subscribe(ResourceParams {
                    uri: "file:///nope".into(),
                }),
                &ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let prompt = EchoRouter
            .route(
                ClientRequest::GetPrompt(GetPromptParams {
                    name: "greeting".into(),
                    arguments: Some(json!({"name": "Ada"})),
                }),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(prompt["messages"][0]["content"]["text"], "Hello, Ada!");
    }

    #[test]
    fn test_detached_notifier_fails() {
        let notifier = Notifier::detached("s-2");
        let err = notifier.notify(notification::TOOLS_LIST_CHANGED, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
