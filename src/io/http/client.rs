//! HTTP client transport
//!
//! Each outbound message is its own POST, sent on a background task so the
//! correlator's I/O loop never waits on the network. Notifications share one
//! ordered task instead, and a `notifications/cancelled` waits until the POST
//! carrying the request it names has been answered. Replies (plain JSON or
//! an SSE-framed body) are queued for [`Transport::receive`]. After the
//! handshake a GET stream carries server-initiated messages; it reconnects
//! per [`RetryPolicy`] and resumes with `Last-Event-ID`. Losing that stream
//! never fails ordinary request/response traffic.
//!
//! If the server rejects `initialize` with 404 or 405, the transport falls
//! back to the 2024-11-05 carrier: one GET stream that announces a POST
//! endpoint and then carries every reply.
//!
//! [`RetryPolicy`]: crate::config::RetryPolicy

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, error, info, warn};

use crate::config::{HttpClientConfig, join_url};
use crate::error::{McpError, McpResult};
use crate::io::http::sse::{SseEvent, SseParser};
use crate::io::http::{EVENT_STREAM, JSON, LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_HEADER};
use crate::io::transport::{Transport, TransportKind};
use crate::log_rpc_message;
use crate::protocol::codec::{Message, Payload, RequestId, decode, encode_message};
use crate::protocol::codes;
use crate::protocol::methods::{method, notification};

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

enum StreamEnd {
    /// Server does not offer a GET stream
    Unsupported,
    /// Server closed the stream; `delivered` if any event arrived
    Closed { delivered: bool },
}

struct Inner {
    config: HttpClientConfig,
    client: reqwest::Client,
    session_id: RwLock<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    /// POST endpoint announced by a legacy server
    legacy_endpoint: RwLock<Option<String>>,
    inbound: mpsc::UnboundedSender<McpResult<String>>,
    stream_started: AtomicBool,
    stream_error: Mutex<Option<McpError>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Fires once the POST carrying a request has its response headers
    answered: Mutex<HashMap<RequestId, CancellationToken>>,
    notices: Mutex<Option<mpsc::UnboundedSender<String>>>,
    shutdown: CancellationToken,
}

/// Streamable HTTP transport with legacy SSE fallback
pub struct HttpTransport {
    inner: Arc<Inner>,
    inbound: mpsc::UnboundedReceiver<McpResult<String>>,
    closed: bool,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.inner.config.endpoint_url())
            .field("session_id", &*self.inner.session_id.read())
            .field("legacy", &self.inner.legacy_endpoint.read().is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

/// Read-only view of a transport's stream state, usable after the transport
/// has been handed to a correlator
#[derive(Clone)]
pub struct HttpTransportMonitor {
    inner: Arc<Inner>,
}

impl HttpTransportMonitor {
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Id of the last event received on the GET stream
    pub fn last_event_id(&self) -> Option<String> {
        self.inner.last_event_id.lock().clone()
    }

    /// Why the GET stream was given up, if it was
    pub fn stream_error(&self) -> Option<McpError> {
        self.inner.stream_error.lock().clone()
    }

    pub fn is_legacy(&self) -> bool {
        self.inner.legacy_endpoint.read().is_some()
    }
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> McpResult<Self> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| McpError::transport(format!("failed to build HTTP client: {e}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                client,
                session_id: RwLock::new(None),
                last_event_id: Mutex::new(None),
                legacy_endpoint: RwLock::new(None),
                inbound: tx,
                stream_started: AtomicBool::new(false),
                stream_error: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                answered: Mutex::new(HashMap::new()),
                notices: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
            inbound: rx,
            closed: false,
        })
    }

    pub fn monitor(&self) -> HttpTransportMonitor {
        HttpTransportMonitor {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(&mut self) -> McpResult<()> {
        if self.closed {
            return Err(McpError::transport("HTTP transport is closed"));
        }
        debug!(endpoint = %self.inner.config.endpoint_url(), "HTTP transport ready");
        Ok(())
    }

    async fn send(&mut self, message: &str) -> McpResult<()> {
        if self.closed {
            return Err(McpError::transport("HTTP transport is closed"));
        }
        let (ids, is_initialize) = inspect(message);
        let body = message.to_string();
        if ids.is_empty() {
            return self.inner.queue_notice(body);
        }

        let answered = CancellationToken::new();
        {
            let mut pending = self.inner.answered.lock();
            for id in &ids {
                pending.insert(id.clone(), answered.clone());
            }
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.post(body, ids, is_initialize, answered).await });
        Ok(())
    }

    async fn receive(&mut self) -> McpResult<String> {
        if self.closed {
            return Err(McpError::transport("HTTP transport is closed"));
        }
        match self.inbound.recv().await {
            Some(item) => item,
            None => Err(McpError::transport("HTTP transport is closed")),
        }
    }

    async fn close(&mut self) -> McpResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.shutdown.cancel();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let session_id = self.inner.session_id.read().clone();
        let legacy = self.inner.legacy_endpoint.read().is_some();
        if let Some(session_id) = session_id
            && !legacy
        {
            let result = self
                .inner
                .request(Method::DELETE, &self.inner.config.endpoint_url())
                .timeout(self.inner.config.request_timeout)
                .send()
                .await;
            match result {
                Ok(response) => debug!(
                    session_id = %session_id,
                    status = %response.status(),
                    "Session terminated"
                ),
                Err(e) => warn!(session_id = %session_id, "Failed to terminate session: {}", e),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }
}

impl Inner {
    fn request(&self, verb: Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(verb, url);
        if let Some(token) = &self.config.bearer_token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if self.legacy_endpoint.read().is_none()
            && let Some(session_id) = self.session_id.read().clone()
        {
            builder = builder
                .header(SESSION_HEADER, session_id)
                .header(PROTOCOL_VERSION_HEADER, self.config.protocol_version.as_str());
        }
        builder
    }

    fn deliver(&self, text: String) {
        let _ = self.inbound.send(Ok(text));
    }

    fn deliver_event(&self, event: SseEvent) {
        if event.event_type() == "message" && !event.data.trim().is_empty() {
            self.deliver(event.data);
        } else {
            debug!(event = event.event_type(), "Ignoring SSE event");
        }
    }

    /// Answer each request id of a failed POST with a local error response
    fn fail_requests(&self, ids: &[RequestId], error: &McpError) {
        if ids.is_empty() {
            warn!("Notification delivery failed: {}", error);
            return;
        }
        for id in ids {
            let response = Message::error(Some(id.clone()), error.to_error_object());
            match encode_message(&response) {
                Ok(text) => self.deliver(text),
                Err(e) => error!("Failed to encode local error response: {}", e),
            }
        }
    }

    // ------------------------------------------------------------------------
    // POST
    // ------------------------------------------------------------------------

    async fn post(
        self: Arc<Self>,
        body: String,
        ids: Vec<RequestId>,
        is_initialize: bool,
        answered: CancellationToken,
    ) {
        let _answered = answered.clone().drop_guard();
        let outcome = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            outcome = self.exchange(&body, is_initialize, &answered) => Some(outcome),
        };
        {
            let mut pending = self.answered.lock();
            for id in &ids {
                pending.remove(id);
            }
        }
        if let Some(Err(e)) = outcome {
            debug!("POST failed: {}", e);
            self.fail_requests(&ids, &e);
        }
    }

    fn queue_notice(self: &Arc<Self>, body: String) -> McpResult<()> {
        let mut notices = self.notices.lock();
        let sender = notices.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let inner = Arc::clone(self);
            let handle = tokio::spawn(async move { inner.run_notices(rx).await });
            self.tasks.lock().push(handle);
            tx
        });
        sender
            .send(body)
            .map_err(|_| McpError::transport("HTTP transport is closed"))
    }

    /// POST notifications one at a time, in the order they were sent
    async fn run_notices(self: Arc<Self>, mut notices: mpsc::UnboundedReceiver<String>) {
        while let Some(body) = notices.recv().await {
            for id in cancelled_ids(&body) {
                let answered = self.answered.lock().get(&id).cloned();
                if let Some(answered) = answered {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return,
                        _ = answered.cancelled() => {}
                    }
                }
            }
            let answered = CancellationToken::new();
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                outcome = self.exchange(&body, false, &answered) => outcome,
            };
            if let Err(e) = outcome {
                self.fail_requests(&[], &e);
            }
        }
    }

    async fn exchange(
        self: &Arc<Self>,
        body: &str,
        is_initialize: bool,
        answered: &CancellationToken,
    ) -> McpResult<()> {
        let legacy_endpoint = self.legacy_endpoint.read().clone();
        if let Some(endpoint) = legacy_endpoint {
            return self.post_legacy(&endpoint, body).await;
        }

        log_rpc_message!(Level::DEBUG, "outgoing", "POST", body);
        let response = self
            .request(Method::POST, &self.config.endpoint_url())
            .header(CONTENT_TYPE, JSON)
            .header(ACCEPT, format!("{JSON}, {EVENT_STREAM}"))
            .body(body.to_string())
            .timeout(self.config.request_timeout)
            .send()
            .await;
        answered.cancel();
        let response = response.map_err(|e| McpError::transport(format!("POST failed: {e}")))?;
        let status = response.status();

        if is_initialize
            && self.config.legacy_fallback
            && matches!(status, StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED)
        {
            info!(%status, "Streamable endpoint rejected initialize, trying legacy SSE");
            let endpoint = self.connect_legacy().await?;
            return self.post_legacy(&endpoint, body).await;
        }

        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
        {
            let mut current = self.session_id.write();
            if current.as_deref() != Some(session_id) {
                info!(session_id, "Server assigned session");
                *current = Some(session_id.to_string());
            }
        }

        if status == StatusCode::NOT_FOUND && !is_initialize {
            let session = self.session_id.read().clone().unwrap_or_default();
            return Err(McpError::SessionExpired(format!(
                "server no longer knows session {session}"
            )));
        }
        if status == StatusCode::ACCEPTED {
            return Ok(());
        }

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.starts_with(EVENT_STREAM));
        if is_stream && status.is_success() {
            self.forward_sse_body(Box::pin(response.bytes_stream())).await?;
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| McpError::transport(format!("failed to read response: {e}")))?;
            if text.trim().is_empty() {
                if !status.is_success() {
                    return Err(McpError::transport(format!("HTTP {status}")));
                }
            } else if status.is_success() || decode(&text).is_ok() {
                // error statuses with a JSON-RPC body still resolve their request
                self.deliver(text);
            } else {
                return Err(McpError::transport(format!("HTTP {status}: {}", text.trim())));
            }
        }

        if is_initialize && status.is_success() {
            self.ensure_event_stream();
        }
        Ok(())
    }

    async fn forward_sse_body(&self, mut body: ByteStream) -> McpResult<()> {
        let mut parser = SseParser::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| McpError::transport(format!("response stream failed: {e}")))?;
            for event in parser.feed(&chunk) {
                self.deliver_event(event);
            }
        }
        if let Some(event) = parser.finish() {
            self.deliver_event(event);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // GET stream
    // ------------------------------------------------------------------------

    fn ensure_event_stream(self: &Arc<Self>) {
        if !self.config.open_event_stream || self.stream_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move { inner.run_event_stream().await });
        self.tasks.lock().push(handle);
    }

    async fn run_event_stream(self: Arc<Self>) {
        let mut attempt = 0u32;
        let mut server_retry: Option<Duration> = None;

        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                outcome = self.read_event_stream(&mut server_retry) => outcome,
            };
            match outcome {
                Ok(StreamEnd::Unsupported) => {
                    debug!("Server offers no event stream");
                    return;
                }
                Ok(StreamEnd::Closed { delivered }) => {
                    if delivered {
                        attempt = 0;
                    }
                    debug!("Event stream closed by server");
                }
                Err(e @ (McpError::SessionExpired(_) | McpError::StreamLost(_))) => {
                    error!("Event stream cannot be resumed: {}", e);
                    *self.stream_error.lock() = Some(e);
                    return;
                }
                Err(e) => warn!(attempt, "Event stream interrupted: {}", e),
            }

            let Some(policy_delay) = self.config.retry_policy.delay(attempt) else {
                let e = McpError::StreamLost(format!(
                    "event stream gave up after {attempt} reconnect attempts"
                ));
                error!("{}", e);
                *self.stream_error.lock() = Some(e);
                return;
            };
            attempt += 1;
            let delay = server_retry.unwrap_or(policy_delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn read_event_stream(&self, retry: &mut Option<Duration>) -> McpResult<StreamEnd> {
        let mut request = self
            .request(Method::GET, &self.config.endpoint_url())
            .header(ACCEPT, EVENT_STREAM);
        let last_event_id = self.last_event_id.lock().clone();
        if let Some(last) = last_event_id {
            request = request.header(LAST_EVENT_ID_HEADER, last);
        }
        let response = request
            .send()
            .await
            .map_err(|e| McpError::transport(format!("event stream connect failed: {e}")))?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::METHOD_NOT_ALLOWED => return Ok(StreamEnd::Unsupported),
            StatusCode::NOT_FOUND => {
                return Err(McpError::SessionExpired(
                    "event stream rejected the session".to_string(),
                ));
            }
            status => {
                let text = response.text().await.unwrap_or_default();
                return Err(stream_rejection(status, &text));
            }
        }
        info!(last_event_id = ?self.last_event_id.lock().as_deref(), "Event stream connected");

        let mut body: ByteStream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        let mut delivered = false;
        loop {
            let chunk = match tokio::time::timeout(self.config.sse_timeout, body.next()).await {
                Err(_) => {
                    return Err(McpError::transport(format!(
                        "event stream idle for {:?}",
                        self.config.sse_timeout
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    return Err(McpError::transport(format!("event stream failed: {e}")));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };
            for event in parser.feed(&chunk) {
                if let Some(delay) = event.retry {
                    *retry = Some(delay);
                }
                if let Some(id) = &event.id {
                    *self.last_event_id.lock() = Some(id.clone());
                }
                delivered = true;
                self.deliver_event(event);
            }
        }
        Ok(StreamEnd::Closed { delivered })
    }

    // ------------------------------------------------------------------------
    // Legacy SSE
    // ------------------------------------------------------------------------

    /// Open the legacy stream and return the announced POST endpoint
    async fn connect_legacy(self: &Arc<Self>) -> McpResult<String> {
        let url = self.config.legacy_sse_url();
        let response = self
            .request(Method::GET, &url)
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("legacy SSE connect failed: {e}")))?;
        if !response.status().is_success() {
            return Err(McpError::transport(format!(
                "legacy SSE endpoint {url} returned HTTP {}",
                response.status()
            )));
        }

        let mut body: ByteStream = Box::pin(response.bytes_stream());
        let mut parser = SseParser::new();
        let announced = tokio::time::timeout(self.config.request_timeout, async {
            while let Some(chunk) = body.next().await {
                let chunk =
                    chunk.map_err(|e| McpError::transport(format!("legacy SSE failed: {e}")))?;
                for event in parser.feed(&chunk) {
                    if event.event_type() == "endpoint" {
                        return Ok::<_, McpError>(event.data);
                    }
                    self.deliver_event(event);
                }
            }
            Err(McpError::transport("legacy SSE stream ended before announcing an endpoint"))
        })
        .await
        .map_err(|_| McpError::Timeout(self.config.request_timeout))??;

        let endpoint = join_url(&self.config.base_url, announced.trim());
        if let Some(session_id) = legacy_session_id(&endpoint) {
            *self.session_id.write() = Some(session_id);
        }
        *self.legacy_endpoint.write() = Some(endpoint.clone());
        info!(endpoint = %endpoint, "Using legacy SSE transport");

        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = inner.shutdown.cancelled() => return,
                outcome = inner.forward_sse_body_with(body, parser) => outcome,
            };
            // every reply travels on this stream, so losing it ends the connection
            let reason = match outcome {
                Ok(()) => "legacy SSE stream closed".to_string(),
                Err(e) => e.to_string(),
            };
            let _ = inner.inbound.send(Err(McpError::transport(reason)));
        });
        self.tasks.lock().push(handle);
        Ok(endpoint)
    }

    async fn forward_sse_body_with(&self, mut body: ByteStream, mut parser: SseParser) -> McpResult<()> {
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| McpError::transport(format!("legacy SSE failed: {e}")))?;
            for event in parser.feed(&chunk) {
                self.deliver_event(event);
            }
        }
        Ok(())
    }

    async fn post_legacy(&self, endpoint: &str, body: &str) -> McpResult<()> {
        log_rpc_message!(Level::DEBUG, "outgoing", "POST", body);
        let response = self
            .request(Method::POST, endpoint)
            .header(CONTENT_TYPE, JSON)
            .body(body.to_string())
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| McpError::transport(format!("legacy POST failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::transport(format!("legacy POST returned HTTP {status}")));
        }
        let text = response.text().await.unwrap_or_default();
        if !text.trim().is_empty() && decode(&text).is_ok() {
            self.deliver(text);
        }
        Ok(())
    }
}

/// Request ids in an outbound document and whether it is a lone `initialize`
fn inspect(message: &str) -> (Vec<RequestId>, bool) {
    match decode(message) {
        Ok(Payload::Single(Message::Request(request))) => {
            let is_initialize = request.method == method::INITIALIZE;
            (vec![request.id], is_initialize)
        }
        Ok(payload) => (
            payload
                .into_messages()
                .into_iter()
                .filter_map(|message| match message {
                    Message::Request(request) => Some(request.id),
                    _ => None,
                })
                .collect(),
            false,
        ),
        Err(_) => (Vec::new(), false),
    }
}

/// Request ids named by the `notifications/cancelled` in an outbound document
fn cancelled_ids(message: &str) -> Vec<RequestId> {
    let Ok(payload) = decode(message) else {
        return Vec::new();
    };
    payload
        .into_messages()
        .into_iter()
        .filter_map(|message| match message {
            Message::Notification(notice) if notice.method == notification::CANCELLED => notice
                .params
                .as_ref()
                .and_then(|params| params.get("requestId"))
                .and_then(RequestId::from_value),
            _ => None,
        })
        .collect()
}

fn legacy_session_id(endpoint: &str) -> Option<String> {
    let (_, query) = endpoint.split_once('?')?;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("sessionId="))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn stream_rejection(status: StatusCode, body: &str) -> McpError {
    if let Ok(Payload::Single(Message::Error(response))) = decode(body) {
        if response.error.code == codes::STREAM_LOST {
            return McpError::StreamLost(response.error.message);
        }
        return McpError::from_error_object(response.error);
    }
    McpError::transport(format!("event stream rejected with HTTP {status}"))
}

// ============================================================================
// Tests
// ============================================================================
