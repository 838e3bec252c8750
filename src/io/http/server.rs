//! HTTP server carrier (axum)
//!
//! `POST` on the endpoint carries client messages, `GET` opens the session's
//! event stream and `DELETE` ends the session. Every call except
//! `initialize` must present the `Mcp-Session-Id` issued by the handshake.
//!
//! Server-initiated notifications flow through a per-session pump: encode,
//! append to the [`EventStore`], then fan out to live GET streams. A stream
//! opened with `Last-Event-ID` first replays the store and then follows the
//! live feed, skipping anything it already replayed.
//!
//! The 2024-11-05 SSE carrier (`GET /sse` + `POST /messages`) is served
//! alongside when enabled.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Level, debug, info, warn};

use crate::config::ResponseMode;
use crate::error::{McpError, McpResult};
use crate::io::http::event_store::{EventRecord, EventStore, create_event_store};
use crate::io::http::{EVENT_STREAM, JSON, LAST_EVENT_ID_HEADER, PROTOCOL_VERSION_HEADER, SESSION_HEADER};
use crate::log_rpc_message;
use crate::protocol::codec::{
    Decoded, Message, Payload, Rejected, Request, RequestId, decode_slice_tolerant,
    encode_message, encode_payload,
};
use crate::protocol::codes;
use crate::protocol::methods::method;
use crate::server::auth::Credentials;
use crate::server::dispatch::Dispatcher;
use crate::server::lifecycle::{Service, ServiceRuns};
use crate::server::router::Notifier;
use crate::session::id::{MAX_SESSION_ID_LEN, generate_session_id, is_well_formed};

/// Path of the legacy event stream
pub const LEGACY_SSE_PATH: &str = "/sse";

/// Path legacy clients POST to, announced in the `endpoint` event
pub const LEGACY_MESSAGES_PATH: &str = "/messages";

const SESSION_HEADER_NAME: HeaderName = HeaderName::from_static("mcp-session-id");

const LIVE_CHANNEL_CAPACITY: usize = 256;

// ============================================================================
// Shared State
// ============================================================================

struct SessionChannel {
    notifier: Notifier,
    live: broadcast::Sender<EventRecord>,
    pump: JoinHandle<()>,
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct LegacySession {
    outbound: mpsc::UnboundedSender<String>,
    session: tokio::sync::Mutex<Option<(String, Notifier)>>,
}

/// State shared by all HTTP handlers
pub struct HttpServerState {
    dispatcher: Arc<Dispatcher>,
    events: Arc<dyn EventStore>,
    channels: DashMap<String, Arc<SessionChannel>>,
    legacy: DashMap<String, Arc<LegacySession>>,
}

impl std::fmt::Debug for HttpServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServerState")
            .field("dispatcher", &self.dispatcher)
            .field("channels", &self.channels.len())
            .field("legacy", &self.legacy.len())
            .finish()
    }
}

impl HttpServerState {
    /// Use the event store backend named in the dispatcher's config
    pub fn new(dispatcher: Arc<Dispatcher>) -> Arc<Self> {
        let events = create_event_store(&dispatcher.config().event_store);
        Self::with_event_store(dispatcher, events)
    }

    pub fn with_event_store(dispatcher: Arc<Dispatcher>, events: Arc<dyn EventStore>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            events,
            channels: DashMap::new(),
            legacy: DashMap::new(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn events(&self) -> &Arc<dyn EventStore> {
        &self.events
    }

    /// Notifier feeding the session's event stream
    pub fn notifier(&self, session_id: &str) -> Notifier {
        self.channel(session_id).notifier.clone()
    }

    fn channel(&self, session_id: &str) -> Arc<SessionChannel> {
        self.channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
                let pump = tokio::spawn(pump_events(
                    session_id.to_string(),
                    rx,
                    Arc::clone(&self.events),
                    live.clone(),
                ));
                Arc::new(SessionChannel {
                    notifier: Notifier::new(session_id, tx),
                    live,
                    pump,
                })
            })
            .value()
            .clone()
    }

    /// Drop the session's stream state and event history
    async fn forget(&self, session_id: &str) {
        self.channels.remove(session_id);
        if let Err(e) = self.events.remove_session(session_id).await {
            warn!(session_id, "Failed to drop event history: {}", e);
        }
    }

    /// Periodically purge expired sessions along with their streams
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let state: Weak<Self> = Arc::downgrade(self);
        let interval = self.dispatcher.config().reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(state) = state.upgrade() else {
                    break;
                };
                for session_id in state.dispatcher.sessions().purge_expired().await {
                    state.dispatcher.close_session(&session_id).await;
                    state.forget(&session_id).await;
                    debug!(session_id = %session_id, "Expired session reaped");
                }
            }
        })
    }

    fn error_response(&self, status: StatusCode, error: &McpError, id: Option<&RequestId>) -> Response {
        let message = self.dispatcher.errors().handle_request_error(error, id);
        match encode_message(&message) {
            Ok(body) => json_response(status, body, None),
            Err(_) => status.into_response(),
        }
    }

    /// Resolve and heartbeat the session named by the request headers
    async fn require_session(
        &self,
        headers: &HeaderMap,
        id: Option<&RequestId>,
    ) -> Result<String, Response> {
        let Some(session_id) = header_str(headers, SESSION_HEADER) else {
            let error = McpError::InvalidRequest(format!("missing {SESSION_HEADER} header"));
            return Err(self.error_response(StatusCode::BAD_REQUEST, &error, id));
        };
        if !is_well_formed(session_id) {
            let error = McpError::InvalidRequest(format!(
                "malformed {SESSION_HEADER} header (at most {MAX_SESSION_ID_LEN} visible ASCII characters)"
            ));
            return Err(self.error_response(StatusCode::BAD_REQUEST, &error, id));
        }
        if let Err(e) = self.dispatcher.sessions().update_activity(session_id).await {
            let error = McpError::InvalidRequest(e.to_string());
            return Err(self.error_response(StatusCode::NOT_FOUND, &error, id));
        }
        Ok(session_id.to_string())
    }

    async fn initialize(&self, request: Request, headers: &HeaderMap) -> Response {
        let credentials = credentials_from(headers);
        let (message, created) = self.dispatcher.handle_initialize(request, &credentials).await;
        let status = match (&message, &created) {
            (_, Some(_)) => StatusCode::OK,
            (Message::Error(response), None) => match response.error.code {
                codes::AUTHENTICATION_ERROR => StatusCode::UNAUTHORIZED,
                codes::AUTHORIZATION_ERROR => StatusCode::FORBIDDEN,
                _ => StatusCode::BAD_REQUEST,
            },
            (_, None) => StatusCode::BAD_REQUEST,
        };
        if let Some(session_id) = &created {
            self.channel(session_id);
        }
        match encode_message(&message) {
            Ok(body) => json_response(status, body, created.as_deref()),
            Err(e) => self.error_response(StatusCode::INTERNAL_SERVER_ERROR, &e, None),
        }
    }

    async fn serve_legacy(&self, legacy: Arc<LegacySession>, decoded: Decoded, credentials: Credentials) {
        let Decoded { payload, rejected } = decoded;
        let reply = match payload {
            Some(Payload::Single(Message::Request(request))) if request.method == method::INITIALIZE => {
                let mut session = legacy.session.lock().await;
                if session.is_some() {
                    let error = McpError::protocol("session already initialized");
                    Some(Payload::Single(
                        self.dispatcher.errors().handle_request_error(&error, Some(&request.id)),
                    ))
                } else {
                    let (message, created) =
                        self.dispatcher.handle_initialize(request, &credentials).await;
                    if let Some(session_id) = created {
                        let notifier = legacy_notifier(&session_id, legacy.outbound.clone());
                        *session = Some((session_id, notifier));
                    }
                    Some(Payload::Single(message))
                }
            }
            payload => {
                let current = legacy.session.lock().await.clone();
                match current {
                    Some((session_id, notifier)) => {
                        match self.dispatcher.sessions().update_activity(&session_id).await {
                            Ok(()) => {
                                let reply = match payload {
                                    Some(payload) => {
                                        self.dispatcher
                                            .handle_payload(&session_id, payload, &notifier)
                                            .await
                                    }
                                    None => None,
                                };
                                self.dispatcher.merge_rejected(reply, rejected)
                            }
                            Err(e) => self.reject_requests(
                                payload,
                                rejected,
                                &McpError::InvalidRequest(e.to_string()),
                            ),
                        }
                    }
                    None => self.reject_requests(
                        payload,
                        rejected,
                        &McpError::InvalidRequest("session not initialized".to_string()),
                    ),
                }
            }
        };

        if let Some(reply) = reply {
            match encode_payload(&reply) {
                Ok(body) => {
                    let _ = legacy.outbound.send(body);
                }
                Err(e) => warn!("Failed to encode legacy reply: {}", e),
            }
        }
    }

    fn reject_requests(
        &self,
        payload: Option<Payload>,
        rejected: Vec<Rejected>,
        error: &McpError,
    ) -> Option<Payload> {
        let replies: Vec<Message> = payload
            .map(Payload::into_messages)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|message| match message {
                Message::Request(request) => Some(
                    self.dispatcher
                        .errors()
                        .handle_request_error(error, Some(&request.id)),
                ),
                _ => None,
            })
            .collect();
        let reply = match replies.len() {
            0 => None,
            1 => replies.into_iter().next().map(Payload::Single),
            _ => Some(Payload::Batch(replies)),
        };
        self.dispatcher.merge_rejected(reply, rejected)
    }
}

async fn pump_events(
    session_id: String,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    events: Arc<dyn EventStore>,
    live: broadcast::Sender<EventRecord>,
) {
    while let Some(message) = outbound.recv().await {
        let payload = match encode_message(&message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(session_id = %session_id, "Failed to encode notification: {}", e);
                continue;
            }
        };
        match events.append(&session_id, payload.clone()).await {
            Ok(sequence_id) => {
                // no subscriber is fine; the store keeps it for the next GET
                let _ = live.send(EventRecord {
                    session_id: session_id.clone(),
                    sequence_id,
                    payload,
                    recorded_at: Utc::now(),
                });
            }
            Err(e) => warn!(session_id = %session_id, "Failed to store event: {}", e),
        }
    }
}

fn legacy_notifier(session_id: &str, outbound: mpsc::UnboundedSender<String>) -> Notifier {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match encode_message(&message) {
                Ok(body) => {
                    if outbound.send(body).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to encode notification: {}", e),
            }
        }
    });
    Notifier::new(session_id, tx)
}

/// Removes a legacy session when its event stream goes away
struct LegacyGuard {
    state: Arc<HttpServerState>,
    legacy_id: String,
}

impl Drop for LegacyGuard {
    fn drop(&mut self) {
        let Some((_, legacy)) = self.state.legacy.remove(&self.legacy_id) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let state = Arc::clone(&self.state);
        let legacy_id = self.legacy_id.clone();
        runtime.spawn(async move {
            if let Some((session_id, _)) = legacy.session.lock().await.take() {
                state.dispatcher.close_session(&session_id).await;
            }
            debug!(legacy_id = %legacy_id, "Legacy stream closed");
        });
    }
}

// ============================================================================
// Routes
// ============================================================================

/// Build the axum router for the configured endpoint
pub fn router(state: Arc<HttpServerState>) -> Router {
    let config = state.dispatcher.config();
    let endpoint = config.endpoint_path.clone();
    let legacy = config.enable_legacy_sse;

    let mut app = Router::new().route(
        &endpoint,
        post(handle_post).get(handle_get).delete(handle_delete),
    );
    if legacy {
        app = app
            .route(LEGACY_SSE_PATH, get(handle_legacy_stream))
            .route(LEGACY_MESSAGES_PATH, post(handle_legacy_post));
    }
    app.with_state(state)
}

async fn handle_post(
    State(state): State<Arc<HttpServerState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Decoded { payload, rejected } = match decode_slice_tolerant(&body) {
        Ok(decoded) => decoded,
        Err(e) => return state.error_response(StatusCode::BAD_REQUEST, &e, None),
    };

    let payload = match payload {
        Some(Payload::Single(Message::Request(request))) if request.method == method::INITIALIZE => {
            log_rpc_message!(Level::DEBUG, "incoming", method::INITIALIZE, &request.params);
            return state.initialize(request, &headers).await;
        }
        other => other,
    };

    let first_id = payload
        .as_ref()
        .and_then(first_request_id)
        .or_else(|| rejected.iter().find_map(|member| member.id.clone()));
    let session_id = match state.require_session(&headers, first_id.as_ref()).await {
        Ok(session_id) => session_id,
        Err(response) => return response,
    };

    if let Some(version) = header_str(&headers, PROTOCOL_VERSION_HEADER)
        && !state
            .dispatcher
            .config()
            .supported_versions
            .iter()
            .any(|v| v == version)
    {
        let error = McpError::InvalidRequest(format!("unsupported protocol version {version}"));
        return state.error_response(StatusCode::BAD_REQUEST, &error, first_id.as_ref());
    }

    let expects_reply =
        !rejected.is_empty() || payload.as_ref().and_then(first_request_id).is_some();
    let notifier = state.notifier(&session_id);
    let dispatcher = Arc::clone(&state.dispatcher);
    // detached so a dropped connection cannot strand the request mid-flight
    let task = tokio::spawn(async move {
        let reply = match payload {
            Some(payload) => dispatcher.handle_payload(&session_id, payload, &notifier).await,
            None => None,
        };
        dispatcher.merge_rejected(reply, rejected)
    });
    if !expects_reply {
        return StatusCode::ACCEPTED.into_response();
    }

    let reply = match task.await {
        Ok(Some(reply)) => reply,
        Ok(None) => return StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let error = McpError::system(format!("dispatch task failed: {e}"));
            return state.error_response(StatusCode::INTERNAL_SERVER_ERROR, &error, first_id.as_ref());
        }
    };
    let body = match encode_payload(&reply) {
        Ok(body) => body,
        Err(e) => return state.error_response(StatusCode::INTERNAL_SERVER_ERROR, &e, first_id.as_ref()),
    };

    if state.dispatcher.config().response_mode == ResponseMode::Sse && accepts(&headers, EVENT_STREAM) {
        // response events carry no id: they are not part of the resumable stream
        let event = Event::default().event("message").data(body);
        let stream = futures::stream::once(async move { Ok::<_, Infallible>(event) });
        Sse::new(stream).into_response()
    } else {
        json_response(StatusCode::OK, body, None)
    }
}

async fn handle_get(State(state): State<Arc<HttpServerState>>, headers: HeaderMap) -> Response {
    if !accepts(&headers, EVENT_STREAM) {
        let error = McpError::InvalidRequest(format!("GET requires Accept: {EVENT_STREAM}"));
        return state.error_response(StatusCode::NOT_ACCEPTABLE, &error, None);
    }
    let session_id = match state.require_session(&headers, None).await {
        Ok(session_id) => session_id,
        Err(response) => return response,
    };

    let last_event_id = match header_str(&headers, LAST_EVENT_ID_HEADER) {
        None => None,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(id) => Some(id),
            Err(_) => {
                let error = McpError::InvalidRequest(format!("malformed {LAST_EVENT_ID_HEADER}: {raw}"));
                return state.error_response(StatusCode::BAD_REQUEST, &error, None);
            }
        },
    };

    // subscribe before reading the backlog so nothing falls between the two
    let mut live = state.channel(&session_id).live.subscribe();
    let backlog = match last_event_id {
        Some(after) => state.events.since(&session_id, after).await,
        // a fresh stream gets whatever is still retained
        None => state.events.retained(&session_id).await,
    };
    let backlog = match backlog {
        Ok(events) => events,
        Err(e) => return state.error_response(StatusCode::BAD_REQUEST, &e, None),
    };
    info!(
        session_id = %session_id,
        last_event_id = ?last_event_id,
        replay = backlog.len(),
        "Event stream opened"
    );

    let mut last_sent = last_event_id.unwrap_or(0);
    let stream = async_stream::stream! {
        for record in backlog {
            last_sent = record.sequence_id;
            yield Ok::<_, Infallible>(to_event(&record));
        }
        loop {
            match live.recv().await {
                Ok(record) if record.sequence_id <= last_sent => continue,
                Ok(record) => {
                    last_sent = record.sequence_id;
                    yield Ok(to_event(&record));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // the client resumes from the store with Last-Event-ID
                    warn!(session_id = %session_id, skipped, "Event stream lagged, closing");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(state.dispatcher.config().keep_alive))
        .into_response()
}

async fn handle_delete(State(state): State<Arc<HttpServerState>>, headers: HeaderMap) -> Response {
    let Some(session_id) = header_str(&headers, SESSION_HEADER).map(str::to_string) else {
        let error = McpError::InvalidRequest(format!("missing {SESSION_HEADER} header"));
        return state.error_response(StatusCode::BAD_REQUEST, &error, None);
    };
    let existed = state.dispatcher.close_session(&session_id).await;
    state.forget(&session_id).await;
    if !existed {
        let error = McpError::InvalidRequest(format!("unknown session {session_id}"));
        return state.error_response(StatusCode::NOT_FOUND, &error, None);
    }
    info!(session_id = %session_id, "Session terminated by client");
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_legacy_stream(State(state): State<Arc<HttpServerState>>) -> Response {
    let legacy_id = generate_session_id();
    let (outbound, mut inbound) = mpsc::unbounded_channel::<String>();
    state.legacy.insert(
        legacy_id.clone(),
        Arc::new(LegacySession {
            outbound,
            session: tokio::sync::Mutex::new(None),
        }),
    );
    let keep_alive = state.dispatcher.config().keep_alive;
    let guard = LegacyGuard {
        state,
        legacy_id: legacy_id.clone(),
    };
    let endpoint = format!("{LEGACY_MESSAGES_PATH}?sessionId={legacy_id}");
    info!(legacy_id = %legacy_id, "Legacy stream opened");

    let stream = async_stream::stream! {
        let _guard = guard;
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        while let Some(payload) = inbound.recv().await {
            yield Ok(Event::default().event("message").data(payload));
        }
    };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(keep_alive))
        .into_response()
}

#[derive(Debug, Deserialize)]
struct LegacyQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

async fn handle_legacy_post(
    State(state): State<Arc<HttpServerState>>,
    Query(query): Query<LegacyQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(legacy) = state
        .legacy
        .get(&query.session_id)
        .map(|entry| Arc::clone(entry.value()))
    else {
        let error = McpError::InvalidRequest(format!("unknown session {}", query.session_id));
        return state.error_response(StatusCode::NOT_FOUND, &error, None);
    };
    let decoded = match decode_slice_tolerant(&body) {
        Ok(decoded) => decoded,
        Err(e) => return state.error_response(StatusCode::BAD_REQUEST, &e, None),
    };

    let credentials = credentials_from(&headers);
    let worker = Arc::clone(&state);
    tokio::spawn(async move { worker.serve_legacy(legacy, decoded, credentials).await });
    StatusCode::ACCEPTED.into_response()
}

// ============================================================================
// Helpers
// ============================================================================

fn to_event(record: &EventRecord) -> Event {
    Event::default()
        .id(record.sequence_id.to_string())
        .event("message")
        .data(&record.payload)
}

fn json_response(status: StatusCode, body: String, session_id: Option<&str>) -> Response {
    let mut response = (status, [(header::CONTENT_TYPE, JSON)], body).into_response();
    if let Some(session_id) = session_id
        && let Ok(value) = HeaderValue::from_str(session_id)
    {
        response.headers_mut().insert(SESSION_HEADER_NAME, value);
    }
    response
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn accepts(headers: &HeaderMap, content_type: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| {
            let media = item.split(';').next().unwrap_or("").trim();
            media.eq_ignore_ascii_case(content_type) || media == "*/*"
        })
}

/// Id of the first request in a payload; `None` if it holds no requests
fn first_request_id(payload: &Payload) -> Option<RequestId> {
    let first = |message: &Message| match message {
        Message::Request(request) => Some(request.id.clone()),
        _ => None,
    };
    match payload {
        Payload::Single(message) => first(message),
        Payload::Batch(messages) => messages.iter().find_map(first),
    }
}

fn credentials_from(headers: &HeaderMap) -> Credentials {
    let bearer_token = header_str(headers, header::AUTHORIZATION.as_str())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());
    let headers = headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    Credentials {
        bearer_token,
        headers,
    }
}

// ============================================================================
// Server Service
// ============================================================================

/// Binds the configured address and serves [`router`] until stopped
pub struct HttpServer {
    state: Arc<HttpServerState>,
    runs: ServiceRuns,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("local_addr", &*self.local_addr.lock())
            .field("running", &self.runs.is_running())
            .finish()
    }
}

impl HttpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self::with_state(HttpServerState::new(dispatcher))
    }

    pub fn with_state(state: Arc<HttpServerState>) -> Self {
        Self {
            state,
            runs: ServiceRuns::default(),
            local_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> &Arc<HttpServerState> {
        &self.state
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub async fn wait(&self) -> McpResult<()> {
        self.runs.wait().await
    }
}

/// Serve on an already bound listener until `shutdown` fires
pub async fn serve(
    listener: TcpListener,
    state: Arc<HttpServerState>,
    shutdown: CancellationToken,
) -> McpResult<()> {
    let reaper = state.spawn_reaper();
    let app = router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| McpError::transport(format!("HTTP server failed: {e}")));
    reaper.abort();
    result
}

#[async_trait]
impl Service for HttpServer {
    fn name(&self) -> &str {
        "http"
    }

    async fn start(&self) -> McpResult<()> {
        let run = self.runs.begin()?;
        let address = self.state.dispatcher.config().bind_address;
        let bound = match TcpListener::bind(address).await {
            Ok(listener) => listener.local_addr().map(|bound| (listener, bound)),
            Err(e) => Err(e),
        };
        let (listener, bound) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.runs.abandon();
                return Err(McpError::transport(format!("failed to bind {address}: {e}")));
            }
        };
        *self.local_addr.lock() = Some(bound);
        info!(address = %bound, "HTTP server listening");

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = serve(listener, state, run.shutdown_token()).await;
            run.complete(result);
        });
        Ok(())
    }

    async fn stop(&self) -> McpResult<()> {
        self.runs.stop().await;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
