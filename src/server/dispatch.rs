//! Server dispatch boundary
//!
//! Carriers (stdio loop, HTTP handlers) hand decoded payloads to the
//! [`Dispatcher`]. It creates sessions on `initialize`, answers `ping`
//! itself, parses everything else into typed requests for the [`Router`],
//! and turns every failure, panics included, into an error response that
//! carries the original request id.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::{AbortHandle, Abortable, join_all};
use serde_json::json;
use tracing::{Level, debug, info};

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::log_timing;
use crate::protocol::codec::{Message, Notification, Payload, Rejected, Request, RequestId};
use crate::protocol::methods::{
    ClientNotification, ClientRequest, InitializeResult, method,
};
use crate::server::auth::{AllowAll, Authenticator, Credentials};
use crate::server::error_handler::ErrorHandler;
use crate::server::router::{Notifier, RequestContext, Router};
use crate::session::store::{ServerSessionStore, SessionMetadata};

type InFlightKey = (String, RequestId);

struct InFlight {
    ticket: u64,
    abort: AbortHandle,
}

pub struct Dispatcher {
    config: Arc<ServerConfig>,
    router: Arc<dyn Router>,
    authenticator: Arc<dyn Authenticator>,
    sessions: Arc<dyn ServerSessionStore>,
    errors: Arc<ErrorHandler>,
    in_flight: DashMap<InFlightKey, InFlight>,
    next_ticket: AtomicU64,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("server", &self.config.server_info)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(
        config: ServerConfig,
        router: Arc<dyn Router>,
        sessions: Arc<dyn ServerSessionStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            router,
            authenticator: Arc::new(AllowAll),
            sessions,
            errors: Arc::new(ErrorHandler::default()),
            in_flight: DashMap::new(),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn with_error_handler(mut self, errors: Arc<ErrorHandler>) -> Self {
        self.errors = errors;
        self
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<dyn ServerSessionStore> {
        &self.sessions
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    // ------------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------------

    /// Authenticate, negotiate the version and create a session
    ///
    /// Every call allocates its own session; racing initializations never
    /// share one.
    pub async fn initialize(
        &self,
        request: &Request,
        credentials: &Credentials,
    ) -> McpResult<(String, InitializeResult)> {
        let ClientRequest::Initialize(params) =
            ClientRequest::parse(&request.method, request.params.clone())?
        else {
            return Err(McpError::InvalidRequest(format!(
                "expected initialize, got {}",
                request.method
            )));
        };

        let auth = self.authenticator.authenticate(credentials).await?;
        let protocol_version = self.config.negotiate_version(&params.protocol_version);

        let session_id = self.sessions.create().await?;
        let metadata = SessionMetadata {
            protocol_version: Some(protocol_version.clone()),
            client_info: Some(params.client_info.clone()),
            client_capabilities: Some(params.capabilities),
            auth: Some(auth),
            ..Default::default()
        };
        if let Err(e) = self.sessions.set_metadata(&session_id, metadata).await {
            self.sessions.terminate(&session_id).await;
            return Err(e);
        }

        info!(
            session_id = %session_id,
            client = %params.client_info.name,
            requested = %params.protocol_version,
            negotiated = %protocol_version,
            "Session initialized"
        );

        Ok((
            session_id,
            InitializeResult {
                protocol_version,
                capabilities: self.config.capabilities.clone(),
                server_info: self.config.server_info.clone(),
                instructions: self.config.instructions.clone(),
            },
        ))
    }

    /// [`Self::initialize`] rendered as a response message
    pub async fn handle_initialize(
        &self,
        request: Request,
        credentials: &Credentials,
    ) -> (Message, Option<String>) {
        let outcome = match self.initialize(&request, credentials).await {
            Ok((session_id, result)) => match serde_json::to_value(&result) {
                Ok(value) => Ok((session_id, value)),
                Err(e) => {
                    self.sessions.terminate(&session_id).await;
                    Err(McpError::from(e))
                }
            },
            Err(e) => Err(e),
        };
        match outcome {
            Ok((session_id, value)) => (Message::response(request.id, value), Some(session_id)),
            Err(e) => (self.errors.handle_request_error(&e, Some(&request.id)), None),
        }
    }

    // ------------------------------------------------------------------------
    // Session traffic
    // ------------------------------------------------------------------------

    /// Serve a payload for an established session
    ///
    /// Batch responses keep the order of the batch's requests. `None` means
    /// there is nothing to send back (only notifications or replies).
    pub async fn handle_payload(
        &self,
        session_id: &str,
        payload: Payload,
        notifier: &Notifier,
    ) -> Option<Payload> {
        match payload {
            Payload::Single(message) => self
                .handle_message(session_id, message, notifier)
                .await
                .map(Payload::Single),
            Payload::Batch(messages) => {
                let items = messages
                    .into_iter()
                    .map(|message| self.handle_batch_item(session_id, message, notifier));
                let responses: Vec<Message> = join_all(items).await.into_iter().flatten().collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(Payload::Batch(responses))
                }
            }
        }
    }

    /// Append an `InvalidRequest` reply per rejected batch member
    pub fn merge_rejected(&self, reply: Option<Payload>, rejected: Vec<Rejected>) -> Option<Payload> {
        if rejected.is_empty() {
            return reply;
        }
        let mut messages = reply.map(Payload::into_messages).unwrap_or_default();
        messages.extend(
            rejected
                .iter()
                .map(|member| self.errors.handle_request_error(&member.error, member.id.as_ref())),
        );
        Some(Payload::Batch(messages))
    }

    async fn handle_batch_item(
        &self,
        session_id: &str,
        message: Message,
        notifier: &Notifier,
    ) -> Option<Message> {
        if let Message::Request(request) = &message
            && request.method == method::INITIALIZE
        {
            let error = McpError::InvalidRequest("initialize cannot be batched".to_string());
            return Some(self.errors.handle_request_error(&error, Some(&request.id)));
        }
        self.handle_message(session_id, message, notifier).await
    }

    pub async fn handle_message(
        &self,
        session_id: &str,
        message: Message,
        notifier: &Notifier,
    ) -> Option<Message> {
        match message {
            Message::Request(request) => self.handle_request(session_id, request, notifier).await,
            Message::Notification(notification) => {
                self.handle_notification(session_id, notification, notifier)
                    .await;
                None
            }
            Message::Response(_) | Message::Error(_) => {
                debug!(session_id, "Ignoring reply from client");
                None
            }
        }
    }

    /// `None` when the request was cancelled by the client
    async fn handle_request(
        &self,
        session_id: &str,
        request: Request,
        notifier: &Notifier,
    ) -> Option<Message> {
        let Request {
            id,
            method: method_name,
            params,
        } = request;

        if method_name == method::INITIALIZE {
            let error = McpError::protocol("session is already initialized");
            return Some(self.errors.handle_request_error(&error, Some(&id)));
        }
        if method_name == method::PING {
            return Some(Message::response(id, json!({})));
        }

        let started = Instant::now();
        let parsed = match ClientRequest::parse(&method_name, params) {
            Ok(parsed) => parsed,
            Err(e) => return Some(self.errors.handle_request_error(&e, Some(&id))),
        };
        let metadata = match self.sessions.get_metadata(session_id).await {
            Ok(metadata) => metadata,
            Err(e) => return Some(self.errors.handle_request_error(&e, Some(&id))),
        };
        let ctx = RequestContext {
            session_id: session_id.to_string(),
            request_id: Some(id.clone()),
            metadata,
            notifier: notifier.clone(),
        };

        let key = (session_id.to_string(), id.clone());
        let (abort, registration) = AbortHandle::new_pair();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        match self.in_flight.entry(key.clone()) {
            Entry::Occupied(_) => {
                let error = McpError::InvalidRequest(format!(
                    "request id {id} is already in flight for this session"
                ));
                return Some(self.errors.handle_request_error(&error, Some(&id)));
            }
            Entry::Vacant(slot) => {
                slot.insert(InFlight { ticket, abort });
            }
        }
        let routed = Abortable::new(
            AssertUnwindSafe(self.router.route(parsed, &ctx)).catch_unwind(),
            registration,
        )
        .await;
        // a cancel may already have freed the id for a newer request
        self.in_flight.remove_if(&key, |_, entry| entry.ticket == ticket);

        let result = match routed {
            Err(_aborted) => {
                debug!(session_id, id = %id, method = %method_name, "Request cancelled by client");
                return None;
            }
            Ok(Err(panic)) => {
                let error = McpError::system(format!(
                    "handler for {method_name} panicked: {}",
                    panic_message(&*panic)
                ));
                self.recover(&error, "request").await;
                Err(error)
            }
            Ok(Ok(result)) => result,
        };
        log_timing!(Level::DEBUG, method_name.as_str(), started.elapsed());

        Some(match result {
            Ok(value) => Message::response(id, value),
            Err(e) => self.errors.handle_request_error(&e, Some(&id)),
        })
    }

    async fn handle_notification(
        &self,
        session_id: &str,
        notification: Notification,
        notifier: &Notifier,
    ) {
        let parsed = match ClientNotification::parse(&notification.method, notification.params) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.errors.handle_system_error(&e, "notification");
                return;
            }
        };

        match parsed {
            ClientNotification::Initialized => {
                let marked = async {
                    let mut metadata = self.sessions.get_metadata(session_id).await?;
                    metadata.initialized = true;
                    self.sessions.set_metadata(session_id, metadata).await
                };
                if let Err(e) = marked.await {
                    self.errors.handle_system_error(&e, "initialized");
                }
            }
            ClientNotification::Cancelled(params) => {
                let key = (session_id.to_string(), params.request_id);
                match self.in_flight.remove(&key) {
                    Some((_, entry)) => {
                        entry.abort.abort();
                        debug!(session_id, id = %key.1, reason = ?params.reason, "Aborting request");
                    }
                    None => debug!(session_id, id = %key.1, "Cancellation for unknown request"),
                }
            }
            other => {
                let metadata = match self.sessions.get_metadata(session_id).await {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        self.errors.handle_system_error(&e, "notification");
                        return;
                    }
                };
                let ctx = RequestContext {
                    session_id: session_id.to_string(),
                    request_id: None,
                    metadata,
                    notifier: notifier.clone(),
                };
                let handled = AssertUnwindSafe(self.router.on_notification(other, &ctx))
                    .catch_unwind()
                    .await;
                match handled {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => self.errors.handle_system_error(&e, "notification"),
                    Err(panic) => {
                        let error = McpError::system(format!(
                            "notification handler panicked: {}",
                            panic_message(&*panic)
                        ));
                        self.recover(&error, "notification").await;
                    }
                }
            }
        }
    }

    /// End a session: drop it from the store and abort its running requests
    pub async fn close_session(&self, session_id: &str) -> bool {
        self.in_flight.retain(|(owner, _), entry| {
            if owner == session_id {
                entry.abort.abort();
                false
            } else {
                true
            }
        });
        self.sessions.terminate(session_id).await
    }

    /// Record a handler crash and let registered strategies repair the router
    async fn recover(&self, error: &McpError, context: &str) -> bool {
        self.errors.handle_system_error(error, context);
        self.errors.attempt_recovery(error).await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
