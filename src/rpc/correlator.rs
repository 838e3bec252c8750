//! Request/response correlation
//!
//! One I/O task per connection owns the transport. It writes outbound
//! messages handed to it over a command channel and reads inbound traffic.
//! Each response either resolves the matching [`PendingRequest`] or, when
//! no request is waiting for it, goes to the unexpected-message sink. The
//! sink runs on its own task so the reader never waits on application code.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Level, debug, error, trace, warn};

use crate::error::{ErrorKind, McpError, McpResult};
use crate::io::transport::{Transport, TransportKind};
use crate::log_rpc_message;
use crate::protocol::codec::{
    Decoded, Message, Request, RequestId, decode_tolerant, encode_batch, encode_message,
};
use crate::protocol::methods::{method, notification};

/// Callback for messages no pending request claimed
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// An outstanding request
#[derive(Debug)]
pub struct PendingRequest {
    pub id: RequestId,
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    ticket: u64,
    slot: oneshot::Sender<McpResult<Value>>,
}

enum Command {
    Send {
        payload: String,
        ack: oneshot::Sender<McpResult<()>>,
    },
    Close {
        ack: oneshot::Sender<McpResult<()>>,
    },
}

type PendingMap = Arc<Mutex<HashMap<RequestId, PendingRequest>>>;

/// Frees the slots a caller registered if the caller goes away early
///
/// Entries a reply, cancel or timeout already took are left alone, as is a
/// newer registration that reused the id.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    slots: Vec<(RequestId, u64)>,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a PendingMap) -> Self {
        Self {
            pending,
            slots: Vec::new(),
        }
    }

    fn track(&mut self, id: RequestId, ticket: u64) {
        self.slots.push((id, ticket));
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.pending.lock();
        for (id, ticket) in &self.slots {
            if pending.get(id).is_some_and(|entry| entry.ticket == *ticket) {
                pending.remove(id);
            }
        }
    }
}

/// Correlates requests with responses over one transport
pub struct RequestCorrelator {
    commands: mpsc::UnboundedSender<Command>,
    pending: PendingMap,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    next_id: AtomicU64,
    next_ticket: AtomicU64,
    default_timeout: Duration,
    connected: Arc<AtomicBool>,
    session_id: Arc<RwLock<Option<String>>>,
    transport_kind: TransportKind,
    io_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RequestCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestCorrelator")
            .field("pending", &self.pending.lock().len())
            .field("connected", &self.is_connected())
            .field("transport", &self.transport_kind)
            .finish()
    }
}

impl RequestCorrelator {
    /// Start the transport and spawn the I/O task
    pub async fn start<T>(mut transport: T, default_timeout: Duration) -> McpResult<Self>
    where
        T: Transport + 'static,
    {
        transport.start().await?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (unexpected_tx, unexpected_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let handler: Arc<RwLock<Option<MessageHandler>>> = Arc::new(RwLock::new(None));
        let connected = Arc::new(AtomicBool::new(true));
        let session_id = Arc::new(RwLock::new(transport.session_id()));
        let transport_kind = transport.kind();

        tokio::spawn(dispatch_unexpected(
            unexpected_rx,
            Arc::clone(&handler),
            command_tx.downgrade(),
        ));

        let io_task = tokio::spawn(run_io(
            transport,
            command_rx,
            Arc::clone(&pending),
            unexpected_tx,
            Arc::clone(&connected),
            Arc::clone(&session_id),
        ));

        Ok(Self {
            commands: command_tx,
            pending,
            handler,
            next_id: AtomicU64::new(1),
            next_ticket: AtomicU64::new(0),
            default_timeout,
            connected,
            session_id,
            transport_kind,
            io_task: Mutex::new(Some(io_task)),
        })
    }

    /// Install the sink for messages no pending request claims
    pub fn on_unexpected<F>(&self, handler: F)
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        *self.handler.write() = Some(Arc::new(handler));
    }

    pub fn next_request_id(&self) -> RequestId {
        RequestId::from(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Session id reported by the transport, if any
    pub fn session_id(&self) -> Option<String> {
        self.session_id.read().clone()
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_ids(&self) -> Vec<RequestId> {
        self.pending.lock().keys().cloned().collect()
    }

    /// Send a request with a fresh id and wait for its result
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        let request = Request {
            id: self.next_request_id(),
            method: method.to_string(),
            params,
        };
        self.send(request, timeout).await
    }

    /// Send a request and wait until it resolves, times out or is cancelled
    pub async fn send(&self, request: Request, timeout: Option<Duration>) -> McpResult<Value> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let id = request.id.clone();
        let method = request.method.clone();
        let payload = encode_message(&Message::Request(request))?;

        let (receiver, ticket) = self.register(&id, &method, timeout)?;
        let mut guard = PendingGuard::new(&self.pending);
        guard.track(id.clone(), ticket);
        log_rpc_message!(Level::DEBUG, "outgoing", method.as_str(), &id);

        self.write(payload).await?;
        self.await_slot(id, receiver, timeout).await
    }

    /// Fire-and-forget notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        let payload = encode_message(&Message::notification(method, params))?;
        log_rpc_message!(Level::DEBUG, "outgoing", method, "notification");
        self.write(payload).await
    }

    /// Drop the local entry for `id` now and tell the peer, best effort
    ///
    /// Returns `false` if nothing was pending under `id`. The peer may keep
    /// working on the request.
    pub async fn cancel(&self, id: &RequestId, reason: Option<&str>) -> bool {
        let Some(pending) = self.pending.lock().remove(id) else {
            return false;
        };
        let reason_text = reason.unwrap_or("cancelled by client").to_string();
        let _ = pending.slot.send(Err(McpError::Cancelled(reason_text)));
        debug!(id = %id, method = %pending.method, "Request cancelled locally");

        let mut params = json!({ "requestId": id.to_value() });
        if let Some(reason) = reason {
            params["reason"] = Value::from(reason);
        }
        match encode_message(&Message::notification(notification::CANCELLED, Some(params))) {
            Ok(payload) => {
                let (ack, _) = oneshot::channel();
                let _ = self.commands.send(Command::Send { payload, ack });
            }
            Err(e) => warn!("Failed to encode cancellation: {}", e),
        }
        true
    }

    /// Send a batch; results come back in the order of the batch's requests
    ///
    /// Notifications in the batch produce no entry.
    pub async fn send_batch(
        &self,
        messages: Vec<Message>,
        timeout: Option<Duration>,
    ) -> McpResult<Vec<McpResult<Value>>> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let payload = encode_batch(&messages)?;

        let mut guard = PendingGuard::new(&self.pending);
        let mut receivers = Vec::new();
        for message in &messages {
            match message {
                Message::Request(request) => {
                    let (receiver, ticket) = self.register(&request.id, &request.method, timeout)?;
                    guard.track(request.id.clone(), ticket);
                    receivers.push((request.id.clone(), receiver));
                }
                Message::Notification(_) => {}
                other => {
                    return Err(McpError::validation(format!(
                        "batch may only contain requests and notifications, found {other:?}"
                    )));
                }
            }
        }

        self.write(payload).await?;

        let waits = receivers
            .into_iter()
            .map(|(id, receiver)| self.await_slot(id, receiver, timeout));
        Ok(futures::future::join_all(waits).await)
    }

    /// Answer a request the peer sent us
    pub async fn respond(&self, id: RequestId, result: Value) -> McpResult<()> {
        self.write(encode_message(&Message::response(id, result))?)
            .await
    }

    pub async fn respond_error(&self, id: RequestId, error: &McpError) -> McpResult<()> {
        self.write(encode_message(&Message::error(
            Some(id),
            error.to_error_object(),
        ))?)
        .await
    }

    /// Close the transport and fail everything still pending
    pub async fn close(&self) -> McpResult<()> {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Close { ack }).is_ok() {
            let _ = done.await;
        }
        let task = self.io_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    fn register(
        &self,
        id: &RequestId,
        method: &str,
        timeout: Duration,
    ) -> McpResult<(oneshot::Receiver<McpResult<Value>>, u64)> {
        if !self.is_connected() {
            return Err(McpError::transport("connection is closed"));
        }
        let (slot, receiver) = oneshot::channel();
        let issued_at = Instant::now();
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(McpError::validation(format!(
                "request id {id} is already outstanding"
            )));
        }
        pending.insert(
            id.clone(),
            PendingRequest {
                id: id.clone(),
                method: method.to_string(),
                issued_at,
                deadline: issued_at + timeout,
                ticket,
                slot,
            },
        );
        Ok((receiver, ticket))
    }

    async fn write(&self, payload: String) -> McpResult<()> {
        let (ack, done) = oneshot::channel();
        self.commands
            .send(Command::Send { payload, ack })
            .map_err(|_| McpError::transport("connection is closed"))?;
        done.await
            .map_err(|_| McpError::transport("connection is closed"))?
    }

    async fn await_slot(
        &self,
        id: RequestId,
        receiver: oneshot::Receiver<McpResult<Value>>,
        timeout: Duration,
    ) -> McpResult<Value> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::transport("connection closed before a response arrived")),
            Err(_) => {
                if let Some(pending) = self.pending.lock().remove(&id) {
                    warn!(
                        id = %id,
                        method = %pending.method,
                        elapsed_ms = pending.issued_at.elapsed().as_millis() as u64,
                        "Request timed out"
                    );
                }
                Err(McpError::Timeout(timeout))
            }
        }
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        if let Some(task) = self.io_task.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// I/O Task
// ============================================================================

async fn run_io<T: Transport>(
    mut transport: T,
    mut commands: mpsc::UnboundedReceiver<Command>,
    pending: PendingMap,
    unexpected: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    session_id: Arc<RwLock<Option<String>>>,
) {
    let reason = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { payload, ack }) => {
                    trace!(payload = %payload, "wire out");
                    let result = transport.send(&payload).await;
                    if let Some(id) = transport.session_id() {
                        *session_id.write() = Some(id);
                    }
                    let fatal = matches!(&result, Err(e) if e.kind() == ErrorKind::Transport);
                    let reason = result.as_ref().err().map(ToString::to_string);
                    let _ = ack.send(result);
                    if fatal {
                        break reason.unwrap_or_else(|| "send failed".to_string());
                    }
                }
                Some(Command::Close { ack }) => {
                    let result = transport.close().await;
                    let _ = ack.send(result);
                    break "connection closed".to_string();
                }
                None => {
                    let _ = transport.close().await;
                    break "correlator dropped".to_string();
                }
            },
            inbound = transport.receive() => match inbound {
                Ok(text) => {
                    trace!(payload = %text, "wire in");
                    if let Some(id) = transport.session_id() {
                        *session_id.write() = Some(id);
                    }
                    route_inbound(&text, &pending, &unexpected);
                }
                Err(e) if e.kind() == ErrorKind::Transport => {
                    error!("Transport failed: {}", e);
                    break e.to_string();
                }
                Err(e) => warn!("Discarding unreadable inbound frame: {}", e),
            },
        }
    };

    connected.store(false, Ordering::Release);
    let drained: Vec<PendingRequest> = pending.lock().drain().map(|(_, p)| p).collect();
    if !drained.is_empty() {
        warn!(count = drained.len(), "Failing pending requests: {}", reason);
    }
    for request in drained {
        let _ = request.slot.send(Err(McpError::Transport(reason.clone())));
    }
    trace!("Correlator I/O task finished");
}

fn route_inbound(text: &str, pending: &PendingMap, unexpected: &mpsc::UnboundedSender<Message>) {
    let Decoded { payload, rejected } = match decode_tolerant(text) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Discarding undecodable message: {}", e);
            return;
        }
    };
    for member in rejected {
        warn!(id = ?member.id, "Discarding malformed batch member: {}", member.error);
    }
    let Some(payload) = payload else {
        return;
    };

    for message in payload.into_messages() {
        let claimed = match &message {
            Message::Response(response) => pending.lock().remove(&response.id),
            Message::Error(error) => error.id.as_ref().and_then(|id| pending.lock().remove(id)),
            _ => None,
        };

        match (claimed, message) {
            (Some(request), Message::Response(response)) => {
                log_rpc_message!(Level::DEBUG, "incoming", request.method.as_str(), &response.id);
                let _ = request.slot.send(Ok(response.result));
            }
            (Some(request), Message::Error(error)) => {
                log_rpc_message!(Level::DEBUG, "incoming", request.method.as_str(), &error.error);
                let _ = request
                    .slot
                    .send(Err(McpError::from_error_object(error.error)));
            }
            (_, message) => {
                if unexpected.send(message).is_err() {
                    debug!("Unexpected-message sink is gone");
                }
            }
        }
    }
}

async fn dispatch_unexpected(
    mut inbound: mpsc::UnboundedReceiver<Message>,
    handler: Arc<RwLock<Option<MessageHandler>>>,
    commands: mpsc::WeakUnboundedSender<Command>,
) {
    while let Some(message) = inbound.recv().await {
        if let Message::Request(request) = &message
            && request.method == method::PING
        {
            reply(&commands, Message::response(request.id.clone(), json!({})));
            continue;
        }

        let current = handler.read().clone();
        match (current, message) {
            (Some(handler), message) => handler(message),
            (None, Message::Request(request)) => {
                debug!(method = %request.method, "No handler for peer request");
                let error = McpError::MethodNotFound(request.method.clone());
                reply(
                    &commands,
                    Message::error(Some(request.id), error.to_error_object()),
                );
            }
            (None, message) => debug!(?message, "Unhandled inbound message"),
        }
    }
}

fn reply(commands: &mpsc::WeakUnboundedSender<Command>, message: Message) {
    let Some(commands) = commands.upgrade() else {
        return;
    };
    match encode_message(&message) {
        Ok(payload) => {
            let (ack, _) = oneshot::channel();
            let _ = commands.send(Command::Send { payload, ack });
        }
        Err(e) => warn!("Failed to encode reply: {}", e),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StdioConfig;
    use crate::io::transport::{MemoryTransport, StdioTransport};
    use crate::protocol::codec::{Payload, decode};

    #[cfg(feature = "test-logging")]
    crate::setup_test_logging!();

    /// Read the next message the correlator wrote
    async fn next_message(peer: &mut MemoryTransport) -> Message {
        let text = peer.receive().await.unwrap();
        match decode(&text).unwrap() {
            Payload::Single(message) => message,
            other => panic!("Expected a single message, got {other:?}"),
        }
    }

    async fn setup() -> (Arc<RequestCorrelator>, MemoryTransport) {
        let (client, server) = MemoryTransport::pair();
        let correlator = RequestCorrelator::start(client, Duration::from_secs(5))
            .await
            .unwrap();
        (Arc::new(correlator), server)
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_by_id() {
        let (correlator, mut peer) = setup().await;

        let first = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("tools/list", None, None).await })
        };
        let second = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("prompts/list", None, None).await })
        };

        let a = next_message(&mut peer).await;
        let b = next_message(&mut peer).await;
        assert_eq!(correlator.pending_count(), 2);

        // answer in reverse order, echoing the method so cross-wiring would show
        for message in [b, a] {
            let Message::Request(request) = message else {
                panic!("Expected request");
            };
            let response = Message::response(request.id, json!({ "method": request.method }));
            peer.send(&encode_message(&response).unwrap()).await.unwrap();
        }

        assert_eq!(first.await.unwrap().unwrap(), json!({"method": "tools/list"}));
        assert_eq!(second.await.unwrap().unwrap(), json!({"method": "prompts/list"}));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_unexpected() {
        let (correlator, mut peer) = setup().await;
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        correlator.on_unexpected(move |message| {
            let _ = seen_tx.send(message);
        });

        let err = correlator
            .send_request("tools/call", Some(json!({"name": "slow"})), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(correlator.pending_count(), 0);

        let Message::Request(request) = next_message(&mut peer).await else {
            panic!("Expected request");
        };
        let late = Message::response(request.id.clone(), json!({"late": true}));
        peer.send(&encode_message(&late).unwrap()).await.unwrap();

        let unexpected = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unexpected.id(), Some(&request.id));
    }

    #[tokio::test]
    async fn test_cancel_is_local_first_and_notifies_peer() {
        let (correlator, mut peer) = setup().await;

        let id = RequestId::from("job-1");
        let call = {
            let c = Arc::clone(&correlator);
            let id = id.clone();
            tokio::spawn(async move {
                c.send(
                    Request {
                        id,
                        method: "tools/call".into(),
                        params: Some(json!({"name": "long"})),
                    },
                    None,
                )
                .await
            })
        };

        let _request = next_message(&mut peer).await;
        assert!(correlator.cancel(&id, Some("user abort")).await);
        assert!(!correlator.cancel(&id, None).await);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let Message::Notification(notice) = next_message(&mut peer).await else {
            panic!("Expected cancellation notice");
        };
        assert_eq!(notice.method, notification::CANCELLED);
        assert_eq!(
            notice.params,
            Some(json!({"requestId": "job-1", "reason": "user abort"}))
        );
    }

    #[tokio::test]
    async fn test_error_response_maps_to_taxonomy() {
        let (correlator, mut peer) = setup().await;
        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("tools/explode", None, None).await })
        };
        let Message::Request(request) = next_message(&mut peer).await else {
            panic!("Expected request");
        };
        let error = McpError::MethodNotFound("tools/explode".into());
        let reply = Message::error(Some(request.id), error.to_error_object());
        peer.send(&encode_message(&reply).unwrap()).await.unwrap();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MethodNotFound);
    }

    #[tokio::test]
    async fn test_duplicate_outstanding_id_rejected() {
        let (correlator, mut peer) = setup().await;
        let request = Request {
            id: RequestId::from(99i64),
            method: "ping".into(),
            params: None,
        };
        let first = {
            let c = Arc::clone(&correlator);
            let request = request.clone();
            tokio::spawn(async move { c.send(request, None).await })
        };
        let _ = next_message(&mut peer).await;

        let err = correlator.send(request, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(correlator.pending_count(), 1);
        first.abort();
    }

    #[tokio::test]
    async fn test_peer_ping_answered_and_unknown_request_rejected() {
        let (_correlator, mut peer) = setup().await;

        let ping = Message::request("srv-1", method::PING, None);
        peer.send(&encode_message(&ping).unwrap()).await.unwrap();
        match next_message(&mut peer).await {
            Message::Response(response) => {
                assert_eq!(response.id, RequestId::from("srv-1"));
                assert_eq!(response.result, json!({}));
            }
            other => panic!("Expected ping response, got {other:?}"),
        }

        let sampling = Message::request(7i64, "sampling/createMessage", Some(json!({})));
        peer.send(&encode_message(&sampling).unwrap()).await.unwrap();
        match next_message(&mut peer).await {
            Message::Error(error) => {
                assert_eq!(error.id, Some(RequestId::from(7i64)));
                assert_eq!(error.error.code, crate::protocol::codes::METHOD_NOT_FOUND);
            }
            other => panic!("Expected error response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_requests() {
        let (correlator, mut peer) = setup().await;
        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("tools/list", None, None).await })
        };
        let _ = next_message(&mut peer).await;
        peer.close().await.unwrap();
        drop(peer);

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(correlator.pending_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!correlator.is_connected());
        let err = correlator.send_request("ping", None, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_batch_results_in_request_order() {
        let (correlator, mut peer) = setup().await;
        let batch = vec![
            Message::request(1i64, "tools/list", None),
            Message::notification("notifications/progress", Some(json!({"progress": 1}))),
            Message::request(2i64, "prompts/list", None),
        ];
        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_batch(batch, None).await })
        };

        let text = peer.receive().await.unwrap();
        let Payload::Batch(sent) = decode(&text).unwrap() else {
            panic!("Expected batch");
        };
        assert_eq!(sent.len(), 3);

        let replies = vec![
            Message::response(RequestId::from(2i64), json!("second")),
            Message::response(RequestId::from(1i64), json!("first")),
        ];
        peer.send(&encode_batch(&replies).unwrap()).await.unwrap();

        let results = call.await.unwrap().unwrap();
        let results: Vec<Value> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(results, vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_stdio_scenario_resolves_only_matching_entry() {
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"response":"hi"}}'; sleep 5"#;
        let transport = StdioTransport::new(
            StdioConfig::new("sh")
                .with_args(["-c", script])
                .with_shutdown_timeout(Duration::from_millis(500)),
        );
        let correlator = RequestCorrelator::start(transport, Duration::from_secs(5))
            .await
            .unwrap();

        let result = correlator
            .send(
                Request {
                    id: RequestId::from(1i64),
                    method: "tools/call".into(),
                    params: Some(json!({"name": "echo", "arguments": {"message": "hi"}})),
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(result, json!({"response": "hi"}));
        assert_eq!(correlator.pending_count(), 0);
        correlator.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_start_registers_nothing() {
        let transport = StdioTransport::new(StdioConfig::new("/nonexistent/mcp-server"));
        let err = RequestCorrelator::start(transport, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_abandoned_send_frees_its_slot() {
        let (correlator, mut peer) = setup().await;

        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("tools/call", None, None).await })
        };
        let Message::Request(request) = next_message(&mut peer).await else {
            panic!("Expected request");
        };
        assert_eq!(correlator.pending_count(), 1);

        call.abort();
        assert!(call.await.unwrap_err().is_cancelled());
        assert_eq!(correlator.pending_count(), 0);

        // a reply for the abandoned id is now just unexpected traffic
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        correlator.on_unexpected(move |message| {
            let _ = seen_tx.send(message);
        });
        let late = Message::response(request.id.clone(), json!({}));
        peer.send(&encode_message(&late).unwrap()).await.unwrap();
        let unexpected = tokio::time::timeout(Duration::from_secs(1), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unexpected.id(), Some(&request.id));
    }

    #[tokio::test]
    async fn test_bad_member_does_not_sink_the_batch() {
        let (correlator, mut peer) = setup().await;

        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.send_request("tools/list", None, None).await })
        };
        let Message::Request(request) = next_message(&mut peer).await else {
            panic!("Expected request");
        };

        let reply = json!([
            {"jsonrpc": "2.0", "id": request.id.to_value(), "result": {"tools": []}},
            {"garbage": true}
        ]);
        peer.send(&reply.to_string()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result, json!({"tools": []}));
    }
}
