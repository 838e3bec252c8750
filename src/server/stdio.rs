//! Line-delimited server loop
//!
//! Reads one JSON document per line, dispatches each on its own task and
//! funnels every response and notification through a single writer task, so
//! output lines never interleave. One connection carries one session: the
//! first `initialize` creates it and a second one is a protocol violation.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_STDIO_BUFFER_SIZE;
use crate::error::{McpError, McpResult};
use crate::protocol::codec::{
    Decoded, Message, Payload, decode_tolerant, encode_message, encode_payload,
};
use crate::protocol::methods::method;
use crate::server::auth::Credentials;
use crate::server::dispatch::Dispatcher;
use crate::server::lifecycle::{Service, ServiceRuns};
use crate::server::router::Notifier;

/// Serves a [`Dispatcher`] over the process's stdin/stdout
pub struct StdioServer {
    dispatcher: Arc<Dispatcher>,
    max_line_length: usize,
    runs: ServiceRuns,
}

impl std::fmt::Debug for StdioServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioServer")
            .field("max_line_length", &self.max_line_length)
            .field("running", &self.runs.is_running())
            .finish()
    }
}

impl StdioServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            max_line_length: DEFAULT_STDIO_BUFFER_SIZE,
            runs: ServiceRuns::default(),
        }
    }

    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        self.max_line_length = max_line_length;
        self
    }

    /// Serve one connection until EOF or [`Service::stop`]
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> McpResult<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let run = self.runs.begin()?;
        let result = serve_lines(
            Arc::clone(&self.dispatcher),
            reader,
            writer,
            run.shutdown_token(),
            self.max_line_length,
        )
        .await;
        run.complete(result.clone());
        result
    }

    /// Wait for the loop started by [`Service::start`] to end
    pub async fn wait(&self) -> McpResult<()> {
        self.runs.wait().await
    }
}

#[async_trait]
impl Service for StdioServer {
    fn name(&self) -> &str {
        "stdio"
    }

    async fn start(&self) -> McpResult<()> {
        let run = self.runs.begin()?;
        let dispatcher = Arc::clone(&self.dispatcher);
        let max_line_length = self.max_line_length;
        tokio::spawn(async move {
            let result = serve_lines(
                dispatcher,
                tokio::io::stdin(),
                tokio::io::stdout(),
                run.shutdown_token(),
                max_line_length,
            )
            .await;
            run.complete(result);
        });
        Ok(())
    }

    async fn stop(&self) -> McpResult<()> {
        self.runs.stop().await;
        Ok(())
    }
}

async fn serve_lines<R, W>(
    dispatcher: Arc<Dispatcher>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
    max_line_length: usize,
) -> McpResult<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length));

    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_lines(writer, out_rx));

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Message>();
    let forward_task = {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = notify_rx.recv().await {
                match encode_message(&message) {
                    Ok(line) => {
                        if out_tx.send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Failed to encode notification: {}", e),
                }
            }
        })
    };

    let mut session: Option<(String, Notifier)> = None;
    let mut tasks = JoinSet::new();

    // FramedRead yields a single `None` after every decode error, then resumes
    let mut after_error = false;
    let result = loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            next = lines.next() => next,
        };
        let line = match next {
            None if after_error => {
                after_error = false;
                continue;
            }
            None => break Ok(()),
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                after_error = true;
                let error = McpError::Parse(format!(
                    "line exceeds the {max_line_length} byte limit"
                ));
                send(&out_tx, &dispatcher.errors().handle_request_error(&error, None));
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                after_error = true;
                let error = McpError::Parse(format!("invalid UTF-8: {e}"));
                send(&out_tx, &dispatcher.errors().handle_request_error(&error, None));
                continue;
            }
            Some(Err(LinesCodecError::Io(e))) => {
                let error = McpError::transport(format!("stdin read failed: {e}"));
                dispatcher.errors().handle_transport_error(&error, "stdio");
                if dispatcher.errors().attempt_recovery(&error).await {
                    info!("Stdin failure handled by recovery, closing cleanly");
                    break Ok(());
                }
                break Err(error);
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        trace!(payload = %line, "stdin");

        let Decoded { payload, rejected } = match decode_tolerant(&line) {
            Ok(decoded) => decoded,
            Err(e) => {
                send(&out_tx, &dispatcher.errors().handle_request_error(&e, None));
                continue;
            }
        };

        match payload {
            Some(Payload::Single(Message::Request(request))) if request.method == method::INITIALIZE => {
                if session.is_some() {
                    let error = McpError::protocol("connection already has an initialized session");
                    send(
                        &out_tx,
                        &dispatcher.errors().handle_request_error(&error, Some(&request.id)),
                    );
                    continue;
                }
                let (response, created) = dispatcher
                    .handle_initialize(request, &Credentials::default())
                    .await;
                if let Some(session_id) = created {
                    let notifier = Notifier::new(session_id.clone(), notify_tx.clone());
                    session = Some((session_id, notifier));
                }
                send(&out_tx, &response);
            }
            payload => match &session {
                Some((session_id, notifier)) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let session_id = session_id.clone();
                    let notifier = notifier.clone();
                    let out_tx = out_tx.clone();
                    tasks.spawn(async move {
                        let reply = match payload {
                            Some(payload) => {
                                dispatcher.handle_payload(&session_id, payload, &notifier).await
                            }
                            None => None,
                        };
                        if let Some(reply) = dispatcher.merge_rejected(reply, rejected) {
                            send_payload(&out_tx, &reply);
                        }
                    });
                }
                None => {
                    let reply = payload.and_then(|payload| reject_uninitialized(&dispatcher, payload));
                    if let Some(reply) = dispatcher.merge_rejected(reply, rejected) {
                        send_payload(&out_tx, &reply);
                    }
                }
            },
        }

        // reap finished dispatches
        while tasks.try_join_next().is_some() {}
    };

    if shutdown.is_cancelled() {
        tasks.abort_all();
    }
    while tasks.join_next().await.is_some() {}

    if let Some((session_id, notifier)) = session.take() {
        dispatcher.close_session(&session_id).await;
        info!(session_id = %session_id, "Stdio session closed");
        drop(notifier);
    }
    drop(notify_tx);
    let _ = forward_task.await;
    drop(out_tx);
    let _ = writer_task.await;

    result
}

/// Before `initialize`, only `ping` is answered
fn reject_uninitialized(dispatcher: &Dispatcher, payload: Payload) -> Option<Payload> {
    let answer = |message: Message| match message {
        Message::Request(request) if request.method == method::PING => {
            Some(Message::response(request.id, json!({})))
        }
        Message::Request(request) => {
            let error = McpError::InvalidRequest(format!(
                "{} before initialize",
                request.method
            ));
            Some(dispatcher.errors().handle_request_error(&error, Some(&request.id)))
        }
        other => {
            debug!(?other, "Ignoring message before initialize");
            None
        }
    };
    match payload {
        Payload::Single(message) => answer(message).map(Payload::Single),
        Payload::Batch(messages) => {
            let replies: Vec<Message> = messages.into_iter().filter_map(answer).collect();
            if replies.is_empty() {
                None
            } else {
                Some(Payload::Batch(replies))
            }
        }
    }
}

fn send(out: &mpsc::UnboundedSender<String>, message: &Message) {
    match encode_message(message) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => warn!("Failed to encode response: {}", e),
    }
}

fn send_payload(out: &mpsc::UnboundedSender<String>, payload: &Payload) {
    match encode_payload(payload) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => warn!("Failed to encode response: {}", e),
    }
}

async fn write_lines<W>(mut writer: W, mut lines: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = lines.recv().await {
        trace!(payload = %line, "stdout");
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = written.await {
            warn!("Stdout write failed, dropping output: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

// ============================================================================
// Tests
// ============================================================================
