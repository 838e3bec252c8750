//! Transport layer - raw message exchange
//!
//! A transport moves whole JSON documents (as text) between two peers. It
//! knows nothing about JSON-RPC semantics; correlation happens one layer up.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, trace, warn};

use crate::config::StdioConfig;
use crate::error::{McpError, McpResult};
use crate::io::process::{ChildProcessManager, ProcessState, StopMode};

/// Which carrier a transport uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Stdio,
    Http,
    Memory,
}

/// Core transport trait for bidirectional message exchange
///
/// `receive` must be cancel-safe: the correlator races it against outgoing
/// sends in a `select!` loop.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn, connect); no-op when already started
    async fn start(&mut self) -> McpResult<()>;

    /// Send one encoded message or batch
    async fn send(&mut self, message: &str) -> McpResult<()>;

    /// Receive the next inbound document
    ///
    /// Errors of kind `Transport` are fatal for the connection; any other
    /// error reports one bad inbound frame and the stream stays usable.
    async fn receive(&mut self) -> McpResult<String>;

    /// Close the connection; idempotent
    async fn close(&mut self) -> McpResult<()>;

    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;

    /// Session id assigned by the remote server, if the carrier has one
    fn session_id(&self) -> Option<String> {
        None
    }
}

// ============================================================================
// Stdio Transport Implementation
// ============================================================================

/// Client transport that owns a child process and speaks JSON lines on its pipes
pub struct StdioTransport {
    config: StdioConfig,
    process: ChildProcessManager,
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<McpResult<String>>>,
    connected: bool,
}

impl std::fmt::Debug for StdioTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioTransport")
            .field("command", &self.config.command)
            .field("state", &self.process.state())
            .field("connected", &self.connected)
            .finish()
    }
}

impl StdioTransport {
    pub fn new(config: StdioConfig) -> Self {
        let process = ChildProcessManager::new(&config);
        Self {
            config,
            process,
            outbound: None,
            inbound: None,
            connected: false,
        }
    }

    pub fn process_state(&self) -> ProcessState {
        self.process.state()
    }

    async fn stdin_writer_task(mut stdin: ChildStdin, mut receiver: mpsc::UnboundedReceiver<String>) {
        while let Some(mut message) = receiver.recv().await {
            trace!(length = message.len(), "stdio: writing line");
            message.push('\n');

            if let Err(e) = stdin.write_all(message.as_bytes()).await {
                error!("Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("Failed to flush stdin: {}", e);
                break;
            }
        }
        // dropping stdin closes the pipe, which well-behaved servers treat as EOF
        trace!("stdio: stdin writer task finished");
    }

    /// Forward complete stdout lines until EOF, a read failure or a dropped receiver
    ///
    /// Lines over `max_line` bytes are skipped and reported as parse failures.
    /// With a read timeout, a line left unfinished that long is abandoned and
    /// its remainder dropped when it finally arrives.
    async fn stdout_reader_task<R>(
        stdout: R,
        sender: mpsc::UnboundedSender<McpResult<String>>,
        max_line: usize,
        read_timeout: Option<Duration>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(max_line));
        // FramedRead yields a single `None` after every decode error, then resumes
        let mut after_error = false;
        let mut skip_tail = false;

        loop {
            let next = match read_timeout {
                Some(limit) if !lines.read_buffer().is_empty() => {
                    match tokio::time::timeout(limit, lines.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(timeout = ?limit, "stdio: line not completed in time, discarding");
                            lines.read_buffer_mut().clear();
                            *lines.decoder_mut() = LinesCodec::new_with_max_length(max_line);
                            skip_tail = true;
                            if sender.send(Err(McpError::Timeout(limit))).is_err() {
                                return;
                            }
                            continue;
                        }
                    }
                }
                _ => lines.next().await,
            };

            let line = match next {
                None if after_error => {
                    after_error = false;
                    continue;
                }
                None => {
                    trace!("stdio: stdout reached EOF");
                    break;
                }
                Some(Ok(line)) if std::mem::take(&mut skip_tail) => {
                    trace!(length = line.len(), "stdio: dropped remainder of abandoned line");
                    continue;
                }
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => Ok(line),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    after_error = true;
                    Err(McpError::Parse(format!(
                        "line exceeds the {max_line} byte limit"
                    )))
                }
                Some(Err(LinesCodecError::Io(e))) if e.kind() == std::io::ErrorKind::InvalidData => {
                    after_error = true;
                    Err(McpError::Parse(format!("invalid UTF-8: {e}")))
                }
                Some(Err(LinesCodecError::Io(e))) => {
                    error!("Failed to read from stdout: {}", e);
                    let _ = sender.send(Err(McpError::transport(format!(
                        "failed to read from server stdout: {e}"
                    ))));
                    return;
                }
            };
            if sender.send(line).is_err() {
                trace!("stdio: inbound receiver dropped, stopping reader");
                return;
            }
        }

        let _ = sender.send(Err(McpError::transport("server closed its stdout")));
    }

    fn exit_error(&self) -> McpError {
        match self.process.state() {
            ProcessState::Exited { code: Some(code) } => {
                McpError::transport(format!("server process exited with status {code}"))
            }
            ProcessState::Exited { code: None } => {
                McpError::transport("server process was terminated by a signal")
            }
            _ => McpError::transport("stdio transport is disconnected"),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&mut self) -> McpResult<()> {
        if self.connected {
            return Ok(());
        }
        self.config.validate()?;

        let pipes = self.process.start().await?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::stdin_writer_task(pipes.stdin, outbound_rx));
        tokio::spawn(Self::stdout_reader_task(
            pipes.stdout,
            inbound_tx,
            self.config.buffer_size,
            self.config.read_timeout,
        ));

        self.outbound = Some(outbound_tx);
        self.inbound = Some(inbound_rx);
        self.connected = true;
        debug!(command = %self.config.command, "stdio transport started");
        Ok(())
    }

    async fn send(&mut self, message: &str) -> McpResult<()> {
        if !self.is_connected() {
            return Err(self.exit_error());
        }
        if message.contains('\n') {
            return Err(McpError::validation(
                "stdio messages must not contain embedded newlines",
            ));
        }
        let sender = self.outbound.as_ref().ok_or_else(|| self.exit_error())?;
        sender
            .send(message.to_string())
            .map_err(|_| McpError::transport("stdin writer has stopped"))
    }

    async fn receive(&mut self) -> McpResult<String> {
        let receiver = self
            .inbound
            .as_mut()
            .ok_or_else(|| McpError::transport("stdio transport is not started"))?;

        match receiver.recv().await {
            Some(Ok(line)) => Ok(line),
            Some(Err(e)) if e.kind() == crate::error::ErrorKind::Transport => {
                self.connected = false;
                // prefer the exit status when the process is already gone
                tokio::time::sleep(Duration::from_millis(10)).await;
                match self.process.state() {
                    ProcessState::Exited { .. } => Err(self.exit_error()),
                    _ => Err(e),
                }
            }
            Some(Err(e)) => Err(e),
            None => {
                self.connected = false;
                Err(self.exit_error())
            }
        }
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected = false;
        self.outbound.take();
        self.inbound.take();
        self.process.stop(StopMode::Graceful).await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected && self.process.is_running()
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

// ============================================================================
// In-Memory Transport
// ============================================================================

/// One end of an in-process transport pair
#[derive(Debug)]
pub struct MemoryTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: mpsc::UnboundedReceiver<String>,
    connected: bool,
    session_id: Option<String>,
}

impl MemoryTransport {
    /// Two connected ends: what one sends the other receives
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: Some(a_tx),
                inbound: b_rx,
                connected: true,
                session_id: None,
            },
            Self {
                outbound: Some(b_tx),
                inbound: a_rx,
                connected: true,
                session_id: None,
            },
        )
    }

    /// Pretend the remote side issued a session id
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn start(&mut self) -> McpResult<()> {
        Ok(())
    }

    async fn send(&mut self, message: &str) -> McpResult<()> {
        if !self.connected {
            return Err(McpError::transport("memory transport is closed"));
        }
        let sender = self
            .outbound
            .as_ref()
            .ok_or_else(|| McpError::transport("memory transport is closed"))?;
        sender
            .send(message.to_string())
            .map_err(|_| McpError::transport("peer dropped"))
    }

    async fn receive(&mut self) -> McpResult<String> {
        if !self.connected {
            return Err(McpError::transport("memory transport is closed"));
        }
        match self.inbound.recv().await {
            Some(message) => Ok(message),
            None => {
                self.connected = false;
                Err(McpError::transport("peer closed the connection"))
            }
        }
    }

    async fn close(&mut self) -> McpResult<()> {
        self.connected = false;
        self.outbound.take();
        self.inbound.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.clone()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sh(script: &str) -> StdioConfig {
        StdioConfig::new("sh")
            .with_args(["-c", script])
            .with_shutdown_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_stdio_transport_echo_server() {
        // `cat` echoes every line back
        let mut transport = StdioTransport::new(StdioConfig::new("cat"));
        transport.start().await.unwrap();
        assert!(transport.is_connected());

        transport
            .send(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#)
            .await
            .unwrap();
        let line = transport.receive().await.unwrap();
        assert_eq!(line, r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#);

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_is_transport_error() {
        let mut transport = StdioTransport::new(StdioConfig::new("/nonexistent/mcp-server"));
        let err = transport.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_embedded_newline_rejected() {
        let mut transport = StdioTransport::new(StdioConfig::new("cat"));
        transport.start().await.unwrap();
        let err = transport.send("{\n}").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_surfaces_status() {
        let mut transport = StdioTransport::new(sh("exit 7"));
        transport.start().await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_stderr_is_not_protocol_traffic() {
        let mut transport = StdioTransport::new(sh(
            r#"echo 'noise' >&2; echo '{"jsonrpc":"2.0","method":"notifications/message"}'; sleep 5"#,
        ));
        transport.start().await.unwrap();
        let line = transport.receive().await.unwrap();
        assert!(line.contains("notifications/message"));
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_read_timeout() {
        let config = sh(r#"printf '{"jsonrpc":'; sleep 5"#).with_read_timeout(Duration::from_millis(100));
        let mut transport = StdioTransport::new(config);
        transport.start().await.unwrap();
        let err = transport.receive().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        transport.close().await.unwrap();
    }

    async fn read_lines<R>(reader: R, max_line: usize, read_timeout: Option<Duration>) -> Vec<McpResult<String>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(StdioTransport::stdout_reader_task(reader, tx, max_line, read_timeout));
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            let closed = matches!(&line, Err(e) if e.kind() == ErrorKind::Transport);
            lines.push(line);
            if closed {
                break;
            }
        }
        lines
    }

    #[tokio::test]
    async fn test_reader_splits_and_joins_chunks() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            writer.write_all(b"{\"a\":").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.write_all(b"1}\r\n{\"b\":2}\n\n").await.unwrap();
            writer.write_all("{\"m\":\"世界\"}\n".as_bytes()).await.unwrap();
        });

        let lines = read_lines(reader, 1024, None).await;
        feeder.await.unwrap();
        let (last, lines) = lines.split_last().unwrap();
        let lines: Vec<&str> = lines.iter().map(|l| l.as_deref().unwrap()).collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":2}"#, "{\"m\":\"世界\"}"]);
        assert_eq!(last.as_ref().unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_reader_skips_oversize_and_invalid_lines() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            for chunk in [&b"0123456789abcdef\n"[..], b"\xff\xfe\n", b"{}\n"] {
                writer.write_all(chunk).await.unwrap();
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        });

        let lines = read_lines(reader, 8, None).await;
        feeder.await.unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].as_ref().unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(lines[1].as_ref().unwrap_err().kind(), ErrorKind::Parse);
        assert_eq!(lines[2].as_ref().unwrap(), "{}");
        assert_eq!(lines[3].as_ref().unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_reader_drops_remainder_of_abandoned_line() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let feeder = tokio::spawn(async move {
            writer.write_all(b"{\"half").await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            writer.write_all(b"\"}\n{\"ok\":1}\n").await.unwrap();
        });

        let lines = read_lines(reader, 1024, Some(Duration::from_millis(50))).await;
        feeder.await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].as_ref().unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(lines[1].as_ref().unwrap(), r#"{"ok":1}"#);
        assert_eq!(lines[2].as_ref().unwrap_err().kind(), ErrorKind::Transport);
    }

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.send("hello").await.unwrap();
        assert_eq!(b.receive().await.unwrap(), "hello");

        b.close().await.unwrap();
        assert!(a.send("x").await.is_err());
        assert!(b.receive().await.is_err());
    }
}
