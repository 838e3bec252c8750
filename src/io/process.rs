//! Process management layer
//!
//! Handles the lifecycle of the child process behind a stdio transport and
//! the draining of its stderr, separate from the line framing that runs on
//! top of its stdin/stdout.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::StdioConfig;
use crate::error::McpError;

// ============================================================================
// Process State Management
// ============================================================================

/// How to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM, wait for the shutdown timeout, then SIGKILL
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Process has not been started yet
    NotStarted,
    /// Process is currently running
    Running { pid: u32 },
    /// Process exited on its own; `code` is `None` when killed by a signal
    Exited { code: Option<i32> },
    /// Process was stopped by us
    Stopped,
}

impl ProcessState {
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Process Exit Events
// ============================================================================

/// Event fired when the process exits without being asked to
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    pub pid: Option<u32>,
    pub code: Option<i32>,
}

/// Receives unexpected exits, e.g. to feed a respawn recovery strategy
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Process not started")]
    NotStarted,

    #[error("Process already started")]
    AlreadyStarted,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,
}

impl From<ProcessError> for McpError {
    fn from(error: ProcessError) -> Self {
        McpError::Transport(error.to_string())
    }
}

/// Protocol pipes handed to the transport after a successful spawn
#[derive(Debug)]
pub struct ProcessPipes {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

// ============================================================================
// Child Process Manager
// ============================================================================

/// Owns exactly one child process
pub struct ChildProcessManager {
    command: String,
    args: Vec<String>,
    working_directory: Option<PathBuf>,
    env: Vec<(String, String)>,
    shutdown_timeout: Duration,

    state: Arc<Mutex<ProcessState>>,

    /// Flips to `true` once the wait task observed the exit
    exited: Option<watch::Receiver<bool>>,

    stderr_handler: Option<Arc<dyn Fn(String) + Send + Sync>>,
    stderr_task: Option<JoinHandle<()>>,
    wait_task: Option<JoinHandle<()>>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ChildProcessManager {
    pub fn new(config: &StdioConfig) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            working_directory: config.working_directory.clone(),
            env: config
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            shutdown_timeout: config.shutdown_timeout,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            exited: None,
            stderr_handler: config.stderr_handler.clone(),
            stderr_task: None,
            wait_task: None,
            exit_handler: config.exit_handler.clone(),
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Spawn the child and hand back its stdin/stdout
    pub async fn start(&mut self) -> Result<ProcessPipes, ProcessError> {
        if !matches!(self.state(), ProcessState::NotStarted) {
            return Err(ProcessError::AlreadyStarted);
        }

        info!(command = %self.command, args = ?self.args, "Starting process");

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.working_directory {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: self.command.clone(),
            source,
        })?;

        let Some(pid) = child.id() else {
            return Err(ProcessError::Io(io::Error::other("Failed to get process ID")));
        };
        info!(pid, "Process started");
        *self.state.lock() = ProcessState::Running { pid };

        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child.stdout.take().ok_or(ProcessError::StdoutNotAvailable)?;

        // stderr is always drained so a chatty child never blocks on a full pipe
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stderr_monitor(stderr);
        }
        self.spawn_wait_task(child, pid);

        Ok(ProcessPipes { stdin, stdout })
    }

    fn spawn_stderr_monitor(&mut self, stderr: tokio::process::ChildStderr) {
        let handler = self.stderr_handler.clone();
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let content = line.trim_end();
                        if content.is_empty() {
                            continue;
                        }
                        match &handler {
                            Some(handler) => handler(content.to_string()),
                            None => trace!(line = content, "stderr drained"),
                        }
                    }
                    Err(e) => {
                        error!("Failed to read from stderr: {}", e);
                        break;
                    }
                }
            }
            trace!("stderr monitoring finished");
        });
        self.stderr_task = Some(task);
    }

    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let (exited_tx, exited_rx) = watch::channel(false);
        let state = Arc::clone(&self.state);
        let exit_handler = self.exit_handler.clone();

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!(pid, %status, "Process exited");
                    status.code()
                }
                Err(e) => {
                    error!(pid, "Error waiting for child process: {}", e);
                    None
                }
            };

            let unexpected = {
                let mut state = state.lock();
                let unexpected = state.is_running();
                if unexpected {
                    *state = ProcessState::Exited { code };
                }
                unexpected
            };
            let _ = exited_tx.send(true);

            if unexpected && let Some(handler) = exit_handler {
                handler
                    .on_process_exit(ProcessExitEvent {
                        pid: Some(pid),
                        code,
                    })
                    .await;
            }
        });

        self.exited = Some(exited_rx);
        self.wait_task = Some(task);
    }

    /// Stop the child; safe to call in any state and more than once
    pub async fn stop(&mut self, mode: StopMode) -> Result<(), ProcessError> {
        let pid = {
            let mut state = self.state.lock();
            match state.pid() {
                Some(pid) => {
                    *state = ProcessState::Stopped;
                    pid
                }
                None => {
                    if matches!(*state, ProcessState::NotStarted) {
                        *state = ProcessState::Stopped;
                    }
                    debug!("stop() called on a process that is not running");
                    return Ok(());
                }
            }
        };

        match mode {
            StopMode::Graceful => {
                info!(pid, timeout = ?self.shutdown_timeout, "Gracefully stopping process");
                send_signal(pid, Signal::Terminate);
                if !self.wait_for_exit(self.shutdown_timeout).await {
                    warn!(pid, "Process ignored SIGTERM, killing");
                    send_signal(pid, Signal::Kill);
                    self.wait_for_exit(self.shutdown_timeout).await;
                }
            }
            StopMode::Force => {
                info!(pid, "Force killing process");
                send_signal(pid, Signal::Kill);
                self.wait_for_exit(self.shutdown_timeout).await;
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }

    /// Synchronous SIGKILL for use in `Drop`
    pub fn kill_sync(&mut self) {
        let pid = {
            let mut state = self.state.lock();
            let Some(pid) = state.pid() else {
                return;
            };
            *state = ProcessState::Stopped;
            pid
        };
        info!(pid, "Synchronously force killing process");
        send_signal(pid, Signal::Kill);
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(exited) = self.exited.as_mut() else {
            return true;
        };
        if *exited.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, exited.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ChildProcessManager {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: Signal) {
    let signo = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only yields ESRCH
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc != 0 {
        debug!(pid, signo, "kill(2) failed: {}", io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: Signal) {
    warn!(pid, "Signal delivery not supported on this platform; relying on kill_on_drop");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sh(script: &str) -> StdioConfig {
        StdioConfig::new("sh")
            .with_args(["-c", script])
            .with_shutdown_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_lifecycle_and_idempotent_stop() {
        let mut manager = ChildProcessManager::new(&sh("sleep 30"));
        assert_eq!(manager.state(), ProcessState::NotStarted);

        let _pipes = manager.start().await.unwrap();
        assert!(manager.is_running());

        manager.stop(StopMode::Graceful).await.unwrap();
        assert_eq!(manager.state(), ProcessState::Stopped);

        manager.stop(StopMode::Graceful).await.unwrap();
        manager.stop(StopMode::Force).await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let mut manager = ChildProcessManager::new(&sh("true"));
        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let mut manager = ChildProcessManager::new(&sh("trap '' TERM; sleep 30"));
        let _pipes = manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        manager.stop(StopMode::Graceful).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut manager = ChildProcessManager::new(&StdioConfig::new("/nonexistent/mcp-server"));
        let err = manager.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert_eq!(McpError::from(err).kind(), crate::error::ErrorKind::Transport);
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let mut manager = ChildProcessManager::new(&sh("sleep 30"));
        let _pipes = manager.start().await.unwrap();
        assert!(matches!(
            manager.start().await,
            Err(ProcessError::AlreadyStarted)
        ));
        manager.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_stderr_handler_receives_lines() {
        let lines = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&lines);
        let config = sh("echo 'diagnostic output' >&2; sleep 1")
            .with_stderr_handler(move |line| sink.lock().push(line));

        let mut manager = ChildProcessManager::new(&config);
        let _pipes = manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop(StopMode::Graceful).await.unwrap();

        assert_eq!(lines.lock().first().map(String::as_str), Some("diagnostic output"));
    }

    struct CountingExitHandler(AtomicUsize);

    #[async_trait]
    impl ProcessExitHandler for CountingExitHandler {
        async fn on_process_exit(&self, event: ProcessExitEvent) {
            assert_eq!(event.code, Some(3));
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let handler = Arc::new(CountingExitHandler(AtomicUsize::new(0)));
        let mut manager = ChildProcessManager::new(&sh("exit 3").with_exit_handler(handler.clone()));
        let _pipes = manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.state(), ProcessState::Exited { code: Some(3) });
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_process_state_methods() {
        assert!(!ProcessState::NotStarted.is_running());
        assert_eq!(ProcessState::Running { pid: 42 }.pid(), Some(42));
        assert!(ProcessState::Exited { code: Some(0) }.pid().is_none());
        assert!(!ProcessState::Stopped.is_running());
    }
}
