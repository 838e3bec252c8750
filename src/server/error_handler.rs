//! Error handling at the server's dispatch boundary
//!
//! Request failures become error responses. Failures outside any request
//! (lost connections, fatal startup errors, bad notifications) are only
//! recorded. Recovery strategies can be registered per error kind, or for
//! every kind, and run in descending priority order.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, McpError, McpResult};
use crate::io::process::{ProcessExitEvent, ProcessExitHandler};
use crate::protocol::codec::{Message, RequestId};
use crate::protocol::codes::code_name;

/// Default cap on recovery attempts per error occurrence
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Which errors a strategy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorFilter {
    Kind(ErrorKind),
    Any,
}

impl ErrorFilter {
    fn matches(&self, error: &McpError) -> bool {
        match self {
            ErrorFilter::Kind(kind) => error.kind() == *kind,
            ErrorFilter::Any => true,
        }
    }
}

impl From<ErrorKind> for ErrorFilter {
    fn from(kind: ErrorKind) -> Self {
        ErrorFilter::Kind(kind)
    }
}

/// Local remediation for an error, e.g. respawning a dead subprocess
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok` means the condition behind `error` has been remedied
    async fn recover(&self, error: &McpError) -> McpResult<()>;
}

struct RegisteredStrategy {
    filter: ErrorFilter,
    priority: i32,
    order: u64,
    strategy: Arc<dyn RecoveryStrategy>,
}

#[derive(Debug, Default)]
struct Counters {
    request_errors: u64,
    transport_errors: u64,
    system_errors: u64,
    by_kind: HashMap<ErrorKind, u64>,
    recovery_attempts: u64,
    recoveries_succeeded: u64,
    recoveries_failed: u64,
}

/// Snapshot of error statistics
#[derive(Debug, Clone, Serialize)]
pub struct ErrorStats {
    pub request_errors: u64,
    pub transport_errors: u64,
    pub system_errors: u64,
    pub by_kind: HashMap<ErrorKind, u64>,
    pub recovery_attempts: u64,
    pub recoveries_succeeded: u64,
    pub recoveries_failed: u64,
    /// Succeeded / (succeeded + failed); 0.0 before any recovery ran
    pub recovery_success_rate: f64,
}

pub struct ErrorHandler {
    max_recovery_attempts: u32,
    strategies: RwLock<Vec<RegisteredStrategy>>,
    next_order: Mutex<u64>,
    counters: Mutex<Counters>,
}

impl std::fmt::Debug for ErrorHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorHandler")
            .field("max_recovery_attempts", &self.max_recovery_attempts)
            .field("strategies", &self.strategies.read().len())
            .finish()
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECOVERY_ATTEMPTS)
    }
}

impl ErrorHandler {
    pub fn new(max_recovery_attempts: u32) -> Self {
        Self {
            max_recovery_attempts: max_recovery_attempts.max(1),
            strategies: RwLock::new(Vec::new()),
            next_order: Mutex::new(0),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Turn a request failure into the error response for that request
    ///
    /// Without a known id the response carries [`RequestId::unknown`].
    pub fn handle_request_error(&self, error: &McpError, request_id: Option<&RequestId>) -> Message {
        {
            let mut counters = self.counters.lock();
            counters.request_errors += 1;
            *counters.by_kind.entry(error.kind()).or_default() += 1;
        }
        let id = request_id.cloned().unwrap_or_else(RequestId::unknown);
        let object = error.to_error_object();
        let name = code_name(object.code).unwrap_or("application error");
        match error.kind() {
            ErrorKind::System => error!(id = %id, code = object.code, name, "Request failed: {}", error),
            _ => debug!(id = %id, code = object.code, name, "Request failed: {}", error),
        }
        Message::error(Some(id), object)
    }

    pub fn handle_transport_error(&self, error: &McpError, context: &str) {
        {
            let mut counters = self.counters.lock();
            counters.transport_errors += 1;
            *counters.by_kind.entry(error.kind()).or_default() += 1;
        }
        warn!(context, "Transport error: {}", error);
    }

    pub fn handle_system_error(&self, error: &McpError, context: &str) {
        {
            let mut counters = self.counters.lock();
            counters.system_errors += 1;
            *counters.by_kind.entry(error.kind()).or_default() += 1;
        }
        error!(context, "System error: {}", error);
    }

    pub fn register_recovery_strategy(
        &self,
        filter: impl Into<ErrorFilter>,
        strategy: Arc<dyn RecoveryStrategy>,
        priority: i32,
    ) {
        let order = {
            let mut next = self.next_order.lock();
            *next += 1;
            *next
        };
        let mut strategies = self.strategies.write();
        strategies.push(RegisteredStrategy {
            filter: filter.into(),
            priority,
            order,
            strategy,
        });
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
    }

    /// Run matching strategies until one succeeds or the attempt cap is hit
    ///
    /// Strategies are tried in priority order and cycled when fewer of them
    /// match than the cap allows. Returns `false` when nothing matched.
    pub async fn attempt_recovery(&self, error: &McpError) -> bool {
        let candidates: Vec<Arc<dyn RecoveryStrategy>> = self
            .strategies
            .read()
            .iter()
            .filter(|registered| registered.filter.matches(error))
            .map(|registered| Arc::clone(&registered.strategy))
            .collect();
        if candidates.is_empty() {
            return false;
        }

        let cycle = candidates.iter().cycle();
        for (attempt, strategy) in cycle.take(self.max_recovery_attempts as usize).enumerate() {
            self.counters.lock().recovery_attempts += 1;
            match strategy.recover(error).await {
                Ok(()) => {
                    info!(
                        strategy = strategy.name(),
                        attempt = attempt + 1,
                        "Recovered from {}",
                        error
                    );
                    self.counters.lock().recoveries_succeeded += 1;
                    return true;
                }
                Err(e) => debug!(
                    strategy = strategy.name(),
                    attempt = attempt + 1,
                    "Recovery attempt failed: {}",
                    e
                ),
            }
        }

        warn!(
            attempts = self.max_recovery_attempts,
            "Recovery exhausted for {}", error
        );
        self.counters.lock().recoveries_failed += 1;
        false
    }

    pub fn stats(&self) -> ErrorStats {
        let counters = self.counters.lock();
        let finished = counters.recoveries_succeeded + counters.recoveries_failed;
        let recovery_success_rate = if finished == 0 {
            0.0
        } else {
            counters.recoveries_succeeded as f64 / finished as f64
        };
        ErrorStats {
            request_errors: counters.request_errors,
            transport_errors: counters.transport_errors,
            system_errors: counters.system_errors,
            by_kind: counters.by_kind.clone(),
            recovery_attempts: counters.recovery_attempts,
            recoveries_succeeded: counters.recoveries_succeeded,
            recoveries_failed: counters.recoveries_failed,
            recovery_success_rate,
        }
    }
}

/// An unexpected child exit is a transport failure; strategies may respawn it
#[async_trait]
impl ProcessExitHandler for ErrorHandler {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let error = match event.code {
            Some(code) => McpError::transport(format!("server process exited with status {code}")),
            None => McpError::transport("server process was terminated by a signal"),
        };
        let context = event
            .pid
            .map(|pid| format!("process {pid}"))
            .unwrap_or_else(|| "process".to_string());
        self.handle_transport_error(&error, &context);
        self.attempt_recovery(&error).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codes;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        name: &'static str,
        succeed_on: Option<u32>,
        calls: AtomicU32,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Scripted {
        fn new(
            name: &'static str,
            succeed_on: Option<u32>,
            log: &Arc<Mutex<Vec<&'static str>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                succeed_on,
                calls: AtomicU32::new(0),
                log: Arc::clone(log),
            })
        }
    }

    #[async_trait]
    impl RecoveryStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn recover(&self, _error: &McpError) -> McpResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.log.lock().push(self.name);
            match self.succeed_on {
                Some(n) if call >= n => Ok(()),
                _ => Err(McpError::system("still broken")),
            }
        }
    }

    #[test]
    fn test_request_error_echoes_id_or_sentinel() {
        let handler = ErrorHandler::default();
        let id = RequestId::from(7u64);

        let Message::Error(response) =
            handler.handle_request_error(&McpError::tool_not_found("nope"), Some(&id))
        else {
            panic!("expected an error response");
        };
        assert_eq!(response.id, Some(id));
        assert_eq!(response.error.code, codes::TOOL_NOT_FOUND);

        let Message::Error(response) =
            handler.handle_request_error(&McpError::Parse("bad json".into()), None)
        else {
            panic!("expected an error response");
        };
        assert_eq!(response.id, Some(RequestId::unknown()));
        assert_eq!(response.error.code, codes::PARSE_ERROR);

        let stats = handler.stats();
        assert_eq!(stats.request_errors, 2);
        assert_eq!(stats.by_kind[&ErrorKind::Parse], 1);
    }

    #[test]
    fn test_record_only_paths() {
        let handler = ErrorHandler::default();
        handler.handle_transport_error(&McpError::transport("pipe closed"), "stdio");
        handler.handle_system_error(&McpError::system("bind failed"), "startup");
        let stats = handler.stats();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.system_errors, 1);
        assert_eq!(stats.request_errors, 0);
    }

    #[tokio::test]
    async fn test_strategies_run_by_priority() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = ErrorHandler::new(5);
        handler.register_recovery_strategy(ErrorFilter::Any, Scripted::new("low", Some(1), &log), 1);
        handler.register_recovery_strategy(
            ErrorKind::Transport,
            Scripted::new("high", None, &log),
            10,
        );
        handler.register_recovery_strategy(
            ErrorKind::Timeout,
            Scripted::new("unrelated", Some(1), &log),
            100,
        );

        assert!(handler.attempt_recovery(&McpError::transport("gone")).await);
        assert_eq!(*log.lock(), vec!["high", "low"]);

        let stats = handler.stats();
        assert_eq!(stats.recovery_attempts, 2);
        assert_eq!(stats.recoveries_succeeded, 1);
        assert_eq!(stats.recovery_success_rate, 1.0);
    }

    #[tokio::test]
    async fn test_attempts_are_capped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = ErrorHandler::new(3);
        handler.register_recovery_strategy(
            ErrorKind::Transport,
            Scripted::new("respawn", None, &log),
            0,
        );

        assert!(!handler.attempt_recovery(&McpError::transport("gone")).await);
        assert_eq!(log.lock().len(), 3);

        // no strategy for this kind
        assert!(!handler.attempt_recovery(&McpError::validation("x")).await);

        let stats = handler.stats();
        assert_eq!(stats.recovery_attempts, 3);
        assert_eq!(stats.recoveries_failed, 1);
        assert_eq!(stats.recovery_success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = ErrorHandler::new(2);
        handler.register_recovery_strategy(ErrorFilter::Any, Scripted::new("first", None, &log), 5);
        handler.register_recovery_strategy(ErrorFilter::Any, Scripted::new("second", Some(1), &log), 5);

        assert!(handler.attempt_recovery(&McpError::system("x")).await);
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_child_exit_reaches_recovery() {
        use crate::config::StdioConfig;
        use crate::io::process::ChildProcessManager;
        use std::time::Duration;

        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(ErrorHandler::default());
        let respawn = Scripted::new("respawn", Some(1), &log);
        handler.register_recovery_strategy(ErrorKind::Transport, respawn.clone(), 0);

        let config = StdioConfig::new("sh")
            .with_args(["-c", "exit 4"])
            .with_exit_handler(handler.clone());
        let mut manager = ChildProcessManager::new(&config);
        let _pipes = manager.start().await.unwrap();

        for _ in 0..50 {
            if handler.stats().recoveries_succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let stats = handler.stats();
        assert_eq!(stats.transport_errors, 1);
        assert_eq!(stats.recoveries_succeeded, 1);
        assert_eq!(respawn.calls.load(Ordering::SeqCst), 1);
    }
}
