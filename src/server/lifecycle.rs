//! Server process lifecycle
//!
//! ```text
//! Stopped → Initializing → Running → Stopped
//!     any phase → Error (on a failed transition)
//! ```
//!
//! Hooks are registered for the phase they run on entering, with a numeric
//! priority: higher runs first, equal priorities run in registration order.
//! Error-phase hooks are best effort; their failures are only logged.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{McpError, McpResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecyclePhase {
    Stopped,
    Initializing,
    Running,
    Error,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Work bound to a phase transition
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self, phase: LifecyclePhase) -> McpResult<()>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> LifecycleHook for FnHook<F>
where
    F: Fn(LifecyclePhase) -> McpResult<()> + Send + Sync,
{
    async fn run(&self, phase: LifecyclePhase) -> McpResult<()> {
        (self.0)(phase)
    }
}

/// Wrap a synchronous closure as a hook
pub fn hook_fn<F>(f: F) -> Arc<dyn LifecycleHook>
where
    F: Fn(LifecyclePhase) -> McpResult<()> + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// The thing being run: binds its carrier on start, releases it on stop
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self) -> McpResult<()>;

    async fn stop(&self) -> McpResult<()>;
}

/// One start/stop cycle of a service's background task
#[derive(Clone)]
pub(crate) struct ServiceRun {
    shutdown: CancellationToken,
    finished: CancellationToken,
    outcome: Arc<Mutex<Option<McpResult<()>>>>,
}

impl ServiceRun {
    /// Fires when the run is asked to stop
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn complete(&self, result: McpResult<()>) {
        *self.outcome.lock() = Some(result);
        self.finished.cancel();
    }
}

/// Tracks the current run of a restartable service
///
/// Every [`ServiceRuns::begin`] hands out fresh tokens, so a stopped service
/// can be started again. Stopping or waiting with no run in progress
/// returns at once.
#[derive(Default)]
pub(crate) struct ServiceRuns {
    current: Mutex<Option<ServiceRun>>,
    outcome: Arc<Mutex<Option<McpResult<()>>>>,
}

impl ServiceRuns {
    pub(crate) fn begin(&self) -> McpResult<ServiceRun> {
        let mut current = self.current.lock();
        if let Some(run) = current.as_ref()
            && !run.finished.is_cancelled()
        {
            return Err(McpError::protocol("service is already running"));
        }
        let run = ServiceRun {
            shutdown: CancellationToken::new(),
            finished: CancellationToken::new(),
            outcome: Arc::clone(&self.outcome),
        };
        *current = Some(run.clone());
        Ok(run)
    }

    /// Forget a run whose task was never spawned
    pub(crate) fn abandon(&self) {
        self.current.lock().take();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|run| !run.finished.is_cancelled())
    }

    pub(crate) async fn stop(&self) {
        let Some(run) = self.current.lock().take() else {
            return;
        };
        run.shutdown.cancel();
        run.finished.cancelled().await;
    }

    pub(crate) async fn wait(&self) -> McpResult<()> {
        let run = self.current.lock().clone();
        if let Some(run) = run {
            run.finished.cancelled().await;
        }
        self.outcome.lock().take().unwrap_or(Ok(()))
    }
}

/// Where and why the last transition failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleFailure {
    pub phase: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LifecycleStats {
    pub initializations: u64,
    pub startups: u64,
    pub shutdowns: u64,
    pub restarts: u64,
    pub errors: u64,
}

struct RegisteredHook {
    phase: LifecyclePhase,
    priority: i32,
    order: u64,
    hook: Arc<dyn LifecycleHook>,
}

struct State {
    phase: LifecyclePhase,
    healthy: bool,
    last_error: Option<LifecycleFailure>,
    stats: LifecycleStats,
}

pub struct LifecycleManager {
    service: Arc<dyn Service>,
    hooks: Mutex<Vec<RegisteredHook>>,
    next_order: Mutex<u64>,
    state: Mutex<State>,
    // serializes transitions; hooks run outside the state lock
    transition: tokio::sync::Mutex<()>,
}

impl fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("service", &self.service.name())
            .field("phase", &self.phase())
            .finish()
    }
}

impl LifecycleManager {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            hooks: Mutex::new(Vec::new()),
            next_order: Mutex::new(0),
            state: Mutex::new(State {
                phase: LifecyclePhase::Stopped,
                healthy: true,
                last_error: None,
                stats: LifecycleStats::default(),
            }),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state.lock().phase
    }

    pub fn is_healthy(&self) -> bool {
        self.state.lock().healthy
    }

    pub fn last_error(&self) -> Option<LifecycleFailure> {
        self.state.lock().last_error.clone()
    }

    pub fn stats(&self) -> LifecycleStats {
        self.state.lock().stats
    }

    pub fn register_hook(&self, phase: LifecyclePhase, priority: i32, hook: Arc<dyn LifecycleHook>) {
        let order = {
            let mut next = self.next_order.lock();
            *next += 1;
            *next
        };
        self.hooks.lock().push(RegisteredHook {
            phase,
            priority,
            order,
            hook,
        });
    }

    /// `Stopped → Initializing`
    pub async fn initialize(&self) -> McpResult<()> {
        let _guard = self.transition.lock().await;
        self.expect_phase(LifecyclePhase::Stopped, "initialize")?;
        self.set_phase(LifecyclePhase::Initializing);

        match self.run_hooks(LifecyclePhase::Initializing).await {
            Ok(()) => {
                self.state.lock().stats.initializations += 1;
                info!(service = self.service.name(), "Initialized");
                Ok(())
            }
            Err(e) => Err(self.fail(LifecyclePhase::Initializing, e).await),
        }
    }

    /// `Initializing → Running`; starts the service
    pub async fn startup(&self) -> McpResult<()> {
        let _guard = self.transition.lock().await;
        self.expect_phase(LifecyclePhase::Initializing, "startup")?;

        let result = match self.service.start().await {
            Ok(()) => self.run_hooks(LifecyclePhase::Running).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.phase = LifecyclePhase::Running;
                    state.stats.startups += 1;
                }
                info!(service = self.service.name(), "Running");
                Ok(())
            }
            Err(e) => Err(self.fail(LifecyclePhase::Running, e).await),
        }
    }

    /// Stop the service; a no-op when already `Stopped`
    pub async fn shutdown(&self) -> McpResult<()> {
        let _guard = self.transition.lock().await;
        self.shutdown_locked().await
    }

    /// Shut down, then initialize and start again
    pub async fn restart(&self) -> McpResult<()> {
        {
            let _guard = self.transition.lock().await;
            self.shutdown_locked().await?;
        }
        self.initialize().await?;
        self.startup().await?;
        self.state.lock().stats.restarts += 1;
        Ok(())
    }

    async fn shutdown_locked(&self) -> McpResult<()> {
        let from = self.phase();
        if from == LifecyclePhase::Stopped {
            return Ok(());
        }

        let mut result = self.service.stop().await;
        let hooks = self.run_hooks(LifecyclePhase::Stopped).await;
        if result.is_ok() {
            result = hooks;
        }
        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    state.phase = LifecyclePhase::Stopped;
                    state.healthy = true;
                    state.stats.shutdowns += 1;
                }
                info!(service = self.service.name(), from = %from, "Stopped");
                Ok(())
            }
            Err(e) => Err(self.fail(LifecyclePhase::Stopped, e).await),
        }
    }

    fn expect_phase(&self, expected: LifecyclePhase, operation: &str) -> McpResult<()> {
        let current = self.phase();
        if current == expected {
            Ok(())
        } else {
            Err(McpError::protocol(format!(
                "{operation} requires phase {expected}, current phase is {current}"
            )))
        }
    }

    fn set_phase(&self, phase: LifecyclePhase) {
        self.state.lock().phase = phase;
    }

    async fn run_hooks(&self, phase: LifecyclePhase) -> McpResult<()> {
        for hook in self.hooks_for(phase) {
            hook.run(phase).await?;
        }
        Ok(())
    }

    fn hooks_for(&self, phase: LifecyclePhase) -> Vec<Arc<dyn LifecycleHook>> {
        let hooks = self.hooks.lock();
        let mut selected: Vec<&RegisteredHook> =
            hooks.iter().filter(|h| h.phase == phase).collect();
        selected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));
        selected.into_iter().map(|h| Arc::clone(&h.hook)).collect()
    }

    async fn fail(&self, phase: LifecyclePhase, error: McpError) -> McpError {
        error!(
            service = self.service.name(),
            phase = %phase,
            "Lifecycle transition failed: {}",
            error
        );
        {
            let mut state = self.state.lock();
            state.phase = LifecyclePhase::Error;
            state.healthy = false;
            state.last_error = Some(LifecycleFailure {
                phase: phase.to_string(),
                message: error.to_string(),
            });
            state.stats.errors += 1;
        }
        for hook in self.hooks_for(LifecyclePhase::Error) {
            if let Err(e) = hook.run(LifecyclePhase::Error).await {
                warn!("Error hook failed: {}", e);
            }
        }
        error
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeService {
        fail_start: AtomicBool,
        starts: AtomicU32,
        stops: AtomicU32,
    }

    #[async_trait]
    impl Service for FakeService {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self) -> McpResult<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(McpError::transport("address in use"));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&self) -> McpResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> (Arc<FakeService>, LifecycleManager) {
        let service = Arc::new(FakeService::default());
        let manager = LifecycleManager::new(service.clone());
        (service, manager)
    }

    #[tokio::test]
    async fn test_full_cycle() {
        let (service, manager) = manager();
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);

        manager.initialize().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Initializing);
        manager.startup().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Running);
        manager.shutdown().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Stopped);

        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
        let stats = manager.stats();
        assert_eq!(stats.initializations, 1);
        assert_eq!(stats.startups, 1);
        assert_eq!(stats.shutdowns, 1);
    }

    #[tokio::test]
    async fn test_phase_guards() {
        let (_service, manager) = manager();
        let err = manager.startup().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);

        manager.initialize().await.unwrap();
        let err = manager.initialize().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(manager.phase(), LifecyclePhase::Initializing);
    }

    #[tokio::test]
    async fn test_shutdown_when_stopped_is_noop() {
        let (service, manager) = manager();
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
        assert_eq!(manager.stats().shutdowns, 0);
        assert_eq!(service.stops.load(Ordering::SeqCst), 0);

        manager.initialize().await.unwrap();
        manager.startup().await.unwrap();
        manager.shutdown().await.unwrap();
        manager.shutdown().await.unwrap();
        assert_eq!(manager.stats().shutdowns, 1);
    }

    #[tokio::test]
    async fn test_hooks_run_by_priority_then_registration() {
        let (_service, manager) = manager();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (name, priority) in [("a", 1), ("b", 5), ("c", 1), ("d", 10)] {
            let order = Arc::clone(&order);
            manager.register_hook(
                LifecyclePhase::Initializing,
                priority,
                hook_fn(move |_| {
                    order.lock().push(name);
                    Ok(())
                }),
            );
        }
        manager.register_hook(
            LifecyclePhase::Running,
            100,
            hook_fn(|phase| {
                assert_eq!(phase, LifecyclePhase::Running);
                Ok(())
            }),
        );

        manager.initialize().await.unwrap();
        assert_eq!(*order.lock(), vec!["d", "b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_failed_transition_records_error() {
        let (service, manager) = manager();
        let error_hook_ran = Arc::new(AtomicBool::new(false));
        {
            let flag = Arc::clone(&error_hook_ran);
            manager.register_hook(
                LifecyclePhase::Error,
                0,
                hook_fn(move |_| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }),
            );
        }
        service.fail_start.store(true, Ordering::SeqCst);

        manager.initialize().await.unwrap();
        let err = manager.startup().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(manager.phase(), LifecyclePhase::Error);
        assert!(!manager.is_healthy());
        assert!(error_hook_ran.load(Ordering::SeqCst));

        let failure = manager.last_error().unwrap();
        assert_eq!(failure.phase, "running");
        assert!(failure.message.contains("address in use"));
        assert_eq!(manager.stats().errors, 1);

        // recover by shutting down and starting over
        service.fail_start.store(false, Ordering::SeqCst);
        manager.shutdown().await.unwrap();
        assert!(manager.is_healthy());
        manager.initialize().await.unwrap();
        manager.startup().await.unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Running);
    }

    #[tokio::test]
    async fn test_restart() {
        let (service, manager) = manager();
        manager.initialize().await.unwrap();
        manager.startup().await.unwrap();
        manager.restart().await.unwrap();

        assert_eq!(manager.phase(), LifecyclePhase::Running);
        assert_eq!(service.starts.load(Ordering::SeqCst), 2);
        let stats = manager.stats();
        assert_eq!(stats.restarts, 1);
        assert_eq!(stats.initializations, 2);
        assert_eq!(stats.shutdowns, 1);
    }

    #[tokio::test]
    async fn test_service_runs_restart_with_fresh_tokens() {
        let runs = ServiceRuns::default();
        runs.stop().await;
        assert!(runs.wait().await.is_ok());

        for round in 0..2 {
            let run = runs.begin().unwrap();
            assert!(runs.begin().is_err(), "second begin while running");
            let shutdown = run.shutdown_token();
            assert!(!shutdown.is_cancelled(), "round {round} starts cancelled");
            let task = tokio::spawn(async move {
                shutdown.cancelled().await;
                run.complete(Ok(()));
            });
            assert!(runs.is_running());
            runs.stop().await;
            task.await.unwrap();
            assert!(!runs.is_running());
        }
    }

    #[tokio::test]
    async fn test_service_runs_abandon_unblocks_stop() {
        let runs = ServiceRuns::default();
        let _run = runs.begin().unwrap();
        runs.abandon();
        tokio::time::timeout(std::time::Duration::from_secs(1), runs.stop())
            .await
            .expect("stop must not wait on a run that never started");
        assert!(runs.begin().is_ok());
    }

    #[tokio::test]
    async fn test_service_runs_wait_returns_outcome() {
        let runs = ServiceRuns::default();
        let run = runs.begin().unwrap();
        run.complete(Err(McpError::transport("stdin closed")));
        let err = runs.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(runs.begin().is_ok(), "finished run does not block a new one");
    }
}
