//! The shutdown coordinator: request flag, timeout, and the staged drain.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ShutdownConfig;
use crate::error::{Error, Result};
use crate::gate::{Gate, GateGuard};
use crate::notifier::{Completion, Notifier};
use crate::registry::{Registry, StageBatch};
use crate::stage::{Phase, Stage};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct CoordinatorState {
    requested: bool,
    timeout: Duration,
    phase: Phase,
}

struct Inner {
    // Never held together with the registry mutex.
    state: Mutex<CoordinatorState>,
    registry: Registry,
    gate: Arc<Gate>,
    finished: CancellationToken,
}

/// Handle to a process-wide shutdown sequence.
///
/// Cheap to clone; every clone drives the same sequence. Create one per
/// process (or per test) and hand it to everything that needs to take part
/// in shutdown.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

/// What happened in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub stage: Stage,
    /// Plain waiters that were handed a completion token.
    pub notified: usize,
    /// Plain waiters that reported completion before the timeout.
    pub completed: usize,
    /// Plain waiters left behind at the timeout.
    pub abandoned: usize,
    /// Function waiters started. Their completion is not awaited.
    pub functions: usize,
}

/// Outcome of a full shutdown sequence, returned to the caller that ran it.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub timeout: Duration,
    pub elapsed: Duration,
    /// False when lock holders were still active at the timeout.
    pub gate_drained: bool,
    pub stages: Vec<StageReport>,
}

impl ShutdownReport {
    pub fn stage(&self, stage: Stage) -> Option<&StageReport> {
        self.stages.iter().find(|report| report.stage == stage)
    }

    pub fn abandoned(&self) -> usize {
        self.stages.iter().map(|report| report.abandoned).sum()
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoordinatorState {
                    requested: false,
                    timeout,
                    phase: Phase::Idle,
                }),
                registry: Registry::default(),
                gate: Arc::new(Gate::new()),
                finished: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::with_timeout(config.stage_timeout)
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the maximum time spent waiting in each stage.
    ///
    /// Rejected once shutdown has been requested: the timeout in effect at
    /// the trigger applies to the whole sequence.
    pub fn set_timeout(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state();
        if state.requested {
            return Err(Error::AlreadyStarted);
        }
        state.timeout = timeout;
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        self.state().timeout
    }

    /// Whether shutdown has been requested.
    ///
    /// Advisory only: a `false` may be stale by the time it is read.
    pub fn started(&self) -> bool {
        self.state().requested
    }

    pub fn phase(&self) -> Phase {
        self.state().phase
    }

    fn set_phase(&self, phase: Phase) {
        self.state().phase = phase;
    }

    /// Notifier for the first stage.
    pub fn first(&self) -> Notifier {
        self.register(Stage::First)
    }

    /// Notifier for the second stage.
    pub fn second(&self) -> Notifier {
        self.register(Stage::Second)
    }

    /// Notifier for the third stage.
    pub fn third(&self) -> Notifier {
        self.register(Stage::Third)
    }

    /// Register a plain waiter for `stage`.
    ///
    /// After shutdown has been requested the returned notifier has already
    /// fired; its completion is not waited on.
    pub fn register(&self, stage: Stage) -> Notifier {
        self.inner.registry.register(stage)
    }

    /// Run `callback(arg)` in the first stage.
    pub fn first_func<F, Fut, T>(&self, callback: F, arg: T) -> Notifier
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        self.register_func(Stage::First, callback, arg)
    }

    /// Run `callback(arg)` in the second stage.
    pub fn second_func<F, Fut, T>(&self, callback: F, arg: T) -> Notifier
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        self.register_func(Stage::Second, callback, arg)
    }

    /// Run `callback(arg)` in the third stage.
    ///
    /// The returned notifier is mostly useful for [`Coordinator::cancel`].
    pub fn third_func<F, Fut, T>(&self, callback: F, arg: T) -> Notifier
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        self.register_func(Stage::Third, callback, arg)
    }

    /// Register a function waiter for `stage`.
    ///
    /// The callback runs on its own tokio task when the stage fires; a panic
    /// inside it is logged and otherwise ignored. The coordinator does not
    /// wait for it to finish, so a slow callback can outlive its stage.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn register_func<F, Fut, T>(&self, stage: Stage, callback: F, arg: T) -> Notifier
    where
        F: FnOnce(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
        T: Send + 'static,
    {
        self.inner.registry.register_func(stage, callback, arg)
    }

    /// Withdraw a registration so it is never signalled.
    ///
    /// For function waiters the callback will not run. Has no effect once
    /// shutdown has been requested. Returns whether anything was removed.
    pub fn cancel(&self, notifier: &Notifier) -> bool {
        if self.started() {
            return false;
        }
        self.inner.registry.cancel(notifier.id())
    }

    /// Pending (plain, function) registrations for `stage`.
    pub fn pending(&self, stage: Stage) -> (usize, usize) {
        self.inner.registry.pending(stage)
    }

    /// Hold off shutdown while a critical section runs.
    ///
    /// Returns `None` without blocking once shutdown has been requested.
    /// Holds nest; shutdown waits until every guard is released or the
    /// timeout elapses.
    pub fn lock(&self) -> Option<GateGuard> {
        self.inner.gate.try_acquire()
    }

    /// Current number of gate holders.
    pub fn lock_holders(&self) -> usize {
        self.inner.gate.holders()
    }

    /// Run the three shutdown stages.
    ///
    /// Only the first call runs the sequence and receives the report. Any
    /// other call returns `None` once that sequence has finished.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        let timeout = {
            let mut state = self.state();
            if state.requested {
                None
            } else {
                state.requested = true;
                // Close under the flag so no lock succeeds after `started()` reads true.
                self.inner.gate.close();
                Some(state.timeout)
            }
        };
        let Some(timeout) = timeout else {
            debug!("shutdown already requested; waiting for it to finish");
            self.inner.finished.cancelled().await;
            return None;
        };
        // Releases concurrent triggers even if this future is dropped midway.
        let _finished = self.inner.finished.clone().drop_guard();
        self.inner.registry.seal();

        let started = Instant::now();
        // The gate is closed, so the holder count only falls from here on.
        let gate_drained = self.inner.gate.drain(timeout).await;

        let mut stages = Vec::with_capacity(Stage::ALL.len());
        for stage in Stage::ALL {
            self.set_phase(Phase::Stage(stage));
            stages.push(self.run_stage(stage, timeout).await);
        }

        self.inner.registry.reset();
        self.set_phase(Phase::Terminated);

        let report = ShutdownReport {
            timeout,
            elapsed: started.elapsed(),
            gate_drained,
            stages,
        };
        info!(
            elapsed = %humantime::format_duration(report.elapsed),
            abandoned = report.abandoned(),
            gate_drained,
            "shutdown complete"
        );
        Some(report)
    }

    async fn run_stage(&self, stage: Stage, timeout: Duration) -> StageReport {
        let StageBatch { waiters, functions } = self.inner.registry.take(stage);
        if waiters.is_empty() && functions.is_empty() {
            debug!(%stage, "no waiters registered");
        } else {
            info!(
                %stage,
                waiters = waiters.len(),
                functions = functions.len(),
                "shutdown stage"
            );
        }

        let notified = waiters.len();
        let mut pending = Vec::with_capacity(notified);
        for waiter in waiters {
            let (completion, done) = Completion::pair();
            // A dropped notifier hands the token back; dropping it resolves `done`.
            let _ = waiter.tx.send(completion);
            pending.push(done);
        }

        let function_count = functions.len();
        for function in functions {
            let _ = function.internal.send(Completion::detached());
        }

        let deadline = Instant::now() + timeout;
        let mut completed = 0;
        let mut timed_out = false;
        for done in &mut pending {
            if !timed_out && tokio::time::timeout_at(deadline, &mut *done).await.is_ok() {
                completed += 1;
                continue;
            }
            // Past the deadline only count tokens that are already resolved.
            timed_out = true;
            if !matches!(done.try_recv(), Err(TryRecvError::Empty)) {
                completed += 1;
            }
        }

        let abandoned = notified - completed;
        if abandoned > 0 {
            warn!(
                %stage,
                abandoned,
                timeout = %humantime::format_duration(timeout),
                "timeout waiting to shutdown, forcing shutdown"
            );
        }

        StageReport {
            stage,
            notified,
            completed,
            abandoned,
            functions: function_count,
        }
    }

    /// Run the shutdown sequence, then exit the process with `code`.
    pub async fn exit(&self, code: i32) {
        self.shutdown().await;
        info!(code, "exiting");
        std::process::exit(code)
    }
}
