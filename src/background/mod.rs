//! Background task supervisor: long-lived named tasks with restart
//!
//! This module provides:
//! - Named long-running tasks driven through a backoff retry loop until
//!   their context is cancelled
//! - Composite task names (caller source file + user suffix) with
//!   duplicate rejection
//! - Fire-and-forget one-shot tasks with per-name accounting
//! - Teardown that cancels every registered task, then closes the pool
//!
//! This is the only component that logs user errors: failures are logged
//! with the task identity, then retried. Running tasks are never
//! force-killed; they cooperate through their context.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::backoff::Backoff;
use crate::context::{CancelReason, Canceller, Ctx};
use crate::pool::{self, PoolError, WorkerPool};
use crate::telemetry::{Counter, Meter, UpDownCounter};

/// Supervisor errors.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The caller's context was cancelled or timed out.
    #[error(transparent)]
    Cancelled(#[from] CancelReason),

    /// The supervisor no longer accepts tasks.
    #[error("supervisor is closed")]
    Closed,

    /// Task names must be non-empty.
    #[error("background task name must not be empty")]
    EmptyName,

    /// A task with the same composite name is already registered.
    #[error("duplicate background task: {0}")]
    DuplicateTask(String),

    /// The underlying pool refused the submission.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for supervisor operations.
pub type SupervisorResult<T> = Result<T, SupervisorError>;

struct SupervisorInner {
    pool: WorkerPool,
    tasks: Mutex<HashMap<String, Canceller>>,
    closed: AtomicBool,
    meter: Arc<dyn Meter>,
    m_running: Arc<dyn UpDownCounter>,
    m_total: Arc<dyn Counter>,
}

/// Supervisor for long-lived background tasks. Create once per process (or
/// use [`default_supervisor`]).
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("pool", &self.inner.pool.name())
            .field("tasks", &self.inner.tasks.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::Acquire))
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor running its tasks on `pool`.
    pub fn new(ctx: &Ctx, pool: WorkerPool) -> Self {
        let meter = ctx.meter(&format!("{}::{}", module_path!(), pool.name()));
        Self {
            inner: Arc::new(SupervisorInner {
                pool,
                tasks: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                m_running: meter.up_down_counter("tasks.running"),
                m_total: meter.counter("tasks.total"),
                meter,
            }),
        }
    }

    /// Register and start a long-lived task.
    ///
    /// `task` is driven through `backoff.retry` until the derived context is
    /// cancelled: a clean completion while the context is live counts as a
    /// restart and is rescheduled; an error is logged with the task identity
    /// and retried. The composite name (caller source file + `name`) must be
    /// unique among registered tasks.
    #[track_caller]
    pub fn run<F, Fut>(
        &self,
        ctx: &Ctx,
        name: &str,
        task: F,
        backoff: Backoff,
    ) -> impl Future<Output = SupervisorResult<()>> + Send
    where
        F: FnMut(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        // capture the call site before entering the async body
        let caller = std::panic::Location::caller();
        let composite = format!("{}::{}", caller.file(), name);
        let this = self.clone();
        let ctx = ctx.clone();
        let name = name.to_string();
        async move { this.run_registered(ctx, name, composite, task, backoff).await }
    }

    async fn run_registered<F, Fut>(
        &self,
        ctx: Ctx,
        name: String,
        composite: String,
        mut task: F,
        backoff: Backoff,
    ) -> SupervisorResult<()>
    where
        F: FnMut(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(SupervisorError::EmptyName);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::Closed);
        }
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }

        let (task_ctx, canceller) = ctx.with_cancel();
        {
            let mut tasks = self.inner.tasks.lock();
            if tasks.contains_key(&composite) {
                return Err(SupervisorError::DuplicateTask(composite));
            }
            tasks.insert(composite.clone(), canceller);
        }

        let m_restarts = self
            .inner
            .meter
            .counter(&format!("task.restarts.{}", composite));
        let inner = self.inner.clone();
        let loop_name = composite.clone();

        let wrapper = async move {
            tracing::info!(task = %loop_name, "background task started");
            inner.m_running.inc();
            inner.m_total.inc();

            let retried_name = loop_name.clone();
            let outcome = backoff
                .retry(&task_ctx, move |c, _attempt| {
                    let run = task(c.clone());
                    let restarts = m_restarts.clone();
                    let task_name = retried_name.clone();
                    async move {
                        match run.await {
                            Ok(()) => {
                                if c.error().is_none() {
                                    // completed while live: reschedule
                                    restarts.inc();
                                    Err(anyhow::anyhow!("task returned; restarting"))
                                } else {
                                    Ok(())
                                }
                            }
                            Err(error) => {
                                tracing::error!(
                                    task = %task_name,
                                    error = ?error,
                                    "background task failed"
                                );
                                Err(error)
                            }
                        }
                    }
                })
                .await;

            match outcome {
                Ok(()) => tracing::info!(task = %loop_name, "background task stopped"),
                Err(error) => {
                    tracing::info!(task = %loop_name, cause = %error, "background task stopped")
                }
            }
            inner.m_running.dec();
            inner.tasks.lock().remove(&loop_name);
        };

        if let Err(err) = self.inner.pool.submit(&ctx, wrapper).await {
            if let Some(canceller) = self.inner.tasks.lock().remove(&composite) {
                canceller.cancel();
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Fire-and-forget a single execution of `task`.
    ///
    /// Unlike [`run`](Supervisor::run), names may repeat; executions and
    /// errors are counted per name.
    pub async fn once<F, Fut>(&self, ctx: &Ctx, name: &str, task: F) -> SupervisorResult<()>
    where
        F: FnOnce(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if name.is_empty() {
            return Err(SupervisorError::EmptyName);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SupervisorError::Closed);
        }
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }

        let m_executions = self
            .inner
            .meter
            .counter(&format!("task.executions.{}", name));
        let m_errors = self.inner.meter.counter(&format!("task.errors.{}", name));
        let task_ctx = ctx.clone();
        let task_name = name.to_string();

        self.inner
            .pool
            .submit(ctx, async move {
                m_executions.inc();
                if let Err(error) = task(task_ctx).await {
                    m_errors.inc();
                    tracing::error!(task = %task_name, error = ?error, "one-shot task failed");
                }
            })
            .await?;
        Ok(())
    }

    /// Stop accepting tasks, cancel every registered task, and close the
    /// pool under its usual deadline rules. Running tasks must cooperate
    /// through their contexts.
    pub async fn close(&self, ctx: &Ctx) -> SupervisorResult<()> {
        self.inner.closed.store(true, Ordering::Release);

        let cancellers: Vec<Canceller> = {
            let mut tasks = self.inner.tasks.lock();
            tasks.drain().map(|(_, canceller)| canceller).collect()
        };
        for canceller in cancellers {
            canceller.cancel();
        }

        self.inner.pool.close(ctx).await?;
        Ok(())
    }

    /// Number of registered long-lived tasks.
    pub fn task_count(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Whether the supervisor refuses new tasks.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// The pool the tasks run on.
    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }
}

static DEFAULT_SUPERVISOR: Lazy<RwLock<Option<Supervisor>>> = Lazy::new(|| RwLock::new(None));

/// The process-wide default supervisor, constructed lazily over the default
/// pool on first use.
pub fn default_supervisor() -> Supervisor {
    if let Some(supervisor) = DEFAULT_SUPERVISOR.read().as_ref() {
        return supervisor.clone();
    }
    let mut slot = DEFAULT_SUPERVISOR.write();
    if let Some(supervisor) = slot.as_ref() {
        return supervisor.clone();
    }
    let supervisor = Supervisor::new(&Ctx::background(), pool::default_pool());
    *slot = Some(supervisor.clone());
    supervisor
}

/// Replace the process-wide default supervisor. Intended for process
/// initialisation only.
pub fn set_default_supervisor(supervisor: Supervisor) {
    *DEFAULT_SUPERVISOR.write() = Some(supervisor);
}
