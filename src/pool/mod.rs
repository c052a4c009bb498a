//! Worker pool with static runners and elastic growth
//!
//! This module provides:
//! - A rendezvous queue (capacity 1) feeding a set of runners
//! - Static runners living for the pool's lifetime
//! - Elastic runners spawned on queue pressure, self-terminating after an
//!   idle timeout
//! - Context-bounded submission with blocked-duration accounting
//! - Deterministic teardown with a deadline, and child pools that share the
//!   parent's runners
//!
//! The queue capacity of 1 is load-bearing: a full queue is the direct
//! signal to grow, which keeps tail latency flat under bursts. Larger
//! capacities would bias the pool toward fewer runners.

pub mod limited;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use thiserror::Error;

use crate::context::{CancelReason, Ctx};
use crate::group::{GroupBuilder, TaskGroup};
use crate::sync::WaitGroup;
use crate::telemetry::{Counter, Meter, UpDownCounter};

pub use limited::LimitedPool;

/// Default idle timeout after which elastic runners terminate.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default bound on [`WorkerPool::close`] when the context has no deadline.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a limited-pool submission may block before it is worth a WARN.
pub(crate) const LIMITED_WAIT_WARN_AFTER: Duration = Duration::from_secs(30);

/// Worker pool errors.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The caller's context was cancelled or timed out.
    #[error(transparent)]
    Cancelled(#[from] CancelReason),

    /// The pool (or this child view of it) no longer accepts submissions.
    #[error("pool is closed")]
    Closed,

    /// In-flight jobs did not drain within the close bound.
    #[error("pool close timed out after {0:?}")]
    CloseTimeout(Duration),

    /// A configuration field is unusable.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Instance name, used for telemetry scopes and log fields.
    pub name: String,

    /// Number of always-on runners. Defaults to the hardware parallelism;
    /// zero is rejected.
    pub static_size: usize,

    /// Idle duration after which an elastic runner terminates. Zero
    /// disables reclamation: elastic runners then live until the pool
    /// closes, which is a leak under sustained bursts.
    pub idle_timeout: Duration,

    /// Suppress the WARN emitted when a limited-pool submission blocks
    /// longer than 30 s.
    pub disable_limited_wait_warn: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "pool".to_string(),
            static_size: num_cpus::get().max(1),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            disable_limited_wait_warn: false,
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> PoolResult<()> {
        if self.static_size == 0 {
            return Err(PoolError::InvalidConfig(
                "static_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A unit of work plus its submission stamp.
struct Job {
    work: BoxFuture<'static, ()>,
    submitted_at: Instant,
}

/// State shared by the root pool, its clones, and its children: the queue,
/// the runners, and the runner/job accounting.
struct PoolShared {
    tx: async_channel::Sender<Job>,
    rx: async_channel::Receiver<Job>,
    static_size: usize,
    idle_timeout: Duration,
    disable_limited_wait_warn: bool,
    static_alive: AtomicI64,
    elastic_alive: AtomicI64,
    elastic_total: AtomicU64,
    running: AtomicI64,
    m_static_exists: Arc<dyn UpDownCounter>,
    m_elastic_exists: Arc<dyn UpDownCounter>,
    m_elastic_total: Arc<dyn Counter>,
    m_running: Arc<dyn UpDownCounter>,
}

impl PoolShared {
    async fn run_job(&self, job: Job) {
        tracing::trace!(
            queued_us = job.submitted_at.elapsed().as_micros() as u64,
            "job picked up"
        );
        self.running.fetch_add(1, Ordering::AcqRel);
        self.m_running.inc();
        job.work.await;
        self.running.fetch_sub(1, Ordering::AcqRel);
        self.m_running.dec();
    }
}

/// Per-handle state: a root pool and each child own their name, closed flag,
/// in-flight accounting, and metrics.
struct PoolLocal {
    name: String,
    child: bool,
    closed: AtomicBool,
    inflight: WaitGroup,
    m_jobs_total: Arc<dyn Counter>,
    m_submit_blocked_us: Arc<dyn Counter>,
}

/// Point-in-time pool counters. Relaxed reads, telemetry-grade only;
/// correctness never depends on them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Live static runners.
    pub static_runners: i64,
    /// Live elastic runners.
    pub elastic_runners: i64,
    /// Elastic runners ever started.
    pub elastic_total: u64,
    /// Jobs currently executing.
    pub running_jobs: i64,
    /// Jobs submitted through this handle and not yet finished.
    pub inflight_jobs: usize,
}

/// A pool of runners fed by a single rendezvous queue.
///
/// Cloning yields another handle to the same pool view; use
/// [`child`](WorkerPool::child) for an independently closable view that
/// shares the runners.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    local: Arc<PoolLocal>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.local.name)
            .field("child", &self.local.child)
            .field("closed", &self.local.closed.load(Ordering::Acquire))
            .field("stats", &self.stats())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool and start its static runners.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(ctx: &Ctx, config: PoolConfig) -> PoolResult<Self> {
        config.validate()?;

        let meter = ctx.meter(&format!("{}::{}", module_path!(), config.name));
        let (tx, rx) = async_channel::bounded(1);

        let shared = Arc::new(PoolShared {
            tx,
            rx,
            static_size: config.static_size,
            idle_timeout: config.idle_timeout,
            disable_limited_wait_warn: config.disable_limited_wait_warn,
            static_alive: AtomicI64::new(0),
            elastic_alive: AtomicI64::new(0),
            elastic_total: AtomicU64::new(0),
            running: AtomicI64::new(0),
            m_static_exists: meter.up_down_counter("runners.static.exists"),
            m_elastic_exists: meter.up_down_counter("runners.elastic.exists"),
            m_elastic_total: meter.counter("runners.elastic.total"),
            m_running: meter.up_down_counter("jobs.running"),
        });

        for _ in 0..config.static_size {
            tokio::spawn(static_runner(shared.clone()));
        }

        tracing::debug!(
            pool = %config.name,
            static_size = config.static_size,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            "worker pool started"
        );

        Ok(Self {
            shared,
            local: Arc::new(PoolLocal {
                name: config.name,
                child: false,
                closed: AtomicBool::new(false),
                inflight: WaitGroup::new(),
                m_jobs_total: meter.counter("jobs.total"),
                m_submit_blocked_us: meter.counter("submit.blocked_us"),
            }),
        })
    }

    /// Submit a job.
    ///
    /// Fails fast when `ctx` is already cancelled (with the cause) or the
    /// pool is closed. When the rendezvous is busy, one elastic runner is
    /// started and the submission commits to a blocking hand-off raced
    /// against `ctx`; each concurrently stuck producer therefore grows the
    /// pool by at most one runner. Once accepted, a job always runs: the
    /// caller's context no longer applies to it.
    pub async fn submit<F>(&self, ctx: &Ctx, work: F) -> PoolResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }
        if self.local.closed.load(Ordering::Acquire) || self.shared.tx.is_closed() {
            return Err(PoolError::Closed);
        }

        self.local.inflight.add(1);
        self.local.m_jobs_total.inc();

        let inflight = self.local.inflight.clone();
        let submitted_at = Instant::now();
        let job = Job {
            work: Box::pin(async move {
                work.await;
                inflight.done();
            }),
            submitted_at,
        };

        match self.shared.tx.try_send(job) {
            Ok(()) => {}
            Err(async_channel::TrySendError::Full(job)) => {
                // Rendezvous busy: grow by one and commit to the hand-off.
                self.start_elastic_runner();
                tokio::select! {
                    reason = ctx.cancelled() => {
                        self.local.inflight.done();
                        return Err(reason.into());
                    }
                    sent = self.shared.tx.send(job) => {
                        if sent.is_err() {
                            self.local.inflight.done();
                            return Err(PoolError::Closed);
                        }
                    }
                }
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                self.local.inflight.done();
                return Err(PoolError::Closed);
            }
        }

        let blocked = submitted_at.elapsed();
        self.local
            .m_submit_blocked_us
            .add(blocked.as_micros() as u64);
        tracing::trace!(
            pool = %self.local.name,
            blocked_us = blocked.as_micros() as u64,
            "job accepted"
        );
        Ok(())
    }

    fn start_elastic_runner(&self) {
        tokio::spawn(elastic_runner(self.shared.clone()));
    }

    /// Stop accepting submissions through this handle and wait for its
    /// in-flight jobs.
    ///
    /// The wait is bounded by the context deadline, or 30 s when it has
    /// none; exceeding the bound returns [`PoolError::CloseTimeout`] and
    /// cancellation returns the cause. On success a root pool closes the
    /// queue, which lets the static runners drain and exit; closing a child
    /// never touches the parent's queue or runners. Idempotent.
    pub async fn close(&self, ctx: &Ctx) -> PoolResult<()> {
        self.local.closed.store(true, Ordering::Release);

        let bound = ctx
            .deadline()
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(DEFAULT_CLOSE_TIMEOUT);

        tokio::select! {
            _ = self.local.inflight.wait() => {}
            reason = ctx.cancelled() => return Err(reason.into()),
            _ = tokio::time::sleep(bound) => return Err(PoolError::CloseTimeout(bound)),
        }

        if !self.local.child {
            // idempotent; queued jobs still drain before the runners exit
            self.shared.tx.close();
        }

        tracing::debug!(pool = %self.local.name, child = self.local.child, "pool closed");
        Ok(())
    }

    /// A child view sharing this pool's queue and runners, with its own
    /// name, metrics, in-flight accounting, and closed flag.
    pub fn child(&self, ctx: &Ctx, name: &str) -> WorkerPool {
        let meter = ctx.meter(&format!("{}::{}", module_path!(), name));
        WorkerPool {
            shared: self.shared.clone(),
            local: Arc::new(PoolLocal {
                name: name.to_string(),
                child: true,
                closed: AtomicBool::new(false),
                inflight: WaitGroup::new(),
                m_jobs_total: meter.counter("jobs.total"),
                m_submit_blocked_us: meter.counter("submit.blocked_us"),
            }),
        }
    }

    /// A [`TaskGroup`] that launches into this pool.
    pub fn group(&self) -> TaskGroup {
        GroupBuilder::new().pool(self.clone()).build()
    }

    /// Wait until every job submitted through this handle has finished.
    pub async fn wait(&self) {
        self.local.inflight.wait().await;
    }

    /// The instance name.
    pub fn name(&self) -> &str {
        &self.local.name
    }

    /// Whether this handle is a child view.
    pub fn is_child(&self) -> bool {
        self.local.child
    }

    /// Whether this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.local.closed.load(Ordering::Acquire) || self.shared.tx.is_closed()
    }

    /// The configured static runner count.
    pub fn static_size(&self) -> usize {
        self.shared.static_size
    }

    /// Live runner count, static plus elastic.
    pub fn runners_alive(&self) -> i64 {
        self.shared.static_alive.load(Ordering::Relaxed)
            + self.shared.elastic_alive.load(Ordering::Relaxed)
    }

    /// Jobs currently executing on the shared runners.
    pub fn running(&self) -> i64 {
        self.shared.running.load(Ordering::Relaxed)
    }

    /// Point-in-time counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            static_runners: self.shared.static_alive.load(Ordering::Relaxed),
            elastic_runners: self.shared.elastic_alive.load(Ordering::Relaxed),
            elastic_total: self.shared.elastic_total.load(Ordering::Relaxed),
            running_jobs: self.shared.running.load(Ordering::Relaxed),
            inflight_jobs: self.local.inflight.count(),
        }
    }

    pub(crate) fn disable_limited_wait_warn(&self) -> bool {
        self.shared.disable_limited_wait_warn
    }
}

/// Static runner: lives until the queue closes and drains.
async fn static_runner(shared: Arc<PoolShared>) {
    shared.static_alive.fetch_add(1, Ordering::AcqRel);
    shared.m_static_exists.inc();

    while let Ok(job) = shared.rx.recv().await {
        shared.run_job(job).await;
    }

    shared.static_alive.fetch_sub(1, Ordering::AcqRel);
    shared.m_static_exists.dec();
}

/// Elastic runner: started on queue pressure, exits after one idle interval
/// without work (or never, when reclamation is disabled).
async fn elastic_runner(shared: Arc<PoolShared>) {
    shared.elastic_alive.fetch_add(1, Ordering::AcqRel);
    shared.elastic_total.fetch_add(1, Ordering::Relaxed);
    shared.m_elastic_exists.inc();
    shared.m_elastic_total.inc();

    loop {
        let job = if shared.idle_timeout.is_zero() {
            match shared.rx.recv().await {
                Ok(job) => job,
                Err(_) => break,
            }
        } else {
            match tokio::time::timeout(shared.idle_timeout, shared.rx.recv()).await {
                Ok(Ok(job)) => job,
                // queue closed, or idle interval elapsed without work
                Ok(Err(_)) | Err(_) => break,
            }
        };
        shared.run_job(job).await;
    }

    shared.elastic_alive.fetch_sub(1, Ordering::AcqRel);
    shared.m_elastic_exists.dec();
}

static DEFAULT_POOL: Lazy<RwLock<Option<WorkerPool>>> = Lazy::new(|| RwLock::new(None));

/// The process-wide default pool, constructed lazily on first use with the
/// default configuration.
///
/// Must first be called (or set) inside a tokio runtime.
pub fn default_pool() -> WorkerPool {
    if let Some(pool) = DEFAULT_POOL.read().as_ref() {
        return pool.clone();
    }
    let mut slot = DEFAULT_POOL.write();
    if let Some(pool) = slot.as_ref() {
        return pool.clone();
    }
    let config = PoolConfig {
        name: "default".to_string(),
        ..PoolConfig::default()
    };
    let pool = WorkerPool::new(&Ctx::background(), config)
        .expect("default pool configuration is statically valid");
    *slot = Some(pool.clone());
    pool
}

/// Replace the process-wide default pool. Intended for process
/// initialisation, before anything captured the previous default.
pub fn set_default_pool(pool: WorkerPool) {
    *DEFAULT_POOL.write() = Some(pool);
}
