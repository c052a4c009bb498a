//! Priority queue over a concurrency-limited pool
//!
//! This module provides:
//! - A bounded admission gate (back-pressure at `max_size` queued jobs)
//! - A max-heap ordered by priority, FIFO at equal priority
//! - A single dispatcher keeping exactly one ready job primed whenever work
//!   is available
//!
//! Ordering is strict: lower priorities are served only when every higher
//! priority has drained. Sustained high-priority traffic therefore starves
//! the rest — that is the contract, not a bug.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::context::{CancelReason, Ctx};
use crate::pool::LimitedPool;
use crate::sync::WaitGroup;

/// The priority assigned when a submission passes zero.
pub const DEFAULT_PRIORITY: u32 = 100;

/// Priority queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The caller's context was cancelled or timed out.
    #[error(transparent)]
    Cancelled(#[from] CancelReason),

    /// The queue has been closed.
    #[error("priority queue is closed")]
    Closed,

    /// A configuration field is unusable.
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// A queued job: ordering key plus the work and its admission slot.
struct HeapEntry {
    priority: u32,
    seq: u64,
    submitted_at: Instant,
    work: BoxFuture<'static, ()>,
    permit: OwnedSemaphorePermit,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // max-heap: higher priority wins, earlier sequence breaks ties
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    limited: LimitedPool,
    heap: Mutex<BinaryHeap<HeapEntry>>,
    next_tx: async_channel::Sender<HeapEntry>,
    next_rx: async_channel::Receiver<HeapEntry>,
    admission: Arc<Semaphore>,
    seq: AtomicU64,
    unprocessed: AtomicI64,
    running: AtomicI64,
    queue_wait: WaitGroup,
    process_wait: WaitGroup,
    closed: CancellationToken,
}

impl QueueInner {
    /// Move the current heap maximum into the next-rendezvous when the slot
    /// is empty, so the dispatcher always has exactly one ready job while
    /// work is available.
    fn prime_next(&self) {
        let mut heap = self.heap.lock();
        if let Some(top) = heap.pop() {
            match self.next_tx.try_send(top) {
                Ok(()) => {}
                Err(async_channel::TrySendError::Full(entry)) => heap.push(entry),
                // dispatcher gone; the entry is dropped with its permit
                Err(async_channel::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// A bounded max-heap submitter feeding a [`LimitedPool`].
#[derive(Clone)]
pub struct PriorityQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("queued", &self.queue_len())
            .field("running", &self.running())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl PriorityQueue {
    /// Create a queue over `limited` admitting at most `max_size` queued
    /// jobs, and start its dispatcher.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(limited: LimitedPool, max_size: usize) -> QueueResult<Self> {
        if max_size == 0 {
            return Err(QueueError::InvalidConfig(
                "max_size must be at least 1".to_string(),
            ));
        }

        let (next_tx, next_rx) = async_channel::bounded(1);
        let inner = Arc::new(QueueInner {
            limited,
            heap: Mutex::new(BinaryHeap::new()),
            next_tx,
            next_rx,
            admission: Arc::new(Semaphore::new(max_size)),
            seq: AtomicU64::new(0),
            unprocessed: AtomicI64::new(0),
            running: AtomicI64::new(0),
            queue_wait: WaitGroup::new(),
            process_wait: WaitGroup::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(dispatcher(inner.clone()));
        Ok(Self { inner })
    }

    /// Submit a job at `priority`; zero normalises to
    /// [`DEFAULT_PRIORITY`]. Higher priorities dispatch first; equal
    /// priorities dispatch in submission order.
    ///
    /// Blocks while the queue is at capacity, bounded by `ctx`.
    pub async fn submit<F>(&self, ctx: &Ctx, priority: u32, work: F) -> QueueResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }
        if self.inner.closed.is_cancelled() {
            return Err(QueueError::Closed);
        }

        let priority = if priority == 0 {
            DEFAULT_PRIORITY
        } else {
            priority
        };

        let permit = tokio::select! {
            acquired = self.inner.admission.clone().acquire_owned() => {
                acquired.map_err(|_| QueueError::Closed)?
            }
            reason = ctx.cancelled() => return Err(reason.into()),
            _ = self.inner.closed.cancelled() => return Err(QueueError::Closed),
        };

        let entry = HeapEntry {
            priority,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            submitted_at: Instant::now(),
            work: Box::pin(work),
            permit,
        };

        self.inner.unprocessed.fetch_add(1, Ordering::AcqRel);
        self.inner.queue_wait.add(1);
        self.inner.process_wait.add(1);

        self.inner.heap.lock().push(entry);
        self.inner.prime_next();
        Ok(())
    }

    /// Wait until everything admitted has been dispatched and finished
    /// executing, bounded by `ctx`.
    pub async fn wait(&self, ctx: &Ctx) -> QueueResult<()> {
        tokio::select! {
            _ = async {
                self.inner.queue_wait.wait().await;
                self.inner.process_wait.wait().await;
            } => Ok(()),
            reason = ctx.cancelled() => Err(reason.into()),
        }
    }

    /// Jobs admitted but not yet executing. Informational.
    pub fn queue_len(&self) -> i64 {
        self.inner.unprocessed.load(Ordering::Relaxed)
    }

    /// Jobs currently executing. Informational.
    pub fn running(&self) -> i64 {
        self.inner.running.load(Ordering::Relaxed)
    }

    /// Stop the dispatcher and refuse further submissions.
    ///
    /// Meant to be called once the queue is empty. Closing with queued jobs
    /// never deadlocks, but those jobs are dropped undispatched and a
    /// concurrent [`wait`](PriorityQueue::wait) on them will only return
    /// through its own context.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.next_rx.close();
    }
}

/// Dispatcher loop: pulls the primed job, releases its admission slot,
/// re-primes, and hands the work to the limited pool with the running
/// counters bracketed around execution.
async fn dispatcher(inner: Arc<QueueInner>) {
    loop {
        let entry = tokio::select! {
            _ = inner.closed.cancelled() => break,
            received = inner.next_rx.recv() => match received {
                Ok(entry) => entry,
                Err(_) => break,
            },
        };

        let HeapEntry {
            priority,
            submitted_at,
            work,
            permit,
            ..
        } = entry;

        // free one admission slot before execution so producers keep flowing
        drop(permit);
        inner.prime_next();

        tracing::trace!(
            priority,
            queued_us = submitted_at.elapsed().as_micros() as u64,
            "dispatching job"
        );

        let exec_inner = inner.clone();
        let wrapped = async move {
            exec_inner.unprocessed.fetch_sub(1, Ordering::AcqRel);
            exec_inner.queue_wait.done();
            exec_inner.running.fetch_add(1, Ordering::AcqRel);
            work.await;
            exec_inner.running.fetch_sub(1, Ordering::AcqRel);
            exec_inner.process_wait.done();
        };

        // accepted work no longer belongs to any submitter's context
        let dispatch_ctx = Ctx::background();
        tokio::select! {
            _ = inner.closed.cancelled() => break,
            submitted = inner.limited.submit(&dispatch_ctx, wrapped) => {
                if let Err(err) = submitted {
                    // the wrapper never ran; keep the waits honest
                    inner.unprocessed.fetch_sub(1, Ordering::AcqRel);
                    inner.queue_wait.done();
                    inner.process_wait.done();
                    tracing::warn!(error = %err, "priority queue dispatch failed");
                }
            }
        }
    }
}
