//! Task group: fan-out with a join point and indexed error aggregation
//!
//! This module provides:
//! - Launch into a worker pool, or direct spawn when no pool is attached
//! - Optional retry of every launch through a backoff
//! - Optional cancel-on-error wired to a context canceller
//! - A reusable join point: after a wait the group is indistinguishable
//!   from a freshly built one

pub mod error_set;

pub use error_set::{ErrorSet, IndexedError};

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use thiserror::Error;

use crate::backoff::Backoff;
use crate::context::{CancelReason, Canceller, Ctx};
use crate::pool::{PoolError, WorkerPool};
use crate::sync::WaitGroup;

/// Group errors. Task failures are NOT here — they come out of
/// [`TaskGroup::wait`] as an [`ErrorSet`]; this covers launch rejection.
#[derive(Error, Debug)]
pub enum GroupError {
    /// The caller's context was cancelled or timed out before launch.
    #[error(transparent)]
    Cancelled(#[from] CancelReason),

    /// The attached pool refused the submission.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for group launches.
pub type GroupResult<T> = Result<T, GroupError>;

/// Per-launch options.
#[derive(Default)]
pub struct GoOptions {
    /// Index attached to this launch's error, if it fails.
    pub index: Option<usize>,

    /// Backoff for this launch, overriding the group-wide one.
    pub backoff: Option<Backoff>,
}

struct GroupInner {
    errors: Mutex<Vec<IndexedError>>,
    wg: WaitGroup,
    live: AtomicI64,
    launched: AtomicU64,
    pool: Option<WorkerPool>,
    backoff: Option<Backoff>,
    canceller: Mutex<Option<Canceller>>,
    cancel_on_err: bool,
}

impl GroupInner {
    fn record_error(&self, index: Option<usize>, error: anyhow::Error) {
        self.errors.lock().push(IndexedError { index, error });
        if self.cancel_on_err {
            if let Some(canceller) = self.canceller.lock().as_ref() {
                canceller.cancel();
            }
        }
    }
}

/// Builder for [`TaskGroup`].
#[derive(Default)]
pub struct GroupBuilder {
    pool: Option<WorkerPool>,
    backoff: Option<Backoff>,
    canceller: Option<Canceller>,
}

impl GroupBuilder {
    /// Start an empty builder: no pool (direct spawn), no backoff, no
    /// cancel-on-error.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch tasks into `pool` instead of spawning directly.
    pub fn pool(mut self, pool: WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Wrap every launch in a retry through `backoff`.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Fire `canceller` on the first launch error, so sibling tasks
    /// observing the derived context exit promptly. The canceller is
    /// consumed by the next [`TaskGroup::wait`].
    pub fn cancel_on_err(mut self, canceller: Canceller) -> Self {
        self.canceller = Some(canceller);
        self
    }

    /// Build the group.
    pub fn build(self) -> TaskGroup {
        TaskGroup {
            inner: Arc::new(GroupInner {
                errors: Mutex::new(Vec::new()),
                wg: WaitGroup::new(),
                live: AtomicI64::new(0),
                launched: AtomicU64::new(0),
                pool: self.pool,
                backoff: self.backoff,
                cancel_on_err: self.canceller.is_some(),
                canceller: Mutex::new(self.canceller),
            }),
        }
    }
}

/// A reusable fan-out/join point.
///
/// Launch with [`go`](TaskGroup::go), then [`wait`](TaskGroup::wait) for the
/// aggregated outcome. Do not interleave launches with a concurrent wait;
/// the group is single-use between waits.
#[derive(Clone)]
pub struct TaskGroup {
    inner: Arc<GroupInner>,
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("live", &self.running())
            .field("launched", &self.launched())
            .field("pooled", &self.inner.pool.is_some())
            .finish()
    }
}

impl TaskGroup {
    /// Start building a group.
    pub fn builder() -> GroupBuilder {
        GroupBuilder::new()
    }

    /// Launch a task with default options.
    pub async fn go<F, Fut>(&self, ctx: &Ctx, f: F) -> GroupResult<()>
    where
        F: FnMut(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.go_with(ctx, GoOptions::default(), f).await
    }

    /// Launch a task.
    ///
    /// Rejects when `ctx` is already cancelled. The context is re-checked
    /// right before the task body runs; a cancellation in between is
    /// recorded as this launch's error without invoking the task. A task
    /// returning an error is appended to the error set under its index and,
    /// when cancel-on-error is configured, fires the group canceller.
    pub async fn go_with<F, Fut>(&self, ctx: &Ctx, options: GoOptions, mut f: F) -> GroupResult<()>
    where
        F: FnMut(Ctx) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }

        let inner = self.inner.clone();
        inner.wg.add(1);
        inner.live.fetch_add(1, Ordering::AcqRel);
        inner.launched.fetch_add(1, Ordering::Relaxed);

        let backoff = options.backoff.or_else(|| inner.backoff.clone());
        let index = options.index;
        let task_ctx = ctx.clone();
        let task_inner = inner.clone();

        let task = async move {
            let outcome = if let Some(reason) = task_ctx.error() {
                Err(anyhow::Error::new(reason))
            } else {
                match backoff {
                    Some(backoff) => backoff.retry(&task_ctx, move |c, _attempt| f(c)).await,
                    None => f(task_ctx.clone()).await,
                }
            };
            if let Err(error) = outcome {
                task_inner.record_error(index, error);
            }
            task_inner.live.fetch_sub(1, Ordering::AcqRel);
            task_inner.wg.done();
        };

        match &self.inner.pool {
            Some(pool) => {
                if let Err(err) = pool.submit(ctx, task).await {
                    // the task never ran; roll the registration back
                    self.inner.live.fetch_sub(1, Ordering::AcqRel);
                    self.inner.wg.done();
                    return Err(err.into());
                }
            }
            None => {
                tokio::spawn(task);
            }
        }
        Ok(())
    }

    /// Wait for every launch to complete and drain the aggregated errors.
    ///
    /// The context is observed for the bracketing trace events only; it
    /// never aborts the wait. Afterwards the canceller (if any) has fired
    /// and been cleared and all per-launch state is reset, so the group can
    /// be reused.
    pub async fn wait(&self, ctx: &Ctx) -> Result<(), ErrorSet> {
        let started = Instant::now();
        tracing::trace!(
            live = self.running(),
            ctx_cancelled = ctx.is_cancelled(),
            "group wait begin"
        );

        self.inner.wg.wait().await;

        if let Some(canceller) = self.inner.canceller.lock().take() {
            canceller.cancel();
        }
        let entries = std::mem::take(&mut *self.inner.errors.lock());
        self.inner.launched.store(0, Ordering::Relaxed);

        tracing::trace!(
            waited_us = started.elapsed().as_micros() as u64,
            failures = entries.len(),
            "group wait end"
        );

        if entries.is_empty() {
            Ok(())
        } else {
            Err(ErrorSet::from_entries(entries))
        }
    }

    /// Live launch count. Informational.
    pub fn running(&self) -> i64 {
        self.inner.live.load(Ordering::Acquire)
    }

    /// Launches since construction or the last wait. Informational.
    pub fn launched(&self) -> u64 {
        self.inner.launched.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_direct_spawn_and_join() {
        let group = TaskGroup::builder().build();
        let ran = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let ran = ran.clone();
            group
                .go(&Ctx::background(), move |_c| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }

        group.wait(&Ctx::background()).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 10);
        assert_eq!(group.running(), 0);
    }

    #[tokio::test]
    async fn test_errors_carry_indices() {
        let group = TaskGroup::builder().build();

        for i in 0..5usize {
            group
                .go_with(
                    &Ctx::background(),
                    GoOptions {
                        index: Some(i),
                        backoff: None,
                    },
                    move |_c| async move {
                        if i % 2 == 1 {
                            Err(anyhow!("task {} failed", i))
                        } else {
                            Ok(())
                        }
                    },
                )
                .await
                .unwrap();
        }

        let errors = group.wait(&Ctx::background()).await.unwrap_err();
        assert_eq!(errors.indices(), vec![1, 3]);
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_on_err_stops_siblings() {
        let (ctx, canceller) = Ctx::background().with_cancel();
        let group = TaskGroup::builder().cancel_on_err(canceller).build();

        // four tasks block on the derived ctx; task 3 fails immediately
        for i in 0..5usize {
            group
                .go_with(
                    &ctx,
                    GoOptions {
                        index: Some(i),
                        backoff: None,
                    },
                    move |c| async move {
                        if i == 3 {
                            Err(anyhow!("boom"))
                        } else {
                            c.cancelled().await;
                            Ok(())
                        }
                    },
                )
                .await
                .unwrap();
        }

        let errors = tokio::time::timeout(
            Duration::from_secs(2),
            group.wait(&Ctx::background()),
        )
        .await
        .unwrap()
        .unwrap_err();

        assert_eq!(errors.indices(), vec![3]);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_launch_on_cancelled_ctx() {
        let (ctx, canceller) = Ctx::background().with_cancel();
        canceller.cancel();

        let group = TaskGroup::builder().build();
        let err = group
            .go(&ctx, |_c| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GroupError::Cancelled(_)));
        assert_eq!(group.running(), 0);
    }

    #[tokio::test]
    async fn test_group_reusable_after_wait() {
        let group = TaskGroup::builder().build();

        group
            .go(&Ctx::background(), |_c| async { Err(anyhow!("first")) })
            .await
            .unwrap();
        assert!(group.wait(&Ctx::background()).await.is_err());

        // state fully reset: a clean round reports no stale errors
        group
            .go(&Ctx::background(), |_c| async { Ok(()) })
            .await
            .unwrap();
        group.wait(&Ctx::background()).await.unwrap();
        assert_eq!(group.launched(), 0);
    }

    #[tokio::test]
    async fn test_backoff_retries_launch() {
        let group = TaskGroup::builder()
            .backoff(Backoff::fast().testing().with_max_attempts(5))
            .build();

        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        group
            .go(&Ctx::background(), move |_c| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(anyhow!("flaky"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        group.wait(&Ctx::background()).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pooled_group_runs_on_pool() {
        let pool = WorkerPool::new(
            &Ctx::background(),
            crate::pool::PoolConfig {
                name: "grouped".to_string(),
                static_size: 2,
                ..crate::pool::PoolConfig::default()
            },
        )
        .unwrap();

        let group = pool.group();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let ran = ran.clone();
            group
                .go(&Ctx::background(), move |_c| {
                    let ran = ran.clone();
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                })
                .await
                .unwrap();
        }
        group.wait(&Ctx::background()).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 20);
    }
}
