//! Concurrency-limited front to a worker pool
//!
//! An admission controller: at most N jobs admitted through a
//! [`LimitedPool`] execute simultaneously, while the underlying pool keeps
//! multiplexing unrelated work. There is nothing to close; this is a
//! lightweight view over the pool.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;

use crate::context::Ctx;
use crate::pool::{PoolError, PoolResult, WorkerPool, LIMITED_WAIT_WARN_AFTER};
use crate::sync::WaitGroup;

/// A capacity-N admission gate in front of a [`WorkerPool`].
#[derive(Clone)]
pub struct LimitedPool {
    pool: WorkerPool,
    slots: Arc<Semaphore>,
    capacity: usize,
    admitted: WaitGroup,
    warn_slow_acquire: bool,
}

impl std::fmt::Debug for LimitedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedPool")
            .field("pool", &self.pool.name())
            .field("capacity", &self.capacity)
            .field("available", &self.slots.available_permits())
            .finish()
    }
}

impl WorkerPool {
    /// A view of this pool that admits at most `capacity` concurrent jobs.
    pub fn limited(&self, capacity: usize) -> PoolResult<LimitedPool> {
        if capacity == 0 {
            return Err(PoolError::InvalidConfig(
                "limited capacity must be at least 1".to_string(),
            ));
        }
        Ok(LimitedPool {
            pool: self.clone(),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            admitted: WaitGroup::new(),
            warn_slow_acquire: !self.disable_limited_wait_warn(),
        })
    }
}

impl LimitedPool {
    /// Submit a job once an admission slot frees up.
    ///
    /// Blocks on the slot (bounded by `ctx`), then forwards to the
    /// underlying pool; the slot is held until the job finishes. A
    /// submission blocked longer than 30 s emits a single WARN — a liveness
    /// signal, not a timeout — unless the pool was configured with
    /// `disable_limited_wait_warn`.
    pub async fn submit<F>(&self, ctx: &Ctx, work: F) -> PoolResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }

        let started = Instant::now();
        let warn_after = tokio::time::sleep(LIMITED_WAIT_WARN_AFTER);
        tokio::pin!(warn_after);
        let mut warned = false;

        let permit = loop {
            tokio::select! {
                acquired = self.slots.clone().acquire_owned() => {
                    match acquired {
                        Ok(permit) => break permit,
                        Err(_) => return Err(PoolError::Closed),
                    }
                }
                reason = ctx.cancelled() => return Err(reason.into()),
                _ = &mut warn_after, if self.warn_slow_acquire && !warned => {
                    warned = true;
                    tracing::warn!(
                        pool = %self.pool.name(),
                        capacity = self.capacity,
                        blocked_s = started.elapsed().as_secs(),
                        "limited submission has been waiting for a slot"
                    );
                }
            }
        };

        self.admitted.add(1);
        let admitted = self.admitted.clone();
        let wrapped = async move {
            work.await;
            drop(permit);
            admitted.done();
        };

        match self.pool.submit(ctx, wrapped).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // the wrapper was dropped unrun; its permit went with it
                self.admitted.done();
                Err(err)
            }
        }
    }

    /// Wait until every admitted job has finished.
    pub async fn wait(&self) {
        self.admitted.wait().await;
    }

    /// The admission capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free admission slots right now. Informational.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
