//! Counter of outstanding work with an async wait
//!
//! Used by the worker pool (in-flight jobs), the limited pool (admitted
//! jobs), the task group (live launches), and the priority queue. The wakeup
//! rides a `tokio::sync::watch` channel: version-based, so a completion that
//! lands between the counter check and the wait never loses the wakeup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

struct WaitGroupInner {
    count: AtomicUsize,
    changed: watch::Sender<()>,
}

/// A cloneable counter of outstanding work items.
///
/// `add` before handing work out, `done` exactly once per item, `wait` until
/// the counter returns to zero. Reusable: the counter may grow again after a
/// wait completes.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<WaitGroupInner>,
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitGroup {
    /// Create a group with a zero counter.
    pub fn new() -> Self {
        let (changed, _) = watch::channel(());
        Self {
            inner: Arc::new(WaitGroupInner {
                count: AtomicUsize::new(0),
                changed,
            }),
        }
    }

    /// Register `n` outstanding items.
    pub fn add(&self, n: usize) {
        self.inner.count.fetch_add(n, Ordering::AcqRel);
    }

    /// Mark one item complete.
    ///
    /// # Panics
    ///
    /// Panics if called more times than [`add`](Self::add) registered; that
    /// is a bookkeeping bug in the caller.
    pub fn done(&self) {
        let previous = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "wait group counter went negative");
        if previous == 1 {
            // send_replace never fails, even with no receivers
            self.inner.changed.send_replace(());
        }
    }

    /// Outstanding item count. Relaxed read, informational only.
    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Wait until the counter reaches zero.
    pub async fn wait(&self) {
        let mut rx = self.inner.changed.subscribe();
        loop {
            if self.inner.count.load(Ordering::Acquire) == 0 {
                return;
            }
            // the sender lives in self, so changed() cannot error here
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("count", &self.count())
            .finish()
    }
}
