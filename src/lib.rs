//! # PLINTH - Foundation Concurrency Runtime
//!
//! Process-wide execution, admission-control, and memory-lifecycle
//! primitives for server applications.
//!
//! ## Architecture
//!
//! - `context`: ambient context carrying cancellation, deadlines, and
//!   telemetry handles
//! - `telemetry`: meter/counter ports with no-op and in-process defaults
//! - `backoff`: exponential backoff policies and the retry engine
//! - `sync`: sharded map, typed object pool, write-rare guard, wait group
//! - `pool`: the worker pool (static + elastic runners) and its
//!   concurrency-limited view
//! - `group`: task groups with indexed error aggregation
//! - `pqueue`: priority queue over a limited pool
//! - `background`: supervisor for long-lived background tasks
//! - `cache`: weak-reference cache with TTL holds and deduplication
//! - `seq`: sequence fan-out helpers

#![warn(missing_docs)]
#![warn(clippy::all)]

// Ambient context and cancellation
pub mod context;

// Telemetry ports
pub mod telemetry;

// Retry engine
pub mod backoff;

// Synchronization primitives
pub mod sync;

// Worker pool and admission control
pub mod pool;

// Fan-out groups
pub mod group;

// Priority dispatch
pub mod pqueue;

// Background task supervision
pub mod background;

// Weak-reference caching
pub mod cache;

// Sequence helpers
pub mod seq;

// Re-export commonly used types
pub use backoff::{permanent, Backoff, Policy};
pub use background::{default_supervisor, set_default_supervisor, Supervisor};
pub use cache::WeakCache;
pub use context::{CancelReason, Canceller, Ctx};
pub use group::{ErrorSet, TaskGroup};
pub use pool::{
    default_pool, set_default_pool, LimitedPool, PoolConfig, PoolError, WorkerPool,
};
pub use pqueue::PriorityQueue;
pub use sync::{Guarded, ObjectPool, ShardedMap, WaitGroup};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
