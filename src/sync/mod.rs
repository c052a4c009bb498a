//! Cooperative synchronization primitives
//!
//! This module provides:
//! - `sharded_map`: lock-striped concurrent map
//! - `object_pool`: typed object pool with a bounded hot buffer
//! - `guarded`: write-rare value guard with lock-free reads
//! - `wait_group`: outstanding-work counter with an async wait

pub mod guarded;
pub mod object_pool;
pub mod sharded_map;
pub mod wait_group;

pub use guarded::Guarded;
pub use object_pool::{ObjectPool, ObjectPoolBuilder, PooledGuard};
pub use sharded_map::ShardedMap;
pub use wait_group::WaitGroup;
