//! Typed object pool with a bounded hot buffer and an elastic free list
//!
//! This module provides:
//! - Factory-backed allocation with reuse accounting
//! - An optional lock-free bounded buffer for the hot objects
//! - An optional reset hook applied before a value is parked
//! - An RAII guard that returns its value on drop
//!
//! The guard is convenient at call sites that bail early, but an explicit
//! [`ObjectPool::put`] skips one pool-handle clone per acquisition and is
//! preferred on hot paths.

use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;

use crate::telemetry::{Counter, Meter, UpDownCounter};

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;
type ResetFn<T> = Box<dyn Fn(&mut T) + Send + Sync>;

/// Builder for [`ObjectPool`].
pub struct ObjectPoolBuilder<T> {
    factory: Factory<T>,
    buffer: usize,
    reset: Option<ResetFn<T>>,
    meter: Option<Arc<dyn Meter>>,
}

impl<T: Send + 'static> ObjectPoolBuilder<T> {
    /// Capacity of the bounded hot buffer. Zero (the default) disables the
    /// buffer and every parked value goes to the free list.
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity;
        self
    }

    /// Hook invoked on a value right before it is parked by
    /// [`ObjectPool::put`], typically to clear buffers for reuse.
    pub fn reset<F>(mut self, reset: F) -> Self
    where
        F: Fn(&mut T) + Send + Sync + 'static,
    {
        self.reset = Some(Box::new(reset));
        self
    }

    /// Meter for the pool's instruments; defaults to the process default
    /// provider under this module's scope.
    pub fn meter(mut self, meter: Arc<dyn Meter>) -> Self {
        self.meter = Some(meter);
        self
    }

    /// Build the pool.
    pub fn build(self) -> ObjectPool<T> {
        let meter = self.meter.unwrap_or_else(|| {
            crate::telemetry::default_meter_provider().meter(module_path!())
        });
        ObjectPool {
            buffer: if self.buffer > 0 {
                Some(ArrayQueue::new(self.buffer))
            } else {
                None
            },
            free: Mutex::new(Vec::new()),
            factory: self.factory,
            reset: self.reset,
            m_gets: meter.counter("pool.gets"),
            m_puts: meter.counter("pool.puts"),
            m_news: meter.counter("pool.news"),
            m_buffered: meter.up_down_counter("pool.buffered"),
        }
    }
}

/// A pool of reusable typed values.
///
/// [`get`](ObjectPool::get) drains the hot buffer first, then the free list,
/// then falls back to the factory; [`put`](ObjectPool::put) parks a value
/// for reuse, preferring the buffer.
pub struct ObjectPool<T> {
    buffer: Option<ArrayQueue<T>>,
    free: Mutex<Vec<T>>,
    factory: Factory<T>,
    reset: Option<ResetFn<T>>,
    m_gets: Arc<dyn Counter>,
    m_puts: Arc<dyn Counter>,
    m_news: Arc<dyn Counter>,
    m_buffered: Arc<dyn UpDownCounter>,
}

impl<T: Send + 'static> ObjectPool<T> {
    /// Start building a pool around `factory`.
    pub fn builder<F>(factory: F) -> ObjectPoolBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        ObjectPoolBuilder {
            factory: Box::new(factory),
            buffer: 0,
            reset: None,
            meter: None,
        }
    }

    /// Take a value out of the pool, allocating through the factory when
    /// nothing is parked.
    pub fn get(&self) -> T {
        self.m_gets.inc();
        if let Some(buffer) = &self.buffer {
            if let Some(value) = buffer.pop() {
                self.m_buffered.dec();
                return value;
            }
        }
        if let Some(value) = self.free.lock().pop() {
            return value;
        }
        self.m_news.inc();
        (self.factory)()
    }

    /// Park a value for reuse, applying the reset hook first.
    ///
    /// Safe at any point in the process lifecycle; the pool has no
    /// dependency on the runtime being up.
    pub fn put(&self, mut value: T) {
        if let Some(reset) = &self.reset {
            reset(&mut value);
        }
        self.m_puts.inc();
        if let Some(buffer) = &self.buffer {
            match buffer.push(value) {
                Ok(()) => {
                    self.m_buffered.inc();
                    return;
                }
                Err(overflow) => {
                    self.free.lock().push(overflow);
                    return;
                }
            }
        }
        self.free.lock().push(value);
    }

    /// Take a value wrapped in a guard that returns it on drop.
    ///
    /// Less direct than an explicit [`put`](ObjectPool::put): the guard
    /// carries a handle to the pool for the give-back.
    pub fn get_guard(self: &Arc<Self>) -> PooledGuard<T> {
        PooledGuard {
            value: Some(self.get()),
            pool: Arc::clone(self),
        }
    }

    /// Number of values parked in the hot buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// Number of values parked in the elastic free list.
    pub fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

impl<T> std::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("buffer_capacity", &self.buffer.as_ref().map(|b| b.capacity()))
            .field("buffered", &self.buffer.as_ref().map(|b| b.len()).unwrap_or(0))
            .field("free", &self.free.lock().len())
            .finish()
    }
}

/// RAII wrapper around a pooled value; returns it to the pool on drop.
pub struct PooledGuard<T: Send + 'static> {
    value: Option<T>,
    pool: Arc<ObjectPool<T>>,
}

impl<T: Send + 'static> PooledGuard<T> {
    /// Detach the value from the guard; it will NOT be returned to the pool.
    pub fn into_inner(mut self) -> T {
        self.value.take().expect("guard value already detached")
    }
}

impl<T: Send + 'static> std::ops::Deref for PooledGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("guard value already detached")
    }
}

impl<T: Send + 'static> std::ops::DerefMut for PooledGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("guard value already detached")
    }
}

impl<T: Send + 'static> Drop for PooledGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.put(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::AtomicMeter;

    #[test]
    fn test_factory_fallback_and_reuse() {
        let meter = Arc::new(AtomicMeter::new("test"));
        let pool = ObjectPool::builder(Vec::<u8>::new)
            .meter(meter.clone())
            .build();

        let mut v = pool.get();
        v.extend_from_slice(b"abc");
        pool.put(v);

        // free-list reuse: no second allocation
        let v = pool.get();
        assert_eq!(meter.counter_value("pool.news"), 1);
        assert_eq!(meter.counter_value("pool.gets"), 2);
        drop(v);
    }

    #[test]
    fn test_reset_applied_on_put() {
        let pool = ObjectPool::builder(Vec::<u8>::new)
            .reset(|v| v.clear())
            .build();

        let mut v = pool.get();
        v.extend_from_slice(b"dirty");
        pool.put(v);

        let v = pool.get();
        assert!(v.is_empty());
    }

    #[test]
    fn test_buffer_preferred_then_overflow() {
        let meter = Arc::new(AtomicMeter::new("test"));
        let pool = ObjectPool::builder(|| 0u64)
            .buffer(2)
            .meter(meter.clone())
            .build();

        pool.put(1);
        pool.put(2);
        pool.put(3);

        assert_eq!(pool.buffered(), 2);
        assert_eq!(pool.free_len(), 1);
        assert_eq!(meter.up_down_value("pool.buffered"), 2);

        // buffer drains before the free list
        let _ = pool.get();
        let _ = pool.get();
        assert_eq!(pool.buffered(), 0);
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_guard_returns_value_on_drop() {
        let pool = Arc::new(ObjectPool::builder(Vec::<u8>::new).buffer(1).build());

        {
            let mut guard = pool.get_guard();
            guard.extend_from_slice(b"x");
            assert_eq!(&guard[..], b"x");
        }
        assert_eq!(pool.buffered(), 1);
    }

    #[test]
    fn test_guard_into_inner_detaches() {
        let pool = Arc::new(ObjectPool::builder(|| 7u32).build());
        let guard = pool.get_guard();
        let value = guard.into_inner();
        assert_eq!(value, 7);
        assert_eq!(pool.buffered(), 0);
        assert_eq!(pool.free_len(), 0);
    }
}
