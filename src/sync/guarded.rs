//! Write-rare value guard with lock-free reads
//!
//! Readers take an atomic snapshot (`Arc<T>`) and must treat it as
//! immutable — the type enforces that. Writers serialise on a mutex and
//! publish whole replacement values; a reader never observes a torn value.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::sync::Arc;

/// A value read constantly and written rarely.
///
/// Reads are lock-free pointer loads. Writes replace the whole value:
/// either [`store`](Guarded::store) a prepared replacement or
/// [`update`](Guarded::update) through clone-mutate-publish.
pub struct Guarded<T> {
    current: ArcSwap<T>,
    writer: Mutex<()>,
}

impl<T> Guarded<T> {
    /// Create a guard holding `initial`.
    pub fn new(initial: T) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            writer: Mutex::new(()),
        }
    }

    /// Create a guard around an existing shared value.
    pub fn from_arc(initial: Arc<T>) -> Self {
        Self {
            current: ArcSwap::new(initial),
            writer: Mutex::new(()),
        }
    }

    /// Snapshot the current value. Lock-free.
    pub fn load(&self) -> Arc<T> {
        self.current.load_full()
    }

    /// Publish a replacement value, returning the one it displaced.
    ///
    /// # Panics
    ///
    /// Panics if `next` is the pointer already published: storing the value
    /// a reader may concurrently be looking at means the caller mutated
    /// shared state in place, which this type exists to prevent.
    pub fn store(&self, next: Arc<T>) -> Arc<T> {
        let _writer = self.writer.lock();
        let current = self.current.load_full();
        assert!(
            !Arc::ptr_eq(&current, &next),
            "Guarded::store called with the value that is already published"
        );
        self.current.store(next);
        current
    }

    /// Read-modify-write: clone the current value, apply `mutate` to the
    /// clone, publish the clone atomically. Returns the displaced value.
    pub fn update<F>(&self, mutate: F) -> Arc<T>
    where
        T: Clone,
        F: FnOnce(&mut T),
    {
        let _writer = self.writer.lock();
        let current = self.current.load_full();
        let mut next = T::clone(&current);
        mutate(&mut next);
        self.current.store(Arc::new(next));
        current
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Guarded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Guarded").field(&self.current.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Config {
        limit: usize,
        name: String,
    }

    fn initial() -> Config {
        Config {
            limit: 10,
            name: "a".to_string(),
        }
    }

    #[test]
    fn test_load_returns_published_value() {
        let guarded = Guarded::new(initial());
        assert_eq!(guarded.load().limit, 10);
    }

    #[test]
    fn test_store_swaps_and_returns_prior() {
        let guarded = Guarded::new(initial());
        let prior = guarded.store(Arc::new(Config {
            limit: 20,
            name: "b".to_string(),
        }));
        assert_eq!(prior.limit, 10);
        assert_eq!(guarded.load().limit, 20);
    }

    #[test]
    #[should_panic(expected = "already published")]
    fn test_same_pointer_store_panics() {
        let guarded = Guarded::new(initial());
        let snapshot = guarded.load();
        guarded.store(snapshot);
    }

    #[test]
    fn test_update_clones_then_publishes() {
        let guarded = Guarded::new(initial());
        let before = guarded.load();

        guarded.update(|c| c.limit = 99);

        // the reader's old snapshot is untouched
        assert_eq!(before.limit, 10);
        assert_eq!(guarded.load().limit, 99);
    }

    #[test]
    fn test_concurrent_readers_never_tear() {
        let guarded = Arc::new(Guarded::new(Config {
            limit: 10,
            name: "even".to_string(),
        }));
        let mut handles = Vec::new();

        for _ in 0..4 {
            let guarded = guarded.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let snapshot = guarded.load();
                    // limit and name always change together
                    assert_eq!(snapshot.limit % 2 == 0, snapshot.name == "even");
                }
            }));
        }

        for i in 0..500usize {
            let limit = 10 + i;
            guarded.store(Arc::new(Config {
                limit,
                name: if limit % 2 == 0 { "even" } else { "odd" }.to_string(),
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
