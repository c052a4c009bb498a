//! Lock-striped concurrent map
//!
//! This module provides:
//! - A fixed shard count sized from hardware parallelism
//! - Linearisable per-key operations behind per-shard reader/writer locks
//! - Compare-and-swap / compare-and-delete with a caller equality predicate
//! - Per-shard snapshot iteration (explicitly not linearisable across shards)
//!
//! No operation ever holds two shard locks at once.

use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};

use parking_lot::RwLock;

/// Shards per hardware thread; the total is rounded up to a power of two.
const SHARDS_PER_CPU: usize = 16;

fn default_shard_count() -> usize {
    (SHARDS_PER_CPU * num_cpus::get().max(1)).next_power_of_two()
}

struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

/// A concurrent `K -> V` store striped over independently locked shards.
///
/// Values are returned by clone; in practice `V` is a cheap handle
/// (`Arc`, `Weak`, small copyable state).
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
    mask: u64,
    hasher: RandomState,
}

impl<K, V> Default for ShardedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Create a map with the default shard count (16 per hardware thread,
    /// rounded up to a power of two). The count is fixed for the map's life.
    pub fn new() -> Self {
        Self::with_shards(default_shard_count())
    }

    /// Create a map with an explicit shard count, rounded up to a power of
    /// two with a minimum of one. Mostly useful for tests.
    pub fn with_shards(shards: usize) -> Self {
        let count = shards.max(1).next_power_of_two();
        let shards: Box<[Shard<K, V>]> = (0..count).map(|_| Shard::default()).collect();
        Self {
            mask: (count - 1) as u64,
            shards,
            hasher: RandomState::new(),
        }
    }

    /// The fixed number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_for(&self, key: &K) -> &Shard<K, V> {
        let hash = self.hasher.hash_one(key);
        // fold the high bits down so the mask sees the whole hash
        let mixed = hash ^ (hash >> 32);
        &self.shards[(mixed & self.mask) as usize]
    }

    /// Look up a key under the shard read lock.
    pub fn get(&self, key: &K) -> Option<V> {
        self.shard_for(key).map.read().get(key).cloned()
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard_for(key).map.read().contains_key(key)
    }

    /// Insert a value, returning the prior one if the key was bound.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).map.write().insert(key, value)
    }

    /// Remove a key, returning the prior value if it was bound.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard_for(key).map.write().remove(key)
    }

    /// Replace the value bound to `key` with `new` iff the bound value
    /// equals `current` under `eq`. Returns whether the swap happened.
    pub fn compare_and_swap<F>(&self, key: &K, current: &V, new: V, eq: F) -> bool
    where
        F: Fn(&V, &V) -> bool,
        K: Clone,
    {
        let mut map = self.shard_for(key).map.write();
        match map.get(key) {
            Some(bound) if eq(bound, current) => {
                map.insert(key.clone(), new);
                true
            }
            _ => false,
        }
    }

    /// Delete `key` iff the bound value equals `current` under `eq`.
    /// Returns whether the delete happened.
    pub fn compare_and_delete<F>(&self, key: &K, current: &V, eq: F) -> bool
    where
        F: Fn(&V, &V) -> bool,
    {
        let mut map = self.shard_for(key).map.write();
        match map.get(key) {
            Some(bound) if eq(bound, current) => {
                map.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.map.write().clear();
        }
    }

    /// Total entry count, summed shard by shard.
    ///
    /// Shards are locked one at a time, so the sum can be stale against
    /// concurrent writers.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    /// Whether every shard is empty (same staleness caveat as [`len`](Self::len)).
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.map.read().is_empty())
    }

    /// Visit every entry, shard by shard.
    ///
    /// Each shard is a consistent snapshot; the iteration as a whole is NOT
    /// linearisable — an entry moved by a concurrent writer can be seen
    /// twice or not at all.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V),
    {
        for shard in self.shards.iter() {
            let map = shard.map.read();
            for (key, value) in map.iter() {
                f(key, value);
            }
        }
    }

    /// Keep only the entries for which `f` returns true, shard by shard.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &mut V) -> bool,
    {
        for shard in self.shards.iter() {
            shard.map.write().retain(|k, v| f(k, v));
        }
    }

    /// Merge every shard into one `HashMap`.
    ///
    /// This is the documented O(N) double pass for callers that need a
    /// global snapshot; it inherits the cross-shard staleness of
    /// [`for_each`](Self::for_each).
    pub fn to_map(&self) -> HashMap<K, V>
    where
        K: Clone,
    {
        let mut out = HashMap::with_capacity(self.len());
        self.for_each(|k, v| {
            out.insert(k.clone(), v.clone());
        });
        out
    }
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("len", &self.len())
            .finish()
    }
}
