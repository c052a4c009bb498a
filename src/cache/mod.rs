//! Weak-reference cache with TTL holds and optional deduplication
//!
//! This module provides:
//! - A `K -> Arc<V>` cache whose entries live exactly as long as some
//!   strong reference does, over the sharded map
//! - A minimum-hold TTL so freshly written values survive until the janitor
//!   releases them, and an optional max-TTL hard delete
//! - Optional durable coupling through filler/setter/deleter closures, with
//!   per-key single-flight fills
//! - Optional value deduplication by a total-order fingerprint
//!
//! Entries whose referents were reclaimed are removed on the next lookup or
//! janitor pass; the removal always re-checks the stored weak reference
//! under the shard lock, so a key re-bound to a live value is never
//! evicted. Memory use is unbounded yet self-limiting: the cache itself
//! only pins values inside the TTL window.

pub mod dedup;

use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dedup::{DedupIndex, FingerprintIndex};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::context::{CancelReason, Ctx};
use crate::pool::{PoolError, WorkerPool};
use crate::sync::ShardedMap;
use crate::telemetry::{Counter, UpDownCounter};

/// Minimum janitor tick.
pub const MIN_JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// Cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The caller's context was cancelled or timed out.
    #[error(transparent)]
    Cancelled(#[from] CancelReason),

    /// A configuration field is unusable.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// A filler/setter/deleter rejected the operation; the cache is
    /// unchanged.
    #[error("durable store operation failed: {0}")]
    Store(anyhow::Error),

    /// The pool refused the janitor task.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

type Filler<K, V> =
    Arc<dyn Fn(Ctx, K) -> BoxFuture<'static, anyhow::Result<Option<Arc<V>>>> + Send + Sync>;
type Setter<K, V> =
    Arc<dyn Fn(Ctx, K, Arc<V>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type Deleter<K> = Arc<dyn Fn(Ctx, K) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct TtlHold<V> {
    value: Arc<V>,
    expires_at: Instant,
}

struct HardTtl<K> {
    deadlines: Mutex<HashMap<K, Instant>>,
    max_ttl: Duration,
}

struct TtlState<K, V> {
    holds: Mutex<HashMap<K, TtlHold<V>>>,
    ttl: Duration,
    interval: Duration,
    hard: Option<HardTtl<K>>,
}

struct CacheInner<K, V> {
    entries: ShardedMap<K, Weak<V>>,
    ttl: Option<TtlState<K, V>>,
    dedup: Option<Arc<dyn DedupIndex<V>>>,
    filler: Option<Filler<K, V>>,
    setter: Option<Setter<K, V>>,
    deleter: Option<Deleter<K>>,
    single_flight: Option<Mutex<HashMap<K, Arc<tokio::sync::Mutex<()>>>>>,
    janitor: CancellationToken,
    m_items: Arc<dyn UpDownCounter>,
    m_hits: Arc<dyn Counter>,
    m_misses: Arc<dyn Counter>,
    m_fills: Arc<dyn Counter>,
    m_dedups: Arc<dyn Counter>,
}

impl<K, V> CacheInner<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Index through the dedup tree, refresh the TTL hold, and store the
    /// weak reference. Returns the canonical value, the prior live value,
    /// and whether a live value was replaced.
    fn store_value(&self, key: K, value: Arc<V>) -> (Arc<V>, Option<Arc<V>>, bool) {
        let (value, deduped) = match &self.dedup {
            Some(index) => index.intern(value),
            None => (value, false),
        };
        if deduped {
            self.m_dedups.inc();
        }

        if let Some(ttl) = &self.ttl {
            ttl.holds.lock().insert(
                key.clone(),
                TtlHold {
                    value: value.clone(),
                    expires_at: Instant::now() + ttl.ttl,
                },
            );
            if let Some(hard) = &ttl.hard {
                // the hard deadline runs from the first write; refreshes do
                // not extend it
                hard.deadlines
                    .lock()
                    .entry(key.clone())
                    .or_insert_with(|| Instant::now() + hard.max_ttl);
            }
        }

        let prior = self.entries.insert(key, Arc::downgrade(&value));
        if prior.is_none() {
            self.m_items.inc();
        }
        let prior_value = prior.and_then(|weak| weak.upgrade());
        let replaced = prior_value.is_some();
        (value, prior_value, replaced)
    }

    /// One janitor pass: expire TTL holds, hard-delete past max-TTL,
    /// collect entries whose referents were reclaimed, prune the dedup
    /// index.
    fn sweep(&self) {
        let now = Instant::now();

        if let Some(ttl) = &self.ttl {
            // drop expired strong holds; the weak entries stay behind and
            // fall out on lookup or in the reclamation pass below
            ttl.holds.lock().retain(|_, hold| hold.expires_at > now);

            if let Some(hard) = &ttl.hard {
                let expired: Vec<K> = hard
                    .deadlines
                    .lock()
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in expired {
                    hard.deadlines.lock().remove(&key);
                    ttl.holds.lock().remove(&key);
                    if self.entries.remove(&key).is_some() {
                        self.m_items.dec();
                    }
                }
            }
        }

        let mut dead: Vec<(K, Weak<V>)> = Vec::new();
        self.entries.for_each(|key, weak| {
            if weak.strong_count() == 0 {
                dead.push((key.clone(), weak.clone()));
            }
        });
        for (key, weak) in dead {
            if self
                .entries
                .compare_and_delete(&key, &weak, |a, b| a.ptr_eq(b))
            {
                self.m_items.dec();
            }
        }

        if let Some(index) = &self.dedup {
            index.prune();
        }
    }
}

/// Builder for [`WeakCache`].
pub struct CacheBuilder<K, V> {
    name: String,
    ttl: Option<Duration>,
    max_ttl: Option<Duration>,
    interval: Duration,
    filler: Option<Filler<K, V>>,
    setter: Option<Setter<K, V>>,
    deleter: Option<Deleter<K>>,
    single_flight: bool,
    dedup: Option<Arc<dyn DedupIndex<V>>>,
}

impl<K, V> CacheBuilder<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Instance name for telemetry scopes.
    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Minimum hold: after a write the cache keeps a strong reference for
    /// `ttl`, so the value survives even with no external references.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Hard upper bound: the entry is deleted outright once `max_ttl` past
    /// its first write, regardless of strong references held elsewhere.
    pub fn max_ttl(mut self, max_ttl: Duration) -> Self {
        self.max_ttl = Some(max_ttl);
        self
    }

    /// Janitor tick. Validated to at least one second.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Durable read: invoked on a miss; its result is cached and returned.
    pub fn filler<F, Fut>(mut self, fill: F) -> Self
    where
        F: Fn(Ctx, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Arc<V>>>> + Send + 'static,
    {
        self.filler = Some(Arc::new(
            move |ctx, key| -> BoxFuture<'static, anyhow::Result<Option<Arc<V>>>> {
                Box::pin(fill(ctx, key))
            },
        ));
        self
    }

    /// Durable write: invoked by [`WeakCache::set`] before the cache
    /// changes; an error aborts the write.
    pub fn setter<F, Fut>(mut self, set: F) -> Self
    where
        F: Fn(Ctx, K, Arc<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.setter = Some(Arc::new(
            move |ctx, key, value| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(set(ctx, key, value))
            },
        ));
        self
    }

    /// Durable delete: invoked by [`WeakCache::del`] before the cache
    /// changes; an error aborts the delete.
    pub fn deleter<F, Fut>(mut self, delete: F) -> Self
    where
        F: Fn(Ctx, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.deleter = Some(Arc::new(
            move |ctx, key| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(delete(ctx, key))
            },
        ));
        self
    }

    /// Coalesce concurrent fillers: at most one in flight per key.
    pub fn single_flight(mut self) -> Self {
        self.single_flight = true;
        self
    }

    /// Deduplicate values by a total-order fingerprint: a write whose
    /// fingerprint matches a live indexed value stores that existing value
    /// instead, so equal values under different keys share storage.
    pub fn dedup_by<Fp, P>(mut self, project: P) -> Self
    where
        Fp: Ord + Send + 'static,
        P: Fn(&V) -> Fp + Send + Sync + 'static,
    {
        self.dedup = Some(Arc::new(FingerprintIndex::new(project)));
        self
    }

    /// Validate the configuration and build the cache, starting the
    /// janitor on `pool` when a TTL is configured.
    pub async fn build(self, ctx: &Ctx, pool: &WorkerPool) -> CacheResult<WeakCache<K, V>> {
        if let Some(ttl) = self.ttl {
            if ttl.is_zero() {
                return Err(CacheError::InvalidConfig("ttl must be positive".to_string()));
            }
            if self.interval < MIN_JANITOR_INTERVAL {
                return Err(CacheError::InvalidConfig(
                    "janitor interval must be at least 1s".to_string(),
                ));
            }
            if let Some(max_ttl) = self.max_ttl {
                if max_ttl < ttl {
                    return Err(CacheError::InvalidConfig(
                        "max_ttl must be at least ttl".to_string(),
                    ));
                }
            }
        } else if self.max_ttl.is_some() {
            return Err(CacheError::InvalidConfig(
                "max_ttl requires a ttl".to_string(),
            ));
        }

        let meter = ctx.meter(&format!("{}::{}", module_path!(), self.name));
        let janitor = CancellationToken::new();

        let inner = Arc::new(CacheInner {
            entries: ShardedMap::new(),
            ttl: self.ttl.map(|ttl| TtlState {
                holds: Mutex::new(HashMap::new()),
                ttl,
                interval: self.interval,
                hard: self.max_ttl.map(|max_ttl| HardTtl {
                    deadlines: Mutex::new(HashMap::new()),
                    max_ttl,
                }),
            }),
            dedup: self.dedup,
            filler: self.filler,
            setter: self.setter,
            deleter: self.deleter,
            single_flight: if self.single_flight {
                Some(Mutex::new(HashMap::new()))
            } else {
                None
            },
            janitor: janitor.clone(),
            m_items: meter.up_down_counter("cache.items"),
            m_hits: meter.counter("cache.hits"),
            m_misses: meter.counter("cache.misses"),
            m_fills: meter.counter("cache.fills"),
            m_dedups: meter.counter("cache.dedups"),
        });

        if let Some(ttl) = &inner.ttl {
            // the janitor holds the cache weakly so an abandoned cache
            // still gets collected; close() stops it explicitly
            let weak_inner = Arc::downgrade(&inner);
            let interval = ttl.interval;
            pool.submit(ctx, async move {
                let mut tick = tokio::time::interval(interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = janitor.cancelled() => break,
                        _ = tick.tick() => match weak_inner.upgrade() {
                            Some(inner) => inner.sweep(),
                            None => break,
                        },
                    }
                }
            })
            .await?;
        }

        Ok(WeakCache { inner })
    }
}

/// An in-memory `K -> Arc<V>` cache whose entries vanish when no strong
/// reference to the value remains.
pub struct WeakCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for WeakCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> std::fmt::Debug for WeakCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakCache")
            .field("entries", &self.inner.entries.len())
            .field("ttl", &self.inner.ttl.as_ref().map(|t| t.ttl))
            .finish()
    }
}

impl<K, V> WeakCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Start building a cache.
    pub fn builder() -> CacheBuilder<K, V> {
        CacheBuilder {
            name: "cache".to_string(),
            ttl: None,
            max_ttl: None,
            interval: MIN_JANITOR_INTERVAL,
            filler: None,
            setter: None,
            deleter: None,
            single_flight: false,
            dedup: None,
        }
    }

    fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let weak = self.inner.entries.get(key)?;
        match weak.upgrade() {
            Some(value) => Some(value),
            None => {
                // reclaimed: delete exactly the entry we saw, never a key
                // that was re-bound to a live value in the meantime
                if self
                    .inner
                    .entries
                    .compare_and_delete(key, &weak, |a, b| a.ptr_eq(b))
                {
                    self.inner.m_items.dec();
                }
                None
            }
        }
    }

    async fn fill(&self, ctx: &Ctx, key: &K, filler: &Filler<K, V>) -> CacheResult<Option<Arc<V>>> {
        let filled = filler(ctx.clone(), key.clone())
            .await
            .map_err(CacheError::Store)?;
        match filled {
            Some(value) => {
                self.inner.m_fills.inc();
                // the value just came from the durable store; cache it
                // without writing back through the setter
                let (canonical, _, _) = self.inner.store_value(key.clone(), value);
                Ok(Some(canonical))
            }
            None => Ok(None),
        }
    }

    /// Look up `key`, consulting the filler on a miss.
    ///
    /// A hit is a live entry; an entry whose referent was reclaimed counts
    /// as a miss and is removed on the way through.
    pub async fn get(&self, ctx: &Ctx, key: &K) -> CacheResult<Option<Arc<V>>> {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }

        if let Some(value) = self.lookup(key) {
            self.inner.m_hits.inc();
            return Ok(Some(value));
        }
        self.inner.m_misses.inc();

        let Some(filler) = self.inner.filler.clone() else {
            return Ok(None);
        };

        if let Some(flights) = &self.inner.single_flight {
            let gate = flights
                .lock()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            let _guard = gate.lock().await;

            // a concurrent filler may have landed the value while we waited
            if let Some(value) = self.lookup(key) {
                self.inner.m_hits.inc();
                return Ok(Some(value));
            }
            let result = self.fill(ctx, key, &filler).await;
            flights.lock().remove(key);
            result
        } else {
            self.fill(ctx, key, &filler).await
        }
    }

    /// Write `key -> value`.
    ///
    /// The setter (if any) runs first and an error aborts with no cache
    /// change. Returns the prior live value and whether one was replaced.
    /// With deduplication active the stored value may be an equivalent
    /// pre-existing instance rather than `value` itself.
    pub async fn set(
        &self,
        ctx: &Ctx,
        key: K,
        value: Arc<V>,
    ) -> CacheResult<(Option<Arc<V>>, bool)> {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }
        if let Some(setter) = &self.inner.setter {
            setter(ctx.clone(), key.clone(), value.clone())
                .await
                .map_err(CacheError::Store)?;
        }
        let (_, prior, replaced) = self.inner.store_value(key, value);
        Ok((prior, replaced))
    }

    /// Delete `key`, returning the prior live value if there was one.
    ///
    /// The deleter (if any) runs first and an error aborts with no cache
    /// change.
    pub async fn del(&self, ctx: &Ctx, key: &K) -> CacheResult<Option<Arc<V>>> {
        if let Some(reason) = ctx.error() {
            return Err(reason.into());
        }
        if let Some(deleter) = &self.inner.deleter {
            deleter(ctx.clone(), key.clone())
                .await
                .map_err(CacheError::Store)?;
        }

        if let Some(ttl) = &self.inner.ttl {
            ttl.holds.lock().remove(key);
            if let Some(hard) = &ttl.hard {
                hard.deadlines.lock().remove(key);
            }
        }

        let prior = self.inner.entries.remove(key);
        if prior.is_some() {
            self.inner.m_items.dec();
        }
        Ok(prior.and_then(|weak| weak.upgrade()))
    }

    /// Entry count, including reclaimed entries not yet swept.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Stop the janitor. Lookups and writes keep working; only the
    /// background expiry stops.
    pub fn close(&self) {
        self.inner.janitor.cancel();
    }
}
