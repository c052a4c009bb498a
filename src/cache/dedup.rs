//! Value deduplication index for the weak cache
//!
//! Folds equal values under different keys into shared storage. Equality is
//! defined by a caller-supplied total-order fingerprint projection of the
//! value; the index keeps weak references only, and reclaimed referents are
//! pruned rather than ordered.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Object-safe view of the index so the cache does not carry the
/// fingerprint type parameter.
pub(crate) trait DedupIndex<V>: Send + Sync {
    /// Return the canonical instance for `value`: an equivalent live value
    /// already indexed, or `value` itself after indexing it. The flag
    /// reports whether a substitution happened.
    fn intern(&self, value: Arc<V>) -> (Arc<V>, bool);

    /// Drop index entries whose referents have been reclaimed.
    fn prune(&self);

    /// Indexed entry count, dead entries included until the next prune.
    fn len(&self) -> usize;
}

/// `BTreeMap`-backed index keyed by the fingerprint projection.
pub(crate) struct FingerprintIndex<V, K, P>
where
    K: Ord,
    P: Fn(&V) -> K,
{
    tree: Mutex<BTreeMap<K, Weak<V>>>,
    project: P,
    _value: PhantomData<fn(&V)>,
}

impl<V, K, P> FingerprintIndex<V, K, P>
where
    K: Ord,
    P: Fn(&V) -> K,
{
    pub(crate) fn new(project: P) -> Self {
        Self {
            tree: Mutex::new(BTreeMap::new()),
            project,
            _value: PhantomData,
        }
    }
}

impl<V, K, P> DedupIndex<V> for FingerprintIndex<V, K, P>
where
    V: Send + Sync,
    K: Ord + Send,
    P: Fn(&V) -> K + Send + Sync,
{
    fn intern(&self, value: Arc<V>) -> (Arc<V>, bool) {
        let key = (self.project)(&value);
        let mut tree = self.tree.lock();
        if let Some(existing) = tree.get(&key).and_then(Weak::upgrade) {
            return (existing, true);
        }
        tree.insert(key, Arc::downgrade(&value));
        (value, false)
    }

    fn prune(&self) {
        self.tree.lock().retain(|_, weak| weak.strong_count() > 0);
    }

    fn len(&self) -> usize {
        self.tree.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_substitutes_equivalent_value() {
        let index = FingerprintIndex::new(|v: &String| v.clone());

        let first = Arc::new("shared".to_string());
        let (canonical, deduped) = index.intern(first.clone());
        assert!(!deduped);
        assert!(Arc::ptr_eq(&canonical, &first));

        let second = Arc::new("shared".to_string());
        let (canonical, deduped) = index.intern(second.clone());
        assert!(deduped);
        assert!(Arc::ptr_eq(&canonical, &first));
        assert!(!Arc::ptr_eq(&canonical, &second));

        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_distinct_fingerprints_coexist() {
        let index = FingerprintIndex::new(|v: &u64| *v);
        let (_, a) = index.intern(Arc::new(1));
        let (_, b) = index.intern(Arc::new(2));
        assert!(!a);
        assert!(!b);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_reclaimed_entry_reindexed_after_prune() {
        let index = FingerprintIndex::new(|v: &String| v.clone());

        let first = Arc::new("gone".to_string());
        index.intern(first.clone());
        drop(first);

        index.prune();
        assert_eq!(index.len(), 0);

        // a dead entry no longer substitutes
        let fresh = Arc::new("gone".to_string());
        let (canonical, deduped) = index.intern(fresh.clone());
        assert!(!deduped);
        assert!(Arc::ptr_eq(&canonical, &fresh));
    }

    #[test]
    fn test_intern_skips_dead_entry_without_prune() {
        let index = FingerprintIndex::new(|v: &String| v.clone());
        index.intern(Arc::new("x".to_string()));
        // the referent died immediately; intern must not hand it back
        let fresh = Arc::new("x".to_string());
        let (canonical, deduped) = index.intern(fresh.clone());
        assert!(!deduped);
        assert!(Arc::ptr_eq(&canonical, &fresh));
    }
}
