//! Bounded memoization caches with a process-wide clear registry.
//!
//! Tokenizers and feature builders memoize per-chunk work that repeats
//! across rounds. Between repetitions the engine calls [`clear_caches`]
//! so one repetition cannot leak derived state into the next; caches
//! holding corpus-level state that is valid across repetitions can mark
//! themselves protected to survive the sweep.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

/// A cache the registry can sweep.
pub trait ClearableCache: Send + Sync {
    fn clear_cache(&self);

    /// Protected caches survive [`clear_caches`] but not
    /// [`clear_all_caches`].
    fn cache_protected(&self) -> bool;
}

fn registry() -> &'static Mutex<Vec<Weak<dyn ClearableCache>>> {
    static REGISTRY: OnceLock<Mutex<Vec<Weak<dyn ClearableCache>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(Vec::new()))
}

/// Register a cache for the process-wide sweep. Dropped caches fall out
/// of the registry on the next sweep.
pub fn register_cache(cache: Weak<dyn ClearableCache>) {
    registry().lock().unwrap().push(cache);
}

/// Clear every live unprotected cache.
pub fn clear_caches() {
    sweep(false);
}

/// Clear every live cache, protected ones included.
pub fn clear_all_caches() {
    sweep(true);
}

fn sweep(include_protected: bool) {
    let mut entries = registry().lock().unwrap();
    entries.retain(|weak| match weak.upgrade() {
        None => false,
        Some(cache) => {
            if include_protected || !cache.cache_protected() {
                cache.clear_cache();
            }
            true
        }
    });
}

/// Bounded insertion-order cache. Eviction is FIFO: once full, each
/// insert displaces the oldest entry.
pub struct BoundedCache<K, V> {
    capacity: usize,
    protected: AtomicBool,
    inner: Mutex<CacheInner<K, V>>,
}

struct CacheInner<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            protected: AtomicBool::new(false),
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Exempt this cache from the unprotected sweep.
    pub fn protect(&self) {
        self.protected.store(true, Ordering::SeqCst);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().unwrap().map.get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
            if inner.order.len() > self.capacity {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.map.remove(&oldest);
                }
            }
        }
    }

    /// Memoized lookup: compute and store on miss.
    pub fn get_or_insert_with(&self, key: &K, compute: impl FnOnce() -> V) -> V {
        if let Some(hit) = self.get(key) {
            return hit;
        }
        let value = compute();
        self.insert(key.clone(), value.clone());
        value
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> ClearableCache for BoundedCache<K, V>
where
    K: Eq + Hash + Clone + Send,
    V: Clone + Send,
{
    fn clear_cache(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
    }

    fn cache_protected(&self) -> bool {
        self.protected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_eviction_drops_oldest_entry() {
        let cache: BoundedCache<u32, u32> = BoundedCache::new(2);
        cache.insert(1, 10);
        cache.insert(2, 20);
        cache.insert(3, 30);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));
    }

    #[test]
    fn test_reinsert_does_not_grow_order_queue() {
        let cache: BoundedCache<u32, u32> = BoundedCache::new(2);
        cache.insert(1, 10);
        cache.insert(1, 11);
        cache.insert(2, 20);
        assert_eq!(cache.get(&1), Some(11));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_memoized_lookup_computes_once() {
        let cache: BoundedCache<String, usize> = BoundedCache::new(8);
        let mut calls = 0;
        let key = "chunk".to_string();
        cache.get_or_insert_with(&key, || {
            calls += 1;
            42
        });
        let value = cache.get_or_insert_with(&key, || unreachable!());
        assert_eq!(value, 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_sweep_spares_protected_caches() {
        let plain: Arc<BoundedCache<u32, u32>> = Arc::new(BoundedCache::new(4));
        let guarded: Arc<BoundedCache<u32, u32>> = Arc::new(BoundedCache::new(4));
        guarded.protect();
        plain.insert(1, 1);
        guarded.insert(1, 1);
        register_cache(Arc::downgrade(&plain) as Weak<dyn ClearableCache>);
        register_cache(Arc::downgrade(&guarded) as Weak<dyn ClearableCache>);

        clear_caches();
        assert!(plain.is_empty());
        assert_eq!(guarded.len(), 1);

        clear_all_caches();
        assert!(guarded.is_empty());
    }
}
