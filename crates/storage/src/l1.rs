//! Process-wide L1 MRU cache of serialized nodes.
//!
//! Keyed by the node's active physical ID (`"N"+uuid`), so a published
//! update (which flips to a fresh physical ID) can never serve stale
//! bytes: the old key simply stops being looked up and ages out.

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Capacity of the process-wide instance.
pub const DEFAULT_L1_CAPACITY: usize = 4096;

struct CachedBytes {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

/// Bounded MRU cache of serialized nodes.
pub struct L1Cache {
    inner: Mutex<LruCache<String, CachedBytes>>,
}

impl L1Cache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        L1Cache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Insert bytes under a key, optionally expiring after `duration`.
    pub fn set(&self, key: &str, bytes: Vec<u8>, duration: Option<Duration>) {
        let expires_at = duration
            .filter(|d| !d.is_zero())
            .map(|d| Instant::now() + d);
        self.inner
            .lock()
            .put(key.to_string(), CachedBytes { bytes, expires_at });
    }

    /// Fetch bytes, refreshing recency. Expired entries are dropped.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let live = match inner.get(key) {
            Some(entry) => entry.expires_at.map(|t| Instant::now() < t).unwrap_or(true),
            None => return None,
        };
        if !live {
            inner.pop(key);
            return None;
        }
        inner.get(key).map(|e| e.bytes.clone())
    }

    /// Drop entries by key.
    pub fn delete(&self, keys: &[String]) {
        let mut inner = self.inner.lock();
        for key in keys {
            inner.pop(key);
        }
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of cached entries (including not-yet-collected expired
    /// ones).
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

static GLOBAL_L1: Lazy<L1Cache> = Lazy::new(|| L1Cache::new(DEFAULT_L1_CAPACITY));

/// The process-wide node cache instance.
pub fn global_l1_cache() -> &'static L1Cache {
    &GLOBAL_L1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let cache = L1Cache::new(8);
        cache.set("a", vec![1], None);
        assert_eq!(cache.get("a"), Some(vec![1]));
        cache.delete(&["a".to_string()]);
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_capacity_evicts_least_recently_used() {
        let cache = L1Cache::new(2);
        cache.set("a", vec![1], None);
        cache.set("b", vec![2], None);
        // Touch "a" so "b" is the eviction candidate.
        assert!(cache.get("a").is_some());
        cache.set("c", vec![3], None);
        assert_eq!(cache.get("b"), None);
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_expiry() {
        let cache = L1Cache::new(8);
        cache.set("a", vec![1], Some(Duration::from_millis(5)));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_global_instance_is_shared() {
        let key = format!("test-{}", uuid::Uuid::new_v4());
        global_l1_cache().set(&key, vec![9], None);
        assert_eq!(global_l1_cache().get(&key), Some(vec![9]));
        global_l1_cache().delete(&[key]);
    }
}
