//! Byte-accounted cache tiers.
//!
//! A [`ByteCache`] is one tier of a group: an [`LruCache`](lru::LruCache)
//! behind a mutex, with a byte counter covering `len(key) + len(value)` of
//! every resident entry plus hit/miss/eviction statistics. Groups keep two —
//! the authoritative main tier and the hot mirror tier — under one shared
//! byte budget.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::ByteView;

pub mod lru;

use self::lru::LruCache;

/// One byte-accounted cache tier.
///
/// All operations are thread safe. The inner LRU is constructed on first
/// insert so its eviction callback can capture the tier's counters; until
/// then the tier reports itself empty.
#[derive(Default)]
pub struct ByteCache {
    lru: Mutex<Option<LruCache>>,
    counters: Arc<TierCounters>,
}

/// Monotone counters shared with the eviction callback.
#[derive(Debug, Default)]
struct TierCounters {
    bytes: AtomicUsize,
    gets: AtomicU64,
    hits: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time statistics of a [`ByteCache`].
///
/// `gets`, `hits` and `evictions` are monotone; `bytes` and `items` reflect
/// the residency at the instant of the snapshot.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheStats {
    /// Bytes of all resident entries, keys included.
    pub bytes: usize,
    /// Number of resident entries.
    pub items: usize,
    /// Number of lookups.
    pub gets: u64,
    /// Number of lookups that found the key.
    pub hits: u64,
    /// Number of entries removed, for any reason.
    pub evictions: u64,
}

impl ByteCache {
    /// Create an empty tier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key` as the most-recently-used entry.
    pub fn add(&self, key: &str, value: ByteView) {
        let cost = key.len() + value.len();

        let mut guard = self.lru.lock().expect("not poisoned");
        let lru = guard.get_or_insert_with(|| {
            let counters = Arc::clone(&self.counters);
            let mut lru = LruCache::new();
            lru.set_on_evict(move |key, value| {
                counters
                    .bytes
                    .fetch_sub(key.len() + value.len(), Ordering::Relaxed);
                counters.evictions.fetch_add(1, Ordering::Relaxed);
            });
            lru
        });

        // An update goes through remove-then-insert, so the callback returns
        // the old cost before the new cost is charged below.
        lru.remove(key);
        lru.add(key, value);
        self.counters.bytes.fetch_add(cost, Ordering::Relaxed);
    }

    /// Look up `key`, promoting it on a hit.
    pub fn get(&self, key: &str) -> Option<ByteView> {
        let mut guard = self.lru.lock().expect("not poisoned");
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        let value = guard.as_mut()?.get(key)?;
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
        Some(value)
    }

    /// Evict the least-recently-used entry, returning it.
    pub fn remove_oldest(&self) -> Option<(Arc<str>, ByteView)> {
        self.lru.lock().expect("not poisoned").as_mut()?.remove_oldest()
    }

    /// Bytes of all resident entries, keys included.
    pub fn bytes(&self) -> usize {
        self.counters.bytes.load(Ordering::Relaxed)
    }

    /// Number of resident entries.
    pub fn items(&self) -> usize {
        self.lru
            .lock()
            .expect("not poisoned")
            .as_ref()
            .map_or(0, LruCache::len)
    }

    /// Snapshot the tier statistics.
    pub fn stats(&self) -> CacheStats {
        let guard = self.lru.lock().expect("not poisoned");
        CacheStats {
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            items: guard.as_ref().map_or(0, LruCache::len),
            gets: self.counters.gets.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ByteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteCache")
            .field("bytes", &self.bytes())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_cost(key: &str, value: &str) -> usize {
        key.len() + value.len()
    }

    #[test]
    fn test_byte_accounting() {
        let cache = ByteCache::new();
        assert_eq!(cache.bytes(), 0);
        assert_eq!(cache.items(), 0);

        cache.add("key", ByteView::from("value"));
        assert_eq!(cache.bytes(), entry_cost("key", "value"));
        assert_eq!(cache.items(), 1);

        cache.add("other", ByteView::from("second"));
        assert_eq!(
            cache.bytes(),
            entry_cost("key", "value") + entry_cost("other", "second")
        );
        assert_eq!(cache.items(), 2);
    }

    #[test]
    fn test_update_replaces_cost() {
        let cache = ByteCache::new();
        cache.add("key", ByteView::from("a longer initial value"));
        cache.add("key", ByteView::from("v"));

        assert_eq!(cache.bytes(), entry_cost("key", "v"));
        assert_eq!(cache.items(), 1);
        assert_eq!(cache.get("key"), Some(ByteView::from("v")));
    }

    #[test]
    fn test_eviction_returns_cost() {
        let cache = ByteCache::new();
        cache.add("a", ByteView::from("1111"));
        cache.add("b", ByteView::from("22"));

        let (key, value) = cache.remove_oldest().unwrap();
        assert_eq!(&*key, "a");
        assert_eq!(value, ByteView::from("1111"));
        assert_eq!(cache.bytes(), entry_cost("b", "22"));

        let stats = cache.stats();
        assert_eq!(stats.items, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_hit_miss_counters() {
        let cache = ByteCache::new();

        // lookups before the first insert still count
        assert_eq!(cache.get("key"), None);

        cache.add("key", ByteView::from("value"));
        assert_eq!(cache.get("key"), Some(ByteView::from("value")));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.gets, 3);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.evictions, 0);
    }

    #[test]
    fn test_remove_oldest_on_empty() {
        let cache = ByteCache::new();
        assert!(cache.remove_oldest().is_none());

        cache.add("key", ByteView::from("value"));
        assert!(cache.remove_oldest().is_some());
        assert!(cache.remove_oldest().is_none());
        assert_eq!(cache.bytes(), 0);
    }
}
