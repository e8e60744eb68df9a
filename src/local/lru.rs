//! Last-use ordered map backing a cache tier.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexSet;

use crate::ByteView;

/// Callback invoked with `(key, value)` for every entry that leaves the map.
pub type EvictFn = Box<dyn FnMut(&str, &ByteView) + Send>;

/// A single-owner key/value map ordered by last use.
///
/// `get` promotes the entry to most-recently-used, so the entry returned by
/// [`remove_oldest`](Self::remove_oldest) is always the one touched least
/// recently. An optional entry capacity evicts from the old end on insert.
///
/// The eviction callback fires once per removed entry on *every* removal path
/// — capacity eviction, [`remove`](Self::remove),
/// [`remove_oldest`](Self::remove_oldest) and [`clear`](Self::clear) — and
/// runs while the entry is still readable, so the callback can account for
/// its cost. It does not fire when `add` updates a key in place.
///
/// Not thread safe; [`ByteCache`](super::ByteCache) wraps it in a mutex.
#[derive(Default)]
pub struct LruCache {
    entries: HashMap<Arc<str>, ByteView>,
    order: LruOrder,
    /// Maximum number of resident entries, `0` meaning unlimited.
    max_entries: usize,
    on_evict: Option<EvictFn>,
}

impl LruCache {
    /// Create an empty, unbounded map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the number of resident entries, `0` meaning unlimited.
    pub fn set_max_entries(&mut self, max_entries: usize) {
        self.max_entries = max_entries;
    }

    /// Install the eviction callback.
    pub fn set_on_evict<F>(&mut self, on_evict: F)
    where
        F: FnMut(&str, &ByteView) + Send + 'static,
    {
        self.on_evict = Some(Box::new(on_evict));
    }

    /// Insert `value` under `key` as the most-recently-used entry.
    ///
    /// An existing key is updated in place (no callback). If the capacity is
    /// exceeded, the least-recently-used entries are evicted until the map
    /// fits.
    pub fn add(&mut self, key: &str, value: ByteView) {
        let existing = self.shared_key(key);
        match existing {
            Some(key) => {
                self.entries.insert(Arc::clone(&key), value);
                self.order.touch(&key);
            }
            None => {
                let key: Arc<str> = Arc::from(key);
                self.entries.insert(Arc::clone(&key), value);
                self.order.push_back(key);
            }
        }

        while self.max_entries != 0 && self.entries.len() > self.max_entries {
            if self.remove_oldest().is_none() {
                break;
            }
        }
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: &str) -> Option<ByteView> {
        let key = self.shared_key(key)?;
        self.order.touch(&key);
        self.entries.get(&*key).cloned()
    }

    /// Remove `key` if present, firing the eviction callback.
    pub fn remove(&mut self, key: &str) {
        self.remove_entry(key);
    }

    /// Evict the least-recently-used entry, returning it.
    pub fn remove_oldest(&mut self) -> Option<(Arc<str>, ByteView)> {
        let key = self.order.pop_front()?;
        let value = self
            .entries
            .get(&*key)
            .cloned()
            .expect("order and entries agree");
        if let Some(on_evict) = &mut self.on_evict {
            on_evict(&key, &value);
        }
        self.entries.remove(&*key);
        Some((key, value))
    }

    /// Drop every entry, firing the eviction callback for each.
    pub fn clear(&mut self) {
        if let Some(mut on_evict) = self.on_evict.take() {
            for (key, value) in &self.entries {
                on_evict(key, value);
            }
            self.on_evict = Some(on_evict);
        }
        self.entries.clear();
        self.order = LruOrder::default();
    }

    /// Number of resident entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no entries are resident.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_entry(&mut self, key: &str) -> Option<(Arc<str>, ByteView)> {
        let (key, value) = self
            .entries
            .get_key_value(key)
            .map(|(k, v)| (Arc::clone(k), v.clone()))?;
        // the callback observes the entry while it is still resident
        if let Some(on_evict) = &mut self.on_evict {
            on_evict(&key, &value);
        }
        self.entries.remove(&*key);
        self.order.remove(&key);
        Some((key, value))
    }

    /// The map's own `Arc` for `key`, shared with the order list.
    fn shared_key(&self, key: &str) -> Option<Arc<str>> {
        self.entries.get_key_value(key).map(|(k, _)| Arc::clone(k))
    }
}

impl std::fmt::Debug for LruCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.entries.len())
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

/// Use-order list over the keys of an [`LruCache`].
///
/// Index 0 is the least-recently-used key; new and touched keys go to the
/// back. Removing from the middle (a promotion) swaps in a tombstone instead
/// of shifting the tail, keeping it amortized `O(1)`; tombstones are skipped
/// by [`pop_front`](Self::pop_front) and compacted away once they outnumber
/// live keys.
#[derive(Default)]
struct LruOrder {
    set: IndexSet<OrderEntry>,
    /// Ever-increasing counter giving every tombstone a unique identity.
    tombstone_counter: u64,
    n_tombstones: usize,
}

#[derive(PartialEq, Eq, Hash)]
enum OrderEntry {
    Key(Arc<str>),
    Tombstone(u64),
}

impl LruOrder {
    fn push_back(&mut self, key: Arc<str>) {
        let is_new = self.set.insert(OrderEntry::Key(key));
        assert!(is_new, "key already ordered");
    }

    fn touch(&mut self, key: &Arc<str>) {
        if self.remove(key) {
            self.push_back(Arc::clone(key));
        }
    }

    /// Remove `key` preserving the relative order of the remaining keys.
    fn remove(&mut self, key: &Arc<str>) -> bool {
        match self.set.get_index_of(&OrderEntry::Key(Arc::clone(key))) {
            Some(idx) => {
                // push a tombstone to the back, then swap it into the hole
                self.set.insert(OrderEntry::Tombstone(self.tombstone_counter));
                self.tombstone_counter += 1;
                self.n_tombstones += 1;
                self.set.swap_remove_index(idx).expect("just got this index");

                // NOTE: `>` rather than `>=` so empty sets never compact
                if self.n_tombstones * 2 > self.set.len() {
                    self.set.retain(|entry| matches!(entry, OrderEntry::Key(_)));
                    self.n_tombstones = 0;
                }

                true
            }
            None => false,
        }
    }

    fn pop_front(&mut self) -> Option<Arc<str>> {
        loop {
            if self.set.is_empty() {
                return None;
            }

            match self.set.shift_remove_index(0).expect("set is non-empty") {
                OrderEntry::Key(key) => return Some(key),
                OrderEntry::Tombstone(_) => {
                    self.n_tombstones -= 1;
                    // keep scanning
                }
            }
        }
    }
}
