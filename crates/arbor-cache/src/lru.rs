//! Size-bounded LRU (Least Recently Used) cache.
//!
//! Entries live in a slot arena and are threaded on a doubly-linked
//! recency list through slot indices, so every operation is O(1) and no
//! entry ever holds a pointer to another.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

use crate::stats::CacheStats;

/// One cache entry in the slot arena.
struct Slot<K, V> {
    key: K,
    value: V,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

/// An LRU cache bounded by the total size estimate of its entries.
///
/// An entry larger than the whole budget is still admitted; it evicts
/// everything else and is itself evicted by the next insertion.
pub struct SizedLruCache<K, V> {
    /// Maximum summed entry size.
    budget: usize,
    /// Current summed entry size.
    used: usize,
    /// Map from key to slot index.
    map: HashMap<K, usize>,
    /// Slot arena; `None` marks a free slot.
    slots: Vec<Option<Slot<K, V>>>,
    /// Free slot indices.
    free: Vec<usize>,
    /// Most recently used slot.
    head: Option<usize>,
    /// Least recently used slot.
    tail: Option<usize>,
    /// Statistics.
    stats: CacheStats,
}

impl<K: Hash + Eq + Clone, V> SizedLruCache<K, V> {
    /// Creates a new cache holding at most `budget` bytes of entries.
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            stats: CacheStats::default(),
        }
    }

    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the summed size of all entries.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns the size budget.
    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Gets a reference to the value for the given key, marking it recently used.
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get(key).copied() {
            Some(index) => {
                self.stats.hits += 1;
                self.move_to_front(index);
                self.slots[index].as_ref().map(|slot| &slot.value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Checks if the cache contains the given key without updating recency.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Inserts an entry with the given size estimate.
    ///
    /// Replaces and returns any previous value for the key, then evicts
    /// least recently used entries until the budget holds again.
    pub fn insert(&mut self, key: K, value: V, size: usize) -> Option<V> {
        let old = self.remove(&key);

        let slot = Slot {
            key: key.clone(),
            value,
            size,
            prev: None,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(slot);
                index
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.map.insert(key, index);
        self.used += size;
        self.push_front(index);

        while self.used > self.budget && self.tail != Some(index) {
            self.evict_lru();
        }
        old
    }

    /// Removes an entry from the cache.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.map.remove(key)?;
        self.unlink(index);
        let slot = self.slots[index].take()?;
        self.free.push(index);
        self.used -= slot.size;
        Some(slot.value)
    }

    /// Clears all entries from the cache.
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.used = 0;
    }

    /// Returns the counters collected so far.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    fn slot_mut(&mut self, index: usize) -> &mut Slot<K, V> {
        self.slots[index]
            .as_mut()
            .unwrap_or_else(|| unreachable!("linked slot {index} is vacant"))
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn push_front(&mut self, index: usize) {
        let old_head = self.head;
        {
            let slot = self.slot_mut(index);
            slot.prev = None;
            slot.next = old_head;
        }
        if let Some(head) = old_head {
            self.slot_mut(head).prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let slot = self.slot_mut(index);
            let links = (slot.prev, slot.next);
            slot.prev = None;
            slot.next = None;
            links
        };
        match prev {
            Some(prev) => self.slot_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.slot_mut(next).prev = prev,
            None => self.tail = prev,
        }
    }

    fn evict_lru(&mut self) {
        if let Some(tail) = self.tail {
            self.stats.evictions += 1;
            let key = self.slot_mut(tail).key.clone();
            self.remove(&key);
        }
    }
}

/// A thread-safe wrapper around [`SizedLruCache`] for cloneable values.
pub struct SyncSizedLruCache<K, V> {
    inner: Mutex<SizedLruCache<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> SyncSizedLruCache<K, V> {
    /// Creates a new synchronized cache.
    pub fn new(budget: usize) -> Self {
        Self {
            inner: Mutex::new(SizedLruCache::new(budget)),
        }
    }

    /// Gets a clone of a cached value.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().get(key).cloned()
    }

    /// Inserts a value into the cache.
    pub fn insert(&self, key: K, value: V, size: usize) -> Option<V> {
        self.inner.lock().insert(key, value, size)
    }

    /// Removes a value from the cache.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.lock().remove(key)
    }

    /// Returns the current number of entries.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns the counters collected so far.
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats()
    }

    /// Clears the cache.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut cache = SizedLruCache::new(100);
        cache.insert(1, "a", 10);
        cache.insert(2, "b", 10);

        assert_eq!(cache.get(&1), Some(&"a"));
        assert_eq!(cache.get(&2), Some(&"b"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.used(), 20);
    }

    #[test]
    fn test_eviction_by_size() {
        let mut cache = SizedLruCache::new(30);
        cache.insert(1, "a", 10);
        cache.insert(2, "b", 10);
        cache.insert(3, "c", 10);

        // Touch 1 so that 2 becomes least recently used
        cache.get(&1);
        cache.insert(4, "d", 10);

        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        let stats = cache.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!((stats.hits, stats.misses), (1, 0));
    }

    #[test]
    fn test_oversized_entry_admitted_alone() {
        let mut cache = SizedLruCache::new(10);
        cache.insert(1, "a", 5);
        cache.insert(2, "big", 50);
        assert_eq!(cache.len(), 1);
        assert!(cache.contains(&2));

        cache.insert(3, "c", 5);
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_replace_updates_size() {
        let mut cache = SizedLruCache::new(100);
        cache.insert(1, "a", 40);
        let old = cache.insert(1, "b", 10);
        assert_eq!(old, Some("a"));
        assert_eq!(cache.used(), 10);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let mut cache = SizedLruCache::new(100);
        cache.insert(1, "a", 10);
        cache.insert(2, "b", 10);
        assert_eq!(cache.remove(&1), Some("a"));
        assert_eq!(cache.remove(&1), None);
        cache.insert(3, "c", 10);
        assert_eq!(cache.slots.len(), 2);
        assert_eq!(cache.get(&3), Some(&"c"));
        assert_eq!(cache.get(&2), Some(&"b"));
    }

    #[test]
    fn test_sync_cache() {
        let cache = SyncSizedLruCache::new(100);
        cache.insert("k", 7u32, 4);
        assert_eq!(cache.get(&"k"), Some(7));
        assert_eq!(cache.remove(&"k"), Some(7));
        assert!(cache.is_empty());
    }
}
