//! Least-recently-used cache with capacity-driven eviction.

use std::collections::HashMap;
use std::hash::Hash;

struct Slot<V> {
    value: V,
    stamp: u64,
}

/// LRU cache. Not thread-safe; callers hold their own lock.
///
/// Recency is tracked with a monotonic stamp per entry; eviction removes the
/// minimum stamp. Capacities here are small (unload cache, open region
/// files), so the linear eviction scan is fine.
pub struct LruCache<K, V> {
    capacity: usize,
    slots: HashMap<K, Slot<V>>,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: HashMap::new(),
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Look up and promote to most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let stamp = self.tick();
        let slot = self.slots.get_mut(key)?;
        slot.stamp = stamp;
        Some(&slot.value)
    }

    /// Look up without promoting.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|slot| &slot.value)
    }

    /// Promote without reading.
    pub fn touch(&mut self, key: &K) {
        let stamp = self.tick();
        if let Some(slot) = self.slots.get_mut(key) {
            slot.stamp = stamp;
        }
    }

    /// Insert or update; returns the evicted entry if capacity was exceeded.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        let stamp = self.tick();
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.value = value;
            slot.stamp = stamp;
            return None;
        }
        let evicted = if self.slots.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };
        self.slots.insert(key, Slot { value, stamp });
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.slots.remove(key).map(|slot| slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    /// Change capacity; returns entries evicted to fit, oldest first.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<(K, V)> {
        self.capacity = capacity.max(1);
        let mut evicted = Vec::new();
        while self.slots.len() > self.capacity {
            if let Some(entry) = self.evict_oldest() {
                evicted.push(entry);
            } else {
                break;
            }
        }
        evicted
    }

    /// Key of the least recently used entry.
    pub fn least_recent_key(&self) -> Option<K> {
        self.slots
            .iter()
            .min_by_key(|(_, slot)| slot.stamp)
            .map(|(k, _)| k.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots.iter().map(|(k, slot)| (k, &slot.value))
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let key = self.least_recent_key()?;
        let slot = self.slots.remove(&key)?;
        Some((key, slot.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recent() {
        let mut cache = LruCache::new(2);
        assert!(cache.put("a", 1).is_none());
        assert!(cache.put("b", 2).is_none());
        cache.get(&"a");
        let evicted = cache.put("c", 3);
        assert_eq!(evicted, Some(("b", 2)));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn touch_protects_entry() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.touch(&"a");
        assert_eq!(cache.put("c", 3), Some(("b", 2)));
    }

    #[test]
    fn shrinking_capacity_evicts_oldest_first() {
        let mut cache = LruCache::new(3);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3);
        let evicted = cache.set_capacity(1);
        assert_eq!(evicted, vec![("a", 1), ("b", 2)]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert!(cache.put("a", 10).is_none());
        assert_eq!(cache.peek(&"a"), Some(&10));
    }
}
