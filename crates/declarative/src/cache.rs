//! Least-frequently-used object cache
//!
//! The cache never decides on its own whether an entry may go: callers pass a
//! deletability predicate on insertion, and entries the predicate rejects are
//! kept even if that pushes the cache over capacity.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    hits: u64,
    seq: u64,
}

/// Bounded cache evicting the least-used deletable entries.
#[derive(Debug)]
pub struct LfuCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    next_seq: u64,
}

impl<K: Eq + Hash + Clone, V> LfuCache<K, V> {
    /// Create a cache holding at most `capacity` deletable entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up an entry, counting the access
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let slot = self.entries.get_mut(key)?;
        slot.hits += 1;
        Some(&slot.value)
    }

    /// Look up an entry mutably, counting the access
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = self.entries.get_mut(key)?;
        slot.hits += 1;
        Some(&mut slot.value)
    }

    /// Look up an entry without touching its counter
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Insert `value` and evict while over capacity.
    ///
    /// Only entries for which `deletable` returns true are candidates. The
    /// victim is the candidate with the fewest hits, oldest first on ties.
    /// The entry just inserted is never evicted. Returns the evicted keys.
    pub fn insert_with<F>(&mut self, key: K, value: V, deletable: F) -> Vec<K>
    where
        F: Fn(&V) -> bool,
    {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            key.clone(),
            Slot {
                value,
                hits: 0,
                seq,
            },
        );

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(k, slot)| **k != key && deletable(&slot.value))
                .min_by_key(|(_, slot)| (slot.hits, slot.seq))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else {
                break;
            };
            self.entries.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keep only the entries for which `keep` returns true
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        self.entries.retain(|k, slot| keep(k, &slot.value));
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(k, slot)| (k, &slot.value))
    }
}
