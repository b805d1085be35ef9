use std::hash::Hash;

use indexmap::IndexMap;

/// Size-bounded map with least-recently-used eviction. Insertion order is
/// recency order: index 0 is the coldest entry.
pub struct LruMap<K, V> {
    max: usize,
    entries: IndexMap<K, V>,
}

impl<K: Hash + Eq, V> LruMap<K, V> {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            entries: IndexMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        let idx = self.entries.get_index_of(key)?;
        let last = self.entries.len() - 1;
        self.entries.move_index(idx, last);
        self.entries.get(key)
    }

    /// Peek without promoting recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Vec<(K, V)> {
        if self.entries.contains_key(&key) {
            let _ = self.entries.shift_remove(&key);
        }
        self.entries.insert(key, value);
        self.evict_overflow()
    }

    fn evict_overflow(&mut self) -> Vec<(K, V)> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.max {
            match self.entries.shift_remove_index(0) {
                Some(kv) => evicted.push(kv),
                None => break,
            }
        }
        evicted
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.shift_remove(key)
    }

    pub fn pop_oldest(&mut self) -> Option<(K, V)> {
        self.entries.shift_remove_index(0)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every entry whose key matches, returning how many were dropped.
    pub fn remove_matching<F: FnMut(&K, &V) -> bool>(&mut self, mut pred: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, v| !pred(k, v));
        before - self.entries.len()
    }
}
