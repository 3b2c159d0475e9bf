use indexmap::IndexMap;

/// Small fixed-capacity LRU keyed by a `u64`, used independently for idle
/// segments, writers, and readers.
///
/// Order is maintained front-to-back as least-to-most recently used; a hit
/// moves its entry to the back. `add` may evict the front (least recently
/// used) entry, which is returned to the caller so it can be released.
pub struct LCache<V> {
    capacity: usize,
    entries: IndexMap<u64, V>,
}

impl<V> LCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: IndexMap::with_capacity(capacity),
        }
    }

    /// Look up `key`, promoting it to most-recently-used on a hit.
    pub fn get(&mut self, key: u64) -> Option<&V> {
        if let Some(value) = self.entries.shift_remove(&key) {
            let (index, _) = self.entries.insert_full(key, value);
            self.entries.get_index(index).map(|(_, v)| v)
        } else {
            None
        }
    }

    /// Extract `key` without touching the rest of the order.
    pub fn remove(&mut self, key: u64) -> Option<V> {
        self.entries.shift_remove(&key)
    }

    /// Insert `key` -> `value` as the most-recently-used entry. If the cache
    /// was already at capacity, the least-recently-used entry is evicted and
    /// returned.
    pub fn add(&mut self, key: u64, value: V) -> Option<(u64, V)> {
        let victim = if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.entries.shift_remove_index(0)
        } else {
            None
        };
        self.entries.insert(key, value);
        victim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drain all entries, least-recently-used first.
    pub fn drain(&mut self) -> impl Iterator<Item = (u64, V)> + '_ {
        self.entries.drain(..)
    }
}
