use std::{
    borrow::Borrow,
    collections::{HashMap, VecDeque},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Bounded map evicting the oldest inserted entry once full.
///
/// Removal is lazy with respect to the insertion queue: stale keys are
/// skipped at eviction time and compacted away when the queue grows to twice
/// the capacity.
pub struct Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    capacity: usize,
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    pub fn new(capacity: usize) -> Self {
        Cache {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
            stats: Stats::new(),
        }
    }

    /// Returns a reference to the value of the given key if it exists in the cache.
    pub fn get<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let found = self.entries.get(key);
        if found.is_some() {
            self.stats.hit();
        } else {
            self.stats.miss();
        }
        found
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.contains_key(key)
    }

    /// Inserts or replaces an entry, evicting the oldest one when full.
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        self.evict();
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// (hits, misses) since creation.
    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }

        if self.order.len() > self.capacity * 2 {
            let entries = &self.entries;
            self.order.retain(|k| entries.contains_key(k));
        }
    }
}

/// Bounded map from key bytes to an index cell offset, with a reverse
/// mapping so a modified cell can drop whichever key pointed at it.
///
/// An offset of 0 records that the key is known to be absent; those entries
/// have no reverse mapping.
pub struct KeyPositions {
    capacity: usize,
    forward: HashMap<Vec<u8>, u64>,
    backward: HashMap<u64, Vec<u8>>,
}

impl KeyPositions {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.forward.get(key).copied()
    }

    pub fn set(&mut self, key: &[u8], position: u64) {
        self.remove(key);
        if self.forward.len() >= self.capacity {
            self.push_out();
        }
        if position != 0 {
            if let Some(previous) = self.backward.insert(position, key.to_vec()) {
                self.forward.remove(&previous);
            }
        }
        self.forward.insert(key.to_vec(), position);
    }

    pub fn remove(&mut self, key: &[u8]) {
        if let Some(position) = self.forward.remove(key) {
            if position != 0 {
                self.backward.remove(&position);
            }
        }
    }

    /// Forgets the key currently mapped to `position`, if any.
    pub fn remove_position(&mut self, position: u64) {
        if let Some(key) = self.backward.remove(&position) {
            self.forward.remove(&key);
        }
    }

    // arbitrary victim
    fn push_out(&mut self) {
        if let Some(key) = self.forward.keys().next().cloned() {
            self.remove(&key);
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_read() {
        let mut cache = Cache::new(2);

        cache.insert("apple", "red");
        cache.insert("banana", "yellow");

        assert_eq!(cache.get(&"apple"), Some(&"red"));
        assert_eq!(cache.get(&"banana"), Some(&"yellow"));
    }

    #[test]
    fn test_push_removes_oldest() {
        let mut cache = Cache::new(2);

        let fruits = vec![
            ("apple", "red"),
            ("banana", "yellow"),
            ("orange", "orange"),
            ("pear", "green"),
            ("peach", "pink"),
        ];

        for (fruit, color) in fruits {
            cache.insert(fruit, color);
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"apple").is_none());
        assert_eq!(cache.get(&"pear"), Some(&"green"));
        assert_eq!(cache.get(&"peach"), Some(&"pink"));
    }

    #[test]
    fn test_replace_keeps_size() {
        let mut cache = Cache::new(2);
        cache.insert(1, "a");
        cache.insert(1, "b");
        cache.insert(2, "c");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(&"b"));
    }

    #[test]
    fn test_remove_then_churn_stays_bounded() {
        let mut cache = Cache::new(4);
        for i in 0..1000 {
            cache.insert(i, i);
            cache.remove(&i);
        }
        assert_eq!(cache.len(), 0);
        assert!(cache.order.len() <= 8);
    }

    #[test]
    fn test_hit_ratio() {
        let cap = 10;
        let mut cache = Cache::new(cap);

        for i in 0..cap {
            cache.insert(i, i);
        }
        for i in 0..cap {
            assert_eq!(cache.get(&i), Some(&i));
        }
        assert!(cache.get(&(cap + 1)).is_none());

        assert_eq!(cache.stats(), (cap, 1));
    }

    #[test]
    fn test_key_positions_reverse_removal() {
        let mut positions = KeyPositions::new(8);
        positions.set(b"a", 100);
        positions.set(b"b", 0);

        assert_eq!(positions.get(b"a"), Some(100));
        assert_eq!(positions.get(b"b"), Some(0));

        positions.remove_position(100);
        assert_eq!(positions.get(b"a"), None);
        assert_eq!(positions.get(b"b"), Some(0));

        // A position taken over by another key drops the old owner.
        positions.set(b"c", 200);
        positions.set(b"d", 200);
        assert_eq!(positions.get(b"c"), None);
        assert_eq!(positions.get(b"d"), Some(200));
    }

    #[test]
    fn test_key_positions_bounded() {
        let mut positions = KeyPositions::new(3);
        for i in 1..=10u64 {
            positions.set(&i.to_le_bytes(), i * 24);
        }
        assert_eq!(positions.forward.len(), 3);
        assert!(positions.backward.len() <= 3);
        assert_eq!(positions.get(&10u64.to_le_bytes()), Some(240));
    }
}
