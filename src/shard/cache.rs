use std::{
    hash::Hash,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;

/// Least-recently-used map whose entries also expire `ttl` after they were inserted.
///
/// Holds at most `capacity` entries. Expired entries are dropped lazily on read.
pub struct TtlCache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock();
        let (value, inserted_at) = entries.get(key)?;
        if inserted_at.elapsed() < self.ttl {
            return Some(value.clone());
        }
        entries.pop(key);
        None
    }

    pub fn insert(&self, key: K, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        self.entries.lock().put(key, (value, Instant::now()));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().pop(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_expire() {
        let cache = TtlCache::new(Duration::from_millis(20), 16);
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_zero_ttl() {
        let cache = TtlCache::new(Duration::from_secs(60), 16);
        cache.insert(1, "x");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);

        let disabled = TtlCache::new(Duration::ZERO, 16);
        disabled.insert(1, "x");
        assert_eq!(disabled.len(), 0);
    }

    #[test]
    fn test_size_stays_at_capacity() {
        let cache = TtlCache::new(Duration::from_secs(60), 100);
        for i in 0..10_000 {
            cache.insert(i, i);
        }
        assert_eq!(cache.len(), 100);
        // Oldest entries are evicted first.
        assert_eq!(cache.get(&0), None);
        assert_eq!(cache.get(&9_999), Some(9_999));
    }

    #[test]
    fn test_recent_reads_survive_eviction() {
        let cache = TtlCache::new(Duration::from_secs(60), 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
    }

    #[test]
    fn test_zero_capacity_keeps_one_entry() {
        let cache = TtlCache::new(Duration::from_secs(60), 0);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert_eq!(cache.len(), 1);
    }
}
