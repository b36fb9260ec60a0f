//! Size-bounded LFU memoization store.
//!
//! Two instances live per configured route: one for resolved canonical
//! procedure names and one for resolved argument signatures. Eviction is
//! frequency based, not recency based: a freshly inserted entry starts at
//! hit count zero and stays a pruning candidate until it earns hits.
//! Pruning happens synchronously inside `set`; there is no TTL and no
//! background sweeper.

use std::collections::HashMap;

use parking_lot::Mutex;

pub const DEFAULT_CACHE_SIZE: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
}

struct CacheEntry<T> {
    value: T,
    hit_count: u64,
}

struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    hits: u64,
    misses: u64,
}

/// Shared mutable across in-flight requests; every operation takes the
/// internal lock once, so a single call is internally consistent but a
/// get/set pair is not atomic. Two requests may both miss and both set
/// the same key; last write wins and only costs redundant work.
pub struct BindingCache<T> {
    inner: Mutex<CacheInner<T>>,
    max_size: usize,
}

impl<T: Clone> Default for BindingCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> BindingCache<T> {
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_CACHE_SIZE)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        BindingCache {
            inner: Mutex::new(CacheInner { entries: HashMap::new(), hits: 0, misses: 0 }),
            max_size: max_size.max(1),
        }
    }

    /// Fetch a value, counting a hit (and bumping the entry's hit count)
    /// or a miss.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.hit_count += 1;
                let value = entry.value.clone();
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert or overwrite. Overwriting resets the hit count to zero.
    /// If the insertion pushes the cache past its bound, the lowest
    /// hit-count tenth is pruned immediately.
    pub fn set(&self, key: impl Into<String>, value: T) {
        let mut inner = self.inner.lock();
        inner.entries.insert(key.into(), CacheEntry { value, hit_count: 0 });
        if inner.entries.len() > self.max_size {
            let victims = self.max_size.div_ceil(10);
            let mut ranked: Vec<(String, u64)> = inner
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.hit_count))
                .collect();
            ranked.sort_by_key(|(_, hits)| *hits);
            for (key, _) in ranked.into_iter().take(victims) {
                inner.entries.remove(&key);
            }
        }
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.entries.len(),
            max_size: self.max_size,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_counts_hits_and_misses() {
        let cache = BindingCache::new();
        cache.set("a", "one".to_string());
        assert_eq!(cache.get("a"), Some("one".to_string()));
        assert_eq!(cache.get("b"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn size_never_exceeds_bound() {
        let cache = BindingCache::with_max_size(20);
        for i in 0..200 {
            cache.set(format!("key{}", i), i);
            assert!(cache.size() <= 20);
        }
    }

    #[test]
    fn prune_removes_exactly_a_tenth_of_lowest_hit_entries() {
        let cache = BindingCache::with_max_size(20);
        for i in 0..20 {
            cache.set(format!("key{}", i), i);
            // distinct hit counts so the eviction order is unambiguous:
            // key0 gets 1 hit, key1 gets 2, ... key19 gets 20
            for _ in 0..=i {
                cache.get(&format!("key{}", i));
            }
        }
        assert_eq!(cache.size(), 20);
        // 21st insert overflows: ceil(20 * 0.1) = 2 evictions, and the
        // newcomer (hit count 0) plus key0 (1 hit) are the two coldest.
        cache.set("key20", 20);
        assert_eq!(cache.size(), 19);
        assert_eq!(cache.get("key20"), None);
        assert_eq!(cache.get("key0"), None);
        assert!(cache.get("key1").is_some());
        assert!(cache.get("key19").is_some());
    }

    #[test]
    fn freshly_inserted_entry_is_eviction_candidate() {
        let cache = BindingCache::with_max_size(10);
        for i in 0..10 {
            cache.set(format!("key{}", i), i);
            // every resident entry has at least one hit
            cache.get(&format!("key{}", i));
        }
        // The newcomer enters at hit count 0 and is pruned in its own set.
        cache.set("newcomer", 99);
        assert_eq!(cache.size(), 10);
        assert_eq!(cache.get("newcomer"), None);
    }

    #[test]
    fn overwrite_resets_hit_count() {
        let cache = BindingCache::with_max_size(100);
        cache.set("a", 1);
        cache.get("a");
        cache.get("a");
        cache.set("a", 2);
        assert_eq!(cache.get("a"), Some(2));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn delete_and_clear() {
        let cache = BindingCache::with_max_size(100);
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.size(), 1);
        cache.clear();
        assert_eq!(cache.size(), 0);
        let mut keys = cache.keys();
        keys.sort();
        assert!(keys.is_empty());
    }
}
