//! Bounded, access-ordered session cache (spec.md §4.4).
//!
//! Eviction is driven purely by `last_accessed_at`, not insertion order:
//! `get` counts as a touch, `set` on an existing key preserves `created_at`.

use std::collections::HashMap;
use std::hash::Hash;

use chrono::DateTime;
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct Entry<V> {
    pub data: V,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub max_sessions: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Callback invoked once per evicted key, in the same task that triggered
/// the eviction (`set` or `set_max_sessions`).
pub type OnEvict<K, V> = Box<dyn FnMut(&K, &V) + Send>;

pub struct LruCache<K, V> {
    entries: HashMap<K, Entry<V>>,
    max_sessions: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    on_evict: Option<OnEvict<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(max_sessions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_sessions,
            hits: 0,
            misses: 0,
            evictions: 0,
            on_evict: None,
        }
    }

    pub fn with_on_evict(max_sessions: usize, on_evict: OnEvict<K, V>) -> Self {
        let mut cache = Self::new(max_sessions);
        cache.on_evict = Some(on_evict);
        cache
    }

    /// Insert or replace. `created_at` is preserved for an existing key;
    /// only `data` and `last_accessed_at` change. Triggers eviction if the
    /// new size exceeds `max_sessions`.
    pub fn set(&mut self, key: K, data: V) {
        let now = Utc::now();
        match self.entries.get_mut(&key) {
            Some(entry) => {
                entry.data = data;
                entry.last_accessed_at = now;
            }
            None => {
                self.entries.insert(
                    key,
                    Entry {
                        data,
                        created_at: now,
                        last_accessed_at: now,
                    },
                );
            }
        }
        self.evict_if_needed(1);
    }

    /// Fetch and mark as most-recently-used. Updates hit/miss counters.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let now = Utc::now();
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = now;
                self.hits += 1;
                Some(&entry.data)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Update `last_accessed_at` without returning the value or counting
    /// toward hit/miss stats.
    pub fn touch(&mut self, key: &K) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn has(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn delete(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.data)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|e| &e.data)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&K, &Entry<V>)> {
        self.entries.iter()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.entries.len(),
            max_sessions: self.max_sessions,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    /// Changing the bound immediately triggers eviction if the cache is
    /// now over capacity.
    pub fn set_max_sessions(&mut self, max_sessions: usize) {
        self.max_sessions = max_sessions;
        self.evict_if_needed(0);
    }

    fn evict_if_needed(&mut self, min_evict: usize) {
        let over = self.entries.len().saturating_sub(self.max_sessions);
        let to_evict = over.max(if over > 0 { min_evict } else { 0 });
        if to_evict == 0 {
            return;
        }

        let mut by_age: Vec<K> = self.entries.keys().cloned().collect();
        by_age.sort_by_key(|k| self.entries[k].last_accessed_at);

        for key in by_age.into_iter().take(to_evict) {
            if let Some(entry) = self.entries.remove(&key) {
                self.evictions += 1;
                if let Some(cb) = self.on_evict.as_mut() {
                    cb(&key, &entry.data);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn set_then_get_updates_last_accessed_and_hits() {
        let mut cache: LruCache<&str, i32> = LruCache::new(10);
        cache.set("a", 1);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.get(&"missing"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn overwriting_preserves_created_at() {
        let mut cache: LruCache<&str, i32> = LruCache::new(10);
        cache.set("a", 1);
        let created = cache.entries().next().unwrap().1.created_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("a", 2);
        let entry = cache.entries().next().unwrap().1;
        assert_eq!(entry.created_at, created);
        assert_eq!(entry.data, 2);
    }

    #[test]
    fn exceeding_capacity_evicts_oldest_by_last_access() {
        let evicted = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let evicted_clone = evicted.clone();
        let mut cache: LruCache<&str, i32> =
            LruCache::with_on_evict(2, Box::new(move |k, _v| evicted_clone.lock().unwrap().push(*k)));

        cache.set("a", 1);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("b", 2);
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get(&"a");
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.set("c", 3);

        assert_eq!(cache.stats().size, 2);
        assert!(!cache.has(&"b"));
        assert!(cache.has(&"a"));
        assert!(cache.has(&"c"));
        assert_eq!(*evicted.lock().unwrap(), vec!["b"]);
    }

    #[test]
    fn shrinking_max_sessions_evicts_immediately() {
        let mut cache: LruCache<&str, i32> = LruCache::new(10);
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        cache.set_max_sessions(1);
        assert_eq!(cache.stats().size, 1);
        assert!(cache.has(&"c"));
    }
}
