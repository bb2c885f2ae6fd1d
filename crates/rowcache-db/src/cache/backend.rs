//! Cache storage backends.
//!
//! - [`CacheBackend`] - The storage interface the cache wrapper consumes
//! - [`InMemoryCache`] - Thread-safe in-memory cache with TTL support
//! - [`DummyCache`] - Stores nothing; every read misses
//!
//! ```
//! use rowcache_db::cache::{CacheBackend, CacheValue, InMemoryCache};
//!
//! let cache = InMemoryCache::new();
//! cache.set("k", CacheValue::Count(3), None).unwrap();
//! assert_eq!(cache.get("k").unwrap(), Some(CacheValue::Count(3)));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use rowcache_core::OrmResult;
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A value stored by the cache wrapper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    /// A row payload: field name to tagged value.
    Row(serde_json::Value),
    /// The row is known not to exist.
    Missing,
    /// An ordered list of primary keys for an index bucket.
    Ids {
        /// Primary-key tuples, in list order.
        ids: Vec<Vec<Value>>,
        /// `false` when the list was cut at the cache's bound.
        complete: bool,
    },
    /// A row count.
    Count(i64),
}

/// Storage for cache entries.
///
/// Every call is synchronous. Errors are returned to the caller of the
/// cache operation.
pub trait CacheBackend: Send + Sync {
    /// Returns the live value under `key`.
    fn get(&self, key: &str) -> OrmResult<Option<CacheValue>>;

    /// Returns the live values for `keys`; absent keys are omitted.
    fn get_multi(&self, keys: &[String]) -> OrmResult<HashMap<String, CacheValue>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(v) = self.get(key)? {
                out.insert(key.clone(), v);
            }
        }
        Ok(out)
    }

    /// Stores `value`, expiring after `ttl` when given.
    fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> OrmResult<()>;

    /// Stores every entry of `values`.
    fn set_multi(&self, values: HashMap<String, CacheValue>, ttl: Option<Duration>) -> OrmResult<()> {
        for (key, value) in values {
            self.set(&key, value, ttl)?;
        }
        Ok(())
    }

    /// Removes `key`. Returns `true` if it was present.
    fn delete(&self, key: &str) -> OrmResult<bool>;

    /// Removes every key in `keys`.
    fn delete_multi(&self, keys: &[String]) -> OrmResult<()> {
        for key in keys {
            self.delete(key)?;
        }
        Ok(())
    }

    /// Removes every entry.
    fn clear(&self) -> OrmResult<()>;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

/// Hit and miss counters of an [`InMemoryCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Reads that found a live entry.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
    /// Entries written.
    pub sets: u64,
    /// Entries removed.
    pub deletes: u64,
}

/// A thread-safe in-memory cache backend with TTL support.
///
/// Expired entries are invisible to reads and dropped on the next write to
/// the same key.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    store: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryCache {
    /// Creates a new empty in-memory cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.store.read().values().filter(|e| !e.is_expired()).count()
    }

    /// Whether there are no live entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` holds a live entry. Does not count as a read.
    pub fn contains(&self, key: &str) -> bool {
        self.store.read().get(key).is_some_and(|e| !e.is_expired())
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .read()
            .iter()
            .filter(|(_, e)| !e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Counters since creation or the last [`reset_stats`](Self::reset_stats).
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters.
    pub fn reset_stats(&self) {
        for counter in [&self.hits, &self.misses, &self.sets, &self.deletes] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn record(&self, found: bool) {
        let counter = if found { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl CacheBackend for InMemoryCache {
    fn get(&self, key: &str) -> OrmResult<Option<CacheValue>> {
        let found = self
            .store
            .read()
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value.clone());
        self.record(found.is_some());
        Ok(found)
    }

    fn get_multi(&self, keys: &[String]) -> OrmResult<HashMap<String, CacheValue>> {
        let store = self.store.read();
        let mut result = HashMap::with_capacity(keys.len());
        for key in keys {
            match store.get(key) {
                Some(entry) if !entry.is_expired() => {
                    self.record(true);
                    result.insert(key.clone(), entry.value.clone());
                }
                _ => self.record(false),
            }
        }
        Ok(result)
    }

    fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> OrmResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.store
            .write()
            .insert(key.to_string(), CacheEntry { value, expires_at });
        self.sets.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn set_multi(&self, values: HashMap<String, CacheValue>, ttl: Option<Duration>) -> OrmResult<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        let mut store = self.store.write();
        self.sets.fetch_add(values.len() as u64, Ordering::Relaxed);
        for (key, value) in values {
            store.insert(key, CacheEntry { value, expires_at });
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> OrmResult<bool> {
        let removed = self.store.write().remove(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(removed.is_some_and(|e| !e.is_expired()))
    }

    fn delete_multi(&self, keys: &[String]) -> OrmResult<()> {
        let mut store = self.store.write();
        self.deletes.fetch_add(keys.len() as u64, Ordering::Relaxed);
        for key in keys {
            store.remove(key);
        }
        Ok(())
    }

    fn clear(&self) -> OrmResult<()> {
        self.store.write().clear();
        Ok(())
    }
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyCache;

impl CacheBackend for DummyCache {
    fn get(&self, _key: &str) -> OrmResult<Option<CacheValue>> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: CacheValue, _ttl: Option<Duration>) -> OrmResult<()> {
        Ok(())
    }

    fn delete(&self, _key: &str) -> OrmResult<bool> {
        Ok(false)
    }

    fn clear(&self) -> OrmResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[i64]) -> CacheValue {
        CacheValue::Ids {
            ids: v.iter().map(|i| vec![Value::Int(*i)]).collect(),
            complete: true,
        }
    }

    #[test]
    fn test_inmemory_get_set() {
        let cache = InMemoryCache::new();
        cache.set("key", CacheValue::Count(5), None).unwrap();
        assert_eq!(cache.get("key").unwrap(), Some(CacheValue::Count(5)));
        assert_eq!(cache.get("other").unwrap(), None);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_inmemory_ttl_expiry() {
        let cache = InMemoryCache::new();
        cache
            .set("k", CacheValue::Missing, Some(Duration::from_millis(10)))
            .unwrap();
        assert!(cache.contains("k"));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_inmemory_multi_operations() {
        let cache = InMemoryCache::new();
        let mut values = HashMap::new();
        values.insert("a".to_string(), ids(&[1, 2]));
        values.insert("b".to_string(), CacheValue::Count(2));
        cache.set_multi(values, None).unwrap();

        let got = cache
            .get_multi(&["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["a"], ids(&[1, 2]));

        cache.delete_multi(&["a".to_string()]).unwrap();
        assert_eq!(cache.keys(), vec!["b".to_string()]);
        assert!(cache.delete("b").unwrap());
        assert!(!cache.delete("b").unwrap());
    }

    #[test]
    fn test_inmemory_clear_and_reset() {
        let cache = InMemoryCache::new();
        cache.set("x", CacheValue::Missing, None).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.len(), 0);
        cache.reset_stats();
        assert_eq!(cache.stats(), BackendStats::default());
    }

    #[test]
    fn test_cache_value_serde_keeps_value_tags() {
        let v = CacheValue::Ids {
            ids: vec![vec![Value::Int(1)], vec![Value::String("1".into())]],
            complete: false,
        };
        let text = serde_json::to_string(&v).unwrap();
        let back: CacheValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_dummy_cache_never_hits() {
        let cache = DummyCache;
        cache.set("k", CacheValue::Count(1), None).unwrap();
        assert_eq!(cache.get("k").unwrap(), None);
        assert!(cache.get_multi(&["k".to_string()]).unwrap().is_empty());
    }
}
