//! A cache backend that records every call.
//!
//! [`RecordingCache`] wraps an [`InMemoryCache`] and logs each operation
//! with the keys it touched, so tests can assert on batching (one
//! `get_multi` instead of many `get`s) and on exactly which keys a mutation
//! wrote or removed.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rowcache_core::OrmResult;
use rowcache_db::cache::{CacheBackend, CacheValue, InMemoryCache};

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOp {
    /// `get(key)`.
    Get(String),
    /// `get_multi(keys)`.
    GetMulti(Vec<String>),
    /// `set(key, ..)`.
    Set(String),
    /// `set_multi(..)`, keys sorted.
    SetMulti(Vec<String>),
    /// `delete(key)`.
    Delete(String),
    /// `delete_multi(keys)`.
    DeleteMulti(Vec<String>),
    /// `clear()`.
    Clear,
}

/// An in-memory cache that records its calls.
#[derive(Debug, Default)]
pub struct RecordingCache {
    inner: InMemoryCache,
    ops: Mutex<Vec<CacheOp>>,
}

impl RecordingCache {
    /// An empty cache with an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The wrapped cache.
    pub const fn inner(&self) -> &InMemoryCache {
        &self.inner
    }

    /// Calls since creation or the last [`clear_log`](Self::clear_log).
    pub fn ops(&self) -> Vec<CacheOp> {
        self.ops.lock().clone()
    }

    /// Forgets recorded calls.
    pub fn clear_log(&self) {
        self.ops.lock().clear();
    }

    /// Every key written by `set` or `set_multi`, in call order.
    pub fn written_keys(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .flat_map(|op| match op {
                CacheOp::Set(key) => vec![key.clone()],
                CacheOp::SetMulti(keys) => keys.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    /// Every key removed by `delete` or `delete_multi`, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.ops
            .lock()
            .iter()
            .flat_map(|op| match op {
                CacheOp::Delete(key) => vec![key.clone()],
                CacheOp::DeleteMulti(keys) => keys.clone(),
                _ => Vec::new(),
            })
            .collect()
    }

    fn record(&self, op: CacheOp) {
        self.ops.lock().push(op);
    }
}

impl CacheBackend for RecordingCache {
    fn get(&self, key: &str) -> OrmResult<Option<CacheValue>> {
        self.record(CacheOp::Get(key.to_string()));
        self.inner.get(key)
    }

    fn get_multi(&self, keys: &[String]) -> OrmResult<HashMap<String, CacheValue>> {
        self.record(CacheOp::GetMulti(keys.to_vec()));
        self.inner.get_multi(keys)
    }

    fn set(&self, key: &str, value: CacheValue, ttl: Option<Duration>) -> OrmResult<()> {
        self.record(CacheOp::Set(key.to_string()));
        self.inner.set(key, value, ttl)
    }

    fn set_multi(&self, values: HashMap<String, CacheValue>, ttl: Option<Duration>) -> OrmResult<()> {
        let mut keys: Vec<String> = values.keys().cloned().collect();
        keys.sort();
        self.record(CacheOp::SetMulti(keys));
        self.inner.set_multi(values, ttl)
    }

    fn delete(&self, key: &str) -> OrmResult<bool> {
        self.record(CacheOp::Delete(key.to_string()));
        self.inner.delete(key)
    }

    fn delete_multi(&self, keys: &[String]) -> OrmResult<()> {
        self.record(CacheOp::DeleteMulti(keys.to_vec()));
        self.inner.delete_multi(keys)
    }

    fn clear(&self) -> OrmResult<()> {
        self.record(CacheOp::Clear);
        self.inner.clear()
    }
}
