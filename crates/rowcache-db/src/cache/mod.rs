//! Read-through caching for single rows, index buckets, and counts.
//!
//! - [`backend`] - Cache storage: [`CacheBackend`], [`InMemoryCache`], [`DummyCache`]
//! - [`key`] - Key derivation
//! - [`invalidation`] - Keys a row touches and the writes that keep them exact
//! - [`wrapper`] - [`CachedStore`], the read-through entry point

pub mod backend;
pub mod invalidation;
pub mod key;
pub mod wrapper;

pub use backend::{BackendStats, CacheBackend, CacheValue, DummyCache, InMemoryCache};
pub use invalidation::{InvalidationPlan, Invalidator, RowKeys};
pub use key::{KeyBuilder, KeySuffix, MAX_KEY_LENGTH};
pub use wrapper::{CacheStats, CachedStore, Lookup, Predicate};
