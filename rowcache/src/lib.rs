//! # rowcache
//!
//! A read-through, invalidation-aware row cache over a portable SQL
//! compiler and a pooled, transaction-aware connection manager.
//!
//! This is the meta-crate that re-exports the sub-crates for convenient
//! access. Depend on `rowcache` to get everything, or on the individual
//! crates for finer-grained control.
//!
//! ```rust
//! # #[cfg(feature = "sqlite")]
//! # fn main() -> rowcache::core::OrmResult<()> {
//! use std::sync::Arc;
//!
//! use rowcache::core::CacheSettings;
//! use rowcache::db::cache::{CachedStore, InMemoryCache};
//! use rowcache::db::{ConnectionManager, ConnectionPool, Entity, FieldDef, FieldType, Schema, Store};
//! use rowcache::db_backends::SqliteConnector;
//!
//! let pool = ConnectionPool::new(
//!     Arc::new(SqliteConnector::memory()?),
//!     4,
//!     std::time::Duration::from_secs(300),
//! );
//! let db = Arc::new(ConnectionManager::new(Arc::new(pool)));
//! let schema = Arc::new(
//!     Schema::builder("users")
//!         .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
//!         .field(FieldDef::new("name", FieldType::Text))
//!         .primary_key(&["id"])
//!         .build()?,
//! );
//! let store = Arc::new(Store::new(db, schema.clone()));
//! store.create_table()?;
//!
//! let users = CachedStore::new(store, Arc::new(InMemoryCache::new()), &CacheSettings::default());
//! let ann = Entity::new(schema);
//! ann.set("name", "Ann")?;
//! users.insert(&ann)?;
//!
//! let id = ann.get_as::<i64>("id")?;
//! assert_eq!(users.get(id)?.unwrap().get_as::<String>("name")?, "Ann");
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "sqlite"))]
//! # fn main() {}
//! ```

/// Errors, settings, and logging setup.
pub use rowcache_core as core;

/// SQL tree, dialects, query builder, pool, transactions, store, and cache.
#[cfg(feature = "db")]
pub use rowcache_db as db;

/// Database drivers.
#[cfg(feature = "sqlite")]
pub use rowcache_db_backends as db_backends;

/// Testing utilities.
#[cfg(feature = "testing")]
pub use rowcache_test as test;

// Third-party re-exports
pub use serde;
pub use serde_json;
pub use tracing;
pub use tracing_subscriber;
