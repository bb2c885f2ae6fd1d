//! # rowcache-db-backends
//!
//! Database drivers for rowcache. Each driver implements
//! [`DbExecutor`](rowcache_db::DbExecutor) for one physical connection and
//! [`Connector`](rowcache_db::Connector) so a
//! [`ConnectionPool`](rowcache_db::ConnectionPool) can open more.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteConnection, SqliteConnector};
