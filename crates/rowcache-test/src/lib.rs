//! # rowcache-test
//!
//! Testing utilities for rowcache: an isolated in-memory SQLite database
//! whose statements are counted, assertions on the number of statements a
//! block executes, and a cache backend that records its calls.
//!
//! ## Modules
//!
//! - [`test_database`] - [`TestDatabase`] and the counting connector
//! - [`assert_queries`] - [`assert_num_queries`] and [`assert_max_queries`]
//! - [`recording_cache`] - [`RecordingCache`]

#[cfg(feature = "sqlite")]
pub mod assert_queries;
pub mod recording_cache;
#[cfg(feature = "sqlite")]
pub mod test_database;

#[cfg(feature = "sqlite")]
pub use assert_queries::{assert_max_queries, assert_num_queries};
pub use recording_cache::{CacheOp, RecordingCache};
#[cfg(feature = "sqlite")]
pub use test_database::{CountingConnector, TestDatabase};
