//! Test database utilities for rowcache.
//!
//! Provides [`TestDatabase`], a pooled connection manager over a fresh
//! shared in-memory SQLite database. Every connection it opens is wrapped so
//! that executed statements are counted and captured for use with
//! [`assert_num_queries`](crate::assert_num_queries).
//!
//! ## Example
//!
//! ```rust
//! use rowcache_test::TestDatabase;
//!
//! let db = TestDatabase::new();
//! db.execute_raw("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
//!     .unwrap();
//! assert_eq!(db.query_count(), 1);
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rowcache_core::OrmResult;
use rowcache_db::query::DatabaseBackendType;
use rowcache_db::{
    ConnectionManager, ConnectionPool, Connector, DbExecutor, QueryResult, Schema, Store, Value,
};
use rowcache_db_backends::SqliteConnector;

/// Pool capacity of a [`TestDatabase`].
pub const TEST_POOL_SIZE: usize = 4;

/// Connection lifetime of a [`TestDatabase`].
pub const TEST_MAX_AGE: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct QueryLog {
    count: AtomicUsize,
    captured: Mutex<Vec<String>>,
}

impl QueryLog {
    fn record(&self, sql: &str) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.captured.lock().push(sql.to_string());
    }
}

/// Opens connections through an inner connector and counts what they run.
///
/// Transaction control (`BEGIN`, `COMMIT`, `ROLLBACK`) is not counted.
pub struct CountingConnector {
    inner: Arc<dyn Connector>,
    log: Arc<QueryLog>,
}

impl CountingConnector {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Connector>) -> Self {
        Self {
            inner,
            log: Arc::new(QueryLog::default()),
        }
    }

    /// Statements executed by every connection this connector opened.
    pub fn query_count(&self) -> usize {
        self.log.count.load(Ordering::Relaxed)
    }

    /// Zeroes the counter and forgets captured statements.
    pub fn reset(&self) {
        self.log.count.store(0, Ordering::Relaxed);
        self.log.captured.lock().clear();
    }

    /// SQL text of every counted statement, in execution order.
    pub fn captured(&self) -> Vec<String> {
        self.log.captured.lock().clone()
    }
}

impl Connector for CountingConnector {
    fn backend_type(&self) -> DatabaseBackendType {
        self.inner.backend_type()
    }

    fn connect(&self) -> OrmResult<Box<dyn DbExecutor>> {
        Ok(Box::new(CountingExecutor {
            inner: self.inner.connect()?,
            log: self.log.clone(),
        }))
    }
}

struct CountingExecutor {
    inner: Box<dyn DbExecutor>,
    log: Arc<QueryLog>,
}

impl DbExecutor for CountingExecutor {
    fn backend_type(&self) -> DatabaseBackendType {
        self.inner.backend_type()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.log.record(sql);
        self.inner.execute(sql, params)
    }

    fn execute_script(&mut self, sql: &str) -> OrmResult<()> {
        self.log.record(sql);
        self.inner.execute_script(sql)
    }

    fn begin(&mut self) -> OrmResult<()> {
        self.inner.begin()
    }

    fn commit(&mut self) -> OrmResult<()> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> OrmResult<()> {
        self.inner.rollback()
    }

    fn is_usable(&self) -> bool {
        self.inner.is_usable()
    }

    fn close(&mut self) -> OrmResult<()> {
        self.inner.close()
    }
}

/// An in-memory SQLite database for testing.
///
/// Each `TestDatabase::new()` call creates a separately named database,
/// providing complete test isolation. Clones share the database and the
/// counter.
#[derive(Clone)]
pub struct TestDatabase {
    manager: Arc<ConnectionManager>,
    connector: Arc<CountingConnector>,
}

impl TestDatabase {
    /// Creates a new in-memory SQLite test database.
    ///
    /// # Panics
    ///
    /// Panics if the in-memory database cannot be created.
    pub fn new() -> Self {
        Self::try_new().expect("Failed to create in-memory SQLite database")
    }

    /// Creates a new in-memory SQLite test database.
    pub fn try_new() -> OrmResult<Self> {
        Self::with_pool(TEST_POOL_SIZE, TEST_MAX_AGE)
    }

    /// Creates a test database whose pool keeps `capacity` idle connections
    /// living at most `max_age`.
    pub fn with_pool(capacity: usize, max_age: Duration) -> OrmResult<Self> {
        let sqlite: Arc<dyn Connector> = Arc::new(SqliteConnector::memory()?);
        let connector = Arc::new(CountingConnector::new(sqlite));
        let pool = ConnectionPool::new(connector.clone(), capacity, max_age);
        Ok(Self {
            manager: Arc::new(ConnectionManager::new(Arc::new(pool))),
            connector,
        })
    }

    /// The connection manager.
    pub const fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    /// The pool behind the manager.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.manager.pool()
    }

    /// Creates the table for `schema`.
    pub fn setup_table(&self, schema: &Schema) -> OrmResult<()> {
        let (sql, _) = self
            .manager
            .compiler()
            .translate(&schema.create_table_node())?;
        self.manager.execute_script(&sql)
    }

    /// Creates the table for `schema` and returns a store over it.
    pub fn store(&self, schema: Arc<Schema>) -> OrmResult<Arc<Store>> {
        self.setup_table(&schema)?;
        Ok(Arc::new(Store::new(self.manager.clone(), schema)))
    }

    /// Drops every user table.
    pub fn teardown(&self) -> OrmResult<()> {
        let rows = self
            .manager
            .execute(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'",
                &[],
            )?
            .rows;
        for row in &rows {
            let table: String = row.get("name")?;
            self.manager
                .execute_script(&format!("DROP TABLE IF EXISTS \"{table}\""))?;
        }
        Ok(())
    }

    /// Executes a raw SQL script with no parameters.
    pub fn execute_raw(&self, sql: &str) -> OrmResult<()> {
        self.manager.execute_script(sql)
    }

    /// Returns the current query count.
    pub fn query_count(&self) -> usize {
        self.connector.query_count()
    }

    /// Resets the query counter to zero.
    pub fn reset_query_count(&self) {
        self.connector.reset();
    }

    /// SQL text of every statement counted since the last reset.
    pub fn captured_queries(&self) -> Vec<String> {
        self.connector.captured()
    }
}

impl Default for TestDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestDatabase")
            .field("query_count", &self.query_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowcache_db::{FieldDef, FieldType};

    fn notes() -> Arc<Schema> {
        Arc::new(
            Schema::builder("notes")
                .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
                .field(FieldDef::new("body", FieldType::Text))
                .primary_key(&["id"])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_counts_statements() {
        let db = TestDatabase::new();
        db.execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)")
            .unwrap();
        db.manager()
            .execute("INSERT INTO t (val) VALUES (?)", &[Value::from("a")])
            .unwrap();
        assert_eq!(db.query_count(), 2);
        assert!(db.captured_queries()[1].starts_with("INSERT"));

        db.reset_query_count();
        assert_eq!(db.query_count(), 0);
        assert!(db.captured_queries().is_empty());
    }

    #[test]
    fn test_transaction_control_is_not_counted() {
        let db = TestDatabase::new();
        db.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
        db.reset_query_count();
        db.manager()
            .atomic(|txn| txn.manager().execute("INSERT INTO t (x) VALUES (?)", &[Value::Int(1)]))
            .unwrap();
        assert_eq!(db.query_count(), 1);
    }

    #[test]
    fn test_databases_are_isolated() {
        let a = TestDatabase::new();
        let b = TestDatabase::new();
        a.execute_raw("CREATE TABLE only_a (x INTEGER)").unwrap();
        assert!(b.execute_raw("INSERT INTO only_a (x) VALUES (1)").is_err());
    }

    #[test]
    fn test_store_and_teardown() {
        let db = TestDatabase::new();
        let store = db.store(notes()).unwrap();
        let note = rowcache_db::Entity::new(store.schema().clone());
        note.set("body", "hello").unwrap();
        store.insert(&note).unwrap();
        assert_eq!(note.get_as::<i64>("id").unwrap(), 1);

        db.teardown().unwrap();
        assert!(store.get_raw(&[("id", Value::Int(1))]).is_err());
    }
}
