//! Query counting assertions for database tests.
//!
//! [`assert_num_queries`] counts the SQL statements executed during a
//! closure and asserts the count matches an expected value. This is how the
//! cache tests prove that a read was served without a database round trip.
//!
//! ## Example
//!
//! ```rust
//! use rowcache_test::{assert_num_queries, TestDatabase};
//!
//! let db = TestDatabase::new();
//! db.execute_raw("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)").unwrap();
//!
//! assert_num_queries(&db, 1, || {
//!     db.execute_raw("INSERT INTO t (val) VALUES ('x')").unwrap();
//! });
//! ```

use crate::test_database::TestDatabase;

/// Asserts that exactly `expected_count` SQL statements are executed during
/// `f`, and returns what `f` returned.
///
/// Resets the query counter on the [`TestDatabase`] before running `f`.
///
/// # Panics
///
/// Panics if the number of statements does not match `expected_count`.
pub fn assert_num_queries<T>(db: &TestDatabase, expected_count: usize, f: impl FnOnce() -> T) -> T {
    db.reset_query_count();
    let out = f();
    let actual = db.query_count();
    assert_eq!(
        actual,
        expected_count,
        "Expected {expected_count} SQL queries, but {actual} were executed: {:?}",
        db.captured_queries()
    );
    out
}

/// Asserts that at most `max_count` SQL statements are executed during `f`.
///
/// # Panics
///
/// Panics if more than `max_count` statements are executed.
pub fn assert_max_queries<T>(db: &TestDatabase, max_count: usize, f: impl FnOnce() -> T) -> T {
    db.reset_query_count();
    let out = f();
    let actual = db.query_count();
    assert!(
        actual <= max_count,
        "Expected at most {max_count} SQL queries, but {actual} were executed: {:?}",
        db.captured_queries()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_table() -> TestDatabase {
        let db = TestDatabase::new();
        db.execute_raw("CREATE TABLE nq (id INTEGER PRIMARY KEY, val TEXT)")
            .unwrap();
        db
    }

    #[test]
    fn test_assert_num_queries_passes() {
        let db = db_with_table();
        assert_num_queries(&db, 2, || {
            db.execute_raw("INSERT INTO nq (val) VALUES ('a')").unwrap();
            db.execute_raw("INSERT INTO nq (val) VALUES ('b')").unwrap();
        });
    }

    #[test]
    fn test_assert_num_queries_zero() {
        let db = TestDatabase::new();
        assert_num_queries(&db, 0, || {});
    }

    #[test]
    fn test_assert_num_queries_returns_value() {
        let db = db_with_table();
        let n = assert_num_queries(&db, 1, || {
            db.manager()
                .execute("SELECT COUNT(*) FROM nq", &[])
                .unwrap()
                .rows[0]
                .get_by_index::<i64>(0)
                .unwrap()
        });
        assert_eq!(n, 0);
    }

    #[test]
    #[should_panic(expected = "Expected 1 SQL queries, but 2 were executed")]
    fn test_assert_num_queries_fails_too_many() {
        let db = db_with_table();
        assert_num_queries(&db, 1, || {
            db.execute_raw("INSERT INTO nq (val) VALUES ('a')").unwrap();
            db.execute_raw("INSERT INTO nq (val) VALUES ('b')").unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "Expected 3 SQL queries, but 1 were executed")]
    fn test_assert_num_queries_fails_too_few() {
        let db = db_with_table();
        assert_num_queries(&db, 3, || {
            db.execute_raw("INSERT INTO nq (val) VALUES ('a')").unwrap();
        });
    }

    #[test]
    fn test_assert_max_queries_passes() {
        let db = db_with_table();
        assert_max_queries(&db, 5, || {
            db.execute_raw("INSERT INTO nq (val) VALUES ('a')").unwrap();
        });
    }

    #[test]
    #[should_panic(expected = "Expected at most 1 SQL queries, but 2 were executed")]
    fn test_assert_max_queries_fails() {
        let db = db_with_table();
        assert_max_queries(&db, 1, || {
            db.execute_raw("INSERT INTO nq (val) VALUES ('a')").unwrap();
            db.execute_raw("INSERT INTO nq (val) VALUES ('b')").unwrap();
        });
    }
}
