//! Pool leasing and expiry with real SQLite connections.

use std::thread;
use std::time::Duration;

use rowcache_db::Value;
use rowcache_test::TestDatabase;

#[test]
fn test_released_connection_is_reused() {
    let db = TestDatabase::new();
    db.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
    assert_eq!(db.pool().idle_count(), 1);
    db.manager()
        .execute("INSERT INTO t (x) VALUES (?)", &[Value::Int(1)])
        .unwrap();
    assert_eq!(db.pool().idle_count(), 1);
    assert_eq!(db.pool().active_count(), 0);
}

#[test]
fn test_expired_connections_are_replaced() {
    let db = TestDatabase::with_pool(2, Duration::from_millis(40)).unwrap();
    db.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
    assert_eq!(db.pool().idle_count(), 1);

    thread::sleep(Duration::from_millis(80));
    assert_eq!(db.pool().idle_count(), 0);

    // The shared in-memory database survives its connections.
    let rows = db
        .manager()
        .execute("SELECT COUNT(*) FROM t", &[])
        .unwrap()
        .rows;
    assert_eq!(rows[0].get_by_index::<i64>(0).unwrap(), 0);
    assert_eq!(db.pool().idle_count(), 1);
}

#[test]
fn test_transaction_holds_one_connection() {
    let db = TestDatabase::new();
    db.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();
    let manager = db.manager();

    manager
        .atomic(|_| {
            assert_eq!(db.pool().active_count(), 1);
            manager.execute("INSERT INTO t (x) VALUES (?)", &[Value::Int(1)])?;
            manager.execute("INSERT INTO t (x) VALUES (?)", &[Value::Int(2)])?;
            assert_eq!(db.pool().active_count(), 1);
            Ok(())
        })
        .unwrap();

    assert_eq!(db.pool().active_count(), 0);
    let rows = manager.execute("SELECT x FROM t ORDER BY x", &[]).unwrap().rows;
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_threads_use_separate_transactions() {
    let db = TestDatabase::new();
    db.execute_raw("CREATE TABLE t (x INTEGER)").unwrap();

    let manager = db.manager().clone();
    manager
        .atomic(|_| {
            let other = manager.clone();
            let seen = thread::spawn(move || other.in_transaction()).join().unwrap();
            assert!(!seen);
            assert!(manager.in_transaction());
            Ok(())
        })
        .unwrap();
}
