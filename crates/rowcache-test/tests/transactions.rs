//! Transaction scoping and deferred cache invalidation against SQLite.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rowcache_core::{CacheSettings, OrmError, OrmResult};
use rowcache_db::cache::{CachedStore, InMemoryCache};
use rowcache_db::{Entity, FieldDef, FieldType, Schema, Value};
use rowcache_test::{assert_num_queries, TestDatabase};

fn accounts() -> Arc<Schema> {
    Arc::new(
        Schema::builder("accounts")
            .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
            .field(FieldDef::new("owner", FieldType::Char).length(60))
            .field(FieldDef::new("balance", FieldType::BigInteger))
            .primary_key(&["id"])
            .index_key(&["owner"])
            .build()
            .unwrap(),
    )
}

fn setup() -> (TestDatabase, CachedStore, Entity) {
    let db = TestDatabase::new();
    let store = db.store(accounts()).unwrap();
    let cached = CachedStore::new(store, Arc::new(InMemoryCache::new()), &CacheSettings::default());
    let account = Entity::new(cached.store().schema().clone());
    account.set("owner", "ann").unwrap();
    account.set("balance", 100).unwrap();
    cached.insert(&account).unwrap();
    (db, cached, account)
}

fn abort() -> OrmError {
    OrmError::Expression("abort".to_string())
}

fn balance(cached: &CachedStore, id: i64) -> i64 {
    cached.get(id).unwrap().unwrap().get_as::<i64>("balance").unwrap()
}

#[test]
fn test_commit_publishes_new_row_to_cache() {
    let (db, cached, account) = setup();
    let id = account.get_as::<i64>("id").unwrap();

    db.manager()
        .atomic(|_| {
            account.set("balance", 150)?;
            cached.update(&account)?;
            Ok(())
        })
        .unwrap();

    assert_eq!(assert_num_queries(&db, 0, || balance(&cached, id)), 150);
}

#[test]
fn test_rollback_discards_cache_and_restores_entity() {
    let (db, cached, account) = setup();
    let id = account.get_as::<i64>("id").unwrap();
    assert_eq!(balance(&cached, id), 100);

    let result: OrmResult<()> = db.manager().atomic(|_| {
        account.set("balance", 0)?;
        cached.update(&account)?;
        assert_eq!(balance(&cached, id), 0);
        Err(abort())
    });
    assert!(result.is_err());

    assert!(account.dirty_fields().contains("balance"));
    assert_eq!(account.snapshot().unwrap()["balance"], Value::Int(100));
    assert_eq!(assert_num_queries(&db, 1, || balance(&cached, id)), 100);
    assert_eq!(assert_num_queries(&db, 0, || balance(&cached, id)), 100);
}

#[test]
fn test_inner_failure_rolls_back_once_at_outer_scope() {
    let (db, cached, _) = setup();
    let manager = db.manager().clone();
    let committed = Arc::new(AtomicUsize::new(0));
    let rolled_back = Arc::new(AtomicUsize::new(0));

    let result: OrmResult<()> = manager.atomic(|outer| {
        let c = committed.clone();
        outer.on_commit(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?;
        let r = rolled_back.clone();
        outer.on_rollback(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let extra = Entity::new(cached.store().schema().clone());
        extra.set("owner", "bob")?;
        extra.set("balance", 5)?;
        cached.insert(&extra)?;

        manager.atomic(|inner| {
            assert_eq!(inner.depth(), 2);
            let c = committed.clone();
            inner.on_commit(move || {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })?;
            Err::<(), _>(abort())
        })?;
        Ok(())
    });

    assert!(matches!(result, Err(OrmError::Expression(_))));
    assert_eq!(committed.load(Ordering::SeqCst), 0);
    assert_eq!(rolled_back.load(Ordering::SeqCst), 1);
    assert!(!manager.in_transaction());
    assert_eq!(cached.count_by(&[("owner", Value::from("bob"))]).unwrap(), 0);
}

#[test]
fn test_cancel_rolls_back_without_error() {
    let (db, cached, account) = setup();
    let id = account.get_as::<i64>("id").unwrap();

    db.manager()
        .atomic(|txn| {
            account.set("balance", 1)?;
            cached.update(&account)?;
            txn.cancel();
            Ok(())
        })
        .unwrap();

    assert_eq!(balance(&cached, id), 100);
}

#[test]
fn test_counts_are_exact_after_commit() {
    let (db, cached, _) = setup();
    assert_eq!(cached.count_by(&[("owner", Value::from("ann"))]).unwrap(), 1);

    db.manager()
        .atomic(|_| {
            for balance in [1, 2] {
                let e = Entity::new(cached.store().schema().clone());
                e.set("owner", "ann")?;
                e.set("balance", balance)?;
                cached.insert(&e)?;
            }
            Ok(())
        })
        .unwrap();

    let n = assert_num_queries(&db, 1, || {
        cached.count_by(&[("owner", Value::from("ann"))]).unwrap()
    });
    assert_eq!(n, 3);
}
