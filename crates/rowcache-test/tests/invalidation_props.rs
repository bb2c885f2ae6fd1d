//! Cached bucket reads agree with the database after arbitrary updates.

use std::sync::Arc;

use proptest::prelude::*;
use rowcache_core::CacheSettings;
use rowcache_db::cache::{CachedStore, InMemoryCache, Lookup};
use rowcache_db::{Entity, FieldDef, FieldType, Schema};
use rowcache_test::TestDatabase;

const GROUPS: i64 = 3;

fn members() -> Arc<Schema> {
    Arc::new(
        Schema::builder("members")
            .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
            .field(FieldDef::new("group_id", FieldType::Integer))
            .field(FieldDef::new("score", FieldType::Integer))
            .field(FieldDef::new("label", FieldType::Text))
            .primary_key(&["id"])
            .index_key(&["group_id"])
            .order_by(&["-score", "id"])
            .build()
            .unwrap(),
    )
}

#[derive(Debug, Clone)]
enum Edit {
    Score(usize, i64),
    Label(usize, String),
    Move(usize, i64),
    Delete(usize),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0usize..6, 0i64..5).prop_map(|(i, s)| Edit::Score(i, s)),
        (0usize..6, "[a-z]{1,4}").prop_map(|(i, l)| Edit::Label(i, l)),
        (0usize..6, 0..GROUPS).prop_map(|(i, g)| Edit::Move(i, g)),
        (0usize..6).prop_map(Edit::Delete),
    ]
}

fn image_ids(rows: &[Entity]) -> Vec<(i64, i64, String)> {
    rows.iter()
        .map(|e| {
            (
                e.get_as::<i64>("id").unwrap(),
                e.get_as::<i64>("score").unwrap(),
                e.get_as::<String>("label").unwrap(),
            )
        })
        .collect()
}

fn check(cached: &CachedStore) {
    let db = cached.store().db();
    for group in 0..GROUPS {
        let ordered = Lookup::new().filter_by("group_id", group).order_by("-score,id").limit(50);
        let expected = cached
            .store()
            .query()
            .filter_by("group_id", group)
            .order_by("-score")
            .order_by("id")
            .all(db)
            .unwrap();
        assert_eq!(image_ids(&cached.get_multi_by(&ordered).unwrap()), image_ids(&expected));

        let by_pk = Lookup::new().filter_by("group_id", group);
        let expected = cached
            .store()
            .query()
            .filter_by("group_id", group)
            .order_by("id")
            .all(db)
            .unwrap();
        assert_eq!(image_ids(&cached.get_multi_by(&by_pk).unwrap()), image_ids(&expected));
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn cached_buckets_match_database(edits in proptest::collection::vec(edit(), 1..12)) {
        let db = TestDatabase::new();
        let store = db.store(members()).unwrap();
        let cached = CachedStore::new(store, Arc::new(InMemoryCache::new()), &CacheSettings::default());

        let mut rows: Vec<Option<Entity>> = Vec::new();
        for i in 0..6_i64 {
            let e = Entity::new(cached.store().schema().clone());
            e.set("group_id", i % GROUPS).unwrap();
            e.set("score", i).unwrap();
            e.set("label", "x").unwrap();
            cached.insert(&e).unwrap();
            rows.push(Some(e));
        }
        check(&cached);

        for edit in edits {
            match edit {
                Edit::Score(i, s) => if let Some(e) = &rows[i] {
                    e.set("score", s).unwrap();
                    cached.update(e).unwrap();
                },
                Edit::Label(i, l) => if let Some(e) = &rows[i] {
                    e.set("label", l).unwrap();
                    cached.update(e).unwrap();
                },
                Edit::Move(i, g) => if let Some(e) = &rows[i] {
                    e.set("group_id", g).unwrap();
                    cached.update(e).unwrap();
                },
                Edit::Delete(i) => if let Some(e) = rows[i].take() {
                    cached.delete(&e).unwrap();
                },
            }
            check(&cached);
        }
    }
}
