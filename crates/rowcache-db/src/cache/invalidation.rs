//! Exact cache invalidation for row mutations.
//!
//! For one row image the observable keys are:
//!
//! - one row key per primary or unique key whose values are all non-null,
//! - one count key per index signature,
//! - one id-list key per index signature, unordered and under every
//!   declared order-by signature.
//!
//! An insert writes the new payload under its row keys and deletes its
//! count and id-list keys. An update writes the new payload under the new
//! row keys and deletes every other key of the old and new images, except
//! that an id-list key shared by both images survives when the primary key
//! is unchanged and no written field appears in the list's order-by
//! signature. A delete removes every key of the old image.
//!
//! Inside a transaction the affected keys are deleted immediately, the
//! plan is applied again after commit, and the keys are deleted once more
//! after a rollback.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rowcache_core::OrmResult;
use tracing::debug;

use super::backend::{CacheBackend, CacheValue};
use super::key::{KeyBuilder, KeySuffix};
use crate::entity::RowImage;
use crate::schema::{OrderSignature, Schema};
use crate::store::{Mutation, MutationKind, MutationSubscriber};
use crate::transactions::ConnectionManager;
use crate::value::Value;

/// The cache keys one row image is visible under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowKeys {
    /// Row keys.
    pub rows: Vec<String>,
    /// Count keys.
    pub counts: Vec<String>,
    /// Id-list keys with their order-by signature.
    pub lists: Vec<(String, Option<OrderSignature>)>,
}

impl RowKeys {
    /// Derives the keys of `image`.
    pub fn of(keys: &KeyBuilder, schema: &Schema, image: &RowImage) -> Self {
        let key_of = |pairs: &[(&str, Value)], suffix: &KeySuffix| {
            keys.key(schema.table(), pairs.iter().map(|(f, v)| (*f, v)), suffix)
        };

        let mut out = Self::default();
        for signature in schema.row_signatures() {
            let pairs = pairs_of(&signature, image);
            if pairs.iter().all(|(_, v)| !v.is_null()) {
                out.rows.push(key_of(&pairs, &KeySuffix::Row));
            }
        }
        for signature in schema.index_signatures() {
            let pairs = pairs_of(&signature, image);
            out.counts.push(key_of(&pairs, &KeySuffix::Count));
            out.lists.push((key_of(&pairs, &KeySuffix::Ids(None)), None));
            for order in schema.order_bys() {
                let suffix = KeySuffix::Ids(Some(order.clone()));
                out.lists.push((key_of(&pairs, &suffix), Some(order.clone())));
            }
        }
        out
    }

    /// Every key, in derivation order.
    pub fn all(&self) -> Vec<String> {
        self.rows
            .iter()
            .chain(&self.counts)
            .chain(self.lists.iter().map(|(k, _)| k))
            .cloned()
            .collect()
    }
}

fn pairs_of<'a>(fields: &'a [String], image: &RowImage) -> Vec<(&'a str, Value)> {
    fields
        .iter()
        .map(|f| (f.as_str(), image.get(f).cloned().unwrap_or(Value::Null)))
        .collect()
}

/// Keys to write and keys to delete for one mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InvalidationPlan {
    /// Keys to populate with a fresh row payload.
    pub set: BTreeMap<String, CacheValue>,
    /// Keys to delete.
    pub delete: BTreeSet<String>,
}

impl InvalidationPlan {
    /// Computes the plan for `mutation`.
    pub fn for_mutation(keys: &KeyBuilder, mutation: &Mutation) -> OrmResult<Self> {
        let schema = mutation.schema.as_ref();
        let before = mutation.before.as_ref().map(|i| RowKeys::of(keys, schema, i));
        let after = mutation.after.as_ref().map(|i| RowKeys::of(keys, schema, i));
        let payload = mutation
            .after
            .as_ref()
            .map(serde_json::to_value)
            .transpose()?;

        let mut plan = Self::default();
        if let (Some(after), Some(payload)) = (&after, payload) {
            for key in &after.rows {
                plan.set.insert(key.clone(), CacheValue::Row(payload.clone()));
            }
            plan.delete.extend(after.counts.iter().cloned());
        }
        if let Some(before) = &before {
            plan.delete.extend(
                before
                    .rows
                    .iter()
                    .filter(|k| !plan.set.contains_key(*k))
                    .cloned(),
            );
            plan.delete.extend(before.counts.iter().cloned());
        }

        let shared: BTreeSet<&String> = match (&before, &after) {
            (Some(b), Some(a)) if mutation.kind == MutationKind::Update && !mutation.pk_changed() => {
                let old: BTreeSet<&String> = b.lists.iter().map(|(k, _)| k).collect();
                a.lists.iter().map(|(k, _)| k).filter(|k| old.contains(k)).collect()
            }
            _ => BTreeSet::new(),
        };
        for (key, order) in before.iter().chain(after.iter()).flat_map(|k| &k.lists) {
            let survives = shared.contains(key)
                && order
                    .as_ref()
                    .map_or(true, |o| !mutation.dirty.iter().any(|f| o.mentions(f)));
            if !survives {
                plan.delete.insert(key.clone());
            }
        }
        Ok(plan)
    }

    /// Every key the plan touches.
    pub fn touched(&self) -> Vec<String> {
        self.set.keys().chain(&self.delete).cloned().collect()
    }

    /// Writes and deletes against `cache`.
    pub fn apply(&self, cache: &dyn CacheBackend, ttl: Option<Duration>) -> OrmResult<()> {
        if !self.delete.is_empty() {
            cache.delete_multi(&self.delete.iter().cloned().collect::<Vec<_>>())?;
        }
        if !self.set.is_empty() {
            let values: HashMap<String, CacheValue> = self
                .set
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            cache.set_multi(values, ttl)?;
        }
        Ok(())
    }
}

/// Keeps a cache consistent with a store's writes.
pub struct Invalidator {
    cache: Arc<dyn CacheBackend>,
    keys: KeyBuilder,
    ttl: Option<Duration>,
}

impl Invalidator {
    /// An invalidator writing to `cache`.
    pub fn new(cache: Arc<dyn CacheBackend>, keys: KeyBuilder, ttl: Option<Duration>) -> Self {
        Self { cache, keys, ttl }
    }
}

impl MutationSubscriber for Invalidator {
    fn on_mutate(&self, db: &ConnectionManager, mutation: &Mutation) -> OrmResult<()> {
        let plan = InvalidationPlan::for_mutation(&self.keys, mutation)?;
        debug!(
            table = mutation.schema.table(),
            kind = ?mutation.kind,
            set = plan.set.len(),
            delete = plan.delete.len(),
            deferred = db.in_transaction(),
            "Invalidating cache keys"
        );
        if !db.in_transaction() {
            return plan.apply(self.cache.as_ref(), self.ttl);
        }

        let touched = plan.touched();
        self.cache.delete_multi(&touched)?;

        let cache = self.cache.clone();
        let ttl = self.ttl;
        db.on_commit(move || plan.apply(cache.as_ref(), ttl))?;

        let cache = self.cache.clone();
        db.on_rollback(move || cache.delete_multi(&touched));
        Ok(())
    }
}

impl fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invalidator")
            .field("keys", &self.keys)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, FieldType};

    fn users() -> Arc<Schema> {
        Arc::new(
            Schema::builder("users")
                .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
                .field(FieldDef::new("email", FieldType::Char).length(120).nullable())
                .field(FieldDef::new("group_id", FieldType::Integer))
                .field(FieldDef::new("age", FieldType::Integer))
                .field(FieldDef::new("name", FieldType::Char).length(40))
                .primary_key(&["id"])
                .unique_key(&["email"])
                .index_key(&["group_id"])
                .order_by(&["-age"])
                .build()
                .unwrap(),
        )
    }

    fn image(id: i64, email: Option<&str>, group: i64, age: i64) -> RowImage {
        RowImage::from([
            ("id".to_string(), Value::Int(id)),
            ("email".to_string(), email.map_or(Value::Null, Value::from)),
            ("group_id".to_string(), Value::Int(group)),
            ("age".to_string(), Value::Int(age)),
            ("name".to_string(), Value::from("n")),
        ])
    }

    fn keys() -> KeyBuilder {
        KeyBuilder::new("t", "1")
    }

    fn update(before: RowImage, after: RowImage, dirty: &[&str]) -> Mutation {
        Mutation {
            kind: MutationKind::Update,
            schema: users(),
            before: Some(before),
            after: Some(after),
            dirty: dirty.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    const LIST: &str = "t:db:users:(group_id=1):1:suffix:ids";
    const ORDERED: &str = "t:db:users:(group_id=1):1:suffix:ids:-age";
    const COUNT: &str = "t:db:users:(group_id=1):1:suffix:count";

    #[test]
    fn test_row_keys_skip_null_unique_values() {
        let k = RowKeys::of(&keys(), &users(), &image(1, None, 1, 20));
        assert_eq!(k.rows, vec!["t:db:users:(id=1):1".to_string()]);
        assert_eq!(k.counts, vec![COUNT.to_string()]);
        assert_eq!(k.lists.len(), 2);
    }

    #[test]
    fn test_insert_populates_rows_and_drops_aggregates() {
        let m = Mutation {
            kind: MutationKind::Insert,
            schema: users(),
            before: None,
            after: Some(image(1, Some("a@x"), 1, 20)),
            dirty: BTreeSet::new(),
        };
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert_eq!(plan.set.len(), 2);
        assert!(plan.set.contains_key("t:db:users:(email='a@x'):1"));
        assert_eq!(
            plan.delete,
            BTreeSet::from([COUNT.to_string(), LIST.to_string(), ORDERED.to_string()])
        );
    }

    #[test]
    fn test_update_outside_order_keeps_lists() {
        let m = update(image(1, None, 1, 20), {
            let mut i = image(1, None, 1, 20);
            i.insert("name".into(), "m".into());
            i
        }, &["name"]);
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(!plan.delete.contains(LIST));
        assert!(!plan.delete.contains(ORDERED));
        assert!(plan.delete.contains(COUNT));
        assert!(plan.set.contains_key("t:db:users:(id=1):1"));
    }

    #[test]
    fn test_update_of_order_field_drops_ordered_list() {
        let m = update(image(1, None, 1, 20), image(1, None, 1, 21), &["age"]);
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(plan.delete.contains(ORDERED));
        assert!(!plan.delete.contains(LIST));
    }

    #[test]
    fn test_bucket_move_drops_both_buckets() {
        let m = update(image(1, None, 1, 20), image(1, None, 2, 20), &["group_id"]);
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(plan.delete.contains(LIST));
        assert!(plan.delete.contains("t:db:users:(group_id=2):1:suffix:ids"));
    }

    #[test]
    fn test_unique_key_change_drops_old_row_key() {
        let m = update(image(1, Some("a@x"), 1, 20), image(1, Some("b@x"), 1, 20), &["email"]);
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(plan.delete.contains("t:db:users:(email='a@x'):1"));
        assert!(plan.set.contains_key("t:db:users:(email='b@x'):1"));
    }

    #[test]
    fn test_pk_change_drops_every_list() {
        let m = update(image(1, None, 1, 20), image(2, None, 1, 20), &["id"]);
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(plan.delete.contains(LIST));
        assert!(plan.delete.contains("t:db:users:(id=1):1"));
    }

    #[test]
    fn test_delete_removes_everything() {
        let m = Mutation {
            kind: MutationKind::Delete,
            schema: users(),
            before: Some(image(1, Some("a@x"), 1, 20)),
            after: None,
            dirty: BTreeSet::new(),
        };
        let plan = InvalidationPlan::for_mutation(&keys(), &m).unwrap();
        assert!(plan.set.is_empty());
        assert_eq!(plan.delete.len(), 5);
    }
}
