//! The read-through cache wrapper.
//!
//! [`CachedStore`] serves single-row lookups by primary or unique key,
//! batched lookups, ordered id-lists for indexed predicates, and counts
//! from a [`CacheBackend`], falling back to the database on a miss and
//! writing the result back. It subscribes an
//! [`Invalidator`](super::invalidation::Invalidator) to the wrapped store, so
//! writes made through that store keep the cache exact.
//!
//! Id-lists are bounded: at most `max_count` primary keys are cached per
//! bucket, and a call whose window reaches past that bound reads the
//! database directly. Listed ids are resolved through the batched row
//! cache, so row payloads and bucket lists are independent layers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rowcache_core::logging::{operation_span, CACHE_MISS_TARGET};
use rowcache_core::{CacheSettings, OrmError, OrmResult};
use tracing::{debug, info};

use super::backend::{CacheBackend, CacheValue};
use super::invalidation::Invalidator;
use super::key::{KeyBuilder, KeySuffix};
use crate::entity::{coerce_value, Entity};
use crate::query::builder::{Projected, Projection, Query};
use crate::query::expr::{col, Expr};
use crate::schema::{OrderSignature, Schema};
use crate::store::Store;
use crate::value::Value;

/// A normalized equality predicate, sorted by field name.
pub type Predicate = BTreeMap<String, Value>;

/// Arguments of an indexed list lookup.
#[derive(Debug, Clone, Default)]
pub struct Lookup {
    predicate: Vec<(String, Value)>,
    exprs: Vec<Expr>,
    start: usize,
    limit: Option<usize>,
    order_by: Option<String>,
}

impl Lookup {
    /// An empty lookup.
    pub fn new() -> Self {
        Self::default()
    }

    /// A lookup over field equalities.
    pub fn by(pairs: &[(&str, Value)]) -> Self {
        pairs
            .iter()
            .fold(Self::new(), |l, (f, v)| l.filter_by(f, v.clone()))
    }

    /// Adds a field equality.
    #[must_use]
    pub fn filter_by(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.predicate.push((field.to_string(), value.into()));
        self
    }

    /// Adds a raw expression. A lookup with expressions is never cached.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.exprs.push(expr);
        self
    }

    /// Skips the first `start` rows.
    #[must_use]
    pub const fn start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Returns at most `limit` rows.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Orders by a signature such as `"-age,name"`.
    #[must_use]
    pub fn order_by(mut self, order: impl Into<String>) -> Self {
        self.order_by = Some(order.into());
        self
    }
}

/// Counters of one [`CachedStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to read the database.
    pub misses: u64,
    /// Lookups that skipped the cache because they were not cacheable or
    /// reached past the id-list bound.
    pub fallbacks: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
}

/// Read-through cache over one [`Store`].
pub struct CachedStore {
    store: Arc<Store>,
    cache: Arc<dyn CacheBackend>,
    keys: KeyBuilder,
    settings: CacheSettings,
    counters: Counters,
}

impl CachedStore {
    /// Wraps `store` and subscribes the cache's invalidator to it.
    pub fn new(store: Arc<Store>, cache: Arc<dyn CacheBackend>, settings: &CacheSettings) -> Self {
        let keys = KeyBuilder::from_settings(settings);
        let ttl = ttl_of(settings);
        store.subscribe(Arc::new(Invalidator::new(cache.clone(), keys.clone(), ttl)));
        Self {
            store,
            cache,
            keys,
            settings: settings.clone(),
            counters: Counters::default(),
        }
    }

    /// The wrapped store.
    pub const fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The cache backend.
    pub const fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.cache
    }

    /// The key builder.
    pub const fn key_builder(&self) -> &KeyBuilder {
        &self.keys
    }

    fn schema(&self) -> &Arc<Schema> {
        self.store.schema()
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters.
    pub fn reset_stats(&self) {
        self.counters.hits.store(0, Ordering::Relaxed);
        self.counters.misses.store(0, Ordering::Relaxed);
        self.counters.fallbacks.store(0, Ordering::Relaxed);
    }

    // ── Mutations ────────────────────────────────────────────────────

    /// See [`Store::insert`].
    pub fn insert(&self, entity: &Entity) -> OrmResult<()> {
        self.store.insert(entity)
    }

    /// See [`Store::update`].
    pub fn update(&self, entity: &Entity) -> OrmResult<bool> {
        self.store.update(entity)
    }

    /// See [`Store::delete`].
    pub fn delete(&self, entity: &Entity) -> OrmResult<()> {
        self.store.delete(entity)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn normalize<S: AsRef<str>>(&self, pairs: &[(S, Value)]) -> OrmResult<Predicate> {
        let schema = self.schema();
        let mut predicate = Predicate::new();
        for (field, value) in pairs {
            let def = schema.require_field(field.as_ref())?;
            predicate.insert(def.name.clone(), coerce_value(def, value.clone()));
        }
        Ok(predicate)
    }

    fn key(&self, predicate: &Predicate, suffix: &KeySuffix) -> String {
        self.keys.key(
            self.schema().table(),
            predicate.iter().map(|(f, v)| (f.as_str(), v)),
            suffix,
        )
    }

    fn is_row_predicate(&self, predicate: &Predicate) -> bool {
        let fields: Vec<&str> = predicate.keys().map(String::as_str).collect();
        self.schema().is_row_signature(&fields) && predicate.values().all(|v| !v.is_null())
    }

    fn is_index_predicate(&self, predicate: &Predicate) -> bool {
        let fields: Vec<&str> = predicate.keys().map(String::as_str).collect();
        self.schema().is_index_signature(&fields)
    }

    fn bypass(&self, op: &'static str, reason: &str) -> OrmResult<()> {
        if self.settings.strict {
            return Err(OrmError::Cache(format!(
                "{op} on '{}': {reason}",
                self.schema().table()
            )));
        }
        debug!(op, reason, "Bypassing cache");
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn hit(&self, n: usize) {
        self.counters.hits.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Counts a database round trip on a cacheable path and occasionally
    /// reports it. Reporting never fails.
    fn record_miss(&self, op: &'static str, key: &str, n: usize) {
        self.counters.misses.fetch_add(n as u64, Ordering::Relaxed);
        let rate = self.settings.miss_sample_rate;
        if rate > 0.0 && rand::thread_rng().gen::<f64>() < rate {
            info!(
                target: CACHE_MISS_TARGET,
                op,
                table = self.schema().table(),
                key,
                misses = n,
                "Cache fallback"
            );
        }
    }

    fn ttl(&self) -> Option<Duration> {
        ttl_of(&self.settings)
    }

    fn filtered(&self, predicate: &Predicate) -> Query {
        predicate
            .iter()
            .fold(self.store.query(), |q, (f, v)| q.filter_by(f, v.clone()))
    }

    fn decode(&self, value: &CacheValue) -> OrmResult<Option<Option<Entity>>> {
        match value {
            CacheValue::Row(payload) => Ok(Some(Some(Entity::from_payload(
                self.schema().clone(),
                payload,
            )?))),
            CacheValue::Missing => Ok(Some(None)),
            CacheValue::Ids { .. } | CacheValue::Count(_) => Ok(None),
        }
    }

    fn encode(entity: Option<&Entity>) -> OrmResult<CacheValue> {
        entity.map_or(Ok(CacheValue::Missing), |e| Ok(CacheValue::Row(e.to_payload()?)))
    }

    // ── Single rows ──────────────────────────────────────────────────

    /// Looks up a row by its single-field primary key.
    pub fn get(&self, pk: impl Into<Value>) -> OrmResult<Option<Entity>> {
        let field = self.single_pk()?;
        self.get_by(&[(field.as_str(), pk.into())])
    }

    fn single_pk(&self) -> OrmResult<String> {
        self.schema().single_pk().map(str::to_string).ok_or_else(|| {
            OrmError::Cache(format!(
                "'{}' has a composite primary key; use get_by",
                self.schema().table()
            ))
        })
    }

    /// Looks up a row by field equalities. Only primary and unique keys
    /// are served from the cache.
    pub fn get_by(&self, pairs: &[(&str, Value)]) -> OrmResult<Option<Entity>> {
        let span = operation_span("get_by", self.schema().table());
        let _guard = span.enter();
        let predicate = self.normalize(pairs)?;
        let db = self.store.db();

        if !self.is_row_predicate(&predicate) {
            self.bypass("get_by", "predicate is not a primary or unique key")?;
            return self.filtered(&predicate).first(db);
        }

        let key = self.key(&predicate, &KeySuffix::Row);
        if let Some(found) = self.cache.get(&key)? {
            if let Some(entity) = self.decode(&found)? {
                self.hit(1);
                return Ok(entity);
            }
        }

        self.record_miss("get_by", &key, 1);
        let entity = self.filtered(&predicate).first(db)?;
        self.cache.set(&key, Self::encode(entity.as_ref())?, self.ttl())?;
        Ok(entity)
    }

    /// Looks up several rows in one cache round trip and at most one
    /// database query per predicate shape. The output follows the input
    /// order; when `filter_none` is `false` a missing row is `None`,
    /// otherwise it is left out.
    pub fn get_multi(
        &self,
        idents: &[Vec<(&str, Value)>],
        filter_none: bool,
    ) -> OrmResult<Vec<Option<Entity>>> {
        let span = operation_span("get_multi", self.schema().table());
        let _guard = span.enter();

        let predicates = idents
            .iter()
            .map(|pairs| self.normalize(pairs))
            .collect::<OrmResult<Vec<_>>>()?;

        let mut keys: Vec<Option<String>> = Vec::with_capacity(predicates.len());
        for predicate in &predicates {
            if self.is_row_predicate(predicate) {
                keys.push(Some(self.key(predicate, &KeySuffix::Row)));
            } else {
                self.bypass("get_multi", "predicate is not a primary or unique key")?;
                keys.push(None);
            }
        }

        let wanted: Vec<String> = keys.iter().flatten().cloned().collect();
        let cached = if wanted.is_empty() {
            HashMap::new()
        } else {
            self.cache.get_multi(&wanted)?
        };

        let mut resolved: HashMap<usize, Option<Entity>> = HashMap::new();
        let mut missing: Vec<usize> = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            match key.as_ref().and_then(|k| cached.get(k)) {
                Some(value) => match self.decode(value)? {
                    Some(entity) => {
                        self.hit(1);
                        resolved.insert(i, entity);
                    }
                    None => missing.push(i),
                },
                None => missing.push(i),
            }
        }

        if !missing.is_empty() {
            let fetched = self.fetch_many(&predicates, &missing)?;
            let mut write_back = HashMap::new();
            for (i, entity) in missing.iter().copied().zip(fetched) {
                if let Some(key) = &keys[i] {
                    write_back.insert(key.clone(), Self::encode(entity.as_ref())?);
                }
                resolved.insert(i, entity);
            }
            let cacheable_misses = write_back.len();
            if cacheable_misses > 0 {
                self.record_miss("get_multi", self.schema().table(), cacheable_misses);
                self.cache.set_multi(write_back, self.ttl())?;
            }
        }
        debug!(requested = predicates.len(), fetched = missing.len(), "Resolved rows");

        Ok((0..predicates.len())
            .map(|i| resolved.remove(&i).flatten())
            .filter(|e| !filter_none || e.is_some())
            .collect())
    }

    /// Loads the rows for `predicates[i]` for every `i` in `indexes`,
    /// grouping single-field predicates into one `IN` query per field.
    fn fetch_many(&self, predicates: &[Predicate], indexes: &[usize]) -> OrmResult<Vec<Option<Entity>>> {
        let db = self.store.db();
        let mut found: HashMap<usize, Entity> = HashMap::new();

        let mut by_field: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for &i in indexes {
            let predicate = &predicates[i];
            match predicate.iter().next() {
                Some((field, value)) if predicate.len() == 1 && !value.is_null() => {
                    by_field.entry(field.as_str()).or_default().push(i);
                }
                _ => {
                    if let Some(entity) = self.filtered(predicate).first(db)? {
                        found.insert(i, entity);
                    }
                }
            }
        }

        for (field, group) in by_field {
            let mut values: Vec<Value> = Vec::new();
            for &i in &group {
                let v = &predicates[i][field];
                if !values.contains(v) {
                    values.push(v.clone());
                }
            }
            let rows = self.store.query().filter(col(field).is_in(values)).all(db)?;
            for entity in rows {
                let value = entity.get(field)?;
                for &i in &group {
                    if predicates[i][field] == value {
                        found.entry(i).or_insert_with(|| entity.clone());
                    }
                }
            }
        }

        Ok(indexes.iter().map(|i| found.remove(i)).collect())
    }

    /// Looks up rows by single-field primary key, leaving out rows that do
    /// not exist.
    pub fn gets(&self, pks: &[Value]) -> OrmResult<Vec<Entity>> {
        let field = self.single_pk()?;
        let idents: Vec<Vec<(&str, Value)>> = pks
            .iter()
            .map(|pk| vec![(field.as_str(), pk.clone())])
            .collect();
        Ok(self.get_multi(&idents, true)?.into_iter().flatten().collect())
    }

    // ── Index buckets ────────────────────────────────────────────────

    fn list_query(&self, predicate: &Predicate, lookup: &Lookup, order: Option<&OrderSignature>) -> Query {
        let mut query = lookup
            .exprs
            .iter()
            .fold(self.filtered(predicate), |q, e| q.filter(e.clone()));
        query = match order {
            Some(order) => query.order_by_signature(order),
            None => self
                .schema()
                .primary_key()
                .iter()
                .fold(query, |q, f| q.order_by(f)),
        };
        query
    }

    /// Looks up the rows of an index bucket, ordered and windowed by
    /// `lookup`.
    ///
    /// Served from a cached id-list when the lookup has no raw
    /// expressions, its fields form a declared index signature, its order
    /// is a declared order-by, and its window ends within `max_count`.
    pub fn get_multi_by(&self, lookup: &Lookup) -> OrmResult<Vec<Entity>> {
        let span = operation_span("get_multi_by", self.schema().table());
        let _guard = span.enter();
        let db = self.store.db();

        let predicate = self.normalize(&lookup.predicate)?;
        let order = lookup
            .order_by
            .as_deref()
            .map(OrderSignature::parse_str)
            .transpose()?;
        let direct = |this: &Self| {
            let mut q = this.list_query(&predicate, lookup, order.as_ref());
            if lookup.start > 0 {
                q = q.offset(lookup.start as u64);
            }
            if let Some(limit) = lookup.limit {
                q = q.limit(limit as u64);
            }
            q.all(db)
        };

        if !lookup.exprs.is_empty() {
            self.bypass("get_multi_by", "lookup has raw expressions")?;
            return direct(self);
        }
        if !self.is_index_predicate(&predicate) {
            self.bypass("get_multi_by", "predicate is not a declared index")?;
            return direct(self);
        }
        if let Some(order) = &order {
            if !self.schema().has_order_by(order) {
                self.bypass("get_multi_by", "order is not a declared order-by")?;
                return direct(self);
            }
        }
        let max_count = self.settings.max_count;
        if lookup.limit.is_some_and(|l| lookup.start.saturating_add(l) > max_count) {
            debug!(start = lookup.start, limit = ?lookup.limit, max_count, "Window past id-list bound");
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            return direct(self);
        }

        let key = self.key(&predicate, &KeySuffix::Ids(order.clone()));
        let (ids, complete) = match self.cache.get(&key)? {
            Some(CacheValue::Ids { ids, complete }) => {
                self.hit(1);
                (ids, complete)
            }
            _ => {
                self.record_miss("get_multi_by", &key, 1);
                let ids = self.fetch_ids(&predicate, lookup, order.as_ref(), max_count)?;
                let complete = ids.len() < max_count;
                self.cache.set(
                    &key,
                    CacheValue::Ids {
                        ids: ids.clone(),
                        complete,
                    },
                    self.ttl(),
                )?;
                (ids, complete)
            }
        };

        if lookup.limit.is_none() && !complete {
            self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
            return direct(self);
        }
        let end = lookup
            .limit
            .map_or(ids.len(), |l| lookup.start.saturating_add(l).min(ids.len()));
        let window = ids.get(lookup.start.min(end)..end).unwrap_or_default();
        self.resolve_ids(window)
    }

    fn fetch_ids(
        &self,
        predicate: &Predicate,
        lookup: &Lookup,
        order: Option<&OrderSignature>,
        max_count: usize,
    ) -> OrmResult<Vec<Vec<Value>>> {
        let pk = self.schema().primary_key();
        let rows = self
            .list_query(predicate, lookup, order)
            .map(pk.iter().map(|f| Projection::Field(f.clone())).collect())
            .limit(max_count as u64)
            .rows(self.store.db())?;
        Ok(rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(pk)
                    .map(|(slot, f)| match slot {
                        Projected::Scalar(v) => self
                            .schema()
                            .field(f)
                            .map_or(v.clone(), |def| coerce_value(def, v)),
                        Projected::Entity(_) => Value::Null,
                    })
                    .collect()
            })
            .collect())
    }

    fn resolve_ids(&self, ids: &[Vec<Value>]) -> OrmResult<Vec<Entity>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let pk = self.schema().primary_key();
        let idents: Vec<Vec<(&str, Value)>> = ids
            .iter()
            .map(|id| pk.iter().map(String::as_str).zip(id.iter().cloned()).collect())
            .collect();
        Ok(self.get_multi(&idents, true)?.into_iter().flatten().collect())
    }

    /// Rows of an index bucket matching field equalities, in primary-key
    /// order.
    pub fn gets_by(&self, pairs: &[(&str, Value)]) -> OrmResult<Vec<Entity>> {
        self.get_multi_by(&Lookup::by(pairs))
    }

    /// Number of rows matching field equalities. Cached when the fields
    /// form a declared index signature.
    pub fn count_by(&self, pairs: &[(&str, Value)]) -> OrmResult<i64> {
        let span = operation_span("count_by", self.schema().table());
        let _guard = span.enter();
        let predicate = self.normalize(pairs)?;
        let db = self.store.db();

        if !self.is_index_predicate(&predicate) {
            self.bypass("count_by", "predicate is not a declared index")?;
            return self.filtered(&predicate).count(db);
        }
        let key = self.key(&predicate, &KeySuffix::Count);
        if let Some(CacheValue::Count(n)) = self.cache.get(&key)? {
            self.hit(1);
            return Ok(n);
        }
        self.record_miss("count_by", &key, 1);
        let n = self.filtered(&predicate).count(db)?;
        self.cache.set(&key, CacheValue::Count(n), self.ttl())?;
        Ok(n)
    }
}

fn ttl_of(settings: &CacheSettings) -> Option<Duration> {
    (settings.ttl_secs > 0).then(|| settings.ttl())
}

impl fmt::Debug for CachedStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedStore")
            .field("table", &self.schema().table())
            .field("keys", &self.keys)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::InMemoryCache;
    use crate::executor::QueryResult;
    use crate::schema::{FieldDef, FieldType};
    use crate::testing::{scripted_manager, StatementLog};
    use crate::value::Row;

    fn users() -> Arc<Schema> {
        Arc::new(
            Schema::builder("users")
                .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
                .field(FieldDef::new("group_id", FieldType::Integer))
                .field(FieldDef::new("age", FieldType::Integer))
                .primary_key(&["id"])
                .index_key(&["group_id"])
                .order_by(&["-age"])
                .build()
                .unwrap(),
        )
    }

    fn user_row(id: i64) -> Row {
        Row::new(
            vec!["id".into(), "group_id".into(), "age".into()],
            vec![Value::Int(id), Value::Int(1), Value::Int(20 + id)],
        )
    }

    /// Answers id lookups for rows 1..=3 and nothing else.
    fn answer(sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        if sql.starts_with("SELECT COUNT(*)") {
            return Ok(QueryResult::from_rows(vec![Row::new(
                vec!["n".into()],
                vec![Value::Int(3)],
            )]));
        }
        if sql.starts_with("SELECT \"id\" FROM") {
            let rows = (1..=3)
                .map(|i| Row::new(vec!["id".into()], vec![Value::Int(i)]))
                .collect();
            return Ok(QueryResult::from_rows(rows));
        }
        if sql.starts_with("SELECT") {
            let rows = params
                .iter()
                .filter_map(Value::as_int)
                .filter(|i| (1..=3).contains(i))
                .map(user_row)
                .collect();
            return Ok(QueryResult::from_rows(rows));
        }
        Ok(QueryResult::affected(1))
    }

    fn cached(settings: CacheSettings) -> (CachedStore, StatementLog, Arc<InMemoryCache>) {
        let (db, log) = scripted_manager(answer);
        let store = Arc::new(Store::new(db, users()));
        let cache = Arc::new(InMemoryCache::new());
        (CachedStore::new(store, cache.clone(), &settings), log, cache)
    }

    fn selects(log: &StatementLog) -> usize {
        log.count_matching("SELECT")
    }

    #[test]
    fn test_get_reads_through_once() {
        let (c, log, _) = cached(CacheSettings::default());
        let first = c.get(2).unwrap().unwrap();
        let second = c.get(2).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(selects(&log), 1);
        assert_eq!(c.stats().hits, 1);
        assert_eq!(c.stats().misses, 1);
    }

    #[test]
    fn test_missing_rows_are_cached() {
        let (c, log, _) = cached(CacheSettings::default());
        assert!(c.get(9).unwrap().is_none());
        assert!(c.get(9).unwrap().is_none());
        assert_eq!(selects(&log), 1);
    }

    #[test]
    fn test_get_multi_batches_misses_and_keeps_order() {
        let (c, log, _) = cached(CacheSettings::default());
        c.get(2).unwrap();
        log.clear();

        let idents: Vec<Vec<(&str, Value)>> =
            [3, 9, 2, 1].iter().map(|i| vec![("id", Value::Int(*i))]).collect();
        let out = c.get_multi(&idents, false).unwrap();
        let ids: Vec<Option<i64>> = out
            .iter()
            .map(|e| e.as_ref().map(|e| e.get_as::<i64>("id").unwrap()))
            .collect();
        assert_eq!(ids, vec![Some(3), None, Some(2), Some(1)]);
        assert_eq!(selects(&log), 1);
        assert!(log.sql()[0].contains("IN (?, ?, ?)"));

        let filtered = c.get_multi(&idents, true).unwrap();
        assert_eq!(filtered.len(), 3);
        assert_eq!(selects(&log), 1);
    }

    #[test]
    fn test_non_unique_get_by_falls_back_or_fails_in_strict_mode() {
        let (c, _, cache) = cached(CacheSettings::default());
        c.get_by(&[("age", Value::Int(21))]).unwrap();
        assert_eq!(c.stats().fallbacks, 1);
        assert!(cache.is_empty());

        let (strict, _, _) = cached(CacheSettings {
            strict: true,
            ..CacheSettings::default()
        });
        assert!(matches!(
            strict.get_by(&[("age", Value::Int(21))]),
            Err(OrmError::Cache(_))
        ));
    }

    #[test]
    fn test_get_multi_by_caches_id_list() {
        let (c, log, _) = cached(CacheSettings::default());
        let lookup = Lookup::new().filter_by("group_id", 1).order_by("-age").limit(2);
        let first = c.get_multi_by(&lookup).unwrap();
        assert_eq!(first.len(), 2);
        let before = selects(&log);

        let again = c.get_multi_by(&lookup).unwrap();
        assert_eq!(again, first);
        assert_eq!(selects(&log), before);
    }

    #[test]
    fn test_window_past_bound_reads_database() {
        let (c, log, _) = cached(CacheSettings {
            max_count: 2,
            ..CacheSettings::default()
        });
        let lookup = Lookup::new().filter_by("group_id", 1).start(1).limit(2);
        c.get_multi_by(&lookup).unwrap();
        c.get_multi_by(&lookup).unwrap();
        assert_eq!(selects(&log), 2);
        assert!(log.sql()[0].ends_with("LIMIT 2 OFFSET 1"));
        assert_eq!(c.stats().fallbacks, 2);
    }

    #[test]
    fn test_undeclared_order_is_not_cached() {
        let (c, _, cache) = cached(CacheSettings::default());
        c.get_multi_by(&Lookup::new().filter_by("group_id", 1).order_by("age"))
            .unwrap();
        assert!(cache.keys().iter().all(|k| !k.contains("suffix:ids")));
    }

    #[test]
    fn test_count_by_is_cached() {
        let (c, log, _) = cached(CacheSettings::default());
        assert_eq!(c.count_by(&[("group_id", Value::Int(1))]).unwrap(), 3);
        assert_eq!(c.count_by(&[("group_id", Value::Int(1))]).unwrap(), 3);
        assert_eq!(log.count_matching("SELECT COUNT(*)"), 1);
    }

    #[test]
    fn test_predicate_values_are_coerced_before_keying() {
        let (c, _, _) = cached(CacheSettings::default());
        let a = c.key(&c.normalize(&[("id", Value::Int(1))]).unwrap(), &KeySuffix::Row);
        let b = c.key(&c.normalize(&[("id", Value::from(1_i32))]).unwrap(), &KeySuffix::Row);
        assert_eq!(a, b);
        assert!(matches!(
            c.normalize(&[("nope", Value::Int(1))]),
            Err(OrmError::InvalidField(_))
        ));
    }
}
