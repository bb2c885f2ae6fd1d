//! Dynamic row instances with dirty-field tracking.
//!
//! An [`Entity`] holds one value per schema field plus the image last
//! persisted to (or loaded from) the database. Every [`Entity::set`] adds
//! the field to the dirty set, whether or not the value changed; saving
//! clears it. Clones share state, so a rollback handler holding a clone can
//! restore the caller's instance.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rowcache_core::{OrmError, OrmResult};

use crate::schema::{FieldDef, FieldType, Schema};
use crate::value::{FromValue, Row, Value};

/// A row as a field-name to value map.
pub type RowImage = BTreeMap<String, Value>;

/// Where a fetched entity sits in the result of one query call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPosition {
    /// Identifier of the query call.
    pub session: u64,
    /// Zero-based row index within that call.
    pub index: usize,
}

#[derive(Debug, Clone)]
struct EntityState {
    values: Vec<Value>,
    snapshot: Option<Vec<Value>>,
    dirty: BTreeSet<String>,
    fetch: Option<FetchPosition>,
}

/// Saved entity state, restorable with [`Entity::restore`].
#[derive(Debug, Clone)]
pub struct Checkpoint(EntityState);

/// One row of a schema, with change tracking.
#[derive(Clone)]
pub struct Entity {
    schema: Arc<Schema>,
    state: Arc<Mutex<EntityState>>,
}

/// Normalizes a driver value to the field's semantic type. Values that do
/// not convert are kept as they are.
pub fn coerce_value(field: &FieldDef, value: Value) -> Value {
    match (field.field_type, value) {
        (_, Value::Null) => Value::Null,
        (FieldType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
        (FieldType::Float | FieldType::Decimal { .. }, Value::Int(i)) => Value::Float(i as f64),
        (FieldType::Uuid, Value::String(s)) => s
            .parse()
            .map_or_else(|_| Value::String(s), Value::Uuid),
        (FieldType::DateTime, Value::String(s)) => {
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f"))
                .map_or_else(|_| Value::String(s), Value::DateTime)
        }
        (FieldType::Date, Value::String(s)) => chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map_or_else(|_| Value::String(s), Value::Date),
        (FieldType::Time, Value::String(s)) => {
            chrono::NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                .map_or_else(|_| Value::String(s), Value::Time)
        }
        (FieldType::Json, Value::String(s)) => serde_json::from_str(&s)
            .map_or_else(|_| Value::String(s), Value::Json),
        (_, v) => v,
    }
}

impl Entity {
    /// A fresh, unsaved entity holding each field's default.
    pub fn new(schema: Arc<Schema>) -> Self {
        let values = schema.fields().iter().map(FieldDef::initial_value).collect();
        Self::with_state(schema, values, None)
    }

    fn with_state(schema: Arc<Schema>, values: Vec<Value>, snapshot: Option<Vec<Value>>) -> Self {
        Self {
            schema,
            state: Arc::new(Mutex::new(EntityState {
                values,
                snapshot,
                dirty: BTreeSet::new(),
                fetch: None,
            })),
        }
    }

    /// A persisted entity from values in schema field order.
    pub fn from_values(schema: Arc<Schema>, values: Vec<Value>) -> OrmResult<Self> {
        if values.len() != schema.fields().len() {
            return Err(OrmError::Parse(format!(
                "'{}' has {} fields but {} values were given",
                schema.table(),
                schema.fields().len(),
                values.len()
            )));
        }
        let values: Vec<Value> = schema
            .fields()
            .iter()
            .zip(values)
            .map(|(f, v)| coerce_value(f, v))
            .collect();
        Ok(Self::with_state(schema, values.clone(), Some(values)))
    }

    /// A persisted entity from a result row, matched by column name.
    pub fn from_row(schema: Arc<Schema>, row: &Row) -> OrmResult<Self> {
        let values = schema
            .fields()
            .iter()
            .map(|f| {
                row.get_value(&f.name).cloned().ok_or_else(|| {
                    OrmError::InvalidField(format!(
                        "Column '{}' of '{}' missing from row",
                        f.name,
                        schema.table()
                    ))
                })
            })
            .collect::<OrmResult<Vec<_>>>()?;
        Self::from_values(schema, values)
    }

    /// A persisted entity from a cached payload.
    pub fn from_payload(schema: Arc<Schema>, payload: &serde_json::Value) -> OrmResult<Self> {
        let mut image: RowImage = serde_json::from_value(payload.clone())?;
        let values = schema
            .fields()
            .iter()
            .map(|f| image.remove(&f.name).unwrap_or(Value::Null))
            .collect();
        Self::from_values(schema, values)
    }

    /// The entity's current values as a cache payload.
    pub fn to_payload(&self) -> OrmResult<serde_json::Value> {
        Ok(serde_json::to_value(self.image())?)
    }

    /// The schema this entity belongs to.
    pub const fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The current value of `field`.
    pub fn get(&self, field: &str) -> OrmResult<Value> {
        let idx = self.index_of(field)?;
        Ok(self.state.lock().values[idx].clone())
    }

    /// The current value of `field`, converted.
    pub fn get_as<T: FromValue>(&self, field: &str) -> OrmResult<T> {
        T::from_value(&self.get(field)?)
    }

    /// Writes `field` and marks it dirty.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> OrmResult<()> {
        let idx = self.index_of(field)?;
        let value = coerce_value(&self.schema.fields()[idx], value.into());
        let mut state = self.state.lock();
        state.values[idx] = value;
        state.dirty.insert(field.to_string());
        Ok(())
    }

    fn index_of(&self, field: &str) -> OrmResult<usize> {
        self.schema.field_index(field).ok_or_else(|| {
            OrmError::InvalidField(format!(
                "'{}' has no field '{field}'",
                self.schema.table()
            ))
        })
    }

    /// Values of the primary-key fields, in key order.
    pub fn pk_values(&self) -> Vec<Value> {
        let state = self.state.lock();
        self.schema
            .primary_key()
            .iter()
            .filter_map(|f| self.schema.field_index(f))
            .map(|i| state.values[i].clone())
            .collect()
    }

    /// Current values by field name.
    pub fn image(&self) -> RowImage {
        let state = self.state.lock();
        self.image_of(&state.values)
    }

    /// The last persisted values, if the entity has been saved or loaded.
    pub fn snapshot(&self) -> Option<RowImage> {
        let state = self.state.lock();
        state.snapshot.as_ref().map(|s| self.image_of(s))
    }

    fn image_of(&self, values: &[Value]) -> RowImage {
        self.schema
            .fields()
            .iter()
            .zip(values)
            .map(|(f, v)| (f.name.clone(), v.clone()))
            .collect()
    }

    /// Fields written since the last save.
    pub fn dirty_fields(&self) -> BTreeSet<String> {
        self.state.lock().dirty.clone()
    }

    /// Whether any field was written since the last save.
    pub fn is_dirty(&self) -> bool {
        !self.state.lock().dirty.is_empty()
    }

    /// Whether the entity exists in the database as far as this instance
    /// knows.
    pub fn is_persisted(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    /// Records the current values as persisted and clears the dirty set.
    pub fn mark_saved(&self) {
        let mut state = self.state.lock();
        state.snapshot = Some(state.values.clone());
        state.dirty.clear();
    }

    /// Records that the row no longer exists.
    pub fn mark_deleted(&self) {
        self.state.lock().snapshot = None;
    }

    /// Captures the full tracking state.
    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint(self.state.lock().clone())
    }

    /// Restores state captured by [`checkpoint`](Self::checkpoint).
    pub fn restore(&self, checkpoint: &Checkpoint) {
        *self.state.lock() = checkpoint.0.clone();
    }

    /// Position of this entity in the query call that produced it.
    pub fn fetch_position(&self) -> Option<FetchPosition> {
        self.state.lock().fetch
    }

    pub(crate) fn set_fetch_position(&self, position: FetchPosition) {
        self.state.lock().fetch = Some(position);
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.schema.table() == other.schema.table() && self.image() == other.image()
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Entity")
            .field("table", &self.schema.table())
            .field("values", &self.image_of(&state.values))
            .field("dirty", &state.dirty)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Arc<Schema> {
        Arc::new(
            Schema::builder("users")
                .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
                .field(FieldDef::new("name", FieldType::Char).length(40).default(""))
                .field(FieldDef::new("active", FieldType::Boolean).default(true))
                .primary_key(&["id"])
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_new_entity_uses_defaults() {
        let e = Entity::new(users());
        assert_eq!(e.get("id").unwrap(), Value::Null);
        assert_eq!(e.get("active").unwrap(), Value::Bool(true));
        assert!(!e.is_persisted());
        assert!(!e.is_dirty());
    }

    #[test]
    fn test_set_marks_dirty_even_when_unchanged() {
        let e = Entity::from_values(users(), vec![1.into(), "ann".into(), true.into()]).unwrap();
        e.set("name", "ann").unwrap();
        assert_eq!(e.dirty_fields(), BTreeSet::from(["name".to_string()]));
        e.mark_saved();
        assert!(!e.is_dirty());
    }

    #[test]
    fn test_unknown_field_is_invalid() {
        let e = Entity::new(users());
        assert!(matches!(e.set("nope", 1), Err(OrmError::InvalidField(_))));
        assert!(matches!(e.get("nope"), Err(OrmError::InvalidField(_))));
    }

    #[test]
    fn test_driver_values_are_coerced() {
        let e = Entity::from_values(users(), vec![1.into(), "ann".into(), Value::Int(0)]).unwrap();
        assert_eq!(e.get("active").unwrap(), Value::Bool(false));
        assert!(!e.get_as::<bool>("active").unwrap());
    }

    #[test]
    fn test_payload_round_trip_preserves_variants() {
        let e = Entity::from_values(users(), vec![7.into(), "bo".into(), true.into()]).unwrap();
        let back = Entity::from_payload(users(), &e.to_payload().unwrap()).unwrap();
        assert_eq!(back, e);
        assert!(back.is_persisted());
    }

    #[test]
    fn test_checkpoint_restore_shared_through_clones() {
        let e = Entity::from_values(users(), vec![1.into(), "ann".into(), true.into()]).unwrap();
        e.set("name", "bob").unwrap();
        let saved = e.checkpoint();
        let handle = e.clone();
        e.mark_saved();
        assert!(!e.is_dirty());

        handle.restore(&saved);
        assert!(e.dirty_fields().contains("name"));
        assert_eq!(e.snapshot().unwrap()["name"], Value::from("ann"));
    }

    #[test]
    fn test_from_row_requires_every_column() {
        let row = Row::new(vec!["id".into()], vec![Value::Int(1)]);
        assert!(matches!(
            Entity::from_row(users(), &row),
            Err(OrmError::InvalidField(_))
        ));
    }
}
