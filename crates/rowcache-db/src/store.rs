//! Persistence of entities, with mutation subscribers.
//!
//! A [`Store`] writes one schema's entities through a
//! [`ConnectionManager`] and tells every registered
//! [`MutationSubscriber`], in registration order, about each insert, update
//! and delete once the statement has executed. Subscribers run on the
//! mutating thread, inside the caller's transaction if one is open.
//!
//! Inside a transaction each mutation also queues a rollback handler that
//! restores the entity's tracking state, so a retried block sees the values
//! it had before the failed attempt.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rowcache_core::logging::operation_span;
use rowcache_core::{OrmError, OrmResult};
use tracing::debug;

use crate::entity::{Entity, RowImage};
use crate::query::builder::Query;
use crate::query::ir::{Delete, Insert, Node, Update};
use crate::schema::Schema;
use crate::transactions::ConnectionManager;
use crate::value::Value;

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// A new row.
    Insert,
    /// Changed fields of an existing row.
    Update,
    /// A removed row.
    Delete,
}

/// One row mutation as seen by subscribers.
#[derive(Debug, Clone)]
pub struct Mutation {
    /// Kind of write.
    pub kind: MutationKind,
    /// Schema of the row.
    pub schema: Arc<Schema>,
    /// Persisted image before the write; `None` for inserts.
    pub before: Option<RowImage>,
    /// Image after the write; `None` for deletes.
    pub after: Option<RowImage>,
    /// Fields written. Every field for inserts and deletes.
    pub dirty: BTreeSet<String>,
}

impl Mutation {
    /// Whether the primary key differs between `before` and `after`.
    pub fn pk_changed(&self) -> bool {
        match (&self.before, &self.after) {
            (Some(before), Some(after)) => self
                .schema
                .primary_key()
                .iter()
                .any(|f| before.get(f) != after.get(f)),
            _ => true,
        }
    }
}

/// Receives every mutation a [`Store`] performs.
pub trait MutationSubscriber: Send + Sync {
    /// Called after the statement executed. An error is returned to the
    /// caller of the mutating operation.
    fn on_mutate(&self, db: &ConnectionManager, mutation: &Mutation) -> OrmResult<()>;
}

/// Writes and reads one schema's rows.
pub struct Store {
    db: Arc<ConnectionManager>,
    schema: Arc<Schema>,
    subscribers: RwLock<Vec<Arc<dyn MutationSubscriber>>>,
}

impl Store {
    /// A store for `schema` on `db`.
    pub fn new(db: Arc<ConnectionManager>, schema: Arc<Schema>) -> Self {
        Self {
            db,
            schema,
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// The schema.
    pub const fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The connection manager.
    pub const fn db(&self) -> &Arc<ConnectionManager> {
        &self.db
    }

    /// Appends a subscriber.
    pub fn subscribe(&self, subscriber: Arc<dyn MutationSubscriber>) {
        self.subscribers.write().push(subscriber);
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn notify(&self, mutation: &Mutation) -> OrmResult<()> {
        let subscribers = self.subscribers.read().clone();
        for subscriber in subscribers {
            subscriber.on_mutate(&self.db, mutation)?;
        }
        Ok(())
    }

    fn check_schema(&self, entity: &Entity) -> OrmResult<()> {
        if entity.schema().table() == self.schema.table() {
            Ok(())
        } else {
            Err(OrmError::Expression(format!(
                "'{}' entity given to the '{}' store",
                entity.schema().table(),
                self.schema.table()
            )))
        }
    }

    fn guard_rollback(&self, entity: &Entity) {
        if self.db.in_transaction() {
            let saved = entity.checkpoint();
            let handle = entity.clone();
            self.db.on_rollback(move || {
                handle.restore(&saved);
                Ok(())
            });
        }
    }

    /// A query over this store's schema.
    pub fn query(&self) -> Query {
        Query::new(self.schema.clone())
    }

    /// Loads the first row matching every field equality, from the
    /// database.
    pub fn get_raw(&self, predicate: &[(&str, Value)]) -> OrmResult<Option<Entity>> {
        self.query().filter_all(predicate).first(&self.db)
    }

    /// Inserts a new row and records the generated primary key.
    pub fn insert(&self, entity: &Entity) -> OrmResult<()> {
        self.check_schema(entity)?;
        if entity.is_persisted() {
            return Err(OrmError::Expression(format!(
                "'{}' entity is already persisted",
                self.schema.table()
            )));
        }
        let span = operation_span("insert", self.schema.table());
        let _guard = span.enter();

        let image = entity.image();
        let generated = self
            .schema
            .single_pk()
            .and_then(|pk| self.schema.field(pk))
            .filter(|f| f.auto_increment && image.get(&f.name).map_or(true, Value::is_null))
            .map(|f| f.name.clone());

        let (columns, values): (Vec<Node>, Vec<Node>) = self
            .schema
            .fields()
            .iter()
            .filter(|f| Some(&f.name) != generated.as_ref())
            .map(|f| {
                let value = image.get(&f.name).cloned().unwrap_or(Value::Null);
                (Node::column(f.name.as_str()), Node::Value(value))
            })
            .unzip();
        let values = if columns.is_empty() { vec![] } else { vec![values] };
        let node = Node::Insert(Box::new(Insert {
            table: Node::Table(self.schema.table().to_string()),
            columns,
            values: Node::Values(values),
            returning: generated
                .as_ref()
                .map(|pk| Node::Returning(vec![Node::column(pk.as_str())])),
        }));

        self.guard_rollback(entity);
        let result = self.db.execute_node(&node)?;
        if let Some(pk) = &generated {
            let id = result
                .rows
                .first()
                .and_then(|r| r.values().first())
                .and_then(Value::as_int)
                .or(result.last_insert_id)
                .ok_or_else(|| {
                    OrmError::DataBase(format!(
                        "Insert into '{}' reported no generated key",
                        self.schema.table()
                    ))
                })?;
            entity.set(pk, id)?;
        }
        entity.mark_saved();
        debug!(pk = ?entity.pk_values(), "Inserted row");

        self.notify(&Mutation {
            kind: MutationKind::Insert,
            schema: self.schema.clone(),
            before: None,
            after: Some(entity.image()),
            dirty: self.schema.field_names().into_iter().map(String::from).collect(),
        })
    }

    fn pk_where(&self, snapshot: &RowImage) -> OrmResult<Node> {
        let mut conds = self
            .schema
            .primary_key()
            .iter()
            .map(|f| {
                let value = snapshot.get(f).cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    return Err(OrmError::Expression(format!(
                        "'{}' row has no value for primary key field '{f}'",
                        self.schema.table()
                    )));
                }
                Ok(Node::binary("=", Node::column(f.as_str()), Node::Value(value)))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        let predicate = if conds.len() == 1 {
            conds.remove(0)
        } else {
            Node::And(conds)
        };
        Ok(Node::Where(Box::new(predicate)))
    }

    fn persisted_snapshot(&self, entity: &Entity, action: &str) -> OrmResult<RowImage> {
        self.check_schema(entity)?;
        entity.snapshot().ok_or_else(|| {
            OrmError::Expression(format!(
                "Cannot {action} an unsaved '{}' entity",
                self.schema.table()
            ))
        })
    }

    /// Writes the dirty fields of a persisted entity. Returns `false`
    /// without touching the database when nothing is dirty.
    pub fn update(&self, entity: &Entity) -> OrmResult<bool> {
        let before = self.persisted_snapshot(entity, "update")?;
        let dirty = entity.dirty_fields();
        if dirty.is_empty() {
            return Ok(false);
        }
        let span = operation_span("update", self.schema.table());
        let _guard = span.enter();

        let after = entity.image();
        let set = dirty
            .iter()
            .map(|f| {
                (
                    Node::column(f.as_str()),
                    Node::Value(after.get(f).cloned().unwrap_or(Value::Null)),
                )
            })
            .collect();
        let node = Node::Update(Box::new(Update {
            table: Node::Table(self.schema.table().to_string()),
            set: Node::Set(set),
            where_clause: Some(self.pk_where(&before)?),
        }));

        self.guard_rollback(entity);
        if self.db.execute_node(&node)?.rows_affected == 0 {
            return Err(OrmError::DoesNotExist(format!(
                "'{}' row to update no longer exists",
                self.schema.table()
            )));
        }
        entity.mark_saved();
        debug!(fields = ?dirty, "Updated row");

        self.notify(&Mutation {
            kind: MutationKind::Update,
            schema: self.schema.clone(),
            before: Some(before),
            after: Some(after),
            dirty,
        })?;
        Ok(true)
    }

    /// Deletes a persisted entity's row.
    pub fn delete(&self, entity: &Entity) -> OrmResult<()> {
        let before = self.persisted_snapshot(entity, "delete")?;
        let span = operation_span("delete", self.schema.table());
        let _guard = span.enter();

        let node = Node::Delete(Box::new(Delete {
            table: Node::Table(self.schema.table().to_string()),
            where_clause: Some(self.pk_where(&before)?),
        }));
        self.guard_rollback(entity);
        let affected = self.db.execute_node(&node)?.rows_affected;
        entity.mark_deleted();
        debug!(affected, "Deleted row");

        self.notify(&Mutation {
            kind: MutationKind::Delete,
            schema: self.schema.clone(),
            before: Some(before),
            after: None,
            dirty: self.schema.field_names().into_iter().map(String::from).collect(),
        })
    }

    fn load_unique(&self, predicate: &[(&str, Value)]) -> OrmResult<Entity> {
        let fields: Vec<&str> = predicate.iter().map(|(f, _)| *f).collect();
        if !self.schema.is_row_signature(&fields) {
            return Err(OrmError::Expression(format!(
                "{fields:?} is not a primary or unique key of '{}'",
                self.schema.table()
            )));
        }
        self.get_raw(predicate)?.ok_or_else(|| {
            OrmError::DoesNotExist(format!(
                "No '{}' row matches {fields:?}",
                self.schema.table()
            ))
        })
    }

    /// Loads the row named by a primary or unique key, applies
    /// `assignments` and saves it through the tracked path.
    pub fn update_by(
        &self,
        predicate: &[(&str, Value)],
        assignments: &[(&str, Value)],
    ) -> OrmResult<Entity> {
        let entity = self.load_unique(predicate)?;
        for (field, value) in assignments {
            entity.set(field, value.clone())?;
        }
        self.update(&entity)?;
        Ok(entity)
    }

    /// Deletes the row named by a primary or unique key.
    pub fn delete_by(&self, predicate: &[(&str, Value)]) -> OrmResult<Entity> {
        let entity = self.load_unique(predicate)?;
        self.delete(&entity)?;
        Ok(entity)
    }

    /// Creates the table and its indexes.
    pub fn create_table(&self) -> OrmResult<()> {
        let (sql, _) = self.db.compiler().translate(&self.schema.create_table_node())?;
        self.db.execute_script(&sql)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("table", &self.schema.table())
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::QueryResult;
    use crate::schema::{FieldDef, FieldType};
    use crate::testing::scripted_manager;
    use crate::value::Row;
    use parking_lot::Mutex;

    fn users() -> Arc<Schema> {
        Arc::new(
            Schema::builder("users")
                .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
                .field(FieldDef::new("email", FieldType::Char).length(120))
                .field(FieldDef::new("age", FieldType::Integer).default(0))
                .primary_key(&["id"])
                .unique_key(&["email"])
                .build()
                .unwrap(),
        )
    }

    fn answer(sql: &str, _params: &[Value]) -> OrmResult<QueryResult> {
        if sql.starts_with("INSERT") {
            return Ok(QueryResult {
                rows_affected: 1,
                last_insert_id: Some(42),
                ..QueryResult::default()
            });
        }
        if sql.starts_with("SELECT") {
            return Ok(QueryResult::from_rows(vec![Row::new(
                vec!["id".into(), "email".into(), "age".into()],
                vec![Value::Int(7), "a@b.c".into(), Value::Int(30)],
            )]));
        }
        Ok(QueryResult::affected(1))
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Mutation>>);

    impl MutationSubscriber for Recorder {
        fn on_mutate(&self, _db: &ConnectionManager, mutation: &Mutation) -> OrmResult<()> {
            self.0.lock().push(mutation.clone());
            Ok(())
        }
    }

    fn store() -> (Store, crate::testing::StatementLog, Arc<Recorder>) {
        let (db, log) = scripted_manager(answer);
        let store = Store::new(db, users());
        let recorder = Arc::new(Recorder::default());
        store.subscribe(recorder.clone());
        (store, log, recorder)
    }

    #[test]
    fn test_insert_assigns_generated_key() {
        let (store, log, recorder) = store();
        let e = Entity::new(users());
        e.set("email", "x@y.z").unwrap();
        store.insert(&e).unwrap();

        assert_eq!(e.get("id").unwrap(), Value::Int(42));
        assert!(e.is_persisted());
        assert!(!e.is_dirty());
        assert_eq!(
            log.sql(),
            vec!["INSERT INTO \"users\" (\"email\", \"age\") VALUES (?, ?)".to_string()]
        );
        let seen = recorder.0.lock();
        assert_eq!(seen[0].kind, MutationKind::Insert);
        assert!(seen[0].before.is_none());
    }

    #[test]
    fn test_update_writes_only_dirty_fields() {
        let (store, log, recorder) = store();
        let e = store.get_raw(&[("id", Value::Int(7))]).unwrap().unwrap();
        log.clear();
        e.set("age", 31).unwrap();
        assert!(store.update(&e).unwrap());

        let entries = log.entries();
        assert_eq!(entries[0].0, "UPDATE \"users\" SET \"age\" = ? WHERE \"id\" = ?");
        assert_eq!(entries[0].1, vec![Value::Int(31), Value::Int(7)]);
        let seen = recorder.0.lock();
        assert_eq!(seen[0].dirty, BTreeSet::from(["age".to_string()]));
        assert!(!seen[0].pk_changed());
    }

    #[test]
    fn test_clean_update_is_a_no_op() {
        let (store, log, recorder) = store();
        let e = store.get_raw(&[("id", Value::Int(7))]).unwrap().unwrap();
        log.clear();
        assert!(!store.update(&e).unwrap());
        assert!(log.sql().is_empty());
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_update_of_missing_row() {
        let (db, _log) = scripted_manager(|sql, params| {
            if sql.starts_with("UPDATE") {
                Ok(QueryResult::affected(0))
            } else {
                answer(sql, params)
            }
        });
        let store = Store::new(db, users());
        let e = store.get_raw(&[("id", Value::Int(7))]).unwrap().unwrap();
        e.set("age", 1).unwrap();
        assert!(matches!(store.update(&e), Err(OrmError::DoesNotExist(_))));
    }

    #[test]
    fn test_update_by_requires_unique_key() {
        let (store, _log, _) = store();
        assert!(matches!(
            store.update_by(&[("age", Value::Int(30))], &[("age", Value::Int(1))]),
            Err(OrmError::Expression(_))
        ));
        let e = store
            .update_by(&[("email", "a@b.c".into())], &[("age", Value::Int(1))])
            .unwrap();
        assert_eq!(e.get("age").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_delete_reports_before_image() {
        let (store, log, recorder) = store();
        let e = store.delete_by(&[("id", Value::Int(7))]).unwrap();
        assert!(!e.is_persisted());
        assert!(log.sql().contains(&"DELETE FROM \"users\" WHERE \"id\" = ?".to_string()));
        let seen = recorder.0.lock();
        assert_eq!(seen[0].kind, MutationKind::Delete);
        assert_eq!(seen[0].before.as_ref().unwrap()["email"], Value::from("a@b.c"));
        assert!(seen[0].after.is_none());
    }

    #[test]
    fn test_rollback_restores_entity_state() {
        let (store, _log, _) = store();
        let e = store.get_raw(&[("id", Value::Int(7))]).unwrap().unwrap();
        e.set("age", 99).unwrap();

        let result: OrmResult<()> = store.db().atomic(|_| {
            store.update(&e)?;
            Err(OrmError::Validation(rowcache_core::ValidationError::new("no", "invalid")))
        });
        assert!(result.is_err());
        assert!(e.dirty_fields().contains("age"));
        assert_eq!(e.snapshot().unwrap()["age"], Value::Int(30));
    }

    #[test]
    fn test_foreign_entity_rejected() {
        let (store, _log, _) = store();
        let other = Arc::new(
            Schema::builder("groups")
                .field(FieldDef::new("id", FieldType::Integer))
                .primary_key(&["id"])
                .build()
                .unwrap(),
        );
        assert!(matches!(
            store.insert(&Entity::new(other)),
            Err(OrmError::Expression(_))
        ));
    }
}
