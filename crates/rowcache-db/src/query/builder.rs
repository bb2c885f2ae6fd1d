//! The immutable statement builder.
//!
//! Every method on [`Query`] takes `&self` and returns a new `Query`, so a
//! partially built query can be branched and reused:
//!
//! ```
//! # use std::sync::Arc;
//! # use rowcache_db::schema::{FieldDef, FieldType, Schema};
//! # use rowcache_db::query::{Query, DatabaseBackendType};
//! # use rowcache_db::query::expr::col;
//! # let schema = Arc::new(Schema::builder("users")
//! #     .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
//! #     .field(FieldDef::new("age", FieldType::Integer))
//! #     .primary_key(&["id"]).build().unwrap());
//! let adults = Query::new(schema).filter(col("age").ge(18));
//! let oldest = adults.order_by("-age").limit(10);
//! let (sql, params) = oldest.to_sql(DatabaseBackendType::SQLite).unwrap();
//! assert_eq!(
//!     sql,
//!     "SELECT \"id\", \"age\" FROM \"users\" WHERE \"age\" >= ? ORDER BY \"age\" DESC LIMIT 10"
//! );
//! assert_eq!(params.len(), 1);
//! # assert!(adults.to_sql(DatabaseBackendType::SQLite).unwrap().0.ends_with("?"));
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rowcache_core::{OrmError, OrmResult};

use super::compiler::DatabaseBackendType;
use super::expr::Expr;
use super::ir::{Delete, JoinKind, Node, Select, Update};
use crate::entity::{Entity, FetchPosition};
use crate::schema::{OrderSignature, Schema};
use crate::transactions::ConnectionManager;
use crate::value::{FromValue, Value};

static NEXT_FETCH_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
enum Predicate {
    Field(String, Value),
    Expr(Expr),
}

#[derive(Debug, Clone)]
struct JoinSpec {
    kind: JoinKind,
    table: String,
    on: Option<Expr>,
}

/// One entry of a select list.
#[derive(Debug, Clone)]
pub enum Projection {
    /// Every field of a schema, materialized as one [`Entity`].
    Entity(Arc<Schema>),
    /// One field of the main table.
    Field(String),
    /// A computed expression.
    Expr(Expr),
}

/// One output slot of a projected row.
#[derive(Debug, Clone, PartialEq)]
pub enum Projected {
    /// A whole entity.
    Entity(Entity),
    /// A single value.
    Scalar(Value),
}

impl Projected {
    /// The entity, if this slot holds one.
    pub const fn as_entity(&self) -> Option<&Entity> {
        match self {
            Self::Entity(e) => Some(e),
            Self::Scalar(_) => None,
        }
    }

    /// The value, if this slot holds a scalar.
    pub const fn as_scalar(&self) -> Option<&Value> {
        match self {
            Self::Scalar(v) => Some(v),
            Self::Entity(_) => None,
        }
    }
}

/// A `SELECT` under construction for one schema.
#[derive(Debug, Clone)]
pub struct Query {
    schema: Arc<Schema>,
    predicates: Vec<Predicate>,
    joins: Vec<JoinSpec>,
    order_by: Vec<String>,
    group_by: Vec<Expr>,
    having: Option<Expr>,
    limit: Option<u64>,
    offset: Option<u64>,
    projections: Vec<Projection>,
    distinct: bool,
    for_update: bool,
}

impl Query {
    /// Selects every row of `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            predicates: Vec::new(),
            joins: Vec::new(),
            order_by: Vec::new(),
            group_by: Vec::new(),
            having: None,
            limit: None,
            offset: None,
            projections: Vec::new(),
            distinct: false,
            for_update: false,
        }
    }

    /// The main schema.
    pub const fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    fn with(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    // ── Mutators ─────────────────────────────────────────────────────

    /// Adds a predicate expression. Predicates are combined with `AND`.
    #[must_use]
    pub fn filter(&self, expr: Expr) -> Self {
        self.with(|q| q.predicates.push(Predicate::Expr(expr)))
    }

    /// Adds an equality predicate on a main-table field.
    #[must_use]
    pub fn filter_by(&self, field: &str, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.with(|q| q.predicates.push(Predicate::Field(field.to_string(), value)))
    }

    /// Adds equality predicates for each pair.
    #[must_use]
    pub fn filter_all<K: AsRef<str>>(&self, pairs: &[(K, Value)]) -> Self {
        self.with(|q| {
            for (field, value) in pairs {
                q.predicates
                    .push(Predicate::Field(field.as_ref().to_string(), value.clone()));
            }
        })
    }

    /// Joins another table.
    #[must_use]
    pub fn join(&self, kind: JoinKind, table: impl Into<String>, on: Expr) -> Self {
        let spec = JoinSpec {
            kind,
            table: table.into(),
            on: (kind != JoinKind::Cross).then_some(on),
        };
        self.with(|q| q.joins.push(spec))
    }

    /// Appends an order-by field; a leading `-` sorts descending.
    #[must_use]
    pub fn order_by(&self, spec: &str) -> Self {
        self.with(|q| q.order_by.push(spec.to_string()))
    }

    /// Appends an order-by signature such as `"-age,name"`.
    #[must_use]
    pub fn order_by_signature(&self, signature: &OrderSignature) -> Self {
        self.with(|q| {
            q.order_by
                .extend(signature.keys().iter().map(ToString::to_string));
        })
    }

    /// Appends a grouping expression.
    #[must_use]
    pub fn group_by(&self, expr: Expr) -> Self {
        self.with(|q| q.group_by.push(expr))
    }

    /// Sets the `HAVING` predicate.
    #[must_use]
    pub fn having(&self, expr: Expr) -> Self {
        self.with(|q| q.having = Some(expr))
    }

    /// Limits the number of rows.
    #[must_use]
    pub fn limit(&self, n: u64) -> Self {
        self.with(|q| q.limit = Some(n))
    }

    /// Skips leading rows.
    #[must_use]
    pub fn offset(&self, n: u64) -> Self {
        self.with(|q| q.offset = Some(n))
    }

    /// Replaces the select list.
    #[must_use]
    pub fn map(&self, projections: Vec<Projection>) -> Self {
        self.with(|q| q.projections = projections)
    }

    /// `SELECT DISTINCT`.
    #[must_use]
    pub fn distinct(&self) -> Self {
        self.with(|q| q.distinct = true)
    }

    /// Locks selected rows where the dialect supports it.
    #[must_use]
    pub fn for_update(&self) -> Self {
        self.with(|q| q.for_update = true)
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// The predicate as field equalities, if every predicate is a direct
    /// equality against a bare main-table field and nothing else shapes
    /// the result.
    pub fn field_predicate(&self) -> Option<BTreeMap<String, Value>> {
        if !self.joins.is_empty()
            || !self.group_by.is_empty()
            || self.having.is_some()
            || self.distinct
            || self.for_update
        {
            return None;
        }
        let mut map = BTreeMap::new();
        for predicate in &self.predicates {
            let (field, value) = match predicate {
                Predicate::Field(f, v) => (f.clone(), v.clone()),
                Predicate::Expr(e) => e.as_field_equality()?,
            };
            match map.get(&field) {
                Some(existing) if existing != &value => return None,
                _ => {
                    map.insert(field, value);
                }
            }
        }
        Some(map)
    }

    /// Whether the predicate names a primary or unique key exactly.
    pub fn is_unique(&self) -> bool {
        self.field_predicate().is_some_and(|p| {
            let fields: Vec<&str> = p.keys().map(String::as_str).collect();
            self.schema.is_row_signature(&fields)
        })
    }

    /// Whether the read-through cache can serve this query: the predicate
    /// names a declared key, any order is a declared order-by, and the
    /// select list is the whole entity.
    pub fn is_cacheable(&self) -> bool {
        let Some(predicate) = self.field_predicate() else {
            return false;
        };
        if !self.projections.is_empty() {
            return false;
        }
        let fields: Vec<&str> = predicate.keys().map(String::as_str).collect();
        if self.order_by.is_empty() && self.schema.is_row_signature(&fields) {
            return true;
        }
        if !self.schema.is_index_signature(&fields) {
            return false;
        }
        self.order_by.is_empty()
            || OrderSignature::parse(&self.order_by).is_ok_and(|o| self.schema.has_order_by(&o))
    }

    fn main_column(&self, name: &str) -> OrmResult<Node> {
        self.schema.require_field(name)?;
        Ok(Node::qualified(self.schema.table(), name))
    }

    fn qualify(&self, expr: &Expr) -> Node {
        let mut node = expr.node().clone();
        if !self.joins.is_empty() {
            qualify_bare_columns(&mut node, self.schema.table());
        }
        node
    }

    fn where_node(&self) -> OrmResult<Option<Node>> {
        let mut conds = Vec::with_capacity(self.predicates.len());
        for predicate in &self.predicates {
            conds.push(match predicate {
                Predicate::Field(field, Value::Null) => {
                    Node::postfix("IS NULL", self.main_column(field)?)
                }
                Predicate::Field(field, value) => {
                    Node::binary("=", self.main_column(field)?, Node::Value(value.clone()))
                }
                Predicate::Expr(expr) => self.qualify(expr),
            });
        }
        Ok(match conds.len() {
            0 => None,
            1 => conds.pop().map(|c| Node::Where(Box::new(c))),
            _ => Some(Node::Where(Box::new(Node::And(conds)))),
        })
    }

    fn from_node(&self) -> Node {
        let joins = self
            .joins
            .iter()
            .map(|j| Node::Join {
                kind: j.kind,
                target: Box::new(Node::Table(j.table.clone())),
                on: j.on.as_ref().map(|on| Box::new(Node::On(Box::new(self.qualify(on))))),
            })
            .collect();
        Node::From {
            source: Box::new(Node::Table(self.schema.table().to_string())),
            joins,
        }
    }

    fn order_node(&self) -> OrmResult<Option<Node>> {
        if self.order_by.is_empty() {
            return Ok(None);
        }
        let signature = OrderSignature::parse(&self.order_by)?;
        let mut items = Vec::with_capacity(signature.keys().len());
        for key in signature.keys() {
            if self.schema.field(&key.field).is_none() {
                return Err(OrmError::OrderBy(format!(
                    "'{}' has no field '{}' to order by",
                    self.schema.table(),
                    key.field
                )));
            }
            let column = Node::qualified(self.schema.table(), key.field.as_str());
            items.push(Node::postfix(if key.descending { "DESC" } else { "ASC" }, column));
        }
        Ok(Some(Node::OrderBy(items)))
    }

    fn limit_node(&self) -> Option<Node> {
        match (self.limit, self.offset) {
            (None, None | Some(0)) => None,
            (count, offset) => Some(Node::Limit {
                offset,
                count: count.unwrap_or(i64::MAX.unsigned_abs()),
            }),
        }
    }

    fn projection_nodes(&self) -> OrmResult<Vec<Node>> {
        if self.projections.is_empty() {
            return Ok(self.entity_columns(&self.schema));
        }
        let mut columns = Vec::new();
        for projection in &self.projections {
            match projection {
                Projection::Entity(schema) => columns.extend(self.entity_columns(schema)),
                Projection::Field(name) => columns.push(self.main_column(name)?),
                Projection::Expr(expr) => columns.push(self.qualify(expr)),
            }
        }
        Ok(columns)
    }

    fn entity_columns(&self, schema: &Schema) -> Vec<Node> {
        schema
            .fields()
            .iter()
            .map(|f| Node::qualified(schema.table(), f.name.as_str()))
            .collect()
    }

    /// Renders the `SELECT` tree.
    pub fn to_node(&self) -> OrmResult<Node> {
        Ok(Node::Select(Box::new(Select {
            distinct: self.distinct,
            columns: self.projection_nodes()?,
            from: Some(self.from_node()),
            where_clause: self.where_node()?,
            group_by: (!self.group_by.is_empty()).then(|| {
                Node::GroupBy(self.group_by.iter().map(|e| self.qualify(e)).collect())
            }),
            having: self
                .having
                .as_ref()
                .map(|h| Node::Having(Box::new(self.qualify(h)))),
            order_by: self.order_node()?,
            limit: self.limit_node(),
            for_update: self.for_update.then_some(Node::ForUpdate),
        })))
    }

    /// Renders and translates for `backend`.
    pub fn to_sql(&self, backend: DatabaseBackendType) -> OrmResult<(String, Vec<Value>)> {
        crate::query::SqlCompiler::new(backend).translate(&self.to_node()?)
    }

    fn count_node(&self) -> OrmResult<Node> {
        let count = Node::call("COUNT", vec![Node::Literal("*".into())]);
        if self.limit.is_some() || self.offset.is_some() || self.distinct || !self.group_by.is_empty() {
            let inner = self.with(|q| q.order_by.clear()).to_node()?;
            return Ok(Node::Select(Box::new(Select {
                columns: vec![count],
                from: Some(Node::From {
                    source: Box::new(Node::alias(Node::Bracket(Box::new(inner)), "sub")),
                    joins: vec![],
                }),
                ..Select::default()
            })));
        }
        Ok(Node::Select(Box::new(Select {
            columns: vec![count],
            from: Some(self.from_node()),
            where_clause: self.where_node()?,
            ..Select::default()
        })))
    }

    fn unique_where(&self, action: &str) -> OrmResult<Node> {
        if !self.is_unique() {
            return Err(OrmError::Expression(format!(
                "{action} on '{}' requires a primary or unique key predicate",
                self.schema.table()
            )));
        }
        self.where_node()?.ok_or_else(|| {
            OrmError::Expression(format!("{action} without a predicate"))
        })
    }

    /// Renders an `UPDATE` of the single row this query identifies.
    pub fn update_node(&self, assignments: &[(&str, Value)]) -> OrmResult<Node> {
        if assignments.is_empty() {
            return Err(OrmError::Expression("UPDATE with no assignments".to_string()));
        }
        let where_clause = self.unique_where("UPDATE")?;
        let set = assignments
            .iter()
            .map(|(field, value)| {
                self.schema.require_field(field)?;
                Ok((Node::column(*field), Node::Value(value.clone())))
            })
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(Node::Update(Box::new(Update {
            table: Node::Table(self.schema.table().to_string()),
            set: Node::Set(set),
            where_clause: Some(where_clause),
        })))
    }

    /// Renders a `DELETE` of the single row this query identifies.
    pub fn delete_node(&self) -> OrmResult<Node> {
        Ok(Node::Delete(Box::new(Delete {
            table: Node::Table(self.schema.table().to_string()),
            where_clause: Some(self.unique_where("DELETE")?),
        })))
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Fetches every matching entity.
    pub fn all(&self, db: &ConnectionManager) -> OrmResult<Vec<Entity>> {
        let rows = db.query(&self.with(|q| q.projections.clear()).to_node()?)?;
        let session = NEXT_FETCH_SESSION.fetch_add(1, Ordering::Relaxed);
        rows.into_iter()
            .enumerate()
            .map(|(index, row)| {
                let entity = Entity::from_values(self.schema.clone(), row.into_values())?;
                entity.set_fetch_position(FetchPosition { session, index });
                Ok(entity)
            })
            .collect()
    }

    /// Fetches the first matching entity.
    pub fn first(&self, db: &ConnectionManager) -> OrmResult<Option<Entity>> {
        Ok(self.limit(1).all(db)?.into_iter().next())
    }

    /// Fetches exactly one entity.
    pub fn get(&self, db: &ConnectionManager) -> OrmResult<Entity> {
        let mut found = self.limit(2).all(db)?;
        match found.len() {
            0 => Err(OrmError::DoesNotExist(format!(
                "No '{}' row matches the query",
                self.schema.table()
            ))),
            1 => Ok(found.remove(0)),
            _ => Err(OrmError::MultipleObjectsReturned(format!(
                "More than one '{}' row matches the query",
                self.schema.table()
            ))),
        }
    }

    /// Counts matching rows.
    pub fn count(&self, db: &ConnectionManager) -> OrmResult<i64> {
        let rows = db.query(&self.count_node()?)?;
        rows.first().map_or(Ok(0), |r| r.get_by_index::<i64>(0))
    }

    /// Whether any row matches.
    pub fn exists(&self, db: &ConnectionManager) -> OrmResult<bool> {
        let probe = self
            .map(vec![Projection::Expr(Expr::from_node(Node::Literal("1".into())))])
            .limit(1);
        Ok(!db.query(&probe.to_node()?)?.is_empty())
    }

    /// Fetches the values of one main-table field.
    pub fn values_of<T: FromValue>(&self, db: &ConnectionManager, field: &str) -> OrmResult<Vec<T>> {
        let rows = db.query(&self.map(vec![Projection::Field(field.to_string())]).to_node()?)?;
        rows.iter().map(|r| r.get_by_index::<T>(0)).collect()
    }

    /// Fetches rows shaped by the select list: each entity projection
    /// consumes one column per schema field, each other projection one
    /// column.
    pub fn rows(&self, db: &ConnectionManager) -> OrmResult<Vec<Vec<Projected>>> {
        let shape = if self.projections.is_empty() {
            vec![Projection::Entity(self.schema.clone())]
        } else {
            self.projections.clone()
        };
        let rows = db.query(&self.to_node()?)?;
        let session = NEXT_FETCH_SESSION.fetch_add(1, Ordering::Relaxed);

        let mut out = Vec::with_capacity(rows.len());
        for (index, row) in rows.into_iter().enumerate() {
            let mut values = row.into_values().into_iter();
            let mut slots = Vec::with_capacity(shape.len());
            for projection in &shape {
                match projection {
                    Projection::Entity(schema) => {
                        let taken: Vec<Value> = values.by_ref().take(schema.fields().len()).collect();
                        let entity = Entity::from_values(schema.clone(), taken)?;
                        entity.set_fetch_position(FetchPosition { session, index });
                        slots.push(Projected::Entity(entity));
                    }
                    Projection::Field(_) | Projection::Expr(_) => {
                        let value = values.next().ok_or_else(|| {
                            OrmError::Parse("Row is shorter than the select list".to_string())
                        })?;
                        slots.push(Projected::Scalar(value));
                    }
                }
            }
            out.push(slots);
        }
        Ok(out)
    }

    /// Updates the single row this query identifies, bypassing change
    /// tracking. Returns the number of rows changed.
    pub fn update(&self, db: &ConnectionManager, assignments: &[(&str, Value)]) -> OrmResult<u64> {
        Ok(db.execute_node(&self.update_node(assignments)?)?.rows_affected)
    }

    /// Deletes the single row this query identifies, bypassing change
    /// tracking. Returns the number of rows removed.
    pub fn delete(&self, db: &ConnectionManager) -> OrmResult<u64> {
        Ok(db.execute_node(&self.delete_node()?)?.rows_affected)
    }
}

/// Qualifies unqualified column references with `table`.
fn qualify_bare_columns(node: &mut Node, table: &str) {
    match node {
        Node::Column { table: t @ None, name } if name != "*" => *t = Some(table.to_string()),
        Node::BinaryOperate { left, right, .. } => {
            qualify_bare_columns(left, table);
            qualify_bare_columns(right, table);
        }
        Node::UnaryOperate { operand, .. } => qualify_bare_columns(operand, table),
        Node::And(items) | Node::Or(items) | Node::Series(items) => {
            for item in items {
                qualify_bare_columns(item, table);
            }
        }
        Node::Call { args, .. } => {
            for arg in args {
                qualify_bare_columns(arg, table);
            }
        }
        Node::Alias { node, .. } | Node::Bracket(node) => qualify_bare_columns(node, table),
        Node::If {
            cond,
            then,
            otherwise,
        } => {
            qualify_bare_columns(cond, table);
            qualify_bare_columns(then, table);
            qualify_bare_columns(otherwise, table);
        }
        _ => {}
    }
}
