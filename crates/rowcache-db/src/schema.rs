//! Schema descriptors and the schema registry.
//!
//! A [`Schema`] is built once through [`SchemaBuilder`] and is immutable after
//! that. It carries the ordered field list plus the key metadata the cache
//! needs: the primary key, unique keys, index keys (each of which also serves
//! its left-prefixes), and the order-by signatures that have a supporting
//! index.
//!
//! Fields refer back to their owning schema through a [`SchemaId`] handle into
//! a [`SchemaRegistry`] rather than through a pointer.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rowcache_core::{OrmError, OrmResult, ValidationError};

use crate::query::ir::{KeyKind, Node};
use crate::value::Value;

/// The semantic type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FieldType {
    /// 16-bit signed integer.
    SmallInteger,
    /// 32-bit signed integer.
    Integer,
    /// 64-bit signed integer.
    BigInteger,
    /// 64-bit floating-point number.
    Float,
    /// Fixed-precision decimal number.
    Decimal {
        /// Maximum total digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Boolean.
    Boolean,
    /// Bounded string; the bound comes from [`FieldDef::length`].
    Char,
    /// Unbounded text.
    Text,
    /// Date without time.
    Date,
    /// Date and time.
    DateTime,
    /// Time without date.
    Time,
    /// UUID.
    Uuid,
    /// Raw binary data.
    Binary,
    /// JSON document.
    Json,
}

impl FieldType {
    /// Returns `true` for integer types that may carry auto-increment.
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::SmallInteger | Self::Integer | Self::BigInteger)
    }
}

/// Handle to a schema registered in a [`SchemaRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(pub usize);

/// A single column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Column name.
    pub name: String,
    /// Semantic type.
    pub field_type: FieldType,
    /// Maximum length for `Char` and `Binary` columns.
    pub length: Option<usize>,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Default value for new rows.
    pub default: Option<Value>,
    /// Whether the database generates the value on insert.
    pub auto_increment: bool,
    /// Owning schema, set on registration.
    pub owner: Option<SchemaId>,
}

impl FieldDef {
    /// Creates a non-null field with no default.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            length: None,
            nullable: false,
            default: None,
            auto_increment: false,
            owner: None,
        }
    }

    /// Sets the maximum length.
    #[must_use]
    pub const fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    /// Allows NULL values.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Marks the field as database-generated.
    #[must_use]
    pub const fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// The value a fresh entity starts with.
    pub fn initial_value(&self) -> Value {
        self.default.clone().unwrap_or(Value::Null)
    }
}

// ── Order-by signatures ────────────────────────────────────────────────

/// One signed component of an order-by signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderKey {
    /// Field name.
    pub field: String,
    /// `true` for `-field`.
    pub descending: bool,
}

impl OrderKey {
    /// Parses `"name"` or `"-name"`.
    pub fn parse(spec: &str) -> OrmResult<Self> {
        let spec = spec.trim();
        let (field, descending) = match spec.strip_prefix('-') {
            Some(rest) => (rest, true),
            None => (spec.strip_prefix('+').unwrap_or(spec), false),
        };
        if field.is_empty() || field.contains(|c: char| c.is_whitespace() || c == '-') {
            return Err(OrmError::OrderBy(format!("Malformed order-by component '{spec}'")));
        }
        Ok(Self {
            field: field.to_string(),
            descending,
        })
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.descending {
            write!(f, "-{}", self.field)
        } else {
            write!(f, "{}", self.field)
        }
    }
}

/// An ordered tuple of signed fields, e.g. `(-age, name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderSignature(Vec<OrderKey>);

impl OrderSignature {
    /// Builds a signature from components like `["-age", "name"]`.
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> OrmResult<Self> {
        if specs.is_empty() {
            return Err(OrmError::OrderBy("Order-by signature is empty".to_string()));
        }
        specs
            .iter()
            .map(|s| OrderKey::parse(s.as_ref()))
            .collect::<OrmResult<Vec<_>>>()
            .map(Self)
    }

    /// Parses the comma-separated form, e.g. `"-age,name"`.
    pub fn parse_str(spec: &str) -> OrmResult<Self> {
        let parts: Vec<&str> = spec.split(',').collect();
        Self::parse(&parts)
    }

    /// The signed components.
    pub fn keys(&self) -> &[OrderKey] {
        &self.0
    }

    /// Returns `true` if `field` appears, ascending or descending.
    pub fn mentions(&self, field: &str) -> bool {
        self.0.iter().any(|k| k.field == field)
    }
}

impl fmt::Display for OrderSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{key}")?;
        }
        Ok(())
    }
}

// ── Schema ─────────────────────────────────────────────────────────────

/// The immutable descriptor of one entity type.
#[derive(Debug, Clone)]
pub struct Schema {
    id: Option<SchemaId>,
    table: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
    unique_keys: Vec<Vec<String>>,
    index_keys: Vec<Vec<String>>,
    order_bys: Vec<OrderSignature>,
}

fn signature_of<S: AsRef<str>>(fields: &[S]) -> Vec<String> {
    let set: BTreeSet<&str> = fields.iter().map(AsRef::as_ref).collect();
    set.into_iter().map(str::to_string).collect()
}

impl Schema {
    /// Starts a builder for `table`.
    pub fn builder(table: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(table)
    }

    /// The registry handle, if registered.
    pub const fn id(&self) -> Option<SchemaId> {
        self.id
    }

    /// The table name.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Fields in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Position of a field in declaration order.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Errors with `InvalidField` unless `name` is declared.
    pub fn require_field(&self, name: &str) -> OrmResult<&FieldDef> {
        self.field(name).ok_or_else(|| {
            OrmError::InvalidField(format!("'{}' has no field '{name}'", self.table))
        })
    }

    /// The primary key fields, in declaration order.
    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    /// The single primary key field, when the key is not composite.
    pub fn single_pk(&self) -> Option<&str> {
        match self.primary_key.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }

    /// Declared unique keys.
    pub fn unique_keys(&self) -> &[Vec<String>] {
        &self.unique_keys
    }

    /// Declared index keys (not expanded).
    pub fn index_keys(&self) -> &[Vec<String>] {
        &self.index_keys
    }

    /// Declared order-by signatures.
    pub fn order_bys(&self) -> &[OrderSignature] {
        &self.order_bys
    }

    /// Sorted field signatures that identify at most one row: the primary
    /// key first, then every unique key.
    pub fn row_signatures(&self) -> Vec<Vec<String>> {
        let mut out = vec![signature_of(&self.primary_key)];
        for key in &self.unique_keys {
            let sig = signature_of(key);
            if !out.contains(&sig) {
                out.push(sig);
            }
        }
        out
    }

    /// Sorted field signatures served by an index: every left-prefix of
    /// every index key.
    pub fn index_signatures(&self) -> Vec<Vec<String>> {
        let mut out: Vec<Vec<String>> = Vec::new();
        for key in &self.index_keys {
            for end in 1..=key.len() {
                let sig = signature_of(&key[..end]);
                if !out.contains(&sig) {
                    out.push(sig);
                }
            }
        }
        out
    }

    /// Returns `true` if the field set names exactly one row key.
    pub fn is_row_signature<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        let sig = signature_of(fields);
        sig.len() == fields.len() && self.row_signatures().contains(&sig)
    }

    /// Returns `true` if the field set is served by a declared index key.
    pub fn is_index_signature<S: AsRef<str>>(&self, fields: &[S]) -> bool {
        let sig = signature_of(fields);
        sig.len() == fields.len() && self.index_signatures().contains(&sig)
    }

    /// Returns `true` if the order-by signature is declared.
    pub fn has_order_by(&self, order: &OrderSignature) -> bool {
        self.order_bys.contains(order)
    }

    /// Builds the `CREATE_TABLE` statement for this schema.
    pub fn create_table_node(&self) -> Node {
        let mut defs: Vec<Node> = self.fields.iter().cloned().map(Node::Field).collect();
        defs.push(Node::Key {
            kind: KeyKind::Primary,
            name: None,
            columns: self.primary_key.clone(),
        });
        for key in &self.unique_keys {
            defs.push(Node::Key {
                kind: KeyKind::Unique,
                name: Some(format!("{}_{}_uniq", self.table, key.join("_"))),
                columns: key.clone(),
            });
        }
        for key in &self.index_keys {
            defs.push(Node::Key {
                kind: KeyKind::Index,
                name: Some(format!("{}_{}_idx", self.table, key.join("_"))),
                columns: key.clone(),
            });
        }
        Node::CreateTable {
            table: self.table.clone(),
            definition: Box::new(Node::CreateDefinition(defs)),
            options: Some(Box::new(Node::TableOptions(vec![
                ("ENGINE".to_string(), "InnoDB".to_string()),
                ("DEFAULT CHARSET".to_string(), "utf8mb4".to_string()),
            ]))),
        }
    }
}

/// Builder producing a validated [`Schema`].
///
/// # Examples
///
/// ```
/// use rowcache_db::schema::{FieldDef, FieldType, Schema};
///
/// let schema = Schema::builder("users")
///     .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
///     .field(FieldDef::new("email", FieldType::Char).length(120))
///     .field(FieldDef::new("group_id", FieldType::Integer))
///     .field(FieldDef::new("age", FieldType::Integer))
///     .primary_key(&["id"])
///     .unique_key(&["email"])
///     .index_key(&["group_id", "age"])
///     .order_by(&["-age"])
///     .build()
///     .unwrap();
/// assert!(schema.is_index_signature(&["group_id"]));
/// ```
#[derive(Debug, Clone)]
pub struct SchemaBuilder {
    table: String,
    fields: Vec<FieldDef>,
    primary_key: Vec<String>,
    unique_keys: Vec<Vec<String>>,
    index_keys: Vec<Vec<String>>,
    order_bys: Vec<Vec<String>>,
}

fn owned(fields: &[&str]) -> Vec<String> {
    fields.iter().map(ToString::to_string).collect()
}

impl SchemaBuilder {
    /// Starts an empty schema for `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            fields: Vec::new(),
            primary_key: Vec::new(),
            unique_keys: Vec::new(),
            index_keys: Vec::new(),
            order_bys: Vec::new(),
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key(mut self, fields: &[&str]) -> Self {
        self.primary_key = owned(fields);
        self
    }

    /// Declares a unique key.
    #[must_use]
    pub fn unique_key(mut self, fields: &[&str]) -> Self {
        self.unique_keys.push(owned(fields));
        self
    }

    /// Declares an index key.
    #[must_use]
    pub fn index_key(mut self, fields: &[&str]) -> Self {
        self.index_keys.push(owned(fields));
        self
    }

    /// Declares an order-by signature such as `["-age", "name"]`.
    #[must_use]
    pub fn order_by(mut self, fields: &[&str]) -> Self {
        self.order_bys.push(owned(fields));
        self
    }

    /// Validates and freezes the schema.
    pub fn build(self) -> OrmResult<Schema> {
        let mut errors: HashMap<String, Vec<ValidationError>> = HashMap::new();
        let mut seen = BTreeSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                errors
                    .entry(field.name.clone())
                    .or_default()
                    .push(ValidationError::new("duplicate field", "duplicate"));
            }
            if field.auto_increment && !field.field_type.is_integer() {
                errors.entry(field.name.clone()).or_default().push(ValidationError::new(
                    "auto-increment requires an integer type",
                    "invalid",
                ));
            }
        }
        if !errors.is_empty() {
            return Err(OrmError::Validation(ValidationError::with_field_errors(errors)));
        }

        if self.primary_key.is_empty() {
            return Err(OrmError::InvalidField(format!(
                "'{}' declares no primary key",
                self.table
            )));
        }
        let keys = std::iter::once(&self.primary_key)
            .chain(&self.unique_keys)
            .chain(&self.index_keys);
        for key in keys {
            if key.is_empty() {
                return Err(OrmError::InvalidField(format!(
                    "'{}' declares an empty key",
                    self.table
                )));
            }
            for name in key {
                if !seen.contains(name.as_str()) {
                    return Err(OrmError::InvalidField(format!(
                        "'{}' has no field '{name}'",
                        self.table
                    )));
                }
            }
        }

        let mut order_bys = Vec::with_capacity(self.order_bys.len());
        for spec in &self.order_bys {
            let order = OrderSignature::parse(spec)?;
            if let Some(unknown) = order.keys().iter().find(|k| !seen.contains(k.field.as_str())) {
                return Err(OrmError::OrderBy(format!(
                    "'{}' has no field '{}' to order by",
                    self.table, unknown.field
                )));
            }
            order_bys.push(order);
        }

        Ok(Schema {
            id: None,
            table: self.table,
            fields: self.fields,
            primary_key: self.primary_key,
            unique_keys: self.unique_keys,
            index_keys: self.index_keys,
            order_bys,
        })
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// Arena of registered schemas addressed by [`SchemaId`].
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<Vec<Arc<Schema>>>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema, stamping it and its fields with a fresh id.
    pub fn register(&self, mut schema: Schema) -> OrmResult<Arc<Schema>> {
        let mut schemas = self.schemas.write();
        if schemas.iter().any(|s| s.table == schema.table) {
            return Err(OrmError::Configuration(format!(
                "Table '{}' is already registered",
                schema.table
            )));
        }
        let id = SchemaId(schemas.len());
        schema.id = Some(id);
        for field in &mut schema.fields {
            field.owner = Some(id);
        }
        let schema = Arc::new(schema);
        schemas.push(Arc::clone(&schema));
        tracing::debug!(table = %schema.table, id = id.0, "registered schema");
        Ok(schema)
    }

    /// Replaces a registered schema. Intended for tests and maintenance.
    pub fn replace(&self, id: SchemaId, mut schema: Schema) -> OrmResult<Arc<Schema>> {
        let mut schemas = self.schemas.write();
        let slot = schemas
            .get_mut(id.0)
            .ok_or_else(|| OrmError::DataBase(format!("No schema with id {}", id.0)))?;
        schema.id = Some(id);
        for field in &mut schema.fields {
            field.owner = Some(id);
        }
        let schema = Arc::new(schema);
        *slot = Arc::clone(&schema);
        Ok(schema)
    }

    /// Resolves a handle.
    pub fn get(&self, id: SchemaId) -> Option<Arc<Schema>> {
        self.schemas.read().get(id.0).cloned()
    }

    /// Finds a schema by table name.
    pub fn by_table(&self, table: &str) -> Option<Arc<Schema>> {
        self.schemas.read().iter().find(|s| s.table == table).cloned()
    }

    /// Resolves the schema that owns a field.
    pub fn owner_of(&self, field: &FieldDef) -> Option<Arc<Schema>> {
        field.owner.and_then(|id| self.get(id))
    }

    /// Number of registered schemas.
    pub fn len(&self) -> usize {
        self.schemas.read().len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.schemas.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> SchemaBuilder {
        Schema::builder("users")
            .field(FieldDef::new("id", FieldType::BigInteger).auto_increment())
            .field(FieldDef::new("email", FieldType::Char).length(120))
            .field(FieldDef::new("group_id", FieldType::Integer))
            .field(FieldDef::new("age", FieldType::Integer))
            .field(FieldDef::new("name", FieldType::Text).nullable())
            .primary_key(&["id"])
            .unique_key(&["email"])
            .index_key(&["group_id", "age"])
            .order_by(&["-age", "name"])
    }

    #[test]
    fn test_signatures() {
        let s = users().build().unwrap();
        assert!(s.is_row_signature(&["id"]));
        assert!(s.is_row_signature(&["email"]));
        assert!(!s.is_row_signature(&["group_id"]));
        assert!(s.is_index_signature(&["group_id"]));
        assert!(s.is_index_signature(&["age", "group_id"]));
        assert!(!s.is_index_signature(&["age"]));
        assert!(!s.is_index_signature(&["group_id", "group_id"]));
        assert_eq!(s.single_pk(), Some("id"));
    }

    #[test]
    fn test_order_signature_parse_and_display() {
        let o = OrderSignature::parse_str("-age,name").unwrap();
        assert_eq!(o.to_string(), "-age,name");
        assert!(o.mentions("age"));
        assert!(!o.mentions("id"));
        assert!(matches!(OrderSignature::parse_str(""), Err(OrmError::OrderBy(_))));
        assert!(matches!(OrderKey::parse("--age"), Err(OrmError::OrderBy(_))));
    }

    #[test]
    fn test_build_rejects_unknown_key_field() {
        let err = users().index_key(&["nickname"]).build().unwrap_err();
        assert!(matches!(err, OrmError::InvalidField(_)));
    }

    #[test]
    fn test_build_rejects_unknown_order_field() {
        let err = users().order_by(&["-height"]).build().unwrap_err();
        assert!(matches!(err, OrmError::OrderBy(_)));
    }

    #[test]
    fn test_build_rejects_duplicates_and_bad_auto_increment() {
        let err = Schema::builder("t")
            .field(FieldDef::new("id", FieldType::Text).auto_increment())
            .field(FieldDef::new("id", FieldType::Integer))
            .primary_key(&["id"])
            .build()
            .unwrap_err();
        match err {
            OrmError::Validation(v) => assert_eq!(v.field_errors["id"].len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_build_requires_primary_key() {
        let err = Schema::builder("t")
            .field(FieldDef::new("id", FieldType::Integer))
            .build()
            .unwrap_err();
        assert!(matches!(err, OrmError::InvalidField(_)));
    }

    #[test]
    fn test_registry_handles() {
        let registry = SchemaRegistry::new();
        let schema = registry.register(users().build().unwrap()).unwrap();
        let id = schema.id().unwrap();
        assert_eq!(registry.get(id).unwrap().table(), "users");
        let email = schema.field("email").unwrap();
        assert_eq!(registry.owner_of(email).unwrap().table(), "users");
        assert!(registry.register(users().build().unwrap()).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_create_table_node_lists_keys() {
        let s = users().build().unwrap();
        let Node::CreateTable { definition, .. } = s.create_table_node() else {
            panic!("expected CREATE_TABLE");
        };
        let Node::CreateDefinition(defs) = *definition else {
            panic!("expected CREATE_DEFINITION");
        };
        // five fields, primary, one unique, one index
        assert_eq!(defs.len(), 8);
    }
}
