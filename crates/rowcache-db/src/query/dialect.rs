//! Per-dialect rendering rules.
//!
//! The [`Dialect`] trait's provided methods are the shared base; each
//! dialect overrides only where it differs: identifier quoting, `LIMIT`
//! order, column types and auto-increment syntax, `RETURNING`, key DDL,
//! row locking, and conditional expressions.

use std::fmt;

use rowcache_core::{OrmError, OrmResult};

use super::compiler::DatabaseBackendType;
use super::ir::KeyKind;
use crate::schema::{FieldDef, FieldType};
use crate::value::Value;

/// Rendering hooks for one SQL dialect.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// The backend this dialect targets.
    fn backend(&self) -> DatabaseBackendType;

    /// The identifier quote character.
    fn quote_char(&self) -> char {
        '"'
    }

    /// Quotes an identifier, doubling embedded quote characters.
    fn quote(&self, ident: &str) -> String {
        let q = self.quote_char();
        let mut out = String::with_capacity(ident.len() + 2);
        out.push(q);
        for c in ident.chars() {
            if c == q {
                out.push(q);
            }
            out.push(c);
        }
        out.push(q);
        out
    }

    /// The placeholder for the `index`-th (1-based) parameter.
    fn placeholder(&self, _index: usize) -> String {
        "%s".to_string()
    }

    /// The `LIMIT` clause.
    fn limit(&self, offset: Option<u64>, count: u64) -> String {
        match offset {
            Some(offset) if offset > 0 => format!("LIMIT {count} OFFSET {offset}"),
            _ => format!("LIMIT {count}"),
        }
    }

    /// Column type for a field.
    fn column_type(&self, field: &FieldDef) -> String;

    /// Full column definition.
    fn field_sql(&self, field: &FieldDef) -> String {
        let null = if field.nullable { " NULL" } else { " NOT NULL" };
        format!(
            "{} {}{null}{}",
            self.quote(&field.name),
            self.column_type(field),
            default_sql(field)
        )
    }

    /// Whether an auto-increment column carries its own `PRIMARY KEY`.
    fn inline_auto_primary_key(&self) -> bool {
        false
    }

    /// Whether plain index keys may appear inside `CREATE TABLE`.
    fn inline_index(&self) -> bool {
        false
    }

    /// Key definition inside `CREATE TABLE`.
    fn key_sql(&self, kind: KeyKind, name: Option<&str>, columns: &[String]) -> OrmResult<String> {
        let cols = self.column_list(columns);
        match (kind, name) {
            (KeyKind::Primary, _) => Ok(format!("PRIMARY KEY ({cols})")),
            (KeyKind::Unique, Some(name)) => {
                Ok(format!("CONSTRAINT {} UNIQUE ({cols})", self.quote(name)))
            }
            (KeyKind::Unique, None) => Ok(format!("UNIQUE ({cols})")),
            (KeyKind::Index, _) => Err(OrmError::NotValidStatement(format!(
                "{:?} cannot declare an index inside CREATE TABLE",
                self.backend()
            ))),
        }
    }

    /// Quoted, comma-separated column names.
    fn column_list(&self, columns: &[String]) -> String {
        columns
            .iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Body of an `INSERT` with no explicit columns.
    fn default_values(&self) -> &'static str {
        "DEFAULT VALUES"
    }

    /// `RETURNING` clause, if supported.
    fn returning(&self, _columns: &str) -> Option<String> {
        None
    }

    /// Row locking clause, if supported.
    fn for_update(&self) -> Option<&'static str> {
        Some("FOR UPDATE")
    }

    /// Conditional expression.
    fn if_sql(&self, cond: &str, then: &str, otherwise: &str) -> String {
        format!("CASE WHEN {cond} THEN {then} ELSE {otherwise} END")
    }

    /// `ALTER TABLE` changing a column definition.
    fn modify_field(&self, table: &str, _field: &FieldDef) -> OrmResult<String> {
        Err(OrmError::NotValidStatement(format!(
            "{:?} cannot modify columns of '{table}'",
            self.backend()
        )))
    }

    /// Storage options trailing `CREATE TABLE`.
    fn table_options(&self, _options: &[(String, String)]) -> String {
        String::new()
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Generates the default value SQL fragment for a field.
fn default_sql(field: &FieldDef) -> String {
    match &field.default {
        Some(Value::Null) => " DEFAULT NULL".to_string(),
        Some(Value::Bool(b)) => format!(" DEFAULT {}", if *b { "TRUE" } else { "FALSE" }),
        Some(Value::Int(i)) => format!(" DEFAULT {i}"),
        Some(Value::Float(f)) => format!(" DEFAULT {f}"),
        Some(Value::String(s)) => format!(" DEFAULT '{}'", s.replace('\'', "''")),
        Some(_) | None => String::new(),
    }
}

// ── MySQL ────────────────────────────────────────────────────────────────

/// MySQL: backtick quoting, `LIMIT offset, count`, `AUTO_INCREMENT`,
/// inline `KEY` definitions, and `IF()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::MySQL
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn limit(&self, offset: Option<u64>, count: u64) -> String {
        match offset {
            Some(offset) if offset > 0 => format!("LIMIT {offset}, {count}"),
            _ => format!("LIMIT {count}"),
        }
    }

    fn column_type(&self, field: &FieldDef) -> String {
        match field.field_type {
            FieldType::SmallInteger => "SMALLINT".to_string(),
            FieldType::Integer => "INT".to_string(),
            FieldType::BigInteger => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE".to_string(),
            FieldType::Decimal {
                max_digits,
                decimal_places,
            } => format!("DECIMAL({max_digits}, {decimal_places})"),
            FieldType::Boolean => "TINYINT(1)".to_string(),
            FieldType::Char => format!("VARCHAR({})", field.length.unwrap_or(255)),
            FieldType::Text => "LONGTEXT".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::DateTime => "DATETIME".to_string(),
            FieldType::Time => "TIME".to_string(),
            FieldType::Uuid => "CHAR(36)".to_string(),
            FieldType::Binary => field
                .length
                .map_or_else(|| "LONGBLOB".to_string(), |n| format!("VARBINARY({n})")),
            FieldType::Json => "JSON".to_string(),
        }
    }

    fn field_sql(&self, field: &FieldDef) -> String {
        let null = if field.nullable { " NULL" } else { " NOT NULL" };
        let auto = if field.auto_increment { " AUTO_INCREMENT" } else { "" };
        format!(
            "{} {}{null}{}{auto}",
            self.quote(&field.name),
            self.column_type(field),
            default_sql(field)
        )
    }

    fn inline_index(&self) -> bool {
        true
    }

    fn key_sql(&self, kind: KeyKind, name: Option<&str>, columns: &[String]) -> OrmResult<String> {
        let cols = self.column_list(columns);
        let named = |keyword: &str| match name {
            Some(name) => format!("{keyword} {} ({cols})", self.quote(name)),
            None => format!("{keyword} ({cols})"),
        };
        Ok(match kind {
            KeyKind::Primary => format!("PRIMARY KEY ({cols})"),
            KeyKind::Unique => named("UNIQUE KEY"),
            KeyKind::Index => named("KEY"),
        })
    }

    fn default_values(&self) -> &'static str {
        "() VALUES ()"
    }

    fn if_sql(&self, cond: &str, then: &str, otherwise: &str) -> String {
        format!("IF({cond}, {then}, {otherwise})")
    }

    fn modify_field(&self, table: &str, field: &FieldDef) -> OrmResult<String> {
        Ok(format!(
            "ALTER TABLE {} MODIFY COLUMN {}",
            self.quote(table),
            self.field_sql(field)
        ))
    }

    fn table_options(&self, options: &[(String, String)]) -> String {
        options
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

// ── PostgreSQL ───────────────────────────────────────────────────────────

/// PostgreSQL: double-quote quoting, `SERIAL`/`BIGSERIAL`, and `RETURNING`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::PostgreSQL
    }

    fn column_type(&self, field: &FieldDef) -> String {
        match field.field_type {
            FieldType::SmallInteger if field.auto_increment => "SMALLSERIAL".to_string(),
            FieldType::Integer if field.auto_increment => "SERIAL".to_string(),
            FieldType::BigInteger if field.auto_increment => "BIGSERIAL".to_string(),
            FieldType::SmallInteger => "SMALLINT".to_string(),
            FieldType::Integer => "INTEGER".to_string(),
            FieldType::BigInteger => "BIGINT".to_string(),
            FieldType::Float => "DOUBLE PRECISION".to_string(),
            FieldType::Decimal {
                max_digits,
                decimal_places,
            } => format!("NUMERIC({max_digits}, {decimal_places})"),
            FieldType::Boolean => "BOOLEAN".to_string(),
            FieldType::Char => format!("VARCHAR({})", field.length.unwrap_or(255)),
            FieldType::Text => "TEXT".to_string(),
            FieldType::Date => "DATE".to_string(),
            FieldType::DateTime => "TIMESTAMP".to_string(),
            FieldType::Time => "TIME".to_string(),
            FieldType::Uuid => "UUID".to_string(),
            FieldType::Binary => "BYTEA".to_string(),
            FieldType::Json => "JSONB".to_string(),
        }
    }

    fn returning(&self, columns: &str) -> Option<String> {
        Some(format!("RETURNING {columns}"))
    }

    fn modify_field(&self, table: &str, field: &FieldDef) -> OrmResult<String> {
        let column = self.quote(&field.name);
        let mut parts = vec![format!(
            "ALTER COLUMN {column} TYPE {}",
            self.column_type(field)
        )];
        parts.push(if field.nullable {
            format!("ALTER COLUMN {column} DROP NOT NULL")
        } else {
            format!("ALTER COLUMN {column} SET NOT NULL")
        });
        let default = default_sql(field);
        if !default.is_empty() {
            parts.push(format!("ALTER COLUMN {column} SET{default}"));
        }
        Ok(format!("ALTER TABLE {} {}", self.quote(table), parts.join(", ")))
    }
}

// ── SQLite ───────────────────────────────────────────────────────────────

/// SQLite: `?` placeholders, `INTEGER PRIMARY KEY AUTOINCREMENT`, no row
/// locking, and no column modification.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn backend(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn column_type(&self, field: &FieldDef) -> String {
        match field.field_type {
            FieldType::SmallInteger
            | FieldType::Integer
            | FieldType::BigInteger
            | FieldType::Boolean => "INTEGER",
            FieldType::Float | FieldType::Decimal { .. } => "REAL",
            FieldType::Char
            | FieldType::Text
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::Time
            | FieldType::Uuid
            | FieldType::Json => "TEXT",
            FieldType::Binary => "BLOB",
        }
        .to_string()
    }

    fn field_sql(&self, field: &FieldDef) -> String {
        if field.auto_increment {
            return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", self.quote(&field.name));
        }
        let null = if field.nullable { "" } else { " NOT NULL" };
        format!(
            "{} {}{null}{}",
            self.quote(&field.name),
            self.column_type(field),
            default_sql(field)
        )
    }

    fn inline_auto_primary_key(&self) -> bool {
        true
    }

    fn for_update(&self) -> Option<&'static str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str, ty: FieldType) -> FieldDef {
        FieldDef::new(name, ty)
    }

    #[test]
    fn test_quoting_escapes() {
        assert_eq!(MySqlDialect.quote("a`b"), "`a``b`");
        assert_eq!(PostgresDialect.quote("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_limit_order() {
        assert_eq!(MySqlDialect.limit(Some(20), 10), "LIMIT 20, 10");
        assert_eq!(PostgresDialect.limit(Some(20), 10), "LIMIT 10 OFFSET 20");
        assert_eq!(SqliteDialect.limit(None, 10), "LIMIT 10");
        assert_eq!(MySqlDialect.limit(Some(0), 5), "LIMIT 5");
    }

    #[test]
    fn test_auto_increment_syntax() {
        let id = field("id", FieldType::BigInteger).auto_increment();
        assert_eq!(MySqlDialect.field_sql(&id), "`id` BIGINT NOT NULL AUTO_INCREMENT");
        assert_eq!(PostgresDialect.field_sql(&id), "\"id\" BIGSERIAL NOT NULL");
        assert_eq!(
            SqliteDialect.field_sql(&id),
            "\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"
        );
    }

    #[test]
    fn test_field_defaults_and_nullability() {
        let name = field("name", FieldType::Char).length(40).nullable().default("it's");
        assert_eq!(
            PostgresDialect.field_sql(&name),
            "\"name\" VARCHAR(40) NULL DEFAULT 'it''s'"
        );
        let flag = field("active", FieldType::Boolean).default(true);
        assert_eq!(
            MySqlDialect.field_sql(&flag),
            "`active` TINYINT(1) NOT NULL DEFAULT TRUE"
        );
        assert_eq!(SqliteDialect.field_sql(&flag), "\"active\" INTEGER NOT NULL DEFAULT TRUE");
    }

    #[test]
    fn test_key_sql() {
        let cols = vec!["group_id".to_string(), "age".to_string()];
        assert_eq!(
            MySqlDialect.key_sql(KeyKind::Index, Some("ix"), &cols).unwrap(),
            "KEY `ix` (`group_id`, `age`)"
        );
        assert_eq!(
            PostgresDialect.key_sql(KeyKind::Unique, Some("ux"), &cols).unwrap(),
            "CONSTRAINT \"ux\" UNIQUE (\"group_id\", \"age\")"
        );
        assert!(matches!(
            SqliteDialect.key_sql(KeyKind::Index, Some("ix"), &cols),
            Err(OrmError::NotValidStatement(_))
        ));
    }

    #[test]
    fn test_returning_presence() {
        assert_eq!(PostgresDialect.returning("\"id\"").unwrap(), "RETURNING \"id\"");
        assert!(MySqlDialect.returning("`id`").is_none());
        assert!(SqliteDialect.returning("\"id\"").is_none());
    }

    #[test]
    fn test_modify_field() {
        let age = field("age", FieldType::Integer).nullable();
        assert_eq!(
            MySqlDialect.modify_field("users", &age).unwrap(),
            "ALTER TABLE `users` MODIFY COLUMN `age` INT NULL"
        );
        assert_eq!(
            PostgresDialect.modify_field("users", &age).unwrap(),
            "ALTER TABLE \"users\" ALTER COLUMN \"age\" TYPE INTEGER, ALTER COLUMN \"age\" DROP NOT NULL"
        );
        assert!(SqliteDialect.modify_field("users", &age).is_err());
    }

    #[test]
    fn test_if_sql() {
        assert_eq!(MySqlDialect.if_sql("c", "a", "b"), "IF(c, a, b)");
        assert_eq!(SqliteDialect.if_sql("c", "a", "b"), "CASE WHEN c THEN a ELSE b END");
    }
}
