//! Translation of statement trees into dialect SQL.
//!
//! [`SqlCompiler::translate`] renders a [`Node`] into `(sql, params)`. The
//! parameter list holds one entry per `VALUE` leaf, in document order.
//!
//! Two passes run before rendering a fresh top-level statement:
//!
//! - **Table aliasing.** Every distinct table receives a short alias (its
//!   first letter, then `u1`, `u2`, ... on collision). Aliases are emitted
//!   only when the statement joins or a subquery names a second table.
//!   Nested statements reuse the parent's alias table.
//! - **Alias-only clauses.** Inside `WHERE`, `ON`, `GROUP BY`, `ORDER BY`
//!   and `HAVING`, an aliased expression renders as its alias.
//!
//! Outside any statement a qualified column renders as `table.column`;
//! inside a statement touching one table it renders bare.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rowcache_core::{OrmError, OrmResult};

use super::dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
use super::ir::{JoinKind, KeyKind, Node};
use crate::value::Value;

/// The type of database backend, used to select a [`Dialect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    /// PostgreSQL.
    PostgreSQL,
    /// SQLite.
    SQLite,
    /// MySQL.
    MySQL,
}

static MYSQL: MySqlDialect = MySqlDialect;
static POSTGRES: PostgresDialect = PostgresDialect;
static SQLITE: SqliteDialect = SqliteDialect;

impl DatabaseBackendType {
    /// Parses a dialect name as found in settings.
    pub fn from_name(name: &str) -> OrmResult<Self> {
        match name.to_ascii_lowercase().as_str() {
            "mysql" => Ok(Self::MySQL),
            "postgresql" | "postgres" | "pg" => Ok(Self::PostgreSQL),
            "sqlite" | "sqlite3" => Ok(Self::SQLite),
            other => Err(OrmError::Configuration(format!("Unknown dialect '{other}'"))),
        }
    }

    /// The rendering rules for this backend.
    pub fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::MySQL => &MYSQL,
            Self::PostgreSQL => &POSTGRES,
            Self::SQLite => &SQLITE,
        }
    }
}

// ── Precedence ───────────────────────────────────────────────────────────

const ATOMIC: u8 = u8::MAX;
const CASE_LEVEL: u8 = 30;
const AND_LEVEL: u8 = 20;
const OR_LEVEL: u8 = 10;

static BINARY_PRECEDENCE: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    let ladder: [(&[&str], u8); 7] = [
        (&["*", "/", "%", "DIV", "MOD"], 70),
        (&["-", "+"], 60),
        (&["<<", ">>"], 50),
        (
            &[
                "=", "!=", "<>", "<", "<=", ">", ">=", "<=>", "LIKE", "NOT LIKE", "IN", "NOT IN",
                "IS", "IS NOT",
            ],
            40,
        ),
        (&["BETWEEN", "NOT BETWEEN", "CASE"], CASE_LEVEL),
        (&["AND"], AND_LEVEL),
        (&["OR"], OR_LEVEL),
    ];
    ladder
        .iter()
        .flat_map(|(ops, level)| ops.iter().map(move |op| (*op, *level)))
        .collect()
});

static UNARY_PRECEDENCE: Lazy<HashMap<&'static str, u8>> = Lazy::new(|| {
    HashMap::from([
        ("-", 80),
        ("~", 80),
        ("NOT", 25),
        ("IS NULL", 40),
        ("IS NOT NULL", 40),
        ("EXISTS", 40),
        ("NOT EXISTS", 40),
        ("ASC", 0),
        ("DESC", 0),
    ])
});

const ASSOCIATIVE: [&str; 4] = ["+", "*", "AND", "OR"];

fn binary_level(op: &str) -> OrmResult<u8> {
    BINARY_PRECEDENCE
        .get(op.to_ascii_uppercase().as_str())
        .copied()
        .ok_or_else(|| OrmError::NotValidStatement(format!("Unknown binary operator '{op}'")))
}

fn unary_level(op: &str) -> OrmResult<u8> {
    UNARY_PRECEDENCE
        .get(op.to_ascii_uppercase().as_str())
        .copied()
        .ok_or_else(|| OrmError::NotValidStatement(format!("Unknown unary operator '{op}'")))
}

fn node_level(node: &Node) -> u8 {
    match node {
        Node::BinaryOperate { op, .. } => binary_level(op).unwrap_or(ATOMIC),
        Node::UnaryOperate { op, .. } => unary_level(op).unwrap_or(ATOMIC),
        Node::And(items) if items.len() > 1 => AND_LEVEL,
        Node::Or(items) if items.len() > 1 => OR_LEVEL,
        Node::If { .. } => CASE_LEVEL,
        _ => ATOMIC,
    }
}

fn invalid(msg: impl Into<String>) -> OrmError {
    OrmError::NotValidStatement(msg.into())
}

// ── Context ──────────────────────────────────────────────────────────────

/// Mutable state threaded through one translation.
#[derive(Debug, Default)]
pub struct TranslateContext {
    aliases: HashMap<String, String>,
    joined: bool,
    in_translation: bool,
    alias_only: bool,
    in_statement: bool,
    params: Vec<Value>,
}

impl TranslateContext {
    /// A fresh context.
    pub fn new() -> Self {
        Self::default()
    }

    /// The alias assigned to `table`, if any.
    pub fn alias_of(&self, table: &str) -> Option<&str> {
        self.aliases.get(table).map(String::as_str)
    }

    /// Parameters collected so far.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Consumes the context, returning its parameters.
    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

// ── Compiler ─────────────────────────────────────────────────────────────

/// Renders statement trees for one backend.
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler {
    dialect: &'static dyn Dialect,
}

impl SqlCompiler {
    /// Creates a new compiler for the given backend type.
    pub fn new(backend: DatabaseBackendType) -> Self {
        Self {
            dialect: backend.dialect(),
        }
    }

    /// The backend this compiler targets.
    pub fn backend(&self) -> DatabaseBackendType {
        self.dialect.backend()
    }

    /// The dialect rules in use.
    pub fn dialect(&self) -> &'static dyn Dialect {
        self.dialect
    }

    /// Translates a node into SQL text and its ordered parameters.
    pub fn translate(&self, node: &Node) -> OrmResult<(String, Vec<Value>)> {
        let mut ctx = TranslateContext::new();
        let sql = self.translate_with(node, &mut ctx)?;
        Ok((sql, ctx.into_params()))
    }

    /// Translates a node within an existing context.
    pub fn translate_with(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        self.visit(node, ctx)
    }

    fn visit(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        match node {
            Node::Progn(items) => self.on_progn(items, ctx),
            Node::Sentence(items) => self.on_sentence(items, ctx),
            Node::Select(_) | Node::Insert(_) | Node::Update(_) | Node::Delete(_) => {
                self.statement(node, ctx)
            }
            Node::Set(pairs) => self.on_set(pairs, ctx),
            Node::Values(rows) => self.on_values(rows, ctx),
            Node::Bracket(inner) => Ok(format!("({})", self.visit(inner, ctx)?)),
            Node::Series(items) => self.on_series(items, ctx),
            Node::Column { table, name } => Ok(self.on_column(table.as_deref(), name, ctx)),
            Node::Alias { node, alias } => self.on_alias(node, alias, ctx),
            Node::From { source, joins } => self.on_from(source, joins, ctx),
            Node::Join { kind, target, on } => self.on_join(*kind, target, on.as_deref(), ctx),
            Node::Value(value) => self.on_value(value, ctx),
            Node::Quote(ident) => Ok(self.dialect.quote(ident)),
            Node::Table(name) => Ok(self.dialect.quote(name)),
            Node::Returning(items) => self.on_returning(items, ctx),
            Node::Call { name, args } => self.on_call(name, args, ctx),
            Node::Where(inner) => self.clause("WHERE", inner, ctx),
            Node::On(inner) => self.clause("ON", inner, ctx),
            Node::Having(inner) => self.clause("HAVING", inner, ctx),
            Node::GroupBy(items) => self.on_list_clause("GROUP BY", items, ctx),
            Node::OrderBy(items) => self.on_list_clause("ORDER BY", items, ctx),
            Node::Limit { offset, count } => Ok(self.dialect.limit(*offset, *count)),
            Node::UnaryOperate {
                op,
                operand,
                postfix,
            } => self.on_unary(op, operand, *postfix, ctx),
            Node::BinaryOperate { op, left, right } => self.on_binary(op, left, right, ctx),
            Node::And(items) => self.on_logical("AND", AND_LEVEL, items, ctx),
            Node::Or(items) => self.on_logical("OR", OR_LEVEL, items, ctx),
            Node::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.visit(cond, ctx)?;
                let then = self.visit(then, ctx)?;
                let otherwise = self.visit(otherwise, ctx)?;
                Ok(self.dialect.if_sql(&cond, &then, &otherwise))
            }
            Node::CreateIndex {
                name,
                table,
                columns,
                unique,
            } => self.on_create_index(name, table, columns, *unique),
            Node::CreateTable {
                table,
                definition,
                options,
            } => self.on_create_table(table, definition, options.as_deref()),
            Node::CreateDefinition(defs) => {
                let rendered = defs
                    .iter()
                    .map(|d| self.definition(d))
                    .collect::<OrmResult<Vec<_>>>()?;
                Ok(rendered.join(", "))
            }
            Node::AddField { table, field } => {
                let Node::Field(def) = field.as_ref() else {
                    return Err(invalid("ADD_FIELD expects a FIELD"));
                };
                Ok(format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    self.dialect.quote(table),
                    self.dialect.field_sql(def)
                ))
            }
            Node::ModifyField { table, field } => {
                let Node::Field(def) = field.as_ref() else {
                    return Err(invalid("MODIFY_FIELD expects a FIELD"));
                };
                self.dialect.modify_field(table, def)
            }
            Node::Field(def) => Ok(self.dialect.field_sql(def)),
            Node::Key {
                kind,
                name,
                columns,
            } => self.on_key(*kind, name.as_deref(), columns),
            Node::TableOptions(options) => Ok(self.dialect.table_options(options)),
            Node::ForUpdate => Ok(self.dialect.for_update().unwrap_or_default().to_string()),
            Node::Literal(text) => Ok(text.clone()),
        }
    }

    // ── Statements ───────────────────────────────────────────────────

    fn statement(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        let fresh = !ctx.in_translation;
        if fresh {
            assign_aliases(node, ctx);
            ctx.in_translation = true;
        }
        let outer_statement = std::mem::replace(&mut ctx.in_statement, true);
        let outer_alias_only = std::mem::replace(&mut ctx.alias_only, false);

        let result = match node {
            Node::Select(select) => self.on_select(select, ctx),
            Node::Insert(insert) => self.on_insert(insert, ctx),
            Node::Update(update) => self.on_update(update, ctx),
            Node::Delete(delete) => self.on_delete(delete, ctx),
            _ => Err(invalid("expected a statement")),
        };

        ctx.alias_only = outer_alias_only;
        ctx.in_statement = outer_statement;
        if fresh {
            ctx.in_translation = false;
        }
        result
    }

    fn on_select(&self, select: &super::ir::Select, ctx: &mut TranslateContext) -> OrmResult<String> {
        let mut parts = vec![if select.distinct {
            "SELECT DISTINCT".to_string()
        } else {
            "SELECT".to_string()
        }];

        if select.columns.is_empty() {
            parts.push("*".to_string());
        } else {
            let cols = select
                .columns
                .iter()
                .map(|c| self.visit(c, ctx))
                .collect::<OrmResult<Vec<_>>>()?;
            parts.push(cols.join(", "));
        }

        let slots: [(&Option<Node>, fn(&Node) -> bool, &str); 7] = [
            (&select.from, |n| matches!(n, Node::From { .. }), "FROM"),
            (&select.where_clause, |n| matches!(n, Node::Where(_)), "WHERE"),
            (&select.group_by, |n| matches!(n, Node::GroupBy(_)), "GROUP BY"),
            (&select.having, |n| matches!(n, Node::Having(_)), "HAVING"),
            (&select.order_by, |n| matches!(n, Node::OrderBy(_)), "ORDER BY"),
            (&select.limit, |n| matches!(n, Node::Limit { .. }), "LIMIT"),
            (&select.for_update, |n| matches!(n, Node::ForUpdate), "FOR UPDATE"),
        ];
        for (slot, is_expected, tag) in slots {
            if let Some(clause) = slot {
                if !is_expected(clause) {
                    return Err(invalid(format!("SELECT slot {tag} holds a different node")));
                }
                let rendered = self.visit(clause, ctx)?;
                if !rendered.is_empty() {
                    parts.push(rendered);
                }
            }
        }
        Ok(parts.join(" "))
    }

    fn on_insert(&self, insert: &super::ir::Insert, ctx: &mut TranslateContext) -> OrmResult<String> {
        let Node::Table(table) = &insert.table else {
            return Err(invalid("INSERT target must be a TABLE"));
        };
        let Node::Values(rows) = &insert.values else {
            return Err(invalid("INSERT expects VALUES"));
        };
        let mut sql = format!("INSERT INTO {}", self.dialect.quote(table));

        if insert.columns.is_empty() && rows.iter().all(Vec::is_empty) {
            sql.push(' ');
            sql.push_str(self.dialect.default_values());
        } else {
            if rows.iter().any(|row| row.len() != insert.columns.len()) {
                return Err(invalid(format!(
                    "INSERT into '{table}' names {} columns but a row has a different width",
                    insert.columns.len()
                )));
            }
            let cols = insert
                .columns
                .iter()
                .map(|c| match c {
                    Node::Column { name, .. } => Ok(self.dialect.quote(name)),
                    _ => Err(invalid("INSERT columns must be COLUMN nodes")),
                })
                .collect::<OrmResult<Vec<_>>>()?;
            sql.push_str(&format!(" ({}) ", cols.join(", ")));
            sql.push_str(&self.on_values(rows, ctx)?);
        }

        if let Some(returning) = &insert.returning {
            if !matches!(returning, Node::Returning(_)) {
                return Err(invalid("INSERT returning slot must be RETURNING"));
            }
            let rendered = self.visit(returning, ctx)?;
            if !rendered.is_empty() {
                sql.push(' ');
                sql.push_str(&rendered);
            }
        }
        Ok(sql)
    }

    fn on_update(&self, update: &super::ir::Update, ctx: &mut TranslateContext) -> OrmResult<String> {
        let Node::Table(table) = &update.table else {
            return Err(invalid("UPDATE target must be a TABLE"));
        };
        let Node::Set(pairs) = &update.set else {
            return Err(invalid("UPDATE expects SET"));
        };
        let mut sql = format!("UPDATE {} {}", self.dialect.quote(table), self.on_set(pairs, ctx)?);
        if let Some(where_clause) = &update.where_clause {
            sql.push(' ');
            sql.push_str(&self.expect_where(where_clause, ctx)?);
        }
        Ok(sql)
    }

    fn on_delete(&self, delete: &super::ir::Delete, ctx: &mut TranslateContext) -> OrmResult<String> {
        let Node::Table(table) = &delete.table else {
            return Err(invalid("DELETE target must be a TABLE"));
        };
        let mut sql = format!("DELETE FROM {}", self.dialect.quote(table));
        if let Some(where_clause) = &delete.where_clause {
            sql.push(' ');
            sql.push_str(&self.expect_where(where_clause, ctx)?);
        }
        Ok(sql)
    }

    fn expect_where(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        match node {
            Node::Where(inner) => self.clause("WHERE", inner, ctx),
            _ => Err(invalid("WHERE slot holds a different node")),
        }
    }

    fn on_progn(&self, items: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        if items.is_empty() {
            return Err(invalid("PROGN is empty"));
        }
        let rendered = items
            .iter()
            .map(|n| self.visit(n, ctx))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(rendered.join("; "))
    }

    fn on_sentence(&self, items: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        let rendered = items
            .iter()
            .map(|n| self.visit(n, ctx))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(rendered
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "))
    }

    // ── Clauses ──────────────────────────────────────────────────────

    fn alias_only<T>(
        &self,
        ctx: &mut TranslateContext,
        f: impl FnOnce(&Self, &mut TranslateContext) -> OrmResult<T>,
    ) -> OrmResult<T> {
        let outer = std::mem::replace(&mut ctx.alias_only, true);
        let result = f(self, ctx);
        ctx.alias_only = outer;
        result
    }

    fn clause(&self, keyword: &str, inner: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        let body = self.alias_only(ctx, |c, ctx| c.visit(inner, ctx))?;
        Ok(format!("{keyword} {body}"))
    }

    fn on_list_clause(
        &self,
        keyword: &str,
        items: &[Node],
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        if items.is_empty() {
            return Err(invalid(format!("{keyword} is empty")));
        }
        let rendered = self.alias_only(ctx, |c, ctx| {
            items
                .iter()
                .map(|n| c.visit(n, ctx))
                .collect::<OrmResult<Vec<_>>>()
        })?;
        Ok(format!("{keyword} {}", rendered.join(", ")))
    }

    fn on_from(&self, source: &Node, joins: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        let mut sql = format!("FROM {}", self.table_ref(source, ctx)?);
        for join in joins {
            if !matches!(join, Node::Join { .. }) {
                return Err(invalid("FROM joins must be JOIN nodes"));
            }
            sql.push(' ');
            sql.push_str(&self.visit(join, ctx)?);
        }
        Ok(sql)
    }

    fn on_join(
        &self,
        kind: JoinKind,
        target: &Node,
        on: Option<&Node>,
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        let mut sql = format!("{} {}", kind.sql(), self.table_ref(target, ctx)?);
        match (kind, on) {
            (JoinKind::Cross, Some(_)) => return Err(invalid("CROSS JOIN takes no ON")),
            (JoinKind::Cross, None) => {}
            (_, None) => return Err(invalid(format!("{} requires ON", kind.sql()))),
            (_, Some(on)) => {
                if !matches!(on, Node::On(_)) {
                    return Err(invalid("JOIN condition must be ON"));
                }
                sql.push(' ');
                sql.push_str(&self.visit(on, ctx)?);
            }
        }
        Ok(sql)
    }

    /// A table in FROM/JOIN position, with its alias when joined.
    fn table_ref(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        match node {
            Node::Table(name) if ctx.joined => {
                let alias = ctx.aliases.get(name).cloned().unwrap_or_else(|| name.clone());
                Ok(format!(
                    "{} AS {}",
                    self.dialect.quote(name),
                    self.dialect.quote(&alias)
                ))
            }
            Node::Table(name) => Ok(self.dialect.quote(name)),
            Node::Alias { node, alias } => Ok(format!(
                "{} AS {}",
                self.table_source(node, ctx)?,
                self.dialect.quote(alias)
            )),
            Node::Bracket(_) => self.visit(node, ctx),
            _ => Err(invalid("FROM/JOIN source must be a TABLE, ALIAS, or BRACKET")),
        }
    }

    fn table_source(&self, node: &Node, ctx: &mut TranslateContext) -> OrmResult<String> {
        match node {
            Node::Table(name) => Ok(self.dialect.quote(name)),
            Node::Bracket(_) => self.visit(node, ctx),
            _ => Err(invalid("ALIAS in FROM must wrap a TABLE or BRACKET")),
        }
    }

    fn on_returning(&self, items: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        if items.is_empty() {
            return Err(invalid("RETURNING is empty"));
        }
        let cols = items
            .iter()
            .map(|n| self.visit(n, ctx))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(self.dialect.returning(&cols.join(", ")).unwrap_or_default())
    }

    fn on_set(&self, pairs: &[(Node, Node)], ctx: &mut TranslateContext) -> OrmResult<String> {
        if pairs.is_empty() {
            return Err(invalid("SET is empty"));
        }
        let mut assignments = Vec::with_capacity(pairs.len());
        for (column, value) in pairs {
            let Node::Column { name, .. } = column else {
                return Err(invalid("SET targets must be COLUMN nodes"));
            };
            let rendered = self.visit(value, ctx)?;
            assignments.push(format!("{} = {rendered}", self.dialect.quote(name)));
        }
        Ok(format!("SET {}", assignments.join(", ")))
    }

    fn on_values(&self, rows: &[Vec<Node>], ctx: &mut TranslateContext) -> OrmResult<String> {
        let Some(first) = rows.first() else {
            return Err(invalid("VALUES has no rows"));
        };
        if rows.iter().any(|r| r.len() != first.len()) || first.is_empty() {
            return Err(invalid("VALUES rows must be non-empty and equally wide"));
        }
        let mut rendered_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let values = row
                .iter()
                .map(|n| self.visit(n, ctx))
                .collect::<OrmResult<Vec<_>>>()?;
            rendered_rows.push(format!("({})", values.join(", ")));
        }
        Ok(format!("VALUES {}", rendered_rows.join(", ")))
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn on_series(&self, items: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        if items.is_empty() {
            return Err(invalid("SERIES is empty"));
        }
        let rendered = items
            .iter()
            .map(|n| self.visit(n, ctx))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(rendered.join(", "))
    }

    fn on_column(&self, table: Option<&str>, name: &str, ctx: &TranslateContext) -> String {
        let column = if name == "*" {
            "*".to_string()
        } else {
            self.dialect.quote(name)
        };
        match table {
            Some(table) if !ctx.in_statement => format!("{}.{column}", self.dialect.quote(table)),
            Some(table) if ctx.joined => {
                let alias = ctx.aliases.get(table).map_or(table, String::as_str);
                format!("{}.{column}", self.dialect.quote(alias))
            }
            _ => column,
        }
    }

    fn on_alias(&self, node: &Node, alias: &str, ctx: &mut TranslateContext) -> OrmResult<String> {
        if ctx.alias_only {
            return Ok(self.dialect.quote(alias));
        }
        let inner = match node {
            Node::Table(_) | Node::Bracket(_) => self.table_source(node, ctx)?,
            other => self.visit(other, ctx)?,
        };
        Ok(format!("{inner} AS {}", self.dialect.quote(alias)))
    }

    fn on_value(&self, value: &Value, ctx: &mut TranslateContext) -> OrmResult<String> {
        if matches!(value, Value::List(_)) {
            return Err(invalid("a list VALUE must be expanded into a SERIES"));
        }
        ctx.params.push(value.clone());
        Ok(self.dialect.placeholder(ctx.params.len()))
    }

    fn on_call(&self, name: &str, args: &[Node], ctx: &mut TranslateContext) -> OrmResult<String> {
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid(format!("'{name}' is not a function name")));
        }
        let rendered = args
            .iter()
            .map(|n| self.visit(n, ctx))
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(format!("{name}({})", rendered.join(", ")))
    }

    /// Renders `child`, parenthesized if it binds looser than its parent.
    fn operand(
        &self,
        child: &Node,
        parent_level: u8,
        parent_op: &str,
        right_side: bool,
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        let level = node_level(child);
        let rendered = self.visit(child, ctx)?;
        let wrap = level < parent_level
            || (right_side
                && level == parent_level
                && level != ATOMIC
                && !ASSOCIATIVE.contains(&parent_op));
        Ok(if wrap { format!("({rendered})") } else { rendered })
    }

    fn on_unary(
        &self,
        op: &str,
        operand: &Node,
        postfix: bool,
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        let level = unary_level(op)?;
        let op = op.to_ascii_uppercase();
        let inner = self.operand(operand, level, &op, false, ctx)?;
        Ok(if postfix {
            format!("{inner} {op}")
        } else if op.chars().all(char::is_alphabetic) {
            format!("{op} {inner}")
        } else {
            format!("{op}{inner}")
        })
    }

    fn on_binary(
        &self,
        op: &str,
        left: &Node,
        right: &Node,
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        let level = binary_level(op)?;
        let op = op.to_ascii_uppercase();
        let lhs = self.operand(left, level, &op, false, ctx)?;

        if op == "BETWEEN" || op == "NOT BETWEEN" {
            let Node::Series(bounds) = right else {
                return Err(invalid(format!("{op} expects a SERIES of two bounds")));
            };
            let [low, high] = bounds.as_slice() else {
                return Err(invalid(format!("{op} expects exactly two bounds")));
            };
            let low = self.operand(low, level, &op, true, ctx)?;
            let high = self.operand(high, level, &op, true, ctx)?;
            return Ok(format!("{lhs} {op} {low} AND {high}"));
        }

        if op == "IN" || op == "NOT IN" {
            let rhs = match right {
                Node::Bracket(_) => self.visit(right, ctx)?,
                Node::Series(_) => format!("({})", self.visit(right, ctx)?),
                _ => return Err(invalid(format!("{op} expects a BRACKET or SERIES"))),
            };
            return Ok(format!("{lhs} {op} {rhs}"));
        }

        let rhs = self.operand(right, level, &op, true, ctx)?;
        Ok(format!("{lhs} {op} {rhs}"))
    }

    fn on_logical(
        &self,
        keyword: &str,
        level: u8,
        items: &[Node],
        ctx: &mut TranslateContext,
    ) -> OrmResult<String> {
        match items {
            [] => Err(invalid(format!("{keyword} has no operands"))),
            [only] => self.visit(only, ctx),
            _ => {
                let rendered = items
                    .iter()
                    .map(|n| self.operand(n, level, keyword, false, ctx))
                    .collect::<OrmResult<Vec<_>>>()?;
                Ok(rendered.join(&format!(" {keyword} ")))
            }
        }
    }

    // ── DDL ──────────────────────────────────────────────────────────

    fn on_key(&self, kind: KeyKind, name: Option<&str>, columns: &[String]) -> OrmResult<String> {
        if columns.is_empty() {
            return Err(invalid("KEY has no columns"));
        }
        self.dialect.key_sql(kind, name, columns)
    }

    fn definition(&self, node: &Node) -> OrmResult<String> {
        match node {
            Node::Field(def) => Ok(self.dialect.field_sql(def)),
            Node::Key {
                kind,
                name,
                columns,
            } => self.on_key(*kind, name.as_deref(), columns),
            _ => Err(invalid("CREATE_DEFINITION holds only FIELD and KEY nodes")),
        }
    }

    fn on_create_index(
        &self,
        name: &str,
        table: &str,
        columns: &[String],
        unique: bool,
    ) -> OrmResult<String> {
        if columns.is_empty() {
            return Err(invalid("CREATE_INDEX has no columns"));
        }
        Ok(format!(
            "CREATE {}INDEX {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            self.dialect.quote(name),
            self.dialect.quote(table),
            self.dialect.column_list(columns)
        ))
    }

    fn on_create_table(
        &self,
        table: &str,
        definition: &Node,
        options: Option<&Node>,
    ) -> OrmResult<String> {
        let Node::CreateDefinition(defs) = definition else {
            return Err(invalid("CREATE_TABLE expects a CREATE_DEFINITION"));
        };
        let auto_fields: Vec<&str> = defs
            .iter()
            .filter_map(|d| match d {
                Node::Field(f) if f.auto_increment => Some(f.name.as_str()),
                _ => None,
            })
            .collect();

        let mut body = Vec::with_capacity(defs.len());
        let mut trailing = Vec::new();
        for def in defs {
            match def {
                Node::Key {
                    kind: KeyKind::Index,
                    name,
                    columns,
                } if !self.dialect.inline_index() => {
                    let name = name
                        .clone()
                        .unwrap_or_else(|| format!("{table}_{}_idx", columns.join("_")));
                    trailing.push(self.on_create_index(&name, table, columns, false)?);
                }
                Node::Key {
                    kind: KeyKind::Primary,
                    columns,
                    ..
                } if self.dialect.inline_auto_primary_key() && !auto_fields.is_empty() => {
                    if columns.len() != 1 || columns[0] != auto_fields[0] || auto_fields.len() > 1 {
                        return Err(invalid(format!(
                            "{:?} allows auto-increment only on a single-column primary key",
                            self.backend()
                        )));
                    }
                }
                other => body.push(self.definition(other)?),
            }
        }
        if body.is_empty() {
            return Err(invalid("CREATE_TABLE has no definitions"));
        }

        let mut sql = format!("CREATE TABLE {} ({})", self.dialect.quote(table), body.join(", "));
        if let Some(options) = options {
            let Node::TableOptions(options) = options else {
                return Err(invalid("CREATE_TABLE options must be TABLE_OPTIONS"));
            };
            let rendered = self.dialect.table_options(options);
            if !rendered.is_empty() {
                sql.push(' ');
                sql.push_str(&rendered);
            }
        }
        for statement in trailing {
            sql.push_str("; ");
            sql.push_str(&statement);
        }
        Ok(sql)
    }
}

/// Assigns each distinct table a short alias and records whether columns
/// need qualifying: the statement joins, or a subquery brings in a second
/// table. An UPDATE or DELETE target cannot carry an alias, so it is
/// qualified by its own name.
fn assign_aliases(node: &Node, ctx: &mut TranslateContext) {
    ctx.aliases.clear();
    ctx.joined = false;
    let target = match node {
        Node::Update(update) => Some(&update.table),
        Node::Delete(delete) => Some(&delete.table),
        _ => None,
    };
    if let Some(Node::Table(table)) = target {
        ctx.aliases.insert(table.clone(), table.clone());
    }
    node.walk(&mut |n| match n {
        Node::Join { .. } => ctx.joined = true,
        Node::Alias { node, alias } => {
            if let Node::Table(table) = node.as_ref() {
                ctx.aliases.insert(table.clone(), alias.clone());
            }
        }
        Node::Table(table) if !ctx.aliases.contains_key(table) => {
            let base = table
                .chars()
                .find(char::is_ascii_alphabetic)
                .map_or('t', |c| c.to_ascii_lowercase())
                .to_string();
            let taken = |candidate: &str| ctx.aliases.values().any(|a| a == candidate);
            let mut alias = base.clone();
            let mut n = 1;
            while taken(&alias) {
                alias = format!("{base}{n}");
                n += 1;
            }
            ctx.aliases.insert(table.clone(), alias);
        }
        _ => {}
    });
    if ctx.aliases.len() > 1 {
        ctx.joined = true;
    }
}
