//! The statement intermediate representation.
//!
//! Every statement the builder produces is a tree of [`Node`] values, one
//! variant per tag. The tree is pure data: rendering to SQL text happens in
//! [`SqlCompiler`](super::compiler::SqlCompiler), which matches on every
//! variant so that an unhandled tag is a compile error.
//!
//! Clause slots on the statement structs (`where_clause`, `order_by`, ...)
//! hold the clause node itself (`Node::Where`, `Node::OrderBy`, ...). The
//! compiler rejects a slot holding the wrong tag as not a valid statement.

use crate::schema::FieldDef;
use crate::value::Value;

/// Join flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    /// `INNER JOIN`
    Inner,
    /// `LEFT OUTER JOIN`
    Left,
    /// `RIGHT OUTER JOIN`
    Right,
    /// `CROSS JOIN`
    Cross,
}

impl JoinKind {
    /// The SQL keyword sequence.
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::Left => "LEFT OUTER JOIN",
            Self::Right => "RIGHT OUTER JOIN",
            Self::Cross => "CROSS JOIN",
        }
    }
}

/// Key flavours inside `CREATE_DEFINITION`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// `PRIMARY KEY`
    Primary,
    /// A unique constraint.
    Unique,
    /// A plain (non-unique) index.
    Index,
}

/// Body of a `SELECT` node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    /// `SELECT DISTINCT`.
    pub distinct: bool,
    /// Projection list.
    pub columns: Vec<Node>,
    /// A `Node::From`.
    pub from: Option<Node>,
    /// A `Node::Where`.
    pub where_clause: Option<Node>,
    /// A `Node::GroupBy`.
    pub group_by: Option<Node>,
    /// A `Node::Having`.
    pub having: Option<Node>,
    /// A `Node::OrderBy`.
    pub order_by: Option<Node>,
    /// A `Node::Limit`.
    pub limit: Option<Node>,
    /// A `Node::ForUpdate`.
    pub for_update: Option<Node>,
}

/// Body of an `INSERT` node.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    /// A `Node::Table`.
    pub table: Node,
    /// Target columns.
    pub columns: Vec<Node>,
    /// A `Node::Values`.
    pub values: Node,
    /// A `Node::Returning`.
    pub returning: Option<Node>,
}

/// Body of an `UPDATE` node.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    /// A `Node::Table`.
    pub table: Node,
    /// A `Node::Set`.
    pub set: Node,
    /// A `Node::Where`.
    pub where_clause: Option<Node>,
}

/// Body of a `DELETE` node.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    /// A `Node::Table`.
    pub table: Node,
    /// A `Node::Where`.
    pub where_clause: Option<Node>,
}

/// A statement tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Several statements, separated by `;`.
    Progn(Vec<Node>),
    /// Several fragments, separated by a space.
    Sentence(Vec<Node>),
    /// `SELECT ...`
    Select(Box<Select>),
    /// `INSERT INTO ...`
    Insert(Box<Insert>),
    /// `UPDATE ...`
    Update(Box<Update>),
    /// `DELETE FROM ...`
    Delete(Box<Delete>),
    /// `SET col = expr, ...`
    Set(Vec<(Node, Node)>),
    /// `VALUES (...), (...)`
    Values(Vec<Vec<Node>>),
    /// A parenthesized expression or subquery.
    Bracket(Box<Node>),
    /// A comma-separated list.
    Series(Vec<Node>),
    /// A column reference, optionally qualified by table name.
    Column {
        /// Owning table.
        table: Option<String>,
        /// Column name, or `*`.
        name: String,
    },
    /// `expr AS alias`; in alias-only clauses renders as the alias alone.
    Alias {
        /// Aliased expression or table.
        node: Box<Node>,
        /// Alias name.
        alias: String,
    },
    /// `FROM source [joins]`
    From {
        /// A `Node::Table` or bracketed subquery.
        source: Box<Node>,
        /// `Node::Join` entries.
        joins: Vec<Node>,
    },
    /// `<kind> JOIN target [ON ...]`
    Join {
        /// Join flavour.
        kind: JoinKind,
        /// A `Node::Table`.
        target: Box<Node>,
        /// A `Node::On`.
        on: Option<Box<Node>>,
    },
    /// A bound parameter.
    Value(Value),
    /// A quoted identifier.
    Quote(String),
    /// A table reference.
    Table(String),
    /// `RETURNING cols` where the dialect supports it.
    Returning(Vec<Node>),
    /// A function call.
    Call {
        /// Function name, rendered verbatim.
        name: String,
        /// Arguments.
        args: Vec<Node>,
    },
    /// `WHERE predicate`
    Where(Box<Node>),
    /// `ON predicate`
    On(Box<Node>),
    /// `HAVING predicate`
    Having(Box<Node>),
    /// `GROUP BY exprs`
    GroupBy(Vec<Node>),
    /// `ORDER BY exprs`
    OrderBy(Vec<Node>),
    /// `LIMIT`, rendered in dialect order.
    Limit {
        /// Rows to skip.
        offset: Option<u64>,
        /// Rows to return.
        count: u64,
    },
    /// A prefix or postfix operator.
    UnaryOperate {
        /// Operator, e.g. `NOT`, `-`, `DESC`, `IS NULL`.
        op: String,
        /// Operand.
        operand: Box<Node>,
        /// Whether the operator follows its operand.
        postfix: bool,
    },
    /// An infix operator.
    BinaryOperate {
        /// Operator, e.g. `=`, `+`, `LIKE`, `IN`, `BETWEEN`.
        op: String,
        /// Left operand.
        left: Box<Node>,
        /// Right operand. For `BETWEEN` a two-element `Series`.
        right: Box<Node>,
    },
    /// Conjunction.
    And(Vec<Node>),
    /// Disjunction.
    Or(Vec<Node>),
    /// Conditional expression.
    If {
        /// Condition.
        cond: Box<Node>,
        /// Value when true.
        then: Box<Node>,
        /// Value when false.
        otherwise: Box<Node>,
    },
    /// `CREATE [UNIQUE] INDEX`
    CreateIndex {
        /// Index name.
        name: String,
        /// Indexed table.
        table: String,
        /// Indexed columns.
        columns: Vec<String>,
        /// Unique index.
        unique: bool,
    },
    /// `CREATE TABLE`
    CreateTable {
        /// Table name.
        table: String,
        /// A `Node::CreateDefinition`.
        definition: Box<Node>,
        /// A `Node::TableOptions`.
        options: Option<Box<Node>>,
    },
    /// Column and key definitions of a `CREATE TABLE`.
    CreateDefinition(Vec<Node>),
    /// `ALTER TABLE ... ADD COLUMN`
    AddField {
        /// Table name.
        table: String,
        /// A `Node::Field`.
        field: Box<Node>,
    },
    /// `ALTER TABLE ... MODIFY COLUMN`
    ModifyField {
        /// Table name.
        table: String,
        /// A `Node::Field`.
        field: Box<Node>,
    },
    /// A column definition.
    Field(FieldDef),
    /// A key definition.
    Key {
        /// Key flavour.
        kind: KeyKind,
        /// Constraint or index name.
        name: Option<String>,
        /// Key columns.
        columns: Vec<String>,
    },
    /// Storage options (`ENGINE=...`).
    TableOptions(Vec<(String, String)>),
    /// Row locking clause.
    ForUpdate,
    /// A keyword or constant rendered verbatim.
    Literal(String),
}

// ── Constructors ───────────────────────────────────────────────────────

impl Node {
    /// An unqualified column.
    pub fn column(name: impl Into<String>) -> Self {
        Self::Column {
            table: None,
            name: name.into(),
        }
    }

    /// A table-qualified column.
    pub fn qualified(table: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Column {
            table: Some(table.into()),
            name: name.into(),
        }
    }

    /// A bound value.
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    /// An infix operation.
    pub fn binary(op: impl Into<String>, left: Self, right: Self) -> Self {
        Self::BinaryOperate {
            op: op.into(),
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// A prefix operation.
    pub fn prefix(op: impl Into<String>, operand: Self) -> Self {
        Self::UnaryOperate {
            op: op.into(),
            operand: Box::new(operand),
            postfix: false,
        }
    }

    /// A postfix operation.
    pub fn postfix(op: impl Into<String>, operand: Self) -> Self {
        Self::UnaryOperate {
            op: op.into(),
            operand: Box::new(operand),
            postfix: true,
        }
    }

    /// A function call.
    pub fn call(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Call {
            name: name.into(),
            args,
        }
    }

    /// `expr AS alias`.
    pub fn alias(node: Self, alias: impl Into<String>) -> Self {
        Self::Alias {
            node: Box::new(node),
            alias: alias.into(),
        }
    }

    /// Returns the number of `VALUE` leaves, in document order.
    pub fn value_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |node| {
            if matches!(node, Self::Value(_)) {
                count += 1;
            }
        });
        count
    }

    /// Visits this node and every descendant, parents first.
    pub fn walk<F: FnMut(&Self)>(&self, f: &mut F) {
        f(self);
        match self {
            Self::Progn(items)
            | Self::Sentence(items)
            | Self::Series(items)
            | Self::Returning(items)
            | Self::GroupBy(items)
            | Self::OrderBy(items)
            | Self::And(items)
            | Self::Or(items)
            | Self::CreateDefinition(items) => {
                for item in items {
                    item.walk(f);
                }
            }
            Self::Call { args, .. } => {
                for arg in args {
                    arg.walk(f);
                }
            }
            Self::Select(select) => {
                for column in &select.columns {
                    column.walk(f);
                }
                for clause in [
                    &select.from,
                    &select.where_clause,
                    &select.group_by,
                    &select.having,
                    &select.order_by,
                    &select.limit,
                    &select.for_update,
                ]
                .into_iter()
                .flatten()
                {
                    clause.walk(f);
                }
            }
            Self::Insert(insert) => {
                insert.table.walk(f);
                for column in &insert.columns {
                    column.walk(f);
                }
                insert.values.walk(f);
                if let Some(returning) = &insert.returning {
                    returning.walk(f);
                }
            }
            Self::Update(update) => {
                update.table.walk(f);
                update.set.walk(f);
                if let Some(w) = &update.where_clause {
                    w.walk(f);
                }
            }
            Self::Delete(delete) => {
                delete.table.walk(f);
                if let Some(w) = &delete.where_clause {
                    w.walk(f);
                }
            }
            Self::Set(pairs) => {
                for (column, value) in pairs {
                    column.walk(f);
                    value.walk(f);
                }
            }
            Self::Values(rows) => {
                for row in rows {
                    for value in row {
                        value.walk(f);
                    }
                }
            }
            Self::Bracket(inner)
            | Self::Where(inner)
            | Self::On(inner)
            | Self::Having(inner) => inner.walk(f),
            Self::Alias { node, .. } => node.walk(f),
            Self::From { source, joins } => {
                source.walk(f);
                for join in joins {
                    join.walk(f);
                }
            }
            Self::Join { target, on, .. } => {
                target.walk(f);
                if let Some(on) = on {
                    on.walk(f);
                }
            }
            Self::UnaryOperate { operand, .. } => operand.walk(f),
            Self::BinaryOperate { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Self::If {
                cond,
                then,
                otherwise,
            } => {
                cond.walk(f);
                then.walk(f);
                otherwise.walk(f);
            }
            Self::CreateTable {
                definition,
                options,
                ..
            } => {
                definition.walk(f);
                if let Some(options) = options {
                    options.walk(f);
                }
            }
            Self::AddField { field, .. } | Self::ModifyField { field, .. } => field.walk(f),
            Self::Value(_)
            | Self::Column { .. }
            | Self::Quote(_)
            | Self::Table(_)
            | Self::Limit { .. }
            | Self::CreateIndex { .. }
            | Self::Field(_)
            | Self::Key { .. }
            | Self::TableOptions(_)
            | Self::ForUpdate
            | Self::Literal(_) => {}
        }
    }

    /// Returns `true` for `SELECT`/`INSERT`/`UPDATE`/`DELETE`.
    pub const fn is_statement(&self) -> bool {
        matches!(
            self,
            Self::Select(_) | Self::Insert(_) | Self::Update(_) | Self::Delete(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_count_in_document_order() {
        let node = Node::And(vec![
            Node::binary("=", Node::column("a"), Node::value(1)),
            Node::binary(
                "BETWEEN",
                Node::column("b"),
                Node::Series(vec![Node::value(2), Node::value(3)]),
            ),
        ]);
        assert_eq!(node.value_count(), 3);
        let mut seen = Vec::new();
        node.walk(&mut |n| {
            if let Node::Value(v) = n {
                seen.push(v.clone());
            }
        });
        assert_eq!(seen, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn test_walk_reaches_subquery() {
        let sub = Node::Select(Box::new(Select {
            columns: vec![Node::column("id")],
            from: Some(Node::From {
                source: Box::new(Node::Table("groups".into())),
                joins: vec![],
            }),
            where_clause: Some(Node::Where(Box::new(Node::binary(
                "=",
                Node::column("active"),
                Node::value(true),
            )))),
            ..Select::default()
        }));
        let outer = Node::binary("IN", Node::column("group_id"), Node::Bracket(Box::new(sub)));
        let mut tables = Vec::new();
        outer.walk(&mut |n| {
            if let Node::Table(t) = n {
                tables.push(t.clone());
            }
        });
        assert_eq!(tables, vec!["groups".to_string()]);
        assert_eq!(outer.value_count(), 1);
    }

    #[test]
    fn test_is_statement() {
        assert!(Node::Select(Box::default()).is_statement());
        assert!(!Node::column("x").is_statement());
    }
}
