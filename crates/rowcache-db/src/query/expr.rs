//! Fluent expressions that build IR predicates.
//!
//! # Examples
//!
//! ```
//! use rowcache_db::query::expr::{col, val};
//!
//! // age >= 18 AND (name LIKE 'a%' OR score * 2 > 10)
//! let pred = col("age").ge(18).and(
//!     col("name").like("a%").or((col("score") * val(2)).gt(10)),
//! );
//! assert!(pred.as_field_equality().is_none());
//! ```

use std::ops;

use super::ir::Node;
use crate::value::Value;

/// An expression tree under construction.
#[derive(Debug, Clone)]
pub struct Expr(Node);

/// A column of the query's main table.
pub fn col(name: impl Into<String>) -> Expr {
    Expr(Node::column(name))
}

/// A column of a named table.
pub fn col_of(table: impl Into<String>, name: impl Into<String>) -> Expr {
    Expr(Node::qualified(table, name))
}

/// A bound value.
pub fn val(v: impl Into<Value>) -> Expr {
    Expr(Node::value(v))
}

/// A function call.
pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
    Expr(Node::call(name, args.into_iter().map(Expr::into_node).collect()))
}

/// `COUNT(*)`.
pub fn count_all() -> Expr {
    Expr(Node::call("COUNT", vec![Node::Literal("*".into())]))
}

impl Expr {
    /// Wraps an existing node.
    pub const fn from_node(node: Node) -> Self {
        Self(node)
    }

    /// The underlying node.
    pub const fn node(&self) -> &Node {
        &self.0
    }

    /// Consumes the expression.
    pub fn into_node(self) -> Node {
        self.0
    }

    fn binary(self, op: &str, rhs: Node) -> Self {
        Self(Node::binary(op, self.0, rhs))
    }

    /// `self = v`. A `Null` value renders as `IS NULL`.
    pub fn eq(self, v: impl Into<Value>) -> Self {
        match v.into() {
            Value::Null => self.is_null(),
            v => self.binary("=", Node::Value(v)),
        }
    }

    /// `self != v`. A `Null` value renders as `IS NOT NULL`.
    pub fn ne(self, v: impl Into<Value>) -> Self {
        match v.into() {
            Value::Null => self.is_not_null(),
            v => self.binary("!=", Node::Value(v)),
        }
    }

    /// `self > v`
    pub fn gt(self, v: impl Into<Value>) -> Self {
        self.binary(">", Node::value(v))
    }

    /// `self >= v`
    pub fn ge(self, v: impl Into<Value>) -> Self {
        self.binary(">=", Node::value(v))
    }

    /// `self < v`
    pub fn lt(self, v: impl Into<Value>) -> Self {
        self.binary("<", Node::value(v))
    }

    /// `self <= v`
    pub fn le(self, v: impl Into<Value>) -> Self {
        self.binary("<=", Node::value(v))
    }

    /// Compares against another expression, e.g. a column of a joined table.
    pub fn cmp(self, op: &str, rhs: Self) -> Self {
        self.binary(op, rhs.0)
    }

    /// `self LIKE pattern`
    pub fn like(self, pattern: impl Into<String>) -> Self {
        self.binary("LIKE", Node::Value(Value::String(pattern.into())))
    }

    /// `self NOT LIKE pattern`
    pub fn not_like(self, pattern: impl Into<String>) -> Self {
        self.binary("NOT LIKE", Node::Value(Value::String(pattern.into())))
    }

    /// `self IN (...)`. An empty list matches nothing.
    pub fn is_in<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let items: Vec<Node> = values.into_iter().map(Node::value).collect();
        if items.is_empty() {
            return Self(Node::Literal("1 = 0".into()));
        }
        self.binary("IN", Node::Series(items))
    }

    /// `self NOT IN (...)`. An empty list matches everything.
    pub fn not_in<I, V>(self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let items: Vec<Node> = values.into_iter().map(Node::value).collect();
        if items.is_empty() {
            return Self(Node::Literal("1 = 1".into()));
        }
        self.binary("NOT IN", Node::Series(items))
    }

    /// `self BETWEEN low AND high`
    pub fn between(self, low: impl Into<Value>, high: impl Into<Value>) -> Self {
        self.binary("BETWEEN", Node::Series(vec![Node::value(low), Node::value(high)]))
    }

    /// `self IS NULL`
    pub fn is_null(self) -> Self {
        Self(Node::postfix("IS NULL", self.0))
    }

    /// `self IS NOT NULL`
    pub fn is_not_null(self) -> Self {
        Self(Node::postfix("IS NOT NULL", self.0))
    }

    /// Conjunction, flattening nested `AND`s.
    pub fn and(self, rhs: Self) -> Self {
        let mut items = match self.0 {
            Node::And(items) => items,
            other => vec![other],
        };
        match rhs.0 {
            Node::And(more) => items.extend(more),
            other => items.push(other),
        }
        Self(Node::And(items))
    }

    /// Disjunction, flattening nested `OR`s.
    pub fn or(self, rhs: Self) -> Self {
        let mut items = match self.0 {
            Node::Or(items) => items,
            other => vec![other],
        };
        match rhs.0 {
            Node::Or(more) => items.extend(more),
            other => items.push(other),
        }
        Self(Node::Or(items))
    }

    /// `self ASC`
    pub fn asc(self) -> Self {
        Self(Node::postfix("ASC", self.0))
    }

    /// `self DESC`
    pub fn desc(self) -> Self {
        Self(Node::postfix("DESC", self.0))
    }

    /// `self AS alias`
    pub fn alias(self, alias: impl Into<String>) -> Self {
        Self(Node::alias(self.0, alias))
    }

    /// If this is `field = value` (or `field IS NULL`) against a bare
    /// column, returns the pair.
    pub fn as_field_equality(&self) -> Option<(String, Value)> {
        match &self.0 {
            Node::BinaryOperate { op, left, right } if op == "=" || op.eq_ignore_ascii_case("IS") => {
                match (left.as_ref(), right.as_ref()) {
                    (Node::Column { table: None, name }, Node::Value(v))
                        if !matches!(v, Value::List(_)) =>
                    {
                        Some((name.clone(), v.clone()))
                    }
                    _ => None,
                }
            }
            Node::UnaryOperate {
                op,
                operand,
                postfix: true,
            } if op.eq_ignore_ascii_case("IS NULL") => match operand.as_ref() {
                Node::Column { table: None, name } => Some((name.clone(), Value::Null)),
                _ => None,
            },
            _ => None,
        }
    }
}

impl From<Expr> for Node {
    fn from(expr: Expr) -> Self {
        expr.0
    }
}

impl ops::Not for Expr {
    type Output = Self;
    fn not(self) -> Self::Output {
        Self(Node::prefix("NOT", self.0))
    }
}

impl ops::Neg for Expr {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(Node::prefix("-", self.0))
    }
}

impl ops::Add for Expr {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        self.binary("+", rhs.0)
    }
}

impl ops::Sub for Expr {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        self.binary("-", rhs.0)
    }
}

impl ops::Mul for Expr {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        self.binary("*", rhs.0)
    }
}

impl ops::Div for Expr {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        self.binary("/", rhs.0)
    }
}

impl ops::BitAnd for Expr {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl ops::BitOr for Expr {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}
