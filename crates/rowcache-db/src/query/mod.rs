//! Statement construction and translation.
//!
//! - [`ir`] - The statement tree ([`Node`]) every statement is built as
//! - [`expr`] - Typed predicate and projection expressions
//! - [`builder`] - The immutable [`Query`] builder and its execution methods
//! - [`compiler`] - Tree to SQL translation ([`SqlCompiler`])
//! - [`dialect`] - Per-backend quoting, placeholders, and DDL fragments

pub mod builder;
pub mod compiler;
pub mod dialect;
pub mod expr;
pub mod ir;

pub use builder::{Projected, Projection, Query};
pub use compiler::{DatabaseBackendType, SqlCompiler, TranslateContext};
pub use dialect::{Dialect, MySqlDialect, PostgresDialect, SqliteDialect};
pub use expr::{call, col, col_of, count_all, val, Expr};
pub use ir::{JoinKind, KeyKind, Node};
