//! The synchronous database execute interface.
//!
//! [`DbExecutor`] is the bridge between this crate and the concrete
//! drivers in `rowcache-db-backends`: one value per physical connection.
//! [`Connector`] opens new physical connections for the
//! [`ConnectionPool`](crate::pool::ConnectionPool).
//!
//! Every call blocks the calling thread. There is no async path.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use rowcache_core::OrmResult;

use crate::query::compiler::DatabaseBackendType;
use crate::value::{Row, Value};

/// Outcome of executing one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Rows returned, if the statement produces any.
    pub rows: Vec<Row>,
    /// Rows changed by a write.
    pub rows_affected: u64,
    /// Identity assigned by the last `INSERT`, where the driver reports one.
    pub last_insert_id: Option<i64>,
}

impl QueryResult {
    /// A result carrying only rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    /// A result carrying only an affected-row count.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            ..Self::default()
        }
    }
}

/// A physical database connection.
pub trait DbExecutor: Send {
    /// Returns the backend type for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Executes one statement with positional parameters.
    fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<QueryResult>;

    /// Executes several `;`-separated statements without parameters.
    fn execute_script(&mut self, sql: &str) -> OrmResult<()>;

    /// Leaves autocommit mode.
    fn begin(&mut self) -> OrmResult<()> {
        self.execute_script("BEGIN")
    }

    /// Commits the open transaction.
    fn commit(&mut self) -> OrmResult<()> {
        self.execute_script("COMMIT")
    }

    /// Rolls back the open transaction.
    fn rollback(&mut self) -> OrmResult<()> {
        self.execute_script("ROLLBACK")
    }

    /// Whether the connection can still serve statements.
    fn is_usable(&self) -> bool {
        true
    }

    /// Physically closes the connection.
    fn close(&mut self) -> OrmResult<()>;
}

/// Opens physical connections.
pub trait Connector: Send + Sync {
    /// Returns the backend type of the connections produced.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Opens a new connection.
    fn connect(&self) -> OrmResult<Box<dyn DbExecutor>>;
}

/// Shared state of one cursor.
///
/// A cursor is *modified* once it executes a write that has not yet been
/// committed or rolled back. A pooled connection with a modified cursor
/// cannot be physically closed.
#[derive(Default)]
pub struct CursorState {
    modified: AtomicBool,
}

impl CursorState {
    /// Whether the cursor holds uncommitted writes.
    pub fn is_modified(&self) -> bool {
        self.modified.load(Ordering::Acquire)
    }

    /// Marks or clears the uncommitted-writes flag.
    pub fn set_modified(&self, modified: bool) {
        self.modified.store(modified, Ordering::Release);
    }
}

impl fmt::Debug for CursorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorState")
            .field("modified", &self.is_modified())
            .finish()
    }
}

const READ_KEYWORDS: [&str; 5] = ["SELECT", "PRAGMA", "EXPLAIN", "SHOW", "VALUES"];
const WRITE_KEYWORDS: [&str; 5] = ["INSERT", "UPDATE", "DELETE", "REPLACE", "MERGE"];

/// Returns `true` when `sql` may change data.
///
/// The leading keyword decides, after comments. A `WITH` statement writes
/// when any of its parts, CTE bodies included, is a DML statement.
pub(crate) fn is_write(sql: &str) -> bool {
    let words = bare_words(sql);
    let Some(head) = words.first() else {
        return false;
    };
    if head.eq_ignore_ascii_case("WITH") {
        return words.iter().any(|word| is_keyword(word, &WRITE_KEYWORDS));
    }
    !is_keyword(head, &READ_KEYWORDS)
}

fn is_keyword(word: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| word.eq_ignore_ascii_case(kw))
}

/// Identifier-like words of `sql`, skipping literals, quoted identifiers
/// and comments.
fn bare_words(sql: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut chars = sql.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                for (_, d) in chars.by_ref() {
                    if d == c {
                        break;
                    }
                }
            }
            '-' if chars.peek().is_some_and(|&(_, d)| d == '-') => {
                for (_, d) in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek().is_some_and(|&(_, d)| d == '*') => {
                chars.next();
                let mut prev = ' ';
                for (_, d) in chars.by_ref() {
                    if prev == '*' && d == '/' {
                        break;
                    }
                    prev = d;
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = start + 1;
                while let Some(&(i, d)) = chars.peek() {
                    if !(d.is_ascii_alphanumeric() || d == '_') {
                        break;
                    }
                    end = i + 1;
                    chars.next();
                }
                words.push(&sql[start..end]);
            }
            _ => {}
        }
    }
    words
}
