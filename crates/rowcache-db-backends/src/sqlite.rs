//! SQLite driver using `rusqlite`.
//!
//! [`SqliteConnector`] opens connections to a database file or to a named
//! shared in-memory database. Every call runs on the calling thread.
//!
//! Features:
//! - WAL mode and a busy timeout for file databases
//! - Shared in-memory databases that outlive the pooled connections
//! - Constraint violations surface as `Integrity` errors, lock contention as
//!   `Operational`

use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use rowcache_core::{OrmError, OrmResult};
use rowcache_db::query::DatabaseBackendType;
use rowcache_db::{Connector, DbExecutor, QueryResult, Row, Value};
use rusqlite::types::ValueRef;
use rusqlite::{ErrorCode, OpenFlags};
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn map_err(e: rusqlite::Error) -> OrmError {
    match &e {
        rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => OrmError::Integrity(e.to_string()),
            ErrorCode::DatabaseBusy
            | ErrorCode::DatabaseLocked
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure => OrmError::Operational(e.to_string()),
            _ => OrmError::DataBase(e.to_string()),
        },
        _ => OrmError::DataBase(e.to_string()),
    }
}

/// Where a connector's database lives.
#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    Memory(String),
}

impl Target {
    fn open(&self) -> OrmResult<rusqlite::Connection> {
        let conn = match self {
            Self::File(path) => rusqlite::Connection::open(path),
            Self::Memory(uri) => rusqlite::Connection::open_with_flags(
                uri,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            ),
        }
        .map_err(|e| OrmError::Operational(format!("SQLite open failed: {e}")))?;

        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_err)?;
        let pragmas = match self {
            Self::File(_) => "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;",
            Self::Memory(_) => "PRAGMA foreign_keys=ON;",
        };
        conn.execute_batch(pragmas)
            .map_err(|e| OrmError::Operational(format!("Failed to set pragmas: {e}")))?;
        Ok(conn)
    }
}

/// Opens SQLite connections for a pool.
pub struct SqliteConnector {
    target: Target,
    /// Keeps a shared in-memory database alive while pooled connections
    /// come and go.
    anchor: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteConnector {
    /// A connector for the database file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            target: Target::File(path.into()),
            anchor: Mutex::new(None),
        }
    }

    /// A connector for a fresh, uniquely named in-memory database shared by
    /// every connection this connector opens.
    pub fn memory() -> OrmResult<Self> {
        Self::shared_memory(&format!("rowcache_{}", uuid::Uuid::new_v4().simple()))
    }

    /// A connector for the named shared in-memory database.
    pub fn shared_memory(name: &str) -> OrmResult<Self> {
        let target = Target::Memory(format!("file:{name}?mode=memory&cache=shared"));
        let anchor = target.open()?;
        Ok(Self {
            target,
            anchor: Mutex::new(Some(anchor)),
        })
    }

    /// Whether the database lives in memory.
    pub const fn is_memory(&self) -> bool {
        matches!(self.target, Target::Memory(_))
    }

    /// Opens a connection without going through a pool.
    pub fn connect_direct(&self) -> OrmResult<SqliteConnection> {
        Ok(SqliteConnection {
            conn: Some(self.target.open()?),
        })
    }
}

impl std::fmt::Debug for SqliteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnector")
            .field("target", &self.target)
            .field("anchored", &self.anchor.lock().is_some())
            .finish()
    }
}

impl Connector for SqliteConnector {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn connect(&self) -> OrmResult<Box<dyn DbExecutor>> {
        Ok(Box::new(self.connect_direct()?))
    }
}

/// One physical SQLite connection.
pub struct SqliteConnection {
    conn: Option<rusqlite::Connection>,
}

impl SqliteConnection {
    fn conn(&self) -> OrmResult<&rusqlite::Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| OrmError::Operational("SQLite connection is closed".to_string()))
    }

    /// Binds values to a statement's positional parameters.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> OrmResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(vals) => {
                    let json = serde_json::to_string(vals)?;
                    stmt.raw_bind_parameter(idx, json)
                }
            }
            .map_err(|e| OrmError::DataBase(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    fn convert_row(row: &rusqlite::Row<'_>, columns: &[String]) -> OrmResult<Row> {
        let values = (0..columns.len())
            .map(|i| {
                Ok(match row.get_ref(i).map_err(map_err)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(v) => Value::Int(v),
                    ValueRef::Real(v) => Value::Float(v),
                    ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                    ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
                })
            })
            .collect::<OrmResult<Vec<_>>>()?;
        Ok(Row::new(columns.to_vec(), values))
    }
}

impl std::fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("open", &self.conn.is_some())
            .finish()
    }
}

impl DbExecutor for SqliteConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql).map_err(map_err)?;
        Self::bind_params(&mut stmt, params)?;

        if stmt.column_count() > 0 {
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut raw = stmt.raw_query();
            let mut rows = Vec::new();
            while let Some(row) = raw.next().map_err(map_err)? {
                rows.push(Self::convert_row(row, &columns)?);
            }
            return Ok(QueryResult::from_rows(rows));
        }

        let affected = stmt.raw_execute().map_err(map_err)?;
        let is_insert = sql
            .trim_start()
            .get(..6)
            .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"));
        Ok(QueryResult {
            rows: Vec::new(),
            rows_affected: affected as u64,
            last_insert_id: is_insert.then(|| conn.last_insert_rowid()),
        })
    }

    fn execute_script(&mut self, sql: &str) -> OrmResult<()> {
        self.conn()?.execute_batch(sql).map_err(map_err)
    }

    fn is_usable(&self) -> bool {
        self.conn.is_some()
    }

    fn close(&mut self) -> OrmResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        match conn.close() {
            Ok(()) => {
                debug!("Closed SQLite connection");
                Ok(())
            }
            Err((conn, e)) => {
                self.conn = Some(conn);
                Err(map_err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SqliteConnection {
        SqliteConnector::memory().unwrap().connect_direct().unwrap()
    }

    #[test]
    fn test_sqlite_memory_open() {
        let connector = SqliteConnector::memory().unwrap();
        assert!(connector.is_memory());
        assert_eq!(connector.backend_type(), DatabaseBackendType::SQLite);
    }

    #[test]
    fn test_sqlite_insert_and_query() {
        let mut db = memory();
        db.execute_script("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();
        let inserted = db
            .execute(
                "INSERT INTO users (name, age) VALUES (?, ?)",
                &[Value::from("Alice"), Value::from(30)],
            )
            .unwrap();
        assert_eq!(inserted.rows_affected, 1);
        assert_eq!(inserted.last_insert_id, Some(1));

        let result = db.execute("SELECT id, name, age FROM users", &[]).unwrap();
        assert_eq!(result.rows.len(), 1);
        assert_eq!(result.rows[0].get::<String>("name").unwrap(), "Alice");
        assert_eq!(result.rows[0].get::<i64>("age").unwrap(), 30);
    }

    #[test]
    fn test_sqlite_null_and_blob_handling() {
        let mut db = memory();
        db.execute_script("CREATE TABLE t (id INTEGER PRIMARY KEY, bio TEXT, data BLOB)")
            .unwrap();
        db.execute(
            "INSERT INTO t (bio, data) VALUES (?, ?)",
            &[Value::Null, Value::Bytes(vec![1, 2, 3])],
        )
        .unwrap();
        let rows = db.execute("SELECT bio, data FROM t", &[]).unwrap().rows;
        assert_eq!(rows[0].values(), &[Value::Null, Value::Bytes(vec![1, 2, 3])]);
    }

    #[test]
    fn test_sqlite_constraint_violation_is_integrity_error() {
        let mut db = memory();
        db.execute_script("CREATE TABLE t (email TEXT UNIQUE)").unwrap();
        db.execute("INSERT INTO t (email) VALUES (?)", &[Value::from("a@x")])
            .unwrap();
        let err = db
            .execute("INSERT INTO t (email) VALUES (?)", &[Value::from("a@x")])
            .unwrap_err();
        assert!(matches!(err, OrmError::Integrity(_)));
    }

    #[test]
    fn test_sqlite_shared_memory_outlives_connections() {
        let connector = SqliteConnector::memory().unwrap();
        let mut first = connector.connect_direct().unwrap();
        first.execute_script("CREATE TABLE t (x INTEGER)").unwrap();
        first.close().unwrap();

        let mut second = connector.connect_direct().unwrap();
        let rows = second.execute("SELECT COUNT(*) FROM t", &[]).unwrap().rows;
        assert_eq!(rows[0].get_by_index::<i64>(0).unwrap(), 0);
    }

    #[test]
    fn test_sqlite_closed_connection_is_unusable() {
        let mut db = memory();
        assert!(db.is_usable());
        db.close().unwrap();
        assert!(!db.is_usable());
        assert!(matches!(db.execute("SELECT 1", &[]), Err(OrmError::Operational(_))));
        db.close().unwrap();
    }

    #[test]
    fn test_sqlite_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let connector = SqliteConnector::open(dir.path().join("rc.db"));
        assert!(!connector.is_memory());
        let mut db = connector.connect_direct().unwrap();
        db.execute_script("CREATE TABLE t (x INTEGER)").unwrap();
        db.execute("INSERT INTO t (x) VALUES (?)", &[Value::Int(7)]).unwrap();
        let mut other = connector.connect_direct().unwrap();
        let rows = other.execute("SELECT x FROM t", &[]).unwrap().rows;
        assert_eq!(rows[0].get::<i64>("x").unwrap(), 7);
    }
}
