//! Connection management and transactions.
//!
//! [`ConnectionManager`] executes statements through a
//! [`ConnectionPool`]. Outside a transaction each statement leases a
//! connection, runs in autocommit mode, and returns it. Inside a
//! transaction every statement on the same thread shares one leased
//! connection.
//!
//! # Nesting
//!
//! Transaction state is thread-local and keyed by manager. Entering a
//! transaction while one is open on the same thread only increments a
//! depth counter: nested scopes share the outer physical transaction, and
//! only the outermost exit commits or rolls back. An inner scope that exits
//! with an error does not roll back by itself; the error reaching the outer
//! scope does.
//!
//! # Handlers
//!
//! [`ConnectionManager::on_commit`] queues a *lazy function* that runs
//! after a successful outermost commit; [`ConnectionManager::on_rollback`]
//! queues a *rollback handler* that runs after a rollback. Both run exactly
//! once, in registration order, after the connection has been returned to
//! the pool. A failing or panicking handler is logged and does not stop the
//! others.
//!
//! # Examples
//!
//! ```ignore
//! db.atomic(|txn| {
//!     db.execute("INSERT INTO t (a) VALUES (?)", &[1.into()])?;
//!     txn.on_commit(|| {
//!         tracing::info!("row is durable");
//!         Ok(())
//!     })?;
//!     Ok(())
//! })?;
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rowcache_core::{DatabaseSettings, OrmError, OrmResult};
use tracing::{debug, error};

use crate::executor::{is_write, Connector, CursorState, QueryResult};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::query::compiler::{DatabaseBackendType, SqlCompiler};
use crate::query::ir::Node;
use crate::value::{Row, Value};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// A deferred transaction callback.
pub type Handler = Box<dyn FnOnce() -> OrmResult<()>>;

#[derive(Default)]
struct ThreadState {
    depth: usize,
    connection: Option<PooledConnection>,
    cursors: Vec<Arc<CursorState>>,
    cancelled: bool,
    lazy_fns: Vec<Handler>,
    rollback_handlers: Vec<Handler>,
}

thread_local! {
    static THREAD_STATES: RefCell<HashMap<u64, ThreadState>> = RefCell::new(HashMap::new());
}

/// How an outermost transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Committed,
    RolledBack,
}

/// Executes statements and manages thread-scoped transactions for one
/// database.
pub struct ConnectionManager {
    id: u64,
    pool: Arc<ConnectionPool>,
    compiler: SqlCompiler,
}

impl ConnectionManager {
    /// Creates a manager over an existing pool.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let compiler = SqlCompiler::new(pool.backend_type());
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            pool,
            compiler,
        }
    }

    /// Creates a manager and its pool from settings.
    ///
    /// Fails with a configuration error when the configured dialect does
    /// not match the connector.
    pub fn from_settings(
        connector: Arc<dyn Connector>,
        settings: &DatabaseSettings,
    ) -> OrmResult<Self> {
        let configured = DatabaseBackendType::from_name(&settings.dialect)?;
        if configured != connector.backend_type() {
            return Err(OrmError::Configuration(format!(
                "dialect '{}' does not match a {:?} connector",
                settings.dialect,
                connector.backend_type()
            )));
        }
        Ok(Self::new(Arc::new(ConnectionPool::from_settings(
            connector, settings,
        ))))
    }

    /// The pool backing this manager.
    pub const fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The compiler for this database's dialect.
    pub const fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    /// The database backend.
    pub fn backend(&self) -> DatabaseBackendType {
        self.compiler.backend()
    }

    fn with_state<R>(&self, f: impl FnOnce(Option<&mut ThreadState>) -> R) -> R {
        THREAD_STATES.with(|states| f(states.borrow_mut().get_mut(&self.id)))
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Executes one statement.
    pub fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.execute_with(None, sql, params)
    }

    /// Translates and executes a statement tree.
    pub fn execute_node(&self, node: &Node) -> OrmResult<QueryResult> {
        let (sql, params) = self.compiler.translate(node)?;
        self.execute(&sql, &params)
    }

    /// Translates and executes a statement tree, returning its rows.
    pub fn query(&self, node: &Node) -> OrmResult<Vec<Row>> {
        Ok(self.execute_node(node)?.rows)
    }

    /// Executes a parameterless script, e.g. DDL.
    pub fn execute_script(&self, sql: &str) -> OrmResult<()> {
        debug!(sql, "Executing script");
        let in_txn = self.with_state(|state| {
            state
                .and_then(|s| s.connection.as_mut())
                .map(|conn| conn.execute_script(sql))
        });
        if let Some(result) = in_txn {
            return result;
        }
        let mut conn = self.pool.acquire()?;
        let result = conn.execute_script(sql);
        self.pool.release(conn);
        result
    }

    fn execute_with(
        &self,
        cursor: Option<&Arc<CursorState>>,
        sql: &str,
        params: &[Value],
    ) -> OrmResult<QueryResult> {
        debug!(sql, params = ?params, "Executing statement");
        let in_txn = self.with_state(|state| {
            let state = state?;
            let conn = state.connection.as_mut()?;
            let result = conn.execute(sql, params);
            if result.is_ok() && is_write(sql) {
                match cursor {
                    Some(c) => c.set_modified(true),
                    None => {
                        if let Some(c) = state.cursors.first() {
                            c.set_modified(true);
                        }
                    }
                }
            }
            Some(result)
        });
        if let Some(result) = in_txn {
            return result;
        }

        let mut conn = self.pool.acquire()?;
        let result = conn.execute(sql, params);
        self.pool.release(conn);
        result
    }

    /// Opens a cursor. Inside a transaction the cursor is bound to the
    /// transaction's connection and is discarded when it ends.
    pub fn cursor(&self) -> Cursor<'_> {
        let state = Arc::new(CursorState::default());
        self.with_state(|s| {
            if let Some(s) = s {
                if let Some(conn) = s.connection.as_mut() {
                    conn.attach_cursor(&state);
                }
                s.cursors.push(state.clone());
            }
        });
        Cursor {
            manager: self,
            state,
        }
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Enters a transaction scope.
    ///
    /// The outermost scope leases a connection and begins a physical
    /// transaction; nested scopes share it. The returned guard rolls back
    /// when dropped without [`Transaction::commit`].
    pub fn transaction(&self) -> OrmResult<Transaction<'_>> {
        let nested = self.with_state(|state| match state {
            Some(s) if s.depth > 0 => {
                s.depth += 1;
                true
            }
            _ => false,
        });

        if !nested {
            let mut conn = self.pool.acquire()?;
            if let Err(e) = conn.begin() {
                conn.expire();
                self.pool.release(conn);
                return Err(e);
            }
            let cursor = Arc::new(CursorState::default());
            conn.attach_cursor(&cursor);
            debug!(connection = conn.id(), "BEGIN");
            THREAD_STATES.with(|states| {
                states.borrow_mut().insert(
                    self.id,
                    ThreadState {
                        depth: 1,
                        connection: Some(conn),
                        cursors: vec![cursor],
                        ..ThreadState::default()
                    },
                );
            });
        }

        Ok(Transaction {
            manager: self,
            finished: false,
            _not_send: PhantomData,
        })
    }

    /// Runs `f` inside a transaction, committing on `Ok` and rolling back
    /// on `Err` or panic.
    pub fn atomic<T>(&self, f: impl FnOnce(&Transaction<'_>) -> OrmResult<T>) -> OrmResult<T> {
        let txn = self.transaction()?;
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback() {
                    error!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Whether a transaction is open on this thread.
    pub fn in_transaction(&self) -> bool {
        self.depth() > 0
    }

    /// Whether statements on this thread run in autocommit mode.
    pub fn autocommit(&self) -> bool {
        !self.in_transaction()
    }

    /// Nesting depth on this thread; zero outside a transaction.
    pub fn depth(&self) -> usize {
        self.with_state(|s| s.map_or(0, |s| s.depth))
    }

    /// Number of cursors opened during the current transaction.
    pub fn open_cursors(&self) -> usize {
        self.with_state(|s| s.map_or(0, |s| s.cursors.len()))
    }

    /// Forces the current transaction to roll back on exit.
    pub fn cancel(&self) -> OrmResult<()> {
        self.with_state(|s| match s {
            Some(s) => {
                s.cancelled = true;
                Ok(())
            }
            None => Err(OrmError::DataBase(
                "Cannot cancel: not in a transaction".to_string(),
            )),
        })
    }

    /// Whether the current transaction is marked for rollback.
    pub fn is_cancelled(&self) -> bool {
        self.with_state(|s| s.is_some_and(|s| s.cancelled))
    }

    /// Queues `f` to run after the outermost commit. Outside a transaction
    /// `f` runs immediately and its result is returned.
    pub fn on_commit(&self, f: impl FnOnce() -> OrmResult<()> + 'static) -> OrmResult<()> {
        let immediate = self.with_state(move |s| match s {
            Some(s) => {
                s.lazy_fns.push(Box::new(f));
                None
            }
            None => Some(f),
        });
        immediate.map_or(Ok(()), |f| f())
    }

    /// Queues `f` to run after a rollback. Outside a transaction there is
    /// nothing to roll back and `f` is dropped.
    pub fn on_rollback(&self, f: impl FnOnce() -> OrmResult<()> + 'static) {
        self.with_state(move |s| {
            if let Some(s) = s {
                s.rollback_handlers.push(Box::new(f));
            }
        });
    }

    /// Leaves one transaction scope. Only the outermost exit touches the
    /// database.
    fn exit(&self, success: bool) -> OrmResult<()> {
        let finished = THREAD_STATES.with(|states| {
            let mut states = states.borrow_mut();
            let state = states.get_mut(&self.id)?;
            state.depth = state.depth.saturating_sub(1);
            if state.depth > 0 {
                return Some(None);
            }
            states.remove(&self.id).map(Some)
        });
        let mut state = match finished {
            None => {
                return Err(OrmError::DataBase(
                    "Cannot leave a transaction that is not open".to_string(),
                ))
            }
            Some(None) => return Ok(()),
            Some(Some(state)) => state,
        };

        let Some(mut conn) = state.connection.take() else {
            return Err(OrmError::DataBase(
                "Transaction lost its connection".to_string(),
            ));
        };

        // `settled` is false when the server-side state is unknown.
        let (outcome, result, settled) = if success && !state.cancelled {
            match conn.commit() {
                Ok(()) => {
                    debug!(connection = conn.id(), "COMMIT");
                    (Outcome::Committed, Ok(()), true)
                }
                Err(commit_err) => {
                    error!(connection = conn.id(), error = %commit_err, "Commit failed, rolling back");
                    let settled = match conn.rollback() {
                        Ok(()) => true,
                        Err(e) => {
                            error!(connection = conn.id(), error = %e, "Rollback after failed commit failed");
                            false
                        }
                    };
                    conn.expire();
                    (Outcome::RolledBack, Err(commit_err), settled)
                }
            }
        } else {
            debug!(connection = conn.id(), cancelled = state.cancelled, "ROLLBACK");
            let result = conn.rollback();
            if result.is_err() {
                conn.expire();
            }
            let settled = result.is_ok();
            (Outcome::RolledBack, result, settled)
        };

        // Unsettled cursors stay flagged so the expired connection is
        // parked; the pool closes it once they are dropped.
        if settled {
            for cursor in &state.cursors {
                cursor.set_modified(false);
            }
        }
        self.pool.release(conn);
        drop(std::mem::take(&mut state.cursors));

        let (kind, handlers) = match outcome {
            Outcome::Committed => ("on_commit", state.lazy_fns),
            Outcome::RolledBack => ("on_rollback", state.rollback_handlers),
        };
        run_handlers(kind, handlers);
        result
    }
}

fn run_handlers(kind: &'static str, handlers: Vec<Handler>) {
    for (index, handler) in handlers.into_iter().enumerate() {
        match panic::catch_unwind(AssertUnwindSafe(handler)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(kind, index, error = %e, "Transaction handler failed"),
            Err(_) => error!(kind, index, "Transaction handler panicked"),
        }
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("id", &self.id)
            .field("backend", &self.backend())
            .field("pool", &self.pool)
            .finish()
    }
}

/// A transaction scope guard.
///
/// Dropping the guard without calling [`commit`](Self::commit) rolls the
/// scope back, including when unwinding from a panic.
pub struct Transaction<'a> {
    manager: &'a ConnectionManager,
    finished: bool,
    _not_send: PhantomData<*const ()>,
}

impl Transaction<'_> {
    /// Leaves the scope successfully. Commits if this is the outermost scope.
    pub fn commit(mut self) -> OrmResult<()> {
        self.finished = true;
        self.manager.exit(true)
    }

    /// Leaves the scope with a failure. Rolls back if this is the
    /// outermost scope.
    pub fn rollback(mut self) -> OrmResult<()> {
        self.finished = true;
        self.manager.exit(false)
    }

    /// Forces the transaction to roll back on exit.
    pub fn cancel(&self) {
        // The guard proves a transaction is open.
        let _ = self.manager.cancel();
    }

    /// Whether the transaction is marked for rollback.
    pub fn is_cancelled(&self) -> bool {
        self.manager.is_cancelled()
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.manager.depth()
    }

    /// The owning manager.
    pub const fn manager(&self) -> &ConnectionManager {
        self.manager
    }

    /// See [`ConnectionManager::on_commit`].
    pub fn on_commit(&self, f: impl FnOnce() -> OrmResult<()> + 'static) -> OrmResult<()> {
        self.manager.on_commit(f)
    }

    /// See [`ConnectionManager::on_rollback`].
    pub fn on_rollback(&self, f: impl FnOnce() -> OrmResult<()> + 'static) {
        self.manager.on_rollback(f);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.manager.exit(false) {
                error!(error = %e, "Rollback on drop failed");
            }
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("depth", &self.depth())
            .field("finished", &self.finished)
            .finish()
    }
}

/// A statement handle. Writes through a cursor inside a transaction mark
/// it modified until the transaction ends.
pub struct Cursor<'a> {
    manager: &'a ConnectionManager,
    state: Arc<CursorState>,
}

impl Cursor<'_> {
    /// Executes one statement.
    pub fn execute(&self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.manager.execute_with(Some(&self.state), sql, params)
    }

    /// Translates and executes a statement tree.
    pub fn execute_node(&self, node: &Node) -> OrmResult<QueryResult> {
        let (sql, params) = self.manager.compiler.translate(node)?;
        self.execute(&sql, &params)
    }

    /// Whether this cursor holds uncommitted writes.
    pub fn is_modified(&self) -> bool {
        self.state.is_modified()
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor").field("state", &self.state).finish()
    }
}
