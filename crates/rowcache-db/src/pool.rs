//! Pooled physical connections.
//!
//! A connection is either *idle* (in the pool) or *active* (leased to a
//! caller). Each carries an expiry fixed at creation. [`ConnectionPool::acquire`]
//! reuses an idle connection when one is live, and otherwise opens a new one;
//! [`ConnectionPool::release`] returns a connection to the idle set unless the
//! pool is at capacity.
//!
//! A surplus connection whose cursors still hold uncommitted writes is not
//! closed on release. It is parked and closed by a later [`ConnectionPool::reap`]
//! once no cursor is modified.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rowcache_core::{DatabaseSettings, OrmResult};
use tracing::{debug, warn};

use crate::executor::{Connector, CursorState, DbExecutor, QueryResult};
use crate::query::compiler::DatabaseBackendType;
use crate::value::Value;

/// A physical connection with pool bookkeeping.
pub struct PooledConnection {
    id: u64,
    conn: Box<dyn DbExecutor>,
    expires_at: Instant,
    cursors: Vec<Weak<CursorState>>,
}

impl PooledConnection {
    fn new(id: u64, conn: Box<dyn DbExecutor>, max_age: Duration) -> Self {
        Self {
            id,
            conn,
            expires_at: Instant::now() + max_age,
            cursors: Vec::new(),
        }
    }

    /// Pool-unique identifier.
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// When this connection stops being reused.
    pub const fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Overrides the expiry.
    pub fn set_expires_at(&mut self, at: Instant) {
        self.expires_at = at;
    }

    /// Expires the connection immediately.
    pub fn expire(&mut self) {
        self.expires_at = Instant::now();
    }

    /// Whether the expiry has passed.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Tracks a cursor opened on this connection.
    pub fn attach_cursor(&mut self, cursor: &Arc<CursorState>) {
        self.cursors.retain(|c| c.strong_count() > 0);
        self.cursors.push(Arc::downgrade(cursor));
    }

    /// Whether any live cursor holds uncommitted writes.
    pub fn has_modified_cursors(&self) -> bool {
        self.cursors
            .iter()
            .filter_map(Weak::upgrade)
            .any(|c| c.is_modified())
    }

    /// The backend of the wrapped connection.
    pub fn backend_type(&self) -> DatabaseBackendType {
        self.conn.backend_type()
    }

    /// Executes one statement.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.conn.execute(sql, params)
    }

    /// Executes a parameterless script.
    pub fn execute_script(&mut self, sql: &str) -> OrmResult<()> {
        self.conn.execute_script(sql)
    }

    pub(crate) fn begin(&mut self) -> OrmResult<()> {
        self.conn.begin()
    }

    pub(crate) fn commit(&mut self) -> OrmResult<()> {
        self.conn.commit()
    }

    pub(crate) fn rollback(&mut self) -> OrmResult<()> {
        self.conn.rollback()
    }

    fn close(mut self) {
        if let Err(e) = self.conn.close() {
            warn!(connection = self.id, error = %e, "Error closing connection");
        } else {
            debug!(connection = self.id, "Closed connection");
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("expires_at", &self.expires_at)
            .field("cursors", &self.cursors.len())
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledConnection>,
    pending_close: Vec<(PooledConnection, Instant)>,
    active: usize,
}

/// A pool of physical connections for one database.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,
    capacity: usize,
    max_age: Duration,
    close_retry: Duration,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Creates a pool keeping up to `capacity` idle connections, each living
    /// at most `max_age`.
    pub fn new(connector: Arc<dyn Connector>, capacity: usize, max_age: Duration) -> Self {
        Self {
            connector,
            capacity,
            max_age,
            close_retry: Duration::from_millis(100),
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Creates a pool from database settings.
    pub fn from_settings(connector: Arc<dyn Connector>, settings: &DatabaseSettings) -> Self {
        Self::new(connector, settings.pool_size, settings.max_age())
            .with_close_retry(settings.close_retry())
    }

    /// Sets the delay between attempts to close a parked connection.
    #[must_use]
    pub const fn with_close_retry(mut self, retry: Duration) -> Self {
        self.close_retry = retry;
        self
    }

    /// The backend of connections in this pool.
    pub fn backend_type(&self) -> DatabaseBackendType {
        self.connector.backend_type()
    }

    /// Maximum number of idle connections.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Leases a connection.
    ///
    /// Expired or unusable idle connections are closed and skipped. Only a
    /// failure to open a new connection is surfaced.
    pub fn acquire(&self) -> OrmResult<PooledConnection> {
        self.reap();
        let reused = {
            let mut state = self.state.lock();
            let mut found = None;
            while let Some(conn) = state.idle.pop_front() {
                if conn.is_expired() || !conn.conn.is_usable() {
                    debug!(connection = conn.id, "Discarding stale connection");
                    conn.close();
                    continue;
                }
                found = Some(conn);
                break;
            }
            if found.is_some() {
                state.active += 1;
            }
            found
        };
        if let Some(conn) = reused {
            return Ok(conn);
        }

        let raw = self.connector.connect()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, backend = ?raw.backend_type(), "Opened connection");
        self.state.lock().active += 1;
        Ok(PooledConnection::new(id, raw, self.max_age))
    }

    /// Returns a leased connection.
    pub fn release(&self, conn: PooledConnection) {
        let surplus = {
            let mut state = self.state.lock();
            state.active = state.active.saturating_sub(1);
            if conn.is_expired() || !conn.conn.is_usable() || state.idle.len() >= self.capacity {
                Some(conn)
            } else {
                state.idle.push_back(conn);
                None
            }
        };
        if let Some(conn) = surplus {
            self.close_or_park(conn);
        }
    }

    fn close_or_park(&self, conn: PooledConnection) {
        if conn.has_modified_cursors() {
            warn!(
                connection = conn.id,
                "Connection has uncommitted cursors, deferring close"
            );
            let retry_at = Instant::now() + self.close_retry;
            self.state.lock().pending_close.push((conn, retry_at));
        } else {
            conn.close();
        }
    }

    /// Closes parked connections whose cursors are clean and drops expired
    /// idle connections.
    pub fn reap(&self) {
        let now = Instant::now();
        let doomed: Vec<PooledConnection> = {
            let mut state = self.state.lock();
            let mut doomed = Vec::new();

            let pending = std::mem::take(&mut state.pending_close);
            for (conn, retry_at) in pending {
                if retry_at > now {
                    state.pending_close.push((conn, retry_at));
                } else if conn.has_modified_cursors() {
                    state.pending_close.push((conn, now + self.close_retry));
                } else {
                    doomed.push(conn);
                }
            }

            let idle = std::mem::take(&mut state.idle);
            for conn in idle {
                if conn.is_expired() {
                    doomed.push(conn);
                } else {
                    state.idle.push_back(conn);
                }
            }
            doomed
        };
        for conn in doomed {
            conn.close();
        }
    }

    /// Number of live idle connections. Expired ones are closed first.
    pub fn idle_count(&self) -> usize {
        self.reap();
        self.state.lock().idle.len()
    }

    /// Number of leased connections.
    pub fn active_count(&self) -> usize {
        self.state.lock().active
    }

    /// Number of connections waiting for their cursors before closing.
    pub fn pending_close_count(&self) -> usize {
        self.state.lock().pending_close.len()
    }

    /// Closes every idle and parked connection.
    pub fn close_all(&self) {
        let (idle, pending) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.pending_close),
            )
        };
        for conn in idle {
            conn.close();
        }
        for (conn, _) in pending {
            conn.close();
        }
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity)
            .field("idle", &state.idle.len())
            .field("active", &state.active)
            .field("pending_close", &state.pending_close.len())
            .finish_non_exhaustive()
    }
}
