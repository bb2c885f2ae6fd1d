//! Scripted connections for unit tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rowcache_core::OrmResult;

use crate::executor::{Connector, DbExecutor, QueryResult};
use crate::pool::ConnectionPool;
use crate::query::compiler::DatabaseBackendType;
use crate::transactions::ConnectionManager;
use crate::value::Value;

pub type Responder = dyn Fn(&str, &[Value]) -> OrmResult<QueryResult> + Send + Sync;

/// Every statement and script seen by a [`ScriptedConnector`].
#[derive(Clone, Default)]
pub struct StatementLog(Arc<Mutex<Vec<(String, Vec<Value>)>>>);

impl StatementLog {
    pub fn sql(&self) -> Vec<String> {
        self.0.lock().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn entries(&self) -> Vec<(String, Vec<Value>)> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn count_matching(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|(s, _)| s.starts_with(prefix)).count()
    }
}

struct ScriptedConnection {
    backend: DatabaseBackendType,
    log: StatementLog,
    responder: Arc<Responder>,
}

impl DbExecutor for ScriptedConnection {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> OrmResult<QueryResult> {
        self.log.0.lock().push((sql.to_string(), params.to_vec()));
        (self.responder)(sql, params)
    }

    fn execute_script(&mut self, sql: &str) -> OrmResult<()> {
        self.log.0.lock().push((sql.to_string(), Vec::new()));
        Ok(())
    }

    fn close(&mut self) -> OrmResult<()> {
        Ok(())
    }
}

/// A connector whose connections answer through one closure.
pub struct ScriptedConnector {
    backend: DatabaseBackendType,
    log: StatementLog,
    responder: Arc<Responder>,
}

impl Connector for ScriptedConnector {
    fn backend_type(&self) -> DatabaseBackendType {
        self.backend
    }

    fn connect(&self) -> OrmResult<Box<dyn DbExecutor>> {
        Ok(Box::new(ScriptedConnection {
            backend: self.backend,
            log: self.log.clone(),
            responder: self.responder.clone(),
        }))
    }
}

/// A SQLite-dialect manager over a scripted connector.
pub fn scripted_manager(
    responder: impl Fn(&str, &[Value]) -> OrmResult<QueryResult> + Send + Sync + 'static,
) -> (Arc<ConnectionManager>, StatementLog) {
    let log = StatementLog::default();
    let connector = Arc::new(ScriptedConnector {
        backend: DatabaseBackendType::SQLite,
        log: log.clone(),
        responder: Arc::new(responder),
    });
    let pool = ConnectionPool::new(connector, 2, Duration::from_secs(60));
    (Arc::new(ConnectionManager::new(Arc::new(pool))), log)
}
