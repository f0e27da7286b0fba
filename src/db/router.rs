//! Routing facade over the connection pool
//!
//! A [`Database`] owns a slice of pooled connections and decides which one an
//! operation lands on. Three policies are available: least-busy with a
//! memoized choice per routing tag, stable assignment by name, and modulo
//! spreading by poller id. Statements are registered on every connection so
//! any routing decision stays valid.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::connection::Connection;
use super::error::{DbError, DbResult};
use super::operation::{Binds, Operation, RowSet, Statement, WriteSummary};
use super::pool::ConnectionPool;
use crate::config::DatabaseConfig;

#[derive(Default)]
struct RouterState {
    /// Rotating cursor for least-busy election
    current: usize,
    /// Memoized least-busy choice per routing tag
    by_tag: HashMap<i32, usize>,
    /// Stable slot per caller-chosen name, assigned round robin
    by_name: HashMap<String, usize>,
    next_named: usize,
}

/// Facade over the connections opened on one database
pub struct Database {
    config: DatabaseConfig,
    connections: Vec<Arc<Connection>>,
    state: Mutex<RouterState>,
}

impl Database {
    pub async fn connect(pool: &ConnectionPool, config: DatabaseConfig) -> DbResult<Database> {
        let connections = pool.connections(&config).await?;
        Ok(Database {
            config,
            connections,
            state: Mutex::new(RouterState::default()),
        })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn connections_count(&self) -> usize {
        self.connections.len()
    }

    /// First error flagged on any connection, if one is currently broken
    pub fn current_error(&self) -> Option<DbError> {
        self.connections
            .iter()
            .find_map(|c| c.error())
            .map(DbError::Unavailable)
    }

    /// Least-busy election with a rotating cursor. When `tag` is given the
    /// first choice is memoized and reused for every later call with the
    /// same tag, keeping dependent statements on one connection.
    pub fn choose_best_connection(&self, tag: Option<i32>) -> usize {
        let mut state = self.state.lock().unwrap();
        if let Some(tag) = tag {
            if let Some(&idx) = state.by_tag.get(&tag) {
                return idx;
            }
        }
        let count = self.connections.len();
        let mut best = state.current % count;
        let mut best_tasks = self.connections[best].tasks_count();
        for step in 1..count {
            let idx = (state.current + step) % count;
            let tasks = self.connections[idx].tasks_count();
            if tasks < best_tasks {
                best = idx;
                best_tasks = tasks;
            }
        }
        state.current = (best + 1) % count;
        if let Some(tag) = tag {
            state.by_tag.insert(tag, best);
            trace!("routing tag {} pinned to connection {}", tag, best);
        }
        best
    }

    /// Stable connection for a caller-chosen name. First use of a name takes
    /// the next slot round robin; later uses always return the same slot.
    pub fn connection_by_name(&self, name: &str) -> usize {
        let mut state = self.state.lock().unwrap();
        if let Some(&idx) = state.by_name.get(name) {
            return idx;
        }
        let idx = state.next_named % self.connections.len();
        state.next_named += 1;
        state.by_name.insert(name.to_string(), idx);
        debug!("'{}' pinned to connection {}", name, idx);
        idx
    }

    /// Spread pollers over connections so one poller's events stay ordered
    pub fn connection_by_instance(&self, instance_id: u64) -> usize {
        (instance_id % self.connections.len() as u64) as usize
    }

    /// Register a statement on every connection and wait for validation
    pub async fn prepare_statement(&self, statement: &Statement) -> DbResult<()> {
        let mut receivers = Vec::with_capacity(self.connections.len());
        for conn in &self.connections {
            let (tx, rx) = oneshot::channel();
            conn.enqueue(Operation::Prepare {
                statement: statement.clone(),
                respond_to: Some(tx),
            })?;
            receivers.push(rx);
        }
        for rx in receivers {
            rx.await.map_err(|_| DbError::ResultDropped)??;
        }
        Ok(())
    }

    /// Fire-and-forget raw query
    pub fn run_query(&self, sql: impl Into<String>, conn: usize) -> DbResult<()> {
        self.connection(conn)?.enqueue(Operation::Query { sql: sql.into() })
    }

    pub async fn run_query_and_get_rows(
        &self,
        sql: impl Into<String>,
        conn: usize,
    ) -> DbResult<RowSet> {
        let (tx, rx) = oneshot::channel();
        self.connection(conn)?.enqueue(Operation::QueryRows {
            sql: sql.into(),
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    pub async fn run_query_and_get_write(
        &self,
        sql: impl Into<String>,
        conn: usize,
    ) -> DbResult<WriteSummary> {
        let (tx, rx) = oneshot::channel();
        self.connection(conn)?.enqueue(Operation::QueryWrite {
            sql: sql.into(),
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    /// Fire-and-forget execution of a registered statement
    pub fn run_statement(&self, statement_id: u32, binds: Binds, conn: usize) -> DbResult<()> {
        self.connection(conn)?.enqueue(Operation::Execute {
            statement_id,
            binds,
        })
    }

    pub async fn run_statement_and_get_rows(
        &self,
        statement_id: u32,
        binds: Binds,
        conn: usize,
    ) -> DbResult<RowSet> {
        let (tx, rx) = oneshot::channel();
        self.connection(conn)?.enqueue(Operation::ExecuteRows {
            statement_id,
            binds,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    pub async fn run_statement_and_get_write(
        &self,
        statement_id: u32,
        binds: Binds,
        conn: usize,
    ) -> DbResult<WriteSummary> {
        let (tx, rx) = oneshot::channel();
        self.connection(conn)?.enqueue(Operation::ExecuteWrite {
            statement_id,
            binds,
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    /// Commit one connection, or all of them when `conn` is `None`.
    /// Every commit is awaited; the first error wins.
    pub async fn commit(&self, conn: Option<usize>) -> DbResult<()> {
        let targets: Vec<&Arc<Connection>> = match conn {
            Some(idx) => vec![self.connection(idx)?],
            None => self.connections.iter().collect(),
        };
        let mut receivers = Vec::with_capacity(targets.len());
        for conn in targets {
            let (tx, rx) = oneshot::channel();
            conn.enqueue(Operation::Commit {
                respond_to: Some(tx),
            })?;
            receivers.push(rx);
        }
        let mut first_error = None;
        for rx in receivers {
            match rx.await.map_err(|_| DbError::ResultDropped).and_then(|r| r) {
                Ok(()) => {}
                Err(err) => first_error = first_error.or(Some(err)),
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn server_version(&self) -> DbResult<String> {
        let (tx, rx) = oneshot::channel();
        self.connection(0)?
            .enqueue(Operation::ServerVersion { respond_to: tx })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    /// Ask every connection to drain and exit, then wait for them
    pub async fn shutdown(&self) {
        for conn in &self.connections {
            conn.stop();
        }
        futures::future::join_all(self.connections.iter().map(|c| c.wait_finished())).await;
    }

    fn connection(&self, idx: usize) -> DbResult<&Arc<Connection>> {
        self.connections
            .get(idx)
            .ok_or_else(|| DbError::StatementFailed(format!("no connection {}", idx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db(connections: usize) -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new();
        let config =
            DatabaseConfig::new(dir.path().join("router.db")).connections_count(connections);
        let db = Database::connect(&pool, config).await.unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn tagged_routing_is_memoized() {
        let (_dir, db) = test_db(3).await;
        let first = db.choose_best_connection(Some(7));
        for _ in 0..10 {
            assert_eq!(db.choose_best_connection(Some(7)), first);
        }
        db.shutdown().await;
    }

    #[tokio::test]
    async fn named_routing_is_stable() {
        let (_dir, db) = test_db(2).await;
        let logs = db.connection_by_name("logs");
        let data = db.connection_by_name("data");
        assert_ne!(logs, data);
        assert_eq!(db.connection_by_name("logs"), logs);
        assert_eq!(db.connection_by_name("data"), data);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn instance_routing_is_modulo() {
        let (_dir, db) = test_db(2).await;
        assert_eq!(db.connection_by_instance(4), 0);
        assert_eq!(db.connection_by_instance(5), 1);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn least_busy_routing_lands_on_the_idle_connection() {
        let (_dir, db) = test_db(3).await;
        // Queued work counts against a connection as soon as it is enqueued;
        // on a current-thread runtime the workers cannot drain before the
        // election below runs.
        db.run_query("SELECT 1", 0).unwrap();
        db.run_query("SELECT 1", 0).unwrap();
        db.run_query("SELECT 1", 1).unwrap();
        assert_eq!(db.choose_best_connection(None), 2);
        db.shutdown().await;
    }

    #[tokio::test]
    async fn statements_work_on_every_connection() {
        let (_dir, db) = test_db(2).await;
        db.run_query_and_get_write("CREATE TABLE t (v INTEGER)", 0)
            .await
            .unwrap();
        // The DDL sits in connection 0's open transaction until committed;
        // validation on the other connections needs to see the table.
        db.commit(Some(0)).await.unwrap();
        let stmt = Statement::new("INSERT INTO t (v) VALUES (?)");
        db.prepare_statement(&stmt).await.unwrap();

        for conn in 0..db.connections_count() {
            db.run_statement(stmt.id, Binds::from([conn as i64]), conn)
                .unwrap();
        }
        db.commit(None).await.unwrap();

        let rows = db
            .run_query_and_get_rows("SELECT COUNT(*) FROM t", 0)
            .await
            .unwrap();
        let mut rows = rows;
        assert_eq!(rows.next_row().unwrap().as_i64(0), 2);
        db.shutdown().await;
    }
}
