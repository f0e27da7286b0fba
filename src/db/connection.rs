//! A single database connection and the worker task that owns it
//!
//! Callers never touch the SQLite session directly. They enqueue
//! [`Operation`]s on a FIFO and a dedicated worker executes them in order,
//! commits on the configured cadence and reconnects on its own when the
//! session is lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous,
};
use sqlx::{ConnectOptions, Connection as _, Executor, Row as _, SqliteConnection, TypeInfo, ValueRef};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use super::error::{DbError, DbResult};
use super::operation::{
    BindValue, Operation, Row, RowSet, StatementRegistry, Value, WriteSummary,
};
use crate::config::DatabaseConfig;

/// Attempts granted to a statement that keeps hitting lock conflicts
const MAX_ATTEMPTS: u32 = 2;

/// Pause between lock-conflict retries
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// How long the worker waits for work before running housekeeping
const IDLE_WAIT: Duration = Duration::from_secs(5);

/// Idle interval after which the session is pinged
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pause between reconnection attempts while the session is down
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);

/// Lifecycle of a connection worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    Running,
    Finished,
}

struct Shared {
    config: DatabaseConfig,
    tasks_count: AtomicU32,
    finish_asked: AtomicBool,
    error_flag: AtomicBool,
    error_message: Mutex<String>,
    state: watch::Sender<ConnectionState>,
}

/// Handle to one pooled connection. Cheap to clone through an `Arc`.
pub struct Connection {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Operation>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("path", &self.shared.config.path)
            .field("state", &*self.state_rx.borrow())
            .field("tasks", &self.tasks_count())
            .finish()
    }
}

impl Connection {
    /// Open the session and start the worker. Returns once the session is
    /// usable or the first connection attempt failed.
    pub async fn spawn(config: DatabaseConfig) -> DbResult<Arc<Connection>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::NotStarted);
        let (ready_tx, ready_rx) = oneshot::channel();

        let shared = Arc::new(Shared {
            config,
            tasks_count: AtomicU32::new(0),
            finish_asked: AtomicBool::new(false),
            error_flag: AtomicBool::new(false),
            error_message: Mutex::new(String::new()),
            state: state_tx,
        });

        let worker = Worker::new(Arc::clone(&shared), receiver);
        tokio::spawn(worker.run(ready_tx));

        ready_rx
            .await
            .map_err(|_| DbError::ConnectionFailed("worker exited during startup".into()))??;

        Ok(Arc::new(Connection {
            shared,
            sender,
            state_rx,
        }))
    }

    /// Queue an operation. Fails with [`DbError::Interrupted`] once shutdown
    /// started, fulfilling the operation's result handle with the same error.
    pub fn enqueue(&self, op: Operation) -> DbResult<()> {
        if self.shared.finish_asked.load(Ordering::Acquire) || self.is_finished() {
            op.interrupt(DbError::Interrupted);
            return Err(DbError::Interrupted);
        }
        self.shared.tasks_count.fetch_add(1, Ordering::AcqRel);
        if let Err(err) = self.sender.send(op) {
            self.shared.tasks_count.fetch_sub(1, Ordering::AcqRel);
            err.0.interrupt(DbError::Interrupted);
            return Err(DbError::Interrupted);
        }
        Ok(())
    }

    /// Number of operations waiting in the FIFO. Used for load balancing.
    pub fn tasks_count(&self) -> u32 {
        self.shared.tasks_count.load(Ordering::Acquire)
    }

    pub fn is_in_error(&self) -> bool {
        self.shared.error_flag.load(Ordering::Acquire)
    }

    /// Last recorded session error, if the connection is currently broken
    pub fn error(&self) -> Option<String> {
        if self.is_in_error() {
            Some(self.shared.error_message.lock().unwrap().clone())
        } else {
            None
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == ConnectionState::Finished
    }

    /// Ask the worker to drain its queue, commit and exit. Idempotent.
    pub fn stop(&self) {
        if !self.shared.finish_asked.swap(true, Ordering::AcqRel) {
            // Wake the worker with a final commit so shutdown is prompt.
            self.shared.tasks_count.fetch_add(1, Ordering::AcqRel);
            if self.sender.send(Operation::Commit { respond_to: None }).is_err() {
                self.shared.tasks_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Wait until the worker has fully exited
    pub async fn wait_finished(&self) {
        let mut rx = self.state_rx.clone();
        let _ = rx.wait_for(|s| *s == ConnectionState::Finished).await;
    }
}

enum Outcome {
    Rows(RowSet),
    Write(WriteSummary),
}

struct Worker {
    shared: Arc<Shared>,
    receiver: mpsc::UnboundedReceiver<Operation>,
    session: Option<SqliteConnection>,
    registry: StatementRegistry,
    last_access: Instant,
    last_commit: Instant,
    in_transaction: bool,
    uncommitted: u32,
}

impl Worker {
    fn new(shared: Arc<Shared>, receiver: mpsc::UnboundedReceiver<Operation>) -> Self {
        Worker {
            shared,
            receiver,
            session: None,
            registry: StatementRegistry::default(),
            last_access: Instant::now(),
            last_commit: Instant::now(),
            in_transaction: false,
            uncommitted: 0,
        }
    }

    async fn run(mut self, ready: oneshot::Sender<DbResult<()>>) {
        match self.open().await {
            Ok(session) => {
                self.session = Some(session);
                self.shared.state.send_replace(ConnectionState::Running);
                let _ = ready.send(Ok(()));
            }
            Err(err) => {
                error!(
                    "connection to '{}' failed: {}",
                    self.shared.config.path.display(),
                    err
                );
                self.shared.state.send_replace(ConnectionState::Finished);
                let _ = ready.send(Err(err));
                return;
            }
        }

        debug!("connection to '{}' open", self.shared.config.path.display());
        self.last_access = Instant::now();
        self.last_commit = Instant::now();

        let mut pending: VecDeque<Operation> = VecDeque::new();
        loop {
            if self.shared.error_flag.load(Ordering::Acquire) {
                if !self.reconnect().await {
                    if self.shared.finish_asked.load(Ordering::Acquire) {
                        break;
                    }
                    sleep(RECONNECT_BACKOFF).await;
                    continue;
                }
            }

            if pending.is_empty() {
                match timeout(IDLE_WAIT, self.receiver.recv()).await {
                    Ok(Some(op)) => {
                        pending.push_back(op);
                        while let Ok(op) = self.receiver.try_recv() {
                            pending.push_back(op);
                        }
                    }
                    // All senders dropped, nothing can arrive anymore.
                    Ok(None) => break,
                    Err(_) => {
                        self.idle_tick().await;
                        if self.shared.finish_asked.load(Ordering::Acquire) {
                            break;
                        }
                        continue;
                    }
                }
            }

            while let Some(op) = pending.pop_front() {
                self.shared.tasks_count.fetch_sub(1, Ordering::AcqRel);
                self.process(op).await;
                if self.shared.error_flag.load(Ordering::Acquire) {
                    // Remaining operations stay queued and run after the
                    // session is back.
                    break;
                }
                self.commit_if_overdue().await;
            }

            if self.shared.finish_asked.load(Ordering::Acquire)
                && pending.is_empty()
                && self.receiver.is_empty()
            {
                break;
            }
        }

        self.shutdown(pending).await;
    }

    /// Drain what is left, then commit and close. Broken sessions fail the
    /// remaining operations instead.
    async fn shutdown(mut self, mut pending: VecDeque<Operation>) {
        self.receiver.close();
        while let Ok(op) = self.receiver.try_recv() {
            pending.push_back(op);
        }

        while let Some(op) = pending.pop_front() {
            self.shared.tasks_count.fetch_sub(1, Ordering::AcqRel);
            if self.shared.error_flag.load(Ordering::Acquire) {
                op.interrupt(DbError::Interrupted);
            } else {
                self.process(op).await;
            }
        }

        if !self.shared.error_flag.load(Ordering::Acquire) {
            if let Err(err) = self.commit_now().await {
                warn!("final commit failed: {}", err);
            }
        }

        if let Some(session) = self.session.take() {
            let _ = session.close().await;
        }
        self.shared.state.send_replace(ConnectionState::Finished);
        debug!("connection to '{}' closed", self.shared.config.path.display());
    }

    async fn open(&self) -> DbResult<SqliteConnection> {
        let cfg = &self.shared.config;
        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(cfg.busy_timeout as u64));
        options
            .connect()
            .await
            .map_err(|e| DbError::ConnectionFailed(e.to_string()))
    }

    fn session_mut(&mut self) -> DbResult<&mut SqliteConnection> {
        self.session
            .as_mut()
            .ok_or_else(|| DbError::Unavailable("session closed".into()))
    }

    fn set_error(&mut self, msg: String) {
        error!("session on '{}' lost: {}", self.shared.config.path.display(), msg);
        *self.shared.error_message.lock().unwrap() = msg;
        self.shared.error_flag.store(true, Ordering::Release);
        // The open transaction died with the session.
        self.in_transaction = false;
        self.uncommitted = 0;
    }

    /// Close the dead session, reopen and re-validate every registered
    /// statement. On failure the error flag stays set and the caller backs
    /// off before the next attempt.
    async fn reconnect(&mut self) -> bool {
        info!("reconnecting to '{}'", self.shared.config.path.display());
        if let Some(old) = self.session.take() {
            let _ = old.close().await;
        }
        self.in_transaction = false;
        self.uncommitted = 0;

        let mut session = match self.open().await {
            Ok(session) => session,
            Err(err) => {
                warn!("reconnection failed: {}", err);
                return false;
            }
        };

        let mut invalid = None;
        for (id, sql) in self.registry.iter() {
            if let Err(err) = (&mut session).prepare(sql.as_str()).await {
                invalid = Some((*id, err));
                break;
            }
        }
        if let Some((id, err)) = invalid {
            warn!("statement {} no longer valid after reconnect: {}", id, err);
            let _ = session.close().await;
            return false;
        }

        self.session = Some(session);
        self.shared.error_flag.store(false, Ordering::Release);
        self.last_access = Instant::now();
        self.last_commit = Instant::now();
        info!("reconnection to '{}' succeeded", self.shared.config.path.display());
        true
    }

    /// Periodic housekeeping while the FIFO is empty
    async fn idle_tick(&mut self) {
        self.commit_if_overdue().await;
        if self.last_access.elapsed() >= PING_INTERVAL {
            let Ok(session) = self.session_mut() else { return };
            match sqlx::query("SELECT 1").execute(&mut *session).await {
                Ok(_) => {
                    trace!("session ping ok");
                    self.last_access = Instant::now();
                }
                Err(err) => self.set_error(err.to_string()),
            }
        }
    }

    async fn commit_if_overdue(&mut self) {
        let delay = self.shared.config.max_commit_delay;
        if delay > 0
            && self.uncommitted > 0
            && self.last_commit.elapsed() >= Duration::from_secs(delay as u64)
        {
            if let Err(err) = self.commit_now().await {
                warn!("delayed commit failed: {}", err);
            }
        }
    }

    async fn commit_now(&mut self) -> DbResult<()> {
        if !self.in_transaction {
            self.last_commit = Instant::now();
            return Ok(());
        }
        let mut attempts = 0;
        loop {
            let session = self.session_mut()?;
            match sqlx::query("COMMIT").execute(&mut *session).await {
                Ok(_) => {
                    self.in_transaction = false;
                    self.uncommitted = 0;
                    self.last_commit = Instant::now();
                    return Ok(());
                }
                Err(err) => {
                    let err = DbError::from(err);
                    attempts += 1;
                    match err {
                        DbError::Busy(msg) if attempts < MAX_ATTEMPTS => {
                            debug!("commit hit a lock, retrying: {}", msg);
                            sleep(RETRY_DELAY).await;
                        }
                        DbError::Busy(msg) => return Err(DbError::StatementFailed(msg)),
                        DbError::Unavailable(msg) => {
                            self.set_error(msg.clone());
                            return Err(DbError::Unavailable(msg));
                        }
                        other => return Err(other),
                    }
                }
            }
        }
    }

    async fn begin_if_needed(&mut self) -> DbResult<()> {
        if self.shared.config.queries_per_transaction <= 1 || self.in_transaction {
            return Ok(());
        }
        let session = self.session_mut()?;
        match sqlx::query("BEGIN").execute(&mut *session).await {
            Ok(_) => {
                self.in_transaction = true;
                Ok(())
            }
            Err(err) => {
                let err = DbError::from(err);
                if let DbError::Unavailable(msg) = &err {
                    self.set_error(msg.clone());
                }
                Err(err)
            }
        }
    }

    /// Statements are grouped into transactions of `queries_per_transaction`
    /// writes. A batch filling up commits on the spot.
    async fn bump_uncommitted(&mut self) -> DbResult<()> {
        if self.shared.config.queries_per_transaction <= 1 {
            return Ok(());
        }
        self.uncommitted += 1;
        if self.uncommitted >= self.shared.config.queries_per_transaction {
            self.commit_now().await?;
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        sql: &str,
        binds: &[BindValue],
        want_rows: bool,
    ) -> DbResult<Outcome> {
        let session = self.session_mut()?;
        let mut query = sqlx::query(sql);
        for bind in binds {
            query = match bind {
                BindValue::Null => query.bind(None::<i64>),
                BindValue::Bool(v) => query.bind(*v),
                BindValue::I32(v) => query.bind(*v),
                BindValue::U32(v) => query.bind(*v as i64),
                BindValue::I64(v) => query.bind(*v),
                BindValue::U64(v) => query.bind(*v as i64),
                BindValue::F64(v) => query.bind(*v),
                BindValue::Text(v) => query.bind(v.as_str()),
            };
        }
        if want_rows {
            let rows = query.fetch_all(&mut *session).await.map_err(DbError::from)?;
            Ok(Outcome::Rows(decode_rows(&rows)?))
        } else {
            let result = query.execute(&mut *session).await.map_err(DbError::from)?;
            Ok(Outcome::Write(WriteSummary {
                rows_affected: result.rows_affected(),
                last_insert_id: result.last_insert_rowid(),
            }))
        }
    }

    /// Execute with the retry policy: lock conflicts commit the open
    /// transaction and retry within a small budget, a lost session flags the
    /// connection broken and surfaces [`DbError::Unavailable`].
    async fn run_with_retry(
        &mut self,
        sql: &str,
        binds: &[BindValue],
        want_rows: bool,
    ) -> DbResult<Outcome> {
        self.begin_if_needed().await?;
        let mut attempts = 0;
        loop {
            self.last_access = Instant::now();
            match self.run_once(sql, binds, want_rows).await {
                Ok(outcome) => {
                    if !want_rows {
                        self.bump_uncommitted().await?;
                    }
                    return Ok(outcome);
                }
                Err(DbError::Busy(msg)) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(DbError::StatementFailed(msg));
                    }
                    debug!("lock conflict, committing before retry: {}", msg);
                    self.commit_now().await?;
                    sleep(RETRY_DELAY).await;
                    self.begin_if_needed().await?;
                }
                Err(DbError::Unavailable(msg)) => {
                    self.set_error(msg.clone());
                    return Err(DbError::Unavailable(msg));
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn validate(&mut self, sql: &str) -> DbResult<()> {
        let session = self.session_mut()?;
        match (&mut *session).prepare(sql).await {
            Ok(_) => Ok(()),
            Err(err) => {
                let err = DbError::from(err);
                if let DbError::Unavailable(msg) = &err {
                    self.set_error(msg.clone());
                }
                Err(err)
            }
        }
    }

    async fn server_version(&mut self) -> DbResult<String> {
        let session = self.session_mut()?;
        let row = sqlx::query("SELECT sqlite_version()")
            .fetch_one(&mut *session)
            .await
            .map_err(DbError::from)?;
        row.try_get::<String, _>(0).map_err(DbError::from)
    }

    async fn process(&mut self, op: Operation) {
        match op {
            Operation::Query { sql } => {
                if let Err(err) = self.run_with_retry(&sql, &[], false).await {
                    if !err.is_transient() {
                        error!("query failed: {}", err);
                    }
                }
            }
            Operation::QueryRows { sql, respond_to } => {
                let res = self.run_with_retry(&sql, &[], true).await.map(into_rows);
                let _ = respond_to.send(res);
            }
            Operation::QueryWrite { sql, respond_to } => {
                let res = self.run_with_retry(&sql, &[], false).await.map(into_write);
                let _ = respond_to.send(res);
            }
            Operation::Prepare {
                statement,
                respond_to,
            } => {
                self.registry.insert(&statement);
                let res = self.validate(&statement.sql).await;
                match respond_to {
                    Some(tx) => {
                        let _ = tx.send(res);
                    }
                    None => {
                        if let Err(err) = res {
                            warn!("preparing statement {} failed: {}", statement.id, err);
                        }
                    }
                }
            }
            Operation::Execute {
                statement_id,
                binds,
            } => {
                let sql = match self.registry.sql(statement_id) {
                    Ok(sql) => sql.to_string(),
                    Err(err) => {
                        error!("{}", err);
                        return;
                    }
                };
                if let Err(err) = self.run_with_retry(&sql, binds.values(), false).await {
                    if !err.is_transient() {
                        error!("statement {} failed: {}", statement_id, err);
                    }
                }
            }
            Operation::ExecuteRows {
                statement_id,
                binds,
                respond_to,
            } => {
                let res = match self.registry.sql(statement_id) {
                    Ok(sql) => {
                        let sql = sql.to_string();
                        self.run_with_retry(&sql, binds.values(), true)
                            .await
                            .map(into_rows)
                    }
                    Err(err) => Err(err),
                };
                let _ = respond_to.send(res);
            }
            Operation::ExecuteWrite {
                statement_id,
                binds,
                respond_to,
            } => {
                let res = match self.registry.sql(statement_id) {
                    Ok(sql) => {
                        let sql = sql.to_string();
                        self.run_with_retry(&sql, binds.values(), false)
                            .await
                            .map(into_write)
                    }
                    Err(err) => Err(err),
                };
                let _ = respond_to.send(res);
            }
            Operation::Commit { respond_to } => {
                let res = self.commit_now().await;
                match respond_to {
                    Some(tx) => {
                        let _ = tx.send(res);
                    }
                    None => {
                        if let Err(err) = res {
                            warn!("commit failed: {}", err);
                        }
                    }
                }
            }
            Operation::ServerVersion { respond_to } => {
                let res = self.server_version().await;
                let _ = respond_to.send(res);
            }
        }
    }
}

fn into_rows(outcome: Outcome) -> RowSet {
    match outcome {
        Outcome::Rows(rows) => rows,
        Outcome::Write(_) => RowSet::default(),
    }
}

fn into_write(outcome: Outcome) -> WriteSummary {
    match outcome {
        Outcome::Write(summary) => summary,
        Outcome::Rows(_) => WriteSummary::default(),
    }
}

fn decode_rows(rows: &[SqliteRow]) -> DbResult<RowSet> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(row.len());
        for idx in 0..row.len() {
            let raw = row.try_get_raw(idx).map_err(DbError::from)?;
            let value = if raw.is_null() {
                Value::Null
            } else {
                let name = raw.type_info().name().to_string();
                match name.as_str() {
                    "INTEGER" | "BOOLEAN" => {
                        Value::Integer(row.try_get::<i64, _>(idx).map_err(DbError::from)?)
                    }
                    "REAL" => Value::Real(row.try_get::<f64, _>(idx).map_err(DbError::from)?),
                    "BLOB" => Value::Blob(row.try_get::<Vec<u8>, _>(idx).map_err(DbError::from)?),
                    _ => Value::Text(row.try_get::<String, _>(idx).map_err(DbError::from)?),
                }
            };
            values.push(value);
        }
        out.push(Row::new(values));
    }
    Ok(RowSet::new(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::operation::{Binds, Statement};
    use assert_matches::assert_matches;

    fn test_config(dir: &tempfile::TempDir) -> DatabaseConfig {
        DatabaseConfig::new(dir.path().join("test.db")).queries_per_transaction(5)
    }

    async fn query_rows(conn: &Connection, sql: &str) -> DbResult<RowSet> {
        let (tx, rx) = oneshot::channel();
        conn.enqueue(Operation::QueryRows {
            sql: sql.to_string(),
            respond_to: tx,
        })?;
        rx.await.map_err(|_| DbError::ResultDropped)?
    }

    #[tokio::test]
    async fn executes_operations_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();

        conn.enqueue(Operation::Query {
            sql: "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)".into(),
        })
        .unwrap();
        let stmt = Statement::new("INSERT INTO items (name) VALUES (?)");
        conn.enqueue(Operation::Prepare {
            statement: stmt.clone(),
            respond_to: None,
        })
        .unwrap();
        for name in ["a", "b", "c"] {
            conn.enqueue(Operation::Execute {
                statement_id: stmt.id,
                binds: Binds::from([name]),
            })
            .unwrap();
        }

        let mut rows = query_rows(&conn, "SELECT name FROM items ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.next_row().unwrap().as_str(0), "a");

        conn.stop();
        conn.wait_finished().await;
    }

    #[tokio::test]
    async fn write_summary_reports_rowid() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();

        conn.enqueue(Operation::Query {
            sql: "CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)".into(),
        })
        .unwrap();
        let (tx, rx) = oneshot::channel();
        conn.enqueue(Operation::QueryWrite {
            sql: "INSERT INTO t (v) VALUES (7)".into(),
            respond_to: tx,
        })
        .unwrap();
        let summary = rx.await.unwrap().unwrap();
        assert_eq!(summary.rows_affected, 1);
        assert_eq!(summary.last_insert_id, 1);

        conn.stop();
        conn.wait_finished().await;
    }

    #[tokio::test]
    async fn reconnects_and_revalidates_after_a_lost_session() {
        let dir = tempfile::tempdir().unwrap();
        let config =
            DatabaseConfig::new(dir.path().join("test.db")).queries_per_transaction(1);
        let conn = Connection::spawn(config).await.unwrap();

        conn.enqueue(Operation::Query {
            sql: "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)".into(),
        })
        .unwrap();
        let stmt = Statement::new("INSERT INTO items (name) VALUES (?)");
        conn.enqueue(Operation::Prepare {
            statement: stmt.clone(),
            respond_to: None,
        })
        .unwrap();
        conn.enqueue(Operation::Execute {
            statement_id: stmt.id,
            binds: Binds::from(["before"]),
        })
        .unwrap();
        // Drain the queue so the statement is registered before the session
        // is torn down.
        query_rows(&conn, "SELECT COUNT(*) FROM items").await.unwrap();

        *conn.shared.error_message.lock().unwrap() = "session dropped".into();
        conn.shared.error_flag.store(true, Ordering::Release);
        assert!(conn.is_in_error());

        // Operations queued while the connection is erroring run once the
        // worker has reopened the session and re-validated the registry.
        conn.enqueue(Operation::Execute {
            statement_id: stmt.id,
            binds: Binds::from(["after"]),
        })
        .unwrap();
        let mut rows = query_rows(&conn, "SELECT name FROM items ORDER BY id")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.next_row().unwrap().as_str(0), "before");
        assert_eq!(rows.next_row().unwrap().as_str(0), "after");
        assert!(!conn.is_in_error());

        conn.stop();
        conn.wait_finished().await;
    }

    #[tokio::test]
    async fn rejects_operations_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();
        conn.stop();
        conn.wait_finished().await;

        let (tx, rx) = oneshot::channel();
        let res = conn.enqueue(Operation::QueryRows {
            sql: "SELECT 1".into(),
            respond_to: tx,
        });
        assert_matches!(res, Err(DbError::Interrupted));
        assert_matches!(rx.await, Ok(Err(DbError::Interrupted)));
    }

    #[tokio::test]
    async fn unknown_statement_fails_result_handle() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        conn.enqueue(Operation::ExecuteRows {
            statement_id: 9999,
            binds: Binds::new(),
            respond_to: tx,
        })
        .unwrap();
        assert_matches!(rx.await.unwrap(), Err(DbError::UnknownStatement(9999)));

        conn.stop();
        conn.wait_finished().await;
    }

    #[tokio::test]
    async fn statement_error_does_not_break_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        conn.enqueue(Operation::QueryWrite {
            sql: "INSERT INTO missing_table VALUES (1)".into(),
            respond_to: tx,
        })
        .unwrap();
        assert_matches!(rx.await.unwrap(), Err(DbError::StatementFailed(_)));

        // The worker keeps serving after a statement failure.
        assert!(!conn.is_in_error());
        let rows = query_rows(&conn, "SELECT 1").await.unwrap();
        assert_eq!(rows.len(), 1);

        conn.stop();
        conn.wait_finished().await;
    }

    #[tokio::test]
    async fn version_reports_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::spawn(test_config(&dir)).await.unwrap();

        let (tx, rx) = oneshot::channel();
        conn.enqueue(Operation::ServerVersion { respond_to: tx }).unwrap();
        let version = rx.await.unwrap().unwrap();
        assert!(version.starts_with('3'));

        conn.stop();
        conn.wait_finished().await;
    }
}
