//! The write coordinator: single consumer of the event streams
//!
//! Producers push decoded events through a [`CoordinatorHandle`]; one loop
//! task serializes every relational write, batches the high-volume tables,
//! issues commit barriers between interdependent writes and releases acks
//! back to the producers once their events are safely committed.

pub mod actions;
pub mod cache;
pub mod fifo;
pub mod statements;

mod sql;
mod storage;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::{CoordinatorConfig, DatabaseConfig};
use crate::db::{self, ConnectionPool, CoordinatorError, Database, DbError, DbResult};
use crate::events::{
    CustomVariable, CustomVariableStatus, Downtime, Event, LogEntry, Publisher, StreamKind,
};
use crate::perfdata::MetricType;
use actions::ActionTable;
use cache::CacheSet;
use fifo::{EventEntry, EventFifo};
use statements::Statements;

/// Fixed routing slots, taken modulo the connection count. Writes to these
/// table families always land on the same connection so their bulk queries
/// never interleave.
pub(crate) mod special {
    pub const CUSTOM_VARIABLE: usize = 0;
    pub const DOWNTIME: usize = 1;
    pub const HOST_GROUP: usize = 2;
    pub const HOST_PARENT: usize = 3;
    pub const LOG: usize = 4;
    pub const SERVICE_GROUP: usize = 5;
    pub const SEVERITY: usize = 6;
    pub const TAG: usize = 7;
    pub const DATA_BIN: usize = 8;
    pub const METRIC: usize = 9;
}

/// Routing tag pinning index_data writes to one connection
pub(crate) const INDEX_DATA_TAG: i32 = 1;

/// Poll interval while the FIFO is empty
const EMPTY_POLL: Duration = Duration::from_millis(500);

/// Time-based flush interval of the batched queues
const BULK_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Downtimes flush more often, their readers are latency sensitive
const DOWNTIME_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval of the deleted index/metric sweep
const DELETED_INDEX_SCAN_INTERVAL: Duration = Duration::from_secs(300);

/// How long `stop()` waits for the loop to acknowledge
const STOP_WAIT: Duration = Duration::from_secs(60);

/// Rolling window length of the events-per-second estimate
const SPEED_SAMPLES: usize = 20;

/// One row bound for the data_bin bulk insert
#[derive(Debug, Clone)]
pub(crate) struct PerfRow {
    pub metric_id: u64,
    pub ctime: i64,
    pub status: i16,
    pub value: f64,
}

/// Pending update of one metrics row, last writer wins per metric id
#[derive(Debug, Clone)]
pub(crate) struct MetricUpdate {
    pub metric_id: u64,
    pub value: f64,
    pub unit_name: String,
    pub warn: f64,
    pub warn_low: f64,
    pub warn_mode: bool,
    pub crit: f64,
    pub crit_low: f64,
    pub crit_mode: bool,
    pub min: f64,
    pub max: f64,
    pub metric_type: MetricType,
}

struct Shared {
    db_config: DatabaseConfig,
    fifo: Mutex<EventFifo>,
    notify: Notify,
    broken: AtomicBool,
    exit_asked: AtomicBool,
    storage_attached: AtomicBool,
    graph_removals: Mutex<Vec<(Vec<u64>, Vec<u64>)>>,
    stats: Mutex<serde_json::Value>,
    stopped: watch::Sender<bool>,
}

/// Producer-facing handle to the coordinator. Cheap to clone.
#[derive(Clone)]
pub struct CoordinatorHandle {
    shared: Arc<Shared>,
    stopped_rx: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    /// Push one event; returns the acks already collectable on the stream
    pub fn send_event(&self, kind: StreamKind, event: Event) -> Result<usize, CoordinatorError> {
        self.check_usable()?;
        let acks = self.shared.fifo.lock().unwrap().push(kind, event);
        self.shared.notify.notify_one();
        Ok(acks)
    }

    /// Collect and reset the ack counter of one stream
    pub fn get_acks(&self, kind: StreamKind) -> Result<usize, CoordinatorError> {
        self.check_usable()?;
        Ok(self.shared.fifo.lock().unwrap().take_acks(kind))
    }

    /// Attach the metric-extraction stream. The storage side shares the Sql
    /// stream's database; a different configuration is refused.
    pub fn attach_storage(&self, db_config: &DatabaseConfig) -> Result<(), CoordinatorError> {
        self.check_usable()?;
        if *db_config != self.shared.db_config {
            return Err(CoordinatorError::ConfigMismatch(format!(
                "storage stream wants '{}' but the coordinator runs on '{}'",
                db_config.path.display(),
                self.shared.db_config.path.display()
            )));
        }
        self.shared.storage_attached.store(true, Ordering::Release);
        Ok(())
    }

    /// Ask the out-of-band task to drop the given graphs
    pub fn remove_graphs(
        &self,
        index_ids: Vec<u64>,
        metric_ids: Vec<u64>,
    ) -> Result<(), CoordinatorError> {
        self.check_usable()?;
        self.shared
            .graph_removals
            .lock()
            .unwrap()
            .push((index_ids, metric_ids));
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Snapshot of the loop's runtime statistics
    pub fn statistics(&self) -> serde_json::Value {
        self.shared.stats.lock().unwrap().clone()
    }

    /// Stop the loop and report whether the stop was clean
    pub async fn stop(&self) -> bool {
        info!("stopping write coordinator");
        self.shared.exit_asked.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let mut rx = self.stopped_rx.clone();
        let _ = timeout(STOP_WAIT, rx.wait_for(|s| *s)).await;
        !self.shared.broken.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<(), CoordinatorError> {
        if self.shared.broken.load(Ordering::Acquire) {
            return Err(CoordinatorError::Broken(
                "the coordinator loop hit a fatal error".into(),
            ));
        }
        if self.shared.exit_asked.load(Ordering::Acquire) || *self.stopped_rx.borrow() {
            return Err(CoordinatorError::Stopped);
        }
        Ok(())
    }
}

/// Entry point: builds the database layer, seeds the caches and starts the
/// loop task.
pub struct WriteCoordinator;

impl WriteCoordinator {
    pub async fn spawn(
        db_config: DatabaseConfig,
        config: CoordinatorConfig,
        publisher: Arc<dyn Publisher>,
        pool: &ConnectionPool,
    ) -> Result<CoordinatorHandle, CoordinatorError> {
        db::install_schema(&db_config).await?;
        let db = Arc::new(Database::connect(pool, db_config.clone()).await?);
        match db.server_version().await {
            Ok(version) => info!("write coordinator using sqlite {}", version),
            Err(err) => warn!("could not read backend version: {}", err),
        }

        let stmts = Statements::new();
        stmts.prepare_all(&db).await?;

        let mut caches = CacheSet::new();
        caches
            .load(&db)
            .await
            .map_err(|e| CoordinatorError::Cache(e.to_string()))?;

        let (stopped_tx, stopped_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            db_config,
            fifo: Mutex::new(EventFifo::default()),
            notify: Notify::new(),
            broken: AtomicBool::new(false),
            exit_asked: AtomicBool::new(false),
            storage_attached: AtomicBool::new(false),
            graph_removals: Mutex::new(Vec::new()),
            stats: Mutex::new(serde_json::Value::Null),
            stopped: stopped_tx,
        });

        let qpt = db.config().queries_per_transaction as usize;
        let connections = db.connections_count();
        let now = Instant::now();
        let inner = Inner {
            max_perfdata: config.max_perfdata_queries.unwrap_or(qpt).max(1),
            max_metrics: config.max_metrics_queries.unwrap_or(qpt).max(1),
            max_cv: config.max_cv_queries.unwrap_or(qpt).max(1),
            max_logs: config.max_log_queries.unwrap_or(qpt).max(1),
            max_downtimes: config.max_downtime_queries.unwrap_or(qpt).max(1),
            db,
            cfg: config,
            shared: Arc::clone(&shared),
            publisher,
            caches,
            actions: ActionTable::new(connections),
            stmts,
            perfdata_queue: Vec::new(),
            perfdata_markers: Vec::new(),
            metrics_queue: HashMap::new(),
            cv_queue: Vec::new(),
            cvs_queue: Vec::new(),
            downtimes_queue: Vec::new(),
            logs_queue: Vec::new(),
            next_perfdata_flush: now + BULK_FLUSH_INTERVAL,
            next_metrics_flush: now + BULK_FLUSH_INTERVAL,
            next_cv_flush: now + BULK_FLUSH_INTERVAL,
            next_downtimes_flush: now + DOWNTIME_FLUSH_INTERVAL,
            next_logs_flush: now + BULK_FLUSH_INTERVAL,
            next_deleted_index_scan: now + DELETED_INDEX_SCAN_INTERVAL,
            events_handled: 0,
            batch_handled: 0,
            budget_start: now,
            speed: VecDeque::with_capacity(SPEED_SAMPLES),
            last_stats_at: now,
            last_stats_handled: 0,
        };
        tokio::spawn(inner.run());

        Ok(CoordinatorHandle { shared, stopped_rx })
    }
}

pub(crate) struct Inner {
    pub(crate) db: Arc<Database>,
    pub(crate) cfg: CoordinatorConfig,
    shared: Arc<Shared>,
    pub(crate) publisher: Arc<dyn Publisher>,
    pub(crate) caches: CacheSet,
    pub(crate) actions: ActionTable,
    pub(crate) stmts: Statements,

    pub(crate) perfdata_queue: Vec<PerfRow>,
    pub(crate) perfdata_markers: Vec<Arc<AtomicBool>>,
    pub(crate) metrics_queue: HashMap<u64, MetricUpdate>,
    pub(crate) cv_queue: Vec<(CustomVariable, Arc<AtomicBool>)>,
    pub(crate) cvs_queue: Vec<(CustomVariableStatus, Arc<AtomicBool>)>,
    pub(crate) downtimes_queue: Vec<(Downtime, Arc<AtomicBool>)>,
    pub(crate) logs_queue: Vec<(LogEntry, Arc<AtomicBool>)>,

    pub(crate) max_perfdata: usize,
    pub(crate) max_metrics: usize,
    pub(crate) max_cv: usize,
    pub(crate) max_logs: usize,
    pub(crate) max_downtimes: usize,

    pub(crate) next_perfdata_flush: Instant,
    pub(crate) next_metrics_flush: Instant,
    pub(crate) next_cv_flush: Instant,
    pub(crate) next_downtimes_flush: Instant,
    pub(crate) next_logs_flush: Instant,
    next_deleted_index_scan: Instant,

    events_handled: u64,
    batch_handled: usize,
    budget_start: Instant,
    speed: VecDeque<f64>,
    last_stats_at: Instant,
    last_stats_handled: u64,
}

impl Inner {
    pub(crate) fn special_conn(&self, slot: usize) -> usize {
        slot % self.db.connections_count()
    }

    async fn run(mut self) {
        info!("write coordinator loop started");
        loop {
            if let Err(err) = self.tick().await {
                error!("write coordinator broken: {}", err);
                self.shared.broken.store(true, Ordering::Release);
                break;
            }
            if self.shared.exit_asked.load(Ordering::Acquire) {
                if let Err(err) = self.final_flush().await {
                    error!("final flush failed: {}", err);
                    self.shared.broken.store(true, Ordering::Release);
                }
                break;
            }
        }

        // Unblock producers still waiting on acks; events still queued on a
        // broken coordinator are dropped.
        {
            let mut fifo = self.shared.fifo.lock().unwrap();
            for entry in fifo.drain_events() {
                entry.mark_done();
            }
            fifo.clean(StreamKind::Sql);
            fifo.clean(StreamKind::Storage);
        }
        self.refresh_stats();
        self.shared.stopped.send_replace(true);
        info!("write coordinator loop stopped");
    }

    async fn tick(&mut self) -> Result<(), CoordinatorError> {
        self.flush_overdue_queues().await?;

        if Instant::now() >= self.next_deleted_index_scan {
            self.next_deleted_index_scan = Instant::now() + DELETED_INDEX_SCAN_INTERVAL;
            if let Err(err) = self.check_deleted_index().await {
                if is_fatal(&err) {
                    return Err(err.into());
                }
                warn!("deleted index sweep failed: {}", err);
            }
        }

        self.spawn_graph_removals();

        let mut events = { self.shared.fifo.lock().unwrap().drain_events() };
        if events.is_empty() {
            let _ = timeout(EMPTY_POLL, self.shared.notify.notified()).await;
            // Idle barrier: commit what is pending and release acks.
            self.finish_actions().await?;
            self.check_outdated_instances().await.map_err(fatal_db)?;
            self.refresh_stats();
            return Ok(());
        }

        while let Some(entry) = events.pop_front() {
            self.dispatch(entry).await?;
            self.batch_handled += 1;
            self.events_handled += 1;
            if self.batch_handled >= self.cfg.max_pending_events
                || self.budget_start.elapsed() >= self.cfg.loop_duration()
            {
                break;
            }
        }
        if !events.is_empty() {
            self.shared.fifo.lock().unwrap().push_back_events(events);
        }

        if self.batch_handled >= self.cfg.max_pending_events
            || self.budget_start.elapsed() >= self.cfg.loop_duration()
        {
            debug!("batch budget reached after {} events", self.batch_handled);
            self.finish_actions().await?;
            self.check_outdated_instances().await.map_err(fatal_db)?;
            self.refresh_stats();
            self.batch_handled = 0;
            self.budget_start = Instant::now();
        }
        Ok(())
    }

    /// Commit every connection, clear every action flag and release the acks
    /// of both streams.
    pub(crate) async fn finish_actions(&mut self) -> Result<(), CoordinatorError> {
        self.db.commit(None).await.map_err(fatal_db)?;
        self.actions.clear_all();
        let mut fifo = self.shared.fifo.lock().unwrap();
        fifo.clean(StreamKind::Sql);
        fifo.clean(StreamKind::Storage);
        Ok(())
    }

    /// Barrier before a statement joining against tables with uncommitted
    /// writes: commit every connection whose pending flags intersect `mask`.
    pub(crate) async fn finish_action(&mut self, conn: Option<usize>, mask: u32) -> DbResult<()> {
        let targets = match conn {
            Some(idx) => {
                if self.actions.pending(idx) & mask != 0 {
                    vec![idx]
                } else {
                    vec![]
                }
            }
            None => self.actions.conflicting(mask),
        };
        for idx in targets {
            trace!("commit barrier on connection {}", idx);
            self.db.commit(Some(idx)).await?;
            self.actions.clear(idx);
        }
        Ok(())
    }

    async fn dispatch(&mut self, entry: EventEntry) -> Result<(), CoordinatorError> {
        let EventEntry { kind, event, done } = entry;
        let name = event.kind_name();
        trace!("handling {} event on {} stream", name, kind.as_str());

        // Staged events hand their marker to a batched queue; the flush
        // acks them. Everything else is acked right here.
        let mut staged = false;
        let result = match (kind, event) {
            (StreamKind::Storage, Event::ServiceStatus(ev)) => {
                staged = true;
                self.storage_service_status(ev, done.clone()).await
            }
            (StreamKind::Storage, _) => Ok(()),
            (StreamKind::Sql, Event::CustomVariable(ev)) => {
                staged = !ev.deleted;
                self.stage_custom_variable(ev, done.clone()).await
            }
            (StreamKind::Sql, Event::CustomVariableStatus(ev)) => {
                staged = true;
                self.stage_custom_variable_status(ev, done.clone()).await
            }
            (StreamKind::Sql, Event::Downtime(ev)) => {
                staged = true;
                self.stage_downtime(ev, done.clone()).await
            }
            (StreamKind::Sql, Event::Log(ev)) => {
                staged = true;
                self.stage_log(ev, done.clone()).await
            }
            (StreamKind::Sql, other) => self.handle_sql_event(other).await,
        };

        if let Err(err) = result {
            if is_fatal(&err) {
                return Err(err.into());
            }
            // Per-event failures drop the event but never wedge the stream.
            warn!("{} event dropped: {}", name, err);
        }
        if !staged {
            done.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn flush_overdue_queues(&mut self) -> Result<(), CoordinatorError> {
        let now = Instant::now();
        if !self.perfdata_queue.is_empty()
            && (now >= self.next_perfdata_flush || self.perfdata_queue.len() >= self.max_perfdata)
        {
            self.flush_perfdata().await.map_err(fatal_db)?;
        }
        if !self.metrics_queue.is_empty()
            && (now >= self.next_metrics_flush || self.metrics_queue.len() >= self.max_metrics)
        {
            self.flush_metrics().await.map_err(fatal_db)?;
        }
        if (!self.cv_queue.is_empty() || !self.cvs_queue.is_empty())
            && (now >= self.next_cv_flush
                || self.cv_queue.len() + self.cvs_queue.len() >= self.max_cv)
        {
            self.flush_custom_variables().await.map_err(fatal_db)?;
        }
        if !self.downtimes_queue.is_empty()
            && (now >= self.next_downtimes_flush
                || self.downtimes_queue.len() >= self.max_downtimes)
        {
            self.flush_downtimes().await.map_err(fatal_db)?;
        }
        if !self.logs_queue.is_empty()
            && (now >= self.next_logs_flush || self.logs_queue.len() >= self.max_logs)
        {
            self.flush_logs().await.map_err(fatal_db)?;
        }
        Ok(())
    }

    /// Drain every queue and commit before the loop exits
    async fn final_flush(&mut self) -> Result<(), CoordinatorError> {
        debug!("final flush before shutdown");
        let mut events = { self.shared.fifo.lock().unwrap().drain_events() };
        while let Some(entry) = events.pop_front() {
            self.dispatch(entry).await?;
            self.events_handled += 1;
        }
        if !self.perfdata_queue.is_empty() {
            self.flush_perfdata().await.map_err(fatal_db)?;
        }
        if !self.metrics_queue.is_empty() {
            self.flush_metrics().await.map_err(fatal_db)?;
        }
        if !self.cv_queue.is_empty() || !self.cvs_queue.is_empty() {
            self.flush_custom_variables().await.map_err(fatal_db)?;
        }
        if !self.downtimes_queue.is_empty() {
            self.flush_downtimes().await.map_err(fatal_db)?;
        }
        if !self.logs_queue.is_empty() {
            self.flush_logs().await.map_err(fatal_db)?;
        }
        self.finish_actions().await
    }

    fn spawn_graph_removals(&mut self) {
        let requests = {
            let mut guard = self.shared.graph_removals.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        for (index_ids, metric_ids) in requests {
            storage::spawn_remove_graphs(
                Arc::clone(&self.db),
                Arc::clone(&self.caches.index),
                Arc::clone(&self.caches.metrics),
                Arc::clone(&self.publisher),
                index_ids,
                metric_ids,
            );
        }
    }

    fn refresh_stats(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_stats_at).as_secs_f64();
        if dt >= 1.0 {
            let sample = (self.events_handled - self.last_stats_handled) as f64 / dt;
            if self.speed.len() == SPEED_SAMPLES {
                self.speed.pop_front();
            }
            self.speed.push_back(sample);
            self.last_stats_at = now;
            self.last_stats_handled = self.events_handled;
        }
        let speed = if self.speed.is_empty() {
            0.0
        } else {
            self.speed.iter().sum::<f64>() / self.speed.len() as f64
        };
        let fifo = self.shared.fifo.lock().unwrap();
        *self.shared.stats.lock().unwrap() = serde_json::json!({
            "pending_events": fifo.pending_events(),
            "events_handled": self.events_handled,
            "sql_timeline": fifo.timeline_len(StreamKind::Sql),
            "storage_timeline": fifo.timeline_len(StreamKind::Storage),
            "speed": speed,
            "loop_timeout": self.cfg.loop_timeout,
            "max_pending_events": self.cfg.max_pending_events,
        });
    }
}

/// Session-level errors take the whole coordinator down; statement-level
/// ones only cost the event.
pub(crate) fn is_fatal(err: &DbError) -> bool {
    matches!(
        err,
        DbError::Unavailable(_) | DbError::ConnectionFailed(_) | DbError::Interrupted
    )
}

pub(crate) fn fatal_db(err: DbError) -> CoordinatorError {
    CoordinatorError::Broken(err.to_string())
}

/// Single-quote escaping for values interpolated into bulk queries
pub(crate) fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Format a float for SQL: NaN becomes NULL, infinities clamp to f32 range
pub(crate) fn fmt_float(v: f64) -> String {
    if v.is_nan() {
        "NULL".to_string()
    } else if v == f64::INFINITY {
        format!("{:e}", f32::MAX)
    } else if v == f64::NEG_INFINITY {
        format!("{:e}", f32::MIN)
    } else {
        format!("{}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_doubles_quotes() {
        assert_eq!(escape("it's"), "it''s");
        assert_eq!(escape("plain"), "plain");
    }

    #[test]
    fn fmt_float_handles_specials() {
        assert_eq!(fmt_float(f64::NAN), "NULL");
        assert_eq!(fmt_float(1.5), "1.5");
        assert!(fmt_float(f64::INFINITY).contains('e'));
        assert!(fmt_float(f64::NEG_INFINITY).starts_with('-'));
    }
}
