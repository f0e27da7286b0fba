//! Metric extraction from the Storage stream
//!
//! Service status events carry a raw perfdata string. This side resolves
//! the `index_data` and `metrics` surrogate ids (creating rows on first
//! sight), stages `data_bin` samples and threshold updates for bulk writes
//! and publishes the derived metric events downstream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::{Binds, Database, DbError, DbResult};
use crate::events::{DerivedEvent, Publisher, ServiceStatus};
use crate::perfdata::{float_equal, parse_perfdata, Perfdata};

use super::actions::action;
use super::cache::{IndexCache, IndexInfo, MetricCache, MetricInfo};
use super::{
    escape, fmt_float, special, Inner, MetricUpdate, PerfRow, BULK_FLUSH_INTERVAL, INDEX_DATA_TAG,
};

/// Seconds per interval unit of a check period
const INTERVAL_LENGTH: u32 = 60;

fn id_list(ids: &[u64]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl Inner {
    /// Storage-side handling of one service status event. The `done` marker
    /// is handed to the perfdata queue when samples are staged, otherwise it
    /// is released here.
    pub(crate) async fn storage_service_status(
        &mut self,
        ev: ServiceStatus,
        done: Arc<AtomicBool>,
    ) -> DbResult<()> {
        if ev.host_id == 0 || ev.service_id == 0 {
            debug!(
                "service status without ids ({}, {}) ignored",
                ev.host_id, ev.service_id
            );
            done.store(true, Ordering::Release);
            return Ok(());
        }

        let index = self.resolve_index(&ev).await?;
        let interval = (ev.check_interval as u32).max(1) * INTERVAL_LENGTH;

        self.publisher
            .publish(DerivedEvent::Status {
                index_id: index.index_id,
                ctime: ev.last_check,
                state: ev.state,
                interval,
            })
            .await;

        let samples = match parse_perfdata(&ev.perfdata) {
            Ok(samples) => samples,
            Err(err) => {
                warn!(
                    "perfdata of service ({}, {}) unreadable: {}",
                    ev.host_id, ev.service_id, err
                );
                Vec::new()
            }
        };

        let mut staged = false;
        for sample in samples {
            let metric = self.resolve_metric(&index, &sample).await?;

            if !metric.metric_mapping_sent {
                self.publisher
                    .publish(DerivedEvent::MetricMapping {
                        index_id: index.index_id,
                        metric_id: metric.metric_id,
                    })
                    .await;
                if let Some(entry) = self
                    .caches
                    .metrics
                    .lock()
                    .unwrap()
                    .get_mut(&(index.index_id, sample.name.clone()))
                {
                    entry.metric_mapping_sent = true;
                }
            }

            self.stage_metric_update(&index, &metric, &sample);

            if self.cfg.store_in_data_bin {
                self.perfdata_queue.push(PerfRow {
                    metric_id: metric.metric_id,
                    ctime: ev.last_check,
                    status: ev.state,
                    value: sample.value,
                });
                staged = true;
            }

            if !metric.locked {
                self.publisher
                    .publish(DerivedEvent::Metric {
                        metric_id: metric.metric_id,
                        ctime: ev.last_check,
                        value: sample.value,
                        value_type: sample.value_type.as_i16(),
                        name: sample.name,
                        interval,
                        is_for_rebuild: false,
                    })
                    .await;
            }
        }

        if staged {
            self.perfdata_markers.push(done);
            if self.perfdata_queue.len() >= self.max_perfdata {
                self.flush_perfdata().await?;
            }
        } else {
            done.store(true, Ordering::Release);
        }
        if self.metrics_queue.len() >= self.max_metrics {
            self.flush_metrics().await?;
        }
        Ok(())
    }

    /// Read-through lookup of the `index_data` row of a (host, service) pair
    async fn resolve_index(&mut self, ev: &ServiceStatus) -> DbResult<IndexInfo> {
        let key = (ev.host_id, ev.service_id);
        let cached = { self.caches.index.lock().unwrap().get(&key).cloned() };
        if let Some(mut info) = cached {
            if info.host_name != ev.host_name
                || info.service_description != ev.service_description
            {
                let conn = self.db.choose_best_connection(Some(INDEX_DATA_TAG));
                let mut binds = Binds::new();
                binds
                    .push(ev.host_name.as_str())
                    .push(ev.service_description.as_str())
                    .push(ev.check_interval)
                    .push(info.special)
                    .push(info.index_id);
                self.db
                    .run_statement(self.stmts.index_data_update.id, binds, conn)?;
                self.actions.add(conn, action::INDEX_DATA);
                info.host_name = ev.host_name.clone();
                info.service_description = ev.service_description.clone();
                self.caches.index.lock().unwrap().insert(key, info.clone());
            }
            return Ok(info);
        }

        info!(
            "creating index for service '{}' on host '{}'",
            ev.service_description, ev.host_name
        );
        let special = ev.host_name.starts_with("_Module_");
        let conn = self.db.choose_best_connection(Some(INDEX_DATA_TAG));
        let mut binds = Binds::new();
        binds
            .push(ev.host_id)
            .push(ev.service_id)
            .push(ev.host_name.as_str())
            .push(ev.service_description.as_str())
            .push(ev.check_interval)
            .push(special);
        let index_id = match self
            .db
            .run_statement_and_get_write(self.stmts.index_data_insert.id, binds, conn)
            .await
        {
            Ok(summary) => summary.last_insert_id as u64,
            Err(DbError::StatementFailed(_)) => {
                // The row exists but was missing from the cache; recover its
                // id and refresh it.
                let mut rows = self
                    .db
                    .run_query_and_get_rows(
                        format!(
                            "SELECT id FROM index_data \
                             WHERE host_id={} AND service_id={}",
                            ev.host_id, ev.service_id
                        ),
                        conn,
                    )
                    .await?;
                let row = rows.next_row().ok_or_else(|| {
                    DbError::StatementFailed(format!(
                        "no index_data row for service ({}, {})",
                        ev.host_id, ev.service_id
                    ))
                })?;
                let id = row.as_u64(0);
                let mut binds = Binds::new();
                binds
                    .push(ev.host_name.as_str())
                    .push(ev.service_description.as_str())
                    .push(ev.check_interval)
                    .push(special)
                    .push(id);
                self.db
                    .run_statement(self.stmts.index_data_update.id, binds, conn)?;
                id
            }
            Err(err) => return Err(err),
        };
        self.actions.add(conn, action::INDEX_DATA);

        self.publisher
            .publish(DerivedEvent::IndexMapping {
                index_id,
                host_id: ev.host_id,
                service_id: ev.service_id,
            })
            .await;

        let info = IndexInfo {
            index_id,
            host_name: ev.host_name.clone(),
            service_description: ev.service_description.clone(),
            rrd_retention: ev.retention,
            interval: ev.check_interval as u32,
            special,
            locked: false,
        };
        self.caches.index.lock().unwrap().insert(key, info.clone());
        Ok(info)
    }

    /// Read-through lookup of the `metrics` row of one perfdata sample
    async fn resolve_metric(
        &mut self,
        index: &IndexInfo,
        sample: &Perfdata,
    ) -> DbResult<MetricInfo> {
        let key = (index.index_id, sample.name.clone());
        let cached = { self.caches.metrics.lock().unwrap().get(&key).cloned() };
        if let Some(info) = cached {
            return Ok(info);
        }

        debug!(
            "creating metric '{}' on index {}",
            sample.name, index.index_id
        );
        let conn = self.special_conn(special::METRIC);
        let mut binds = Binds::new();
        binds
            .push(index.index_id)
            .push(sample.name.as_str())
            .push(sample.unit.as_str())
            .push(sample.warn)
            .push(sample.warn_low)
            .push(sample.warn_mode)
            .push(sample.crit)
            .push(sample.crit_low)
            .push(sample.crit_mode)
            .push(sample.min)
            .push(sample.max)
            .push(sample.value)
            .push(sample.value_type.as_i16());
        let metric_id = match self
            .db
            .run_statement_and_get_write(self.stmts.metrics_insert.id, binds, conn)
            .await
        {
            Ok(summary) => summary.last_insert_id as u64,
            Err(DbError::StatementFailed(_)) => {
                let mut rows = self
                    .db
                    .run_query_and_get_rows(
                        format!(
                            "SELECT metric_id FROM metrics \
                             WHERE index_id={} AND metric_name='{}'",
                            index.index_id,
                            escape(&sample.name)
                        ),
                        conn,
                    )
                    .await?;
                let row = rows.next_row().ok_or_else(|| {
                    DbError::StatementFailed(format!(
                        "no metrics row named '{}' on index {}",
                        sample.name, index.index_id
                    ))
                })?;
                row.as_u64(0)
            }
            Err(err) => return Err(err),
        };
        self.actions.add(conn, action::METRICS);

        let info = MetricInfo {
            metric_id,
            metric_type: sample.value_type,
            value: sample.value,
            unit_name: sample.unit.clone(),
            warn: sample.warn,
            warn_low: sample.warn_low,
            warn_mode: sample.warn_mode,
            crit: sample.crit,
            crit_low: sample.crit_low,
            crit_mode: sample.crit_mode,
            min: sample.min,
            max: sample.max,
            locked: false,
            metric_mapping_sent: false,
        };
        self.caches.metrics.lock().unwrap().insert(key, info.clone());
        Ok(info)
    }

    /// Queue a `metrics` row update when a threshold or the value changed.
    /// Last writer wins per metric id.
    fn stage_metric_update(&mut self, index: &IndexInfo, metric: &MetricInfo, sample: &Perfdata) {
        let changed = !float_equal(metric.value, sample.value)
            || metric.unit_name != sample.unit
            || !float_equal(metric.warn, sample.warn)
            || !float_equal(metric.warn_low, sample.warn_low)
            || metric.warn_mode != sample.warn_mode
            || !float_equal(metric.crit, sample.crit)
            || !float_equal(metric.crit_low, sample.crit_low)
            || metric.crit_mode != sample.crit_mode
            || !float_equal(metric.min, sample.min)
            || !float_equal(metric.max, sample.max);
        if !changed {
            return;
        }
        self.metrics_queue.insert(
            metric.metric_id,
            MetricUpdate {
                metric_id: metric.metric_id,
                value: sample.value,
                unit_name: sample.unit.clone(),
                warn: sample.warn,
                warn_low: sample.warn_low,
                warn_mode: sample.warn_mode,
                crit: sample.crit,
                crit_low: sample.crit_low,
                crit_mode: sample.crit_mode,
                min: sample.min,
                max: sample.max,
                metric_type: sample.value_type,
            },
        );
        if let Some(entry) = self
            .caches
            .metrics
            .lock()
            .unwrap()
            .get_mut(&(index.index_id, sample.name.clone()))
        {
            entry.value = sample.value;
            entry.unit_name = sample.unit.clone();
            entry.warn = sample.warn;
            entry.warn_low = sample.warn_low;
            entry.warn_mode = sample.warn_mode;
            entry.crit = sample.crit;
            entry.crit_low = sample.crit_low;
            entry.crit_mode = sample.crit_mode;
            entry.min = sample.min;
            entry.max = sample.max;
        }
    }

    pub(crate) async fn flush_perfdata(&mut self) -> DbResult<()> {
        self.next_perfdata_flush = Instant::now() + BULK_FLUSH_INTERVAL;
        if self.perfdata_queue.is_empty() {
            return Ok(());
        }
        let conn = self.special_conn(special::DATA_BIN);
        let mut sql =
            String::from("INSERT INTO data_bin (id_metric, ctime, status, value) VALUES ");
        for (i, row) in self.perfdata_queue.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&format!(
                "({},{},{},{})",
                row.metric_id,
                row.ctime,
                row.status,
                fmt_float(row.value)
            ));
        }
        debug!("flushing {} data_bin rows", self.perfdata_queue.len());
        self.db.run_query(sql, conn)?;
        self.perfdata_queue.clear();
        for marker in self.perfdata_markers.drain(..) {
            marker.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) async fn flush_metrics(&mut self) -> DbResult<()> {
        self.next_metrics_flush = Instant::now() + BULK_FLUSH_INTERVAL;
        if self.metrics_queue.is_empty() {
            return Ok(());
        }
        let conn = self.special_conn(special::METRIC);
        let mut sql = String::from(
            "INSERT INTO metrics (metric_id, unit_name, warn, warn_low, \
             warn_threshold_mode, crit, crit_low, crit_threshold_mode, min, max, \
             current_value, data_source_type) VALUES ",
        );
        for (i, upd) in self.metrics_queue.values().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&format!(
                "({},'{}',{},{},{},{},{},{},{},{},{},{})",
                upd.metric_id,
                escape(&upd.unit_name),
                fmt_float(upd.warn),
                fmt_float(upd.warn_low),
                upd.warn_mode as i32,
                fmt_float(upd.crit),
                fmt_float(upd.crit_low),
                upd.crit_mode as i32,
                fmt_float(upd.min),
                fmt_float(upd.max),
                fmt_float(upd.value),
                upd.metric_type.as_i16()
            ));
        }
        // Rows are created by resolve_metric, so the conflict branch always
        // fires here.
        sql.push_str(
            " ON CONFLICT(metric_id) DO UPDATE SET unit_name=excluded.unit_name, \
             warn=excluded.warn, warn_low=excluded.warn_low, \
             warn_threshold_mode=excluded.warn_threshold_mode, \
             crit=excluded.crit, crit_low=excluded.crit_low, \
             crit_threshold_mode=excluded.crit_threshold_mode, \
             min=excluded.min, max=excluded.max, \
             current_value=excluded.current_value, \
             data_source_type=excluded.data_source_type",
        );
        debug!("flushing {} metric updates", self.metrics_queue.len());
        self.db.run_query(sql, conn)?;
        self.actions.add(conn, action::METRICS);
        self.metrics_queue.clear();
        Ok(())
    }

    /// Periodic sweep deleting graphs whose rows were flagged `to_delete`
    pub(crate) async fn check_deleted_index(&mut self) -> DbResult<()> {
        debug!("checking for indexes flagged for deletion");
        let conn = self.db.choose_best_connection(Some(INDEX_DATA_TAG));

        let rows = self
            .db
            .run_query_and_get_rows("SELECT id FROM index_data WHERE to_delete=1", conn)
            .await?;
        let index_ids: Vec<u64> = rows.map(|row| row.as_u64(0)).collect();

        let rows = self
            .db
            .run_query_and_get_rows("SELECT metric_id FROM metrics WHERE to_delete=1", conn)
            .await?;
        let mut metric_ids: Vec<u64> = rows.map(|row| row.as_u64(0)).collect();

        if index_ids.is_empty() && metric_ids.is_empty() {
            return Ok(());
        }

        if !index_ids.is_empty() {
            let rows = self
                .db
                .run_query_and_get_rows(
                    format!(
                        "SELECT metric_id FROM metrics WHERE index_id IN ({})",
                        id_list(&index_ids)
                    ),
                    conn,
                )
                .await?;
            for row in rows {
                metric_ids.push(row.as_u64(0));
            }
        }

        delete_graph_rows(&self.db, conn, &index_ids, &metric_ids).await?;
        info!(
            "removed {} indexes and {} metrics flagged for deletion",
            index_ids.len(),
            metric_ids.len()
        );

        evict_graph_entries(&self.caches.index, &self.caches.metrics, &index_ids, &metric_ids);
        self.publisher
            .publish(DerivedEvent::RemoveGraphs {
                index_ids,
                metric_ids,
            })
            .await;
        Ok(())
    }
}

async fn delete_graph_rows(
    db: &Database,
    conn: usize,
    index_ids: &[u64],
    metric_ids: &[u64],
) -> DbResult<()> {
    if !metric_ids.is_empty() {
        let list = id_list(metric_ids);
        db.run_query(
            format!("DELETE FROM data_bin WHERE id_metric IN ({})", list),
            conn,
        )?;
        db.run_query(
            format!("DELETE FROM metrics WHERE metric_id IN ({})", list),
            conn,
        )?;
    }
    if !index_ids.is_empty() {
        db.run_query(
            format!("DELETE FROM index_data WHERE id IN ({})", id_list(index_ids)),
            conn,
        )?;
    }
    db.commit(Some(conn)).await
}

fn evict_graph_entries(
    index_cache: &Mutex<IndexCache>,
    metric_cache: &Mutex<MetricCache>,
    index_ids: &[u64],
    metric_ids: &[u64],
) {
    index_cache
        .lock()
        .unwrap()
        .retain(|_, info| !index_ids.contains(&info.index_id));
    metric_cache
        .lock()
        .unwrap()
        .retain(|_, info| !metric_ids.contains(&info.metric_id));
}

/// Out-of-band graph removal requested through the handle. Target rows are
/// flagged first so an interrupted run is finished by the periodic sweep.
pub(crate) fn spawn_remove_graphs(
    db: Arc<Database>,
    index_cache: Arc<Mutex<IndexCache>>,
    metric_cache: Arc<Mutex<MetricCache>>,
    publisher: Arc<dyn Publisher>,
    index_ids: Vec<u64>,
    metric_ids: Vec<u64>,
) {
    tokio::spawn(async move {
        if let Err(err) =
            remove_graphs(&db, &index_cache, &metric_cache, &*publisher, index_ids, metric_ids)
                .await
        {
            warn!("graph removal failed: {}", err);
        }
    });
}

async fn remove_graphs(
    db: &Database,
    index_cache: &Mutex<IndexCache>,
    metric_cache: &Mutex<MetricCache>,
    publisher: &dyn Publisher,
    index_ids: Vec<u64>,
    mut metric_ids: Vec<u64>,
) -> DbResult<()> {
    let conn = db.choose_best_connection(Some(INDEX_DATA_TAG));
    if !index_ids.is_empty() {
        let list = id_list(&index_ids);
        db.run_query(
            format!("UPDATE index_data SET to_delete=1 WHERE id IN ({})", list),
            conn,
        )?;
        let rows = db
            .run_query_and_get_rows(
                format!("SELECT metric_id FROM metrics WHERE index_id IN ({})", list),
                conn,
            )
            .await?;
        for row in rows {
            metric_ids.push(row.as_u64(0));
        }
    }
    if !metric_ids.is_empty() {
        db.run_query(
            format!(
                "UPDATE metrics SET to_delete=1 WHERE metric_id IN ({})",
                id_list(&metric_ids)
            ),
            conn,
        )?;
    }

    delete_graph_rows(db, conn, &index_ids, &metric_ids).await?;
    info!(
        "removed {} indexes and {} metrics on request",
        index_ids.len(),
        metric_ids.len()
    );

    evict_graph_entries(index_cache, metric_cache, &index_ids, &metric_ids);
    publisher
        .publish(DerivedEvent::RemoveGraphs {
            index_ids,
            metric_ids,
        })
        .await;
    Ok(())
}
