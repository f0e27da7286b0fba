//! In-memory caches seeded from the database at startup
//!
//! These give the coordinator its surrogate ids without a SELECT per event:
//! `index_data` rows by (host, service), `metrics` rows by (index, name),
//! severity/tag internal ids, host-to-poller mapping and the per-poller
//! liveness timestamps used by the unresponsive-instance scan.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::db::{Database, DbResult};
use crate::perfdata::MetricType;

/// Cached `index_data` row
#[derive(Debug, Clone, Default)]
pub struct IndexInfo {
    pub index_id: u64,
    pub host_name: String,
    pub service_description: String,
    pub rrd_retention: u32,
    pub interval: u32,
    pub special: bool,
    pub locked: bool,
}

/// Cached `metrics` row
#[derive(Debug, Clone)]
pub struct MetricInfo {
    pub metric_id: u64,
    pub metric_type: MetricType,
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
    pub locked: bool,
    /// Whether the metric-mapping derived event went out already
    pub metric_mapping_sent: bool,
}

/// Per-poller liveness record
#[derive(Debug, Clone, Copy)]
pub struct InstanceTimestamp {
    pub last_seen: i64,
    pub responsive: bool,
}

pub type IndexCache = HashMap<(u64, u64), IndexInfo>;
pub type MetricCache = HashMap<(u64, String), MetricInfo>;

/// Every cache the coordinator works with. The index and metric caches are
/// shared with the out-of-band graph-removal task, hence the mutexes; every
/// other member is owned by the coordinator task alone.
pub struct CacheSet {
    pub index: Arc<Mutex<IndexCache>>,
    pub metrics: Arc<Mutex<MetricCache>>,
    pub host_instance: HashMap<u64, u64>,
    pub hostgroups: HashSet<u64>,
    pub servicegroups: HashSet<u64>,
    pub severities: HashMap<(u64, i16), u64>,
    pub tags: HashMap<(u64, i16), u64>,
    pub deleted_instances: HashSet<u64>,
    pub stored_timestamps: HashMap<u64, InstanceTimestamp>,
}

impl CacheSet {
    pub fn new() -> Self {
        CacheSet {
            index: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(HashMap::new())),
            host_instance: HashMap::new(),
            hostgroups: HashSet::new(),
            servicegroups: HashSet::new(),
            severities: HashMap::new(),
            tags: HashMap::new(),
            deleted_instances: HashSet::new(),
            stored_timestamps: HashMap::new(),
        }
    }

    /// Seed every cache with bulk SELECTs. Any failure here is fatal to the
    /// coordinator.
    pub async fn load(&mut self, db: &Database) -> DbResult<()> {
        let conn = 0;

        let rows = db
            .run_query_and_get_rows(
                "SELECT instance_id, last_alive, outdated, deleted FROM instances",
                conn,
            )
            .await?;
        for row in rows {
            let id = row.as_u64(0);
            if row.as_bool(3) {
                self.deleted_instances.insert(id);
            } else {
                self.stored_timestamps.insert(
                    id,
                    InstanceTimestamp {
                        last_seen: row.as_i64(1),
                        responsive: !row.as_bool(2),
                    },
                );
            }
        }

        let rows = db
            .run_query_and_get_rows("SELECT host_id, instance_id FROM hosts", conn)
            .await?;
        for row in rows {
            self.host_instance.insert(row.as_u64(0), row.as_u64(1));
        }

        let rows = db
            .run_query_and_get_rows(
                "SELECT id, host_id, service_id, host_name, service_description, \
                 rrd_retention, check_interval, special, locked FROM index_data",
                conn,
            )
            .await?;
        {
            let mut index = self.index.lock().unwrap();
            for row in rows {
                index.insert(
                    (row.as_u64(1), row.as_u64(2)),
                    IndexInfo {
                        index_id: row.as_u64(0),
                        host_name: row.as_str(3).to_string(),
                        service_description: row.as_str(4).to_string(),
                        rrd_retention: row.as_u32(5),
                        interval: row.as_f64(6) as u32,
                        special: row.as_bool(7),
                        locked: row.as_bool(8),
                    },
                );
            }
            debug!("loaded {} index_data rows", index.len());
        }

        let rows = db
            .run_query_and_get_rows(
                "SELECT metric_id, index_id, metric_name, unit_name, warn, warn_low, \
                 warn_threshold_mode, crit, crit_low, crit_threshold_mode, min, max, \
                 current_value, data_source_type, locked FROM metrics",
                conn,
            )
            .await?;
        {
            let mut metrics = self.metrics.lock().unwrap();
            for row in rows {
                metrics.insert(
                    (row.as_u64(1), row.as_str(2).to_string()),
                    MetricInfo {
                        metric_id: row.as_u64(0),
                        metric_type: MetricType::from_i16(row.as_i64(13) as i16),
                        value: row.as_f64(12),
                        unit_name: row.as_str(3).to_string(),
                        warn: row.as_f64(4),
                        warn_low: row.as_f64(5),
                        warn_mode: row.as_bool(6),
                        crit: row.as_f64(7),
                        crit_low: row.as_f64(8),
                        crit_mode: row.as_bool(9),
                        min: row.as_f64(10),
                        max: row.as_f64(11),
                        locked: row.as_bool(14),
                        metric_mapping_sent: true,
                    },
                );
            }
            debug!("loaded {} metrics rows", metrics.len());
        }

        let rows = db
            .run_query_and_get_rows("SELECT hostgroup_id FROM hostgroups", conn)
            .await?;
        for row in rows {
            self.hostgroups.insert(row.as_u64(0));
        }

        let rows = db
            .run_query_and_get_rows("SELECT servicegroup_id FROM servicegroups", conn)
            .await?;
        for row in rows {
            self.servicegroups.insert(row.as_u64(0));
        }

        let rows = db
            .run_query_and_get_rows("SELECT severity_id, id, type FROM severities", conn)
            .await?;
        for row in rows {
            self.severities
                .insert((row.as_u64(1), row.as_i64(2) as i16), row.as_u64(0));
        }

        let rows = db
            .run_query_and_get_rows("SELECT tag_id, id, type FROM tags", conn)
            .await?;
        for row in rows {
            self.tags
                .insert((row.as_u64(1), row.as_i64(2) as i16), row.as_u64(0));
        }

        info!(
            "caches seeded: {} pollers, {} hosts",
            self.stored_timestamps.len(),
            self.host_instance.len()
        );
        Ok(())
    }

    /// Oldest last-seen time among responsive pollers, if any
    pub fn oldest_timestamp(&self) -> Option<i64> {
        self.stored_timestamps
            .values()
            .filter(|t| t.responsive)
            .map(|t| t.last_seen)
            .min()
    }
}

impl Default for CacheSet {
    fn default() -> Self {
        CacheSet::new()
    }
}
