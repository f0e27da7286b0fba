use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

/// Database connection configuration shared by every pooled connection.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Number of statements grouped into one transaction.
    /// A value of 1 keeps connections in autocommit mode.
    #[serde(default = "default_queries_per_transaction")]
    pub queries_per_transaction: u32,

    /// Upper bound, in seconds, on how long a connection may sit on an
    /// open transaction before committing on its own. 0 disables the bound.
    #[serde(default)]
    pub max_commit_delay: u32,

    /// Number of connections opened on this database
    #[serde(default = "default_connections_count")]
    pub connections_count: usize,

    /// Busy timeout handed to SQLite, in seconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout: u32,

    /// Event category this database accepts (used by stream filtering)
    #[serde(default)]
    pub category: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
            queries_per_transaction: default_queries_per_transaction(),
            max_commit_delay: 0,
            connections_count: default_connections_count(),
            busy_timeout: default_busy_timeout(),
            category: None,
        }
    }
}

impl DatabaseConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DatabaseConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn connections_count(mut self, count: usize) -> Self {
        self.connections_count = count.max(1);
        self
    }

    pub fn queries_per_transaction(mut self, count: u32) -> Self {
        self.queries_per_transaction = count.max(1);
        self
    }

    pub fn max_commit_delay(mut self, seconds: u32) -> Self {
        self.max_commit_delay = seconds;
        self
    }

    /// Two configurations target the same database when their paths match.
    /// Connections are only shared between owners that agree on the rest of
    /// the settings too.
    pub fn same_database(&self, other: &DatabaseConfig) -> bool {
        self.path == other.path
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./broker.db")
}

fn default_queries_per_transaction() -> u32 {
    2000
}

fn default_connections_count() -> usize {
    1
}

fn default_busy_timeout() -> u32 {
    30
}

/// Tuning knobs for the write coordinator.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CoordinatorConfig {
    /// Seconds a batch of events may wait before being forced to the database
    #[serde(default = "default_loop_timeout")]
    pub loop_timeout: u64,

    /// Number of events accepted before the loop stops draining and flushes
    #[serde(default = "default_max_pending_events")]
    pub max_pending_events: usize,

    /// Seconds without any event from a poller before it is marked outdated
    #[serde(default = "default_instance_timeout")]
    pub instance_timeout: u64,

    /// Whether metric samples are written to the `data_bin` table
    #[serde(default = "default_true")]
    pub store_in_data_bin: bool,

    /// Row counts at which the batched queues flush early.
    /// Unset thresholds fall back to `queries_per_transaction`.
    #[serde(default)]
    pub max_perfdata_queries: Option<usize>,
    #[serde(default)]
    pub max_metrics_queries: Option<usize>,
    #[serde(default)]
    pub max_cv_queries: Option<usize>,
    #[serde(default)]
    pub max_log_queries: Option<usize>,
    #[serde(default)]
    pub max_downtime_queries: Option<usize>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            loop_timeout: default_loop_timeout(),
            max_pending_events: default_max_pending_events(),
            instance_timeout: default_instance_timeout(),
            store_in_data_bin: true,
            max_perfdata_queries: None,
            max_metrics_queries: None,
            max_cv_queries: None,
            max_log_queries: None,
            max_downtime_queries: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn loop_duration(&self) -> Duration {
        Duration::from_secs(self.loop_timeout)
    }
}

fn default_loop_timeout() -> u64 {
    30
}

fn default_max_pending_events() -> usize {
    10_000
}

fn default_instance_timeout() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

pub fn read_config_file(path: &str) -> anyhow::Result<(DatabaseConfig, CoordinatorConfig)> {
    #[derive(serde::Deserialize)]
    struct FileConfig {
        database: DatabaseConfig,
        #[serde(default)]
        coordinator: CoordinatorConfig,
    }

    let file_content = std::fs::read_to_string(path)?;
    let config: FileConfig = serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))?;
    trace!("loaded database config: {:?}", config.database);
    Ok((config.database, config.coordinator))
}
