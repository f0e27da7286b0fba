//! Process-wide pool of database connections
//!
//! Connections are shared between owners targeting the same database file.
//! The first owner fixes the settings; later owners asking for the same file
//! with different settings are refused.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::connection::Connection;
use super::error::{DbError, DbResult};
use crate::config::DatabaseConfig;

struct PoolEntry {
    config: DatabaseConfig,
    connections: Vec<Arc<Connection>>,
}

/// Owner of every live [`Connection`]. Cloned around behind an `Arc`.
#[derive(Default)]
pub struct ConnectionPool {
    entries: Mutex<Vec<PoolEntry>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(ConnectionPool::default())
    }

    /// Hand out the connections for `config`, spawning missing ones.
    /// Finished connections are replaced with fresh workers.
    pub async fn connections(&self, config: &DatabaseConfig) -> DbResult<Vec<Arc<Connection>>> {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            if !entry.config.same_database(config) {
                continue;
            }
            if entry.config != *config {
                return Err(DbError::ConfigMismatch(format!(
                    "'{}' is already open with different settings",
                    config.path.display()
                )));
            }
            entry.connections.retain(|c| !c.is_finished());
            while entry.connections.len() < config.connections_count.max(1) {
                entry.connections.push(Connection::spawn(config.clone()).await?);
            }
            debug!(
                "reusing {} connection(s) on '{}'",
                entry.connections.len(),
                config.path.display()
            );
            return Ok(entry.connections.clone());
        }

        let count = config.connections_count.max(1);
        let mut connections = Vec::with_capacity(count);
        for _ in 0..count {
            connections.push(Connection::spawn(config.clone()).await?);
        }
        info!(
            "opened {} connection(s) on '{}'",
            connections.len(),
            config.path.display()
        );
        entries.push(PoolEntry {
            config: config.clone(),
            connections: connections.clone(),
        });
        Ok(connections)
    }

    /// Number of live connections across all databases
    pub async fn connection_count(&self) -> usize {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|e| e.connections.iter().filter(|c| !c.is_finished()).count())
            .sum()
    }

    /// Stop every connection and wait for the workers to exit
    pub async fn shutdown(&self) {
        let entries = {
            let mut guard = self.entries.lock().await;
            std::mem::take(&mut *guard)
        };
        for entry in &entries {
            for conn in &entry.connections {
                conn.stop();
            }
        }
        for entry in &entries {
            for conn in &entry.connections {
                conn.wait_finished().await;
            }
        }
        info!("connection pool drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shares_connections_for_the_same_database() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new();
        let config = DatabaseConfig::new(dir.path().join("a.db")).connections_count(2);

        let first = pool.connections(&config).await.unwrap();
        let second = pool.connections(&config).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(Arc::ptr_eq(&first[0], &second[0]));
        assert_eq!(pool.connection_count().await, 2);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn refuses_conflicting_settings() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new();
        let config = DatabaseConfig::new(dir.path().join("a.db"));
        pool.connections(&config).await.unwrap();

        let other = config.clone().queries_per_transaction(1);
        let res = pool.connections(&other).await;
        assert!(matches!(res, Err(DbError::ConfigMismatch(_))));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn separate_databases_get_separate_connections() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectionPool::new();
        let a = pool
            .connections(&DatabaseConfig::new(dir.path().join("a.db")))
            .await
            .unwrap();
        let b = pool
            .connections(&DatabaseConfig::new(dir.path().join("b.db")))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(pool.connection_count().await, 2);

        pool.shutdown().await;
    }
}
