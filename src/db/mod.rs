//! Asynchronous database layer: connections, pooling and routing

pub mod connection;
pub mod error;
pub mod operation;
pub mod pool;
pub mod router;

pub use connection::{Connection, ConnectionState};
pub use error::{CoordinatorError, DbError, DbResult};
pub use operation::{BindValue, Binds, Operation, Row, RowSet, Statement, WriteSummary};
pub use pool::ConnectionPool;
pub use router::Database;

use sqlx::ConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;

use crate::config::DatabaseConfig;

/// Create the database file if needed and bring its schema up to date
pub async fn install_schema(config: &DatabaseConfig) -> DbResult<()> {
    let options = SqliteConnectOptions::new()
        .filename(&config.path)
        .create_if_missing(true);
    let mut conn = options
        .connect()
        .await
        .map_err(|e| DbError::ConnectionFailed(e.to_string()))?;
    sqlx::migrate!("./migrations").run(&mut conn).await?;
    sqlx::Connection::close(conn)
        .await
        .map_err(DbError::from)?;
    Ok(())
}
