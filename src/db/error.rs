//! Error types for database operations

use std::fmt;

/// Result type alias for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Errors reported by connections and the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Opening the database session failed
    ConnectionFailed(String),

    /// The session was lost mid-operation. Retryable: the connection
    /// reconnects on its own and the caller may post the operation again.
    Unavailable(String),

    /// A lock conflict. The worker commits its pending transaction and
    /// retries the statement a bounded number of times.
    Busy(String),

    /// A statement failed for a non-transient reason (constraint violation,
    /// syntax error, retry budget exhausted on a lock conflict)
    StatementFailed(String),

    /// The operation was dropped because the connection is shutting down
    Interrupted,

    /// An unknown prepared statement id was used
    UnknownStatement(u32),

    /// The database is already open with different settings
    ConfigMismatch(String),

    /// Schema migration failed
    MigrationFailed(String),

    /// The result channel was closed before a result arrived
    ResultDropped,
}

impl DbError {
    /// Transient errors are absorbed by the connection: it flags itself
    /// broken, reconnects and keeps serving the rest of its queue.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::Unavailable(_))
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::ConnectionFailed(msg) => {
                write!(f, "failed to open database session: {}", msg)
            }
            DbError::Unavailable(msg) => write!(f, "database unavailable: {}", msg),
            DbError::Busy(msg) => write!(f, "database busy: {}", msg),
            DbError::StatementFailed(msg) => write!(f, "statement failed: {}", msg),
            DbError::Interrupted => write!(f, "operation interrupted by shutdown"),
            DbError::UnknownStatement(id) => write!(f, "unknown prepared statement {}", id),
            DbError::ConfigMismatch(msg) => {
                write!(f, "conflicting database configuration: {}", msg)
            }
            DbError::MigrationFailed(msg) => write!(f, "database migration failed: {}", msg),
            DbError::ResultDropped => write!(f, "result channel closed before completion"),
        }
    }
}

impl std::error::Error for DbError {}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::WorkerCrashed => DbError::Unavailable(err.to_string()),
            sqlx::Error::Database(db) => {
                // SQLITE_BUSY (5) and SQLITE_LOCKED (6) play the role of a
                // lock wait: the statement is worth retrying after a commit.
                // Extended codes keep the primary code in the low byte.
                let primary = db
                    .code()
                    .and_then(|c| c.parse::<i64>().ok())
                    .map(|c| c & 0xff);
                match primary {
                    Some(5) | Some(6) => DbError::Busy(err.to_string()),
                    _ => DbError::StatementFailed(err.to_string()),
                }
            }
            _ => DbError::StatementFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Errors surfaced by the write coordinator to event producers
#[derive(Debug)]
pub enum CoordinatorError {
    /// The coordinator hit a fatal error and refuses further events
    Broken(String),

    /// Two owners asked for the same database with different settings
    ConfigMismatch(String),

    /// Seeding the in-memory caches from the database failed
    Cache(String),

    /// The coordinator was already stopped
    Stopped,
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::Broken(msg) => write!(f, "coordinator is broken: {}", msg),
            CoordinatorError::ConfigMismatch(msg) => {
                write!(f, "conflicting database configuration: {}", msg)
            }
            CoordinatorError::Cache(msg) => write!(f, "cache loading failed: {}", msg),
            CoordinatorError::Stopped => write!(f, "coordinator is stopped"),
        }
    }
}

impl std::error::Error for CoordinatorError {}

impl From<DbError> for CoordinatorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConfigMismatch(msg) => CoordinatorError::ConfigMismatch(msg),
            other => CoordinatorError::Broken(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DbError::Unavailable("gone".into()).is_transient());
        assert!(!DbError::Busy("locked".into()).is_transient());
        assert!(!DbError::StatementFailed("syntax".into()).is_transient());
        assert!(!DbError::Interrupted.is_transient());
    }

    #[test]
    fn io_errors_are_transient() {
        let err: DbError =
            sqlx::Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe")).into();
        assert!(err.is_transient());
    }
}
