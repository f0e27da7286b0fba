//! Operations queued on a database connection and the values they carry
//!
//! Every operation travels through the connection's FIFO and is executed by
//! the worker task in submission order. Result-producing variants carry a
//! `respond_to` oneshot that the worker fulfills exactly once.

use std::collections::HashMap;

use tokio::sync::oneshot;

use super::error::{DbError, DbResult};

/// A value bound to a statement placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F64(f64),
    Text(String),
}

impl BindValue {
    /// NULL used where the schema expects a numeric column
    pub fn null_number() -> Self {
        BindValue::Null
    }
}

impl From<&str> for BindValue {
    fn from(v: &str) -> Self {
        BindValue::Text(v.to_string())
    }
}

impl From<String> for BindValue {
    fn from(v: String) -> Self {
        BindValue::Text(v)
    }
}

impl From<i16> for BindValue {
    fn from(v: i16) -> Self {
        BindValue::I32(v.into())
    }
}

macro_rules! bind_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl From<$ty> for BindValue {
            fn from(v: $ty) -> Self {
                BindValue::$variant(v)
            }
        })*
    };
}

bind_from!(bool => Bool, i32 => I32, u32 => U32, i64 => I64, u64 => U64, f64 => F64);

impl<T: Into<BindValue>> From<Option<T>> for BindValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => BindValue::Null,
        }
    }
}

/// Placeholder values for one execution of a prepared statement
#[derive(Debug, Clone, Default)]
pub struct Binds {
    values: Vec<BindValue>,
}

impl Binds {
    pub fn new() -> Self {
        Binds { values: Vec::new() }
    }

    pub fn push(&mut self, value: impl Into<BindValue>) -> &mut Self {
        self.values.push(value.into());
        self
    }

    pub fn values(&self) -> &[BindValue] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V: Into<BindValue>, const N: usize> From<[V; N]> for Binds {
    fn from(values: [V; N]) -> Self {
        Binds {
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// A single decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// One materialized result row
#[derive(Debug, Clone, Default)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Row { values }
    }

    pub fn value(&self, idx: usize) -> &Value {
        self.values.get(idx).unwrap_or(&Value::Null)
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.value(idx), Value::Null)
    }

    pub fn as_i64(&self, idx: usize) -> i64 {
        match self.value(idx) {
            Value::Integer(v) => *v,
            Value::Real(v) => *v as i64,
            Value::Text(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }

    pub fn as_u64(&self, idx: usize) -> u64 {
        self.as_i64(idx).max(0) as u64
    }

    pub fn as_u32(&self, idx: usize) -> u32 {
        self.as_i64(idx).clamp(0, u32::MAX as i64) as u32
    }

    pub fn as_f64(&self, idx: usize) -> f64 {
        match self.value(idx) {
            Value::Real(v) => *v,
            Value::Integer(v) => *v as f64,
            Value::Text(s) => s.parse().unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }

    pub fn as_bool(&self, idx: usize) -> bool {
        self.as_i64(idx) != 0
    }

    pub fn as_str(&self, idx: usize) -> &str {
        match self.value(idx) {
            Value::Text(s) => s.as_str(),
            _ => "",
        }
    }
}

/// A fully materialized query result, consumed row by row
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: std::collections::VecDeque<Row>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        RowSet { rows: rows.into() }
    }

    pub fn next_row(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl Iterator for RowSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.next_row()
    }
}

/// Affected-row count and last inserted rowid of a write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub rows_affected: u64,
    pub last_insert_id: i64,
}

/// A statement registered on every connection before use.
///
/// Ids are allocated by the router; the text survives reconnects because the
/// worker keeps the registry and re-validates it on a fresh session.
#[derive(Debug, Clone)]
pub struct Statement {
    pub id: u32,
    pub sql: String,
}

static NEXT_STATEMENT_ID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(1);

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Statement {
            id: NEXT_STATEMENT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed),
            sql: sql.into(),
        }
    }
}

/// One unit of work for a connection worker
#[derive(Debug)]
pub enum Operation {
    /// Fire-and-forget raw query
    Query { sql: String },

    /// Raw query returning its rows
    QueryRows {
        sql: String,
        respond_to: oneshot::Sender<DbResult<RowSet>>,
    },

    /// Raw write returning its affected-row summary
    QueryWrite {
        sql: String,
        respond_to: oneshot::Sender<DbResult<WriteSummary>>,
    },

    /// Register a statement in the worker's registry and validate it
    Prepare {
        statement: Statement,
        respond_to: Option<oneshot::Sender<DbResult<()>>>,
    },

    /// Fire-and-forget execution of a registered statement
    Execute { statement_id: u32, binds: Binds },

    /// Execute a registered statement and return its rows
    ExecuteRows {
        statement_id: u32,
        binds: Binds,
        respond_to: oneshot::Sender<DbResult<RowSet>>,
    },

    /// Execute a registered statement and return its write summary
    ExecuteWrite {
        statement_id: u32,
        binds: Binds,
        respond_to: oneshot::Sender<DbResult<WriteSummary>>,
    },

    /// Commit the open transaction, if any
    Commit {
        respond_to: Option<oneshot::Sender<DbResult<()>>>,
    },

    /// Report the SQLite library version
    ServerVersion {
        respond_to: oneshot::Sender<DbResult<String>>,
    },
}

impl Operation {
    /// Fail the carried result handle, if any. Fire-and-forget operations
    /// are dropped silently.
    pub fn interrupt(self, err: DbError) {
        match self {
            Operation::QueryRows { respond_to, .. }
            | Operation::ExecuteRows { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            Operation::QueryWrite { respond_to, .. }
            | Operation::ExecuteWrite { respond_to, .. } => {
                let _ = respond_to.send(Err(err));
            }
            Operation::Prepare { respond_to, .. } => {
                if let Some(tx) = respond_to {
                    let _ = tx.send(Err(err));
                }
            }
            Operation::Commit { respond_to } => {
                if let Some(tx) = respond_to {
                    let _ = tx.send(Err(err));
                }
            }
            Operation::ServerVersion { respond_to } => {
                let _ = respond_to.send(Err(err));
            }
            Operation::Query { .. } | Operation::Execute { .. } => {}
        }
    }
}

/// Statement registry kept by each worker, re-validated after reconnects
#[derive(Debug, Default)]
pub struct StatementRegistry {
    statements: HashMap<u32, String>,
}

impl StatementRegistry {
    pub fn insert(&mut self, statement: &Statement) {
        self.statements.insert(statement.id, statement.sql.clone());
    }

    pub fn sql(&self, id: u32) -> DbResult<&str> {
        self.statements
            .get(&id)
            .map(String::as_str)
            .ok_or(DbError::UnknownStatement(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &String)> {
        self.statements.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn statement_ids_are_unique() {
        let a = Statement::new("SELECT 1");
        let b = Statement::new("SELECT 2");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn row_accessors_default_on_type_mismatch() {
        let row = Row::new(vec![
            Value::Text("oops".into()),
            Value::Integer(42),
            Value::Null,
        ]);
        assert_eq!(row.as_i64(0), 0);
        assert_eq!(row.as_u64(1), 42);
        assert!(row.as_f64(2).is_nan());
        assert!(row.is_null(2));
        assert_eq!(row.as_str(99), "");
    }

    #[test]
    fn small_integers_widen_to_i32() {
        assert_eq!(BindValue::from(3i16), BindValue::I32(3));
        assert_eq!(BindValue::from(-1i16), BindValue::I32(-1));
        let mut binds = Binds::new();
        binds.push(7i16).push(9i64);
        assert_eq!(binds.values(), &[BindValue::I32(7), BindValue::I64(9)]);
    }

    #[test]
    fn registry_rejects_unknown_ids() {
        let registry = StatementRegistry::default();
        assert_matches!(registry.sql(7), Err(DbError::UnknownStatement(7)));
    }

    #[tokio::test]
    async fn interrupt_fails_pending_result_handles() {
        let (tx, rx) = oneshot::channel();
        let op = Operation::QueryRows {
            sql: "SELECT 1".into(),
            respond_to: tx,
        };
        op.interrupt(DbError::Interrupted);
        assert_matches!(rx.await, Ok(Err(DbError::Interrupted)));
    }
}
