//! Asynchronous relational write path for monitoring events
//!
//! Pollers emit configuration, status and performance events; this crate
//! persists them. A small set of dedicated SQLite sessions runs behind
//! [`db::Database`], each owned by its task, and the [`coordinator`] serializes
//! every write on top of them. Statements are routed per poller and the
//! high-volume tables are batched. Events are acknowledged back to producers
//! only once their writes are committed.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod events;
pub mod perfdata;

pub use config::{CoordinatorConfig, DatabaseConfig};
pub use coordinator::{CoordinatorHandle, WriteCoordinator};
pub use db::{ConnectionPool, CoordinatorError, DbError};
pub use events::{
    BroadcastPublisher, DerivedEvent, Event, NullPublisher, Publisher, StreamKind,
};
