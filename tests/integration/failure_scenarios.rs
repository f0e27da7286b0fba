//! Failure-path tests
//!
//! These tests verify that:
//! - Handles refuse work once the coordinator has stopped
//! - A bad event only loses itself, never the stream
//! - Stopping twice is harmless

use assert_matches::assert_matches;
use relaydb::config::CoordinatorConfig;
use relaydb::db::CoordinatorError;
use relaydb::events::{Event, HostStatus, StreamKind};
use tempfile::tempdir;

use crate::helpers::{count_rows, host_event, instance_event, spawn_coordinator};

#[tokio::test]
async fn stopped_handle_refuses_events() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;

    assert!(bed.handle.stop().await);
    let err = bed.handle.send_event(StreamKind::Sql, instance_event(1));
    assert_matches!(err, Err(CoordinatorError::Stopped));
    let err = bed.handle.get_acks(StreamKind::Sql);
    assert_matches!(err, Err(CoordinatorError::Stopped));
}

#[tokio::test]
async fn bad_event_does_not_wedge_the_stream() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;

    // Status for a host nobody declared is discarded with a warning.
    bed.handle
        .send_event(
            StreamKind::Sql,
            Event::HostStatus(HostStatus {
                host_id: 999,
                ..HostStatus::default()
            }),
        )
        .unwrap();
    bed.handle
        .send_event(StreamKind::Sql, host_event(1, 11))
        .unwrap();

    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "hosts").await, 1);
}

#[tokio::test]
async fn stop_is_idempotent() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle
        .send_event(StreamKind::Sql, host_event(1, 11))
        .unwrap();
    assert!(bed.handle.stop().await);
    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "hosts").await, 1);
}
