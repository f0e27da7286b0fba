//! End-to-end tests of the Sql stream
//!
//! These tests verify that:
//! - Events flow through the coordinator into their tables
//! - Acks are only released once events are committed, and none are lost
//! - Batched queues reach the database
//! - Unresponsive pollers are flagged and restored

use std::time::Duration;

use pretty_assertions::assert_eq;
use relaydb::config::CoordinatorConfig;
use relaydb::events::{DerivedEvent, Event, InstanceStatus, StreamKind};
use tempfile::tempdir;
use tokio_test::assert_ok;

use crate::helpers::{
    count_rows, custom_variable_event, host_event, instance_event, query_i64, service_event,
    service_status_event, spawn_coordinator,
};

const POLL: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn events_flow_into_tables() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;

    for event in [
        instance_event(1),
        host_event(1, 11),
        service_event(11, 21),
        service_status_event(11, 21, ""),
    ] {
        tokio_test::assert_ok!(bed.handle.send_event(StreamKind::Sql, event));
    }

    assert!(bed.handle.stop().await, "coordinator should stop cleanly");
    assert_eq!(count_rows(&bed, "instances").await, 1);
    assert_eq!(count_rows(&bed, "hosts").await, 1);
    assert_eq!(count_rows(&bed, "services").await, 1);
    assert_eq!(
        query_i64(&bed, "SELECT checked FROM services WHERE service_id=21").await,
        1
    );
}

#[tokio::test]
async fn every_event_is_acknowledged() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;

    let total = 25usize;
    let mut collected = 0;
    for i in 0..total {
        collected += bed
            .handle
            .send_event(StreamKind::Sql, host_event(1, 100 + i as u64))
            .unwrap();
    }

    // The idle barrier commits and releases the remaining acks.
    let give_up = tokio::time::Instant::now() + DEADLINE;
    while collected < total && tokio::time::Instant::now() < give_up {
        collected += bed.handle.get_acks(StreamKind::Sql).unwrap();
        tokio::time::sleep(POLL).await;
    }
    assert_eq!(collected, total, "some events were never acknowledged");

    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "hosts").await, total as i64);
}

#[tokio::test]
async fn custom_variables_are_batched() {
    let dir = tempdir().unwrap();
    let config = CoordinatorConfig {
        max_cv_queries: Some(2),
        ..CoordinatorConfig::default()
    };
    let bed = spawn_coordinator(dir.path(), config).await;

    bed.handle
        .send_event(StreamKind::Sql, custom_variable_event(11, "ROLE", "edge"))
        .unwrap();
    bed.handle
        .send_event(StreamKind::Sql, custom_variable_event(11, "SITE", "fra"))
        .unwrap();

    // Two queued upserts hit the flush threshold and land in one statement.
    let give_up = tokio::time::Instant::now() + DEADLINE;
    while count_rows(&bed, "customvariables").await < 2 {
        assert!(
            tokio::time::Instant::now() < give_up,
            "batched custom variables never reached the table"
        );
        tokio::time::sleep(POLL).await;
    }

    // An update to an already flushed key must replace its value.
    bed.handle
        .send_event(StreamKind::Sql, custom_variable_event(11, "ROLE", "core"))
        .unwrap();
    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "customvariables").await, 2);
}

#[tokio::test]
async fn silent_poller_is_flagged_and_restored() {
    let dir = tempdir().unwrap();
    let config = CoordinatorConfig {
        instance_timeout: 1,
        ..CoordinatorConfig::default()
    };
    let mut bed = spawn_coordinator(dir.path(), config).await;

    bed.handle
        .send_event(StreamKind::Sql, instance_event(7))
        .unwrap();

    // No further events: the scan must flag the poller within a few polls.
    let flagged = tokio::time::timeout(DEADLINE, async {
        loop {
            if let Ok(DerivedEvent::ResponsiveInstance(ev)) = bed.derived.recv().await {
                if ev.poller_id == 7 && !ev.responsive {
                    return;
                }
            }
        }
    })
    .await;
    assert!(flagged.is_ok(), "poller 7 was never flagged unresponsive");

    let give_up = tokio::time::Instant::now() + DEADLINE;
    while query_i64(&bed, "SELECT outdated FROM instances WHERE instance_id=7").await != 1 {
        assert!(
            tokio::time::Instant::now() < give_up,
            "instances.outdated was never set"
        );
        tokio::time::sleep(POLL).await;
    }

    // Any sign of life restores it.
    bed.handle
        .send_event(
            StreamKind::Sql,
            Event::InstanceStatus(InstanceStatus {
                poller_id: 7,
                last_alive: 2000,
                ..InstanceStatus::default()
            }),
        )
        .unwrap();
    let restored = tokio::time::timeout(DEADLINE, async {
        loop {
            if let Ok(DerivedEvent::ResponsiveInstance(ev)) = bed.derived.recv().await {
                if ev.poller_id == 7 && ev.responsive {
                    return;
                }
            }
        }
    })
    .await;
    assert!(restored.is_ok(), "poller 7 was never restored");
    assert!(bed.handle.stop().await);
}

#[tokio::test]
async fn storage_stream_refuses_other_database() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;

    let other = relaydb::config::DatabaseConfig::new(dir.path().join("other.db"));
    let err = bed.handle.attach_storage(&other).unwrap_err();
    assert!(matches!(
        err,
        relaydb::db::CoordinatorError::ConfigMismatch(_)
    ));

    tokio_test::assert_ok!(bed.handle.attach_storage(&bed.db_config));
    assert!(bed.handle.stop().await);
}
