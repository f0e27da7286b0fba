//! Tests of the Storage stream and the derived metric events
//!
//! These tests verify that:
//! - index_data and metrics rows are created on first sight only
//! - Samples land in data_bin and threshold changes update metrics
//! - Index and metric mappings are published exactly once
//! - Graph removal deletes the rows and evicts the caches

use std::time::Duration;

use pretty_assertions::assert_eq;
use relaydb::config::CoordinatorConfig;
use relaydb::events::{DerivedEvent, StreamKind};
use tempfile::tempdir;

use crate::helpers::{count_rows, query_f64, query_i64, service_status_event, spawn_coordinator};

const POLL: Duration = Duration::from_millis(100);
const DEADLINE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn samples_create_index_and_metric_rows() {
    let dir = tempdir().unwrap();
    let mut bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle.attach_storage(&bed.db_config).unwrap();

    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 21, "load=0.5;1;2;0;5"),
        )
        .unwrap();

    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "index_data").await, 1);
    assert_eq!(count_rows(&bed, "metrics").await, 1);
    assert_eq!(count_rows(&bed, "data_bin").await, 1);
    assert_eq!(
        query_f64(&bed, "SELECT current_value FROM metrics WHERE metric_name='load'").await,
        0.5
    );

    // The mappings went out before the samples.
    let mut saw_index = false;
    let mut saw_metric = false;
    let mut saw_sample = false;
    while let Ok(event) = bed.derived.try_recv() {
        match event {
            DerivedEvent::IndexMapping {
                host_id,
                service_id,
                ..
            } => {
                assert_eq!((host_id, service_id), (11, 21));
                saw_index = true;
            }
            DerivedEvent::MetricMapping { .. } => saw_metric = true,
            DerivedEvent::Metric { name, value, .. } => {
                assert_eq!(name, "load");
                assert_eq!(value, 0.5);
                saw_sample = true;
            }
            DerivedEvent::Status { state, .. } => assert_eq!(state, 0),
            other => panic!("unexpected derived event {other:?}"),
        }
    }
    assert!(saw_index && saw_metric && saw_sample);
}

#[tokio::test]
async fn mappings_are_published_once_per_pair() {
    let dir = tempdir().unwrap();
    let mut bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle.attach_storage(&bed.db_config).unwrap();

    // Many samples over few services must not create duplicate rows.
    for round in 0..20 {
        for service_id in 1..=5u64 {
            bed.handle
                .send_event(
                    StreamKind::Storage,
                    service_status_event(11, service_id, &format!("rt={}ms;;;;", round)),
                )
                .unwrap();
        }
    }

    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "index_data").await, 5);
    assert_eq!(count_rows(&bed, "metrics").await, 5);
    assert_eq!(count_rows(&bed, "data_bin").await, 100);

    let mut index_mappings = 0;
    let mut metric_mappings = 0;
    while let Ok(event) = bed.derived.try_recv() {
        match event {
            DerivedEvent::IndexMapping { .. } => index_mappings += 1,
            DerivedEvent::MetricMapping { .. } => metric_mappings += 1,
            _ => {}
        }
    }
    assert_eq!(index_mappings, 5);
    assert_eq!(metric_mappings, 5);
}

#[tokio::test]
async fn threshold_changes_update_the_metrics_row() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle.attach_storage(&bed.db_config).unwrap();

    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 21, "used=10;80;90;0;100"),
        )
        .unwrap();
    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 21, "used=25;70;95;0;100"),
        )
        .unwrap();

    assert!(bed.handle.stop().await);
    assert_eq!(count_rows(&bed, "metrics").await, 1);
    assert_eq!(
        query_f64(&bed, "SELECT current_value FROM metrics WHERE metric_name='used'").await,
        25.0
    );
    assert_eq!(
        query_f64(&bed, "SELECT warn FROM metrics WHERE metric_name='used'").await,
        70.0
    );
    assert_eq!(count_rows(&bed, "data_bin").await, 2);
}

#[tokio::test]
async fn unreadable_perfdata_only_loses_the_samples() {
    let dir = tempdir().unwrap();
    let bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle.attach_storage(&bed.db_config).unwrap();

    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 21, "=broken==;;"),
        )
        .unwrap();
    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 22, "ok=1;;;;"),
        )
        .unwrap();

    assert!(bed.handle.stop().await);
    // Both indexes exist, only the readable sample was stored.
    assert_eq!(count_rows(&bed, "index_data").await, 2);
    assert_eq!(count_rows(&bed, "metrics").await, 1);
    assert_eq!(count_rows(&bed, "data_bin").await, 1);
}

#[tokio::test]
async fn remove_graphs_deletes_rows_and_publishes() {
    let dir = tempdir().unwrap();
    let mut bed = spawn_coordinator(dir.path(), CoordinatorConfig::default()).await;
    bed.handle.attach_storage(&bed.db_config).unwrap();

    bed.handle
        .send_event(
            StreamKind::Storage,
            service_status_event(11, 21, "load=0.5;;;;"),
        )
        .unwrap();

    // Wait for the rows before asking for their removal.
    let give_up = tokio::time::Instant::now() + DEADLINE;
    while count_rows(&bed, "metrics").await < 1 {
        assert!(
            tokio::time::Instant::now() < give_up,
            "metric row never appeared"
        );
        tokio::time::sleep(POLL).await;
    }
    let index_id = query_i64(&bed, "SELECT id FROM index_data").await as u64;

    bed.handle.remove_graphs(vec![index_id], vec![]).unwrap();

    let give_up = tokio::time::Instant::now() + DEADLINE;
    while count_rows(&bed, "index_data").await > 0 {
        assert!(
            tokio::time::Instant::now() < give_up,
            "index_data row was never removed"
        );
        tokio::time::sleep(POLL).await;
    }
    assert_eq!(count_rows(&bed, "metrics").await, 0);
    assert_eq!(count_rows(&bed, "data_bin").await, 0);

    let removed = tokio::time::timeout(DEADLINE, async {
        loop {
            if let Ok(DerivedEvent::RemoveGraphs { index_ids, .. }) = bed.derived.recv().await {
                return index_ids;
            }
        }
    })
    .await;
    assert_eq!(removed.unwrap(), vec![index_id]);
    assert!(bed.handle.stop().await);
}
