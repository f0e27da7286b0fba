//! Shared fixtures for the coordinator integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use relaydb::config::{CoordinatorConfig, DatabaseConfig};
use relaydb::coordinator::{CoordinatorHandle, WriteCoordinator};
use relaydb::db::{ConnectionPool, Database};
use relaydb::events::{
    BroadcastPublisher, CustomVariable, DerivedEvent, Event, Host, Instance, Publisher, Service,
    ServiceStatus,
};

pub struct TestBed {
    pub handle: CoordinatorHandle,
    pub publisher: Arc<BroadcastPublisher>,
    pub derived: tokio::sync::broadcast::Receiver<DerivedEvent>,
    pub db_config: DatabaseConfig,
    pub pool: Arc<ConnectionPool>,
}

/// Spawns a coordinator on a temp database with one statement per
/// transaction, so committed rows are visible as soon as events are acked.
pub async fn spawn_coordinator(dir: &Path, config: CoordinatorConfig) -> TestBed {
    let db_config = DatabaseConfig::new(dir.join("relay.db"))
        .connections_count(2)
        .queries_per_transaction(1);
    let publisher = Arc::new(BroadcastPublisher::new(4096));
    let derived = publisher.subscribe();
    let pool = ConnectionPool::new();
    let handle = WriteCoordinator::spawn(
        db_config.clone(),
        config,
        Arc::clone(&publisher) as Arc<dyn Publisher>,
        &pool,
    )
    .await
    .unwrap();
    TestBed {
        handle,
        publisher,
        derived,
        db_config,
        pool,
    }
}

pub async fn count_rows(bed: &TestBed, table: &str) -> i64 {
    query_i64(bed, &format!("SELECT COUNT(*) FROM {}", table)).await
}

pub async fn query_i64(bed: &TestBed, sql: &str) -> i64 {
    let db = Database::connect(&bed.pool, bed.db_config.clone())
        .await
        .unwrap();
    let mut rows = db.run_query_and_get_rows(sql.to_string(), 0).await.unwrap();
    rows.next_row().expect("query returned no row").as_i64(0)
}

pub async fn query_f64(bed: &TestBed, sql: &str) -> f64 {
    let db = Database::connect(&bed.pool, bed.db_config.clone())
        .await
        .unwrap();
    let mut rows = db.run_query_and_get_rows(sql.to_string(), 0).await.unwrap();
    rows.next_row().expect("query returned no row").as_f64(0)
}

pub fn instance_event(poller_id: u64) -> Event {
    Event::Instance(Instance {
        poller_id,
        name: format!("poller-{poller_id}"),
        version: "1.0.0".to_string(),
        pid: 42,
        start_time: 1000,
        end_time: 0,
        running: true,
    })
}

pub fn host_event(poller_id: u64, host_id: u64) -> Event {
    Event::Host(Host {
        poller_id,
        host_id,
        name: format!("host-{host_id}"),
        address: "192.0.2.1".to_string(),
        alias: format!("alias-{host_id}"),
        active_checks: true,
        check_interval: 5.0,
        max_check_attempts: 3,
        notify: false,
        enabled: true,
    })
}

pub fn service_event(host_id: u64, service_id: u64) -> Event {
    Event::Service(Service {
        host_id,
        service_id,
        description: format!("service-{service_id}"),
        active_checks: true,
        check_interval: 5.0,
        max_check_attempts: 3,
        notify: false,
        enabled: true,
    })
}

pub fn service_status_event(host_id: u64, service_id: u64, perfdata: &str) -> Event {
    Event::ServiceStatus(ServiceStatus {
        host_id,
        service_id,
        host_name: format!("host-{host_id}"),
        service_description: format!("service-{service_id}"),
        checked: true,
        check_type: 0,
        state: 0,
        state_type: 1,
        last_check: 1000,
        next_check: 1300,
        last_hard_state: 0,
        current_check_attempt: 1,
        check_interval: 5.0,
        retention: 0,
        output: "OK".to_string(),
        perfdata: perfdata.to_string(),
        flapping: false,
        acknowledged: false,
        downtime_depth: 0,
    })
}

pub fn custom_variable_event(host_id: u64, name: &str, value: &str) -> Event {
    Event::CustomVariable(CustomVariable {
        host_id,
        service_id: 0,
        name: name.to_string(),
        value: value.to_string(),
        default_value: value.to_string(),
        modified: false,
        update_time: 1000,
        var_type: 0,
        deleted: false,
    })
}
