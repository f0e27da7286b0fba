//! Events accepted by the write coordinator and the derived events it emits
//!
//! Producers decode these from the wire; the coordinator only consumes them.
//! Field sets mirror the relational schema, so handlers mostly map fields to
//! statement binds.

use serde::{Deserialize, Serialize};

/// Logical producer stream an event arrives on. The Sql stream feeds the
/// configuration/status tables, the Storage stream feeds metric extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Sql,
    Storage,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Sql, StreamKind::Storage];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Sql => "sql",
            StreamKind::Storage => "storage",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Instance {
    pub poller_id: u64,
    pub name: String,
    pub version: String,
    pub pid: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub poller_id: u64,
    pub active_host_checks: bool,
    pub active_service_checks: bool,
    pub check_hosts_freshness: bool,
    pub check_services_freshness: bool,
    pub global_host_event_handler: String,
    pub global_service_event_handler: String,
    pub last_alive: i64,
    pub last_command_check: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    pub poller_id: u64,
    pub host_id: u64,
    pub name: String,
    pub address: String,
    pub alias: String,
    pub active_checks: bool,
    pub check_interval: f64,
    pub max_check_attempts: i32,
    pub notify: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostStatus {
    pub host_id: u64,
    pub checked: bool,
    pub check_type: i16,
    pub state: i16,
    pub state_type: i16,
    pub last_check: i64,
    pub next_check: i64,
    pub last_hard_state: i16,
    pub current_check_attempt: i32,
    pub output: String,
    pub perfdata: String,
    pub flapping: bool,
    pub acknowledged: bool,
    pub downtime_depth: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostCheck {
    pub host_id: u64,
    pub command_line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Service {
    pub host_id: u64,
    pub service_id: u64,
    pub description: String,
    pub active_checks: bool,
    pub check_interval: f64,
    pub max_check_attempts: i32,
    pub notify: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub host_id: u64,
    pub service_id: u64,
    pub host_name: String,
    pub service_description: String,
    pub checked: bool,
    pub check_type: i16,
    pub state: i16,
    pub state_type: i16,
    pub last_check: i64,
    pub next_check: i64,
    pub last_hard_state: i16,
    pub current_check_attempt: i32,
    pub check_interval: f64,
    pub retention: u32,
    pub output: String,
    pub perfdata: String,
    pub flapping: bool,
    pub acknowledged: bool,
    pub downtime_depth: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub host_id: u64,
    pub service_id: u64,
    pub command_line: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub poller_id: u64,
    pub host_id: u64,
    pub service_id: u64,
    pub entry_time: i64,
    pub author: String,
    pub comment: String,
    pub deletion_time: i64,
    pub notify_contacts: bool,
    pub persistent_comment: bool,
    pub sticky: bool,
    pub state: i16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Comment {
    pub poller_id: u64,
    pub host_id: u64,
    pub service_id: u64,
    pub internal_id: u64,
    pub entry_time: i64,
    pub entry_type: i16,
    pub expire_time: i64,
    pub expires: bool,
    pub persistent: bool,
    pub source: i16,
    pub author: String,
    pub data: String,
    pub deletion_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomVariable {
    pub host_id: u64,
    pub service_id: u64,
    pub name: String,
    pub value: String,
    pub default_value: String,
    pub modified: bool,
    pub update_time: i64,
    pub var_type: i16,
    /// True when the variable is being removed from the configuration
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomVariableStatus {
    pub host_id: u64,
    pub service_id: u64,
    pub name: String,
    pub value: String,
    pub modified: bool,
    pub update_time: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Downtime {
    pub poller_id: u64,
    pub host_id: u64,
    pub service_id: u64,
    pub internal_id: u64,
    pub entry_time: i64,
    pub author: String,
    pub comment: String,
    pub duration: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub actual_start_time: Option<i64>,
    pub actual_end_time: Option<i64>,
    pub deletion_time: Option<i64>,
    pub downtime_type: i16,
    pub fixed: bool,
    pub started: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogEntry {
    pub ctime: i64,
    pub host_id: u64,
    pub service_id: u64,
    pub host_name: String,
    pub instance_name: String,
    pub msg_type: i16,
    pub status: i16,
    pub retry: i32,
    pub output: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostGroup {
    pub poller_id: u64,
    pub hostgroup_id: u64,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostGroupMember {
    pub poller_id: u64,
    pub hostgroup_id: u64,
    pub host_id: u64,
    pub group_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceGroup {
    pub poller_id: u64,
    pub servicegroup_id: u64,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceGroupMember {
    pub poller_id: u64,
    pub servicegroup_id: u64,
    pub host_id: u64,
    pub service_id: u64,
    pub group_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostParent {
    pub child_id: u64,
    pub parent_id: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Severity {
    pub id: u64,
    pub severity_type: i16,
    pub level: u32,
    pub icon_id: u64,
    pub name: String,
    /// False when the definition is being dropped by the poller
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tag {
    pub id: u64,
    pub tag_type: i16,
    pub name: String,
    pub poller_id: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsiveInstance {
    pub poller_id: u64,
    pub responsive: bool,
}

/// Everything the coordinator accepts from producers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Instance(Instance),
    InstanceStatus(InstanceStatus),
    Host(Host),
    HostStatus(HostStatus),
    HostCheck(HostCheck),
    Service(Service),
    ServiceStatus(ServiceStatus),
    ServiceCheck(ServiceCheck),
    Acknowledgement(Acknowledgement),
    Comment(Comment),
    CustomVariable(CustomVariable),
    CustomVariableStatus(CustomVariableStatus),
    Downtime(Downtime),
    Log(LogEntry),
    HostGroup(HostGroup),
    HostGroupMember(HostGroupMember),
    ServiceGroup(ServiceGroup),
    ServiceGroupMember(ServiceGroupMember),
    HostParent(HostParent),
    Severity(Severity),
    Tag(Tag),
    ResponsiveInstance(ResponsiveInstance),
}

impl Event {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::Instance(_) => "instance",
            Event::InstanceStatus(_) => "instance_status",
            Event::Host(_) => "host",
            Event::HostStatus(_) => "host_status",
            Event::HostCheck(_) => "host_check",
            Event::Service(_) => "service",
            Event::ServiceStatus(_) => "service_status",
            Event::ServiceCheck(_) => "service_check",
            Event::Acknowledgement(_) => "acknowledgement",
            Event::Comment(_) => "comment",
            Event::CustomVariable(_) => "custom_variable",
            Event::CustomVariableStatus(_) => "custom_variable_status",
            Event::Downtime(_) => "downtime",
            Event::Log(_) => "log",
            Event::HostGroup(_) => "host_group",
            Event::HostGroupMember(_) => "host_group_member",
            Event::ServiceGroup(_) => "service_group",
            Event::ServiceGroupMember(_) => "service_group_member",
            Event::HostParent(_) => "host_parent",
            Event::Severity(_) => "severity",
            Event::Tag(_) => "tag",
            Event::ResponsiveInstance(_) => "responsive_instance",
        }
    }
}

/// Events the coordinator derives and publishes downstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DerivedEvent {
    /// A new `index_data` row was created for a (host, service) pair
    IndexMapping {
        index_id: u64,
        host_id: u64,
        service_id: u64,
    },

    /// A metric was attached to its index for the first time
    MetricMapping { index_id: u64, metric_id: u64 },

    /// One decoded metric sample
    Metric {
        metric_id: u64,
        ctime: i64,
        value: f64,
        value_type: i16,
        name: String,
        interval: u32,
        is_for_rebuild: bool,
    },

    /// Status sample attached to an index
    Status {
        index_id: u64,
        ctime: i64,
        state: i16,
        interval: u32,
    },

    /// Graphs whose index/metric rows were deleted
    RemoveGraphs {
        index_ids: Vec<u64>,
        metric_ids: Vec<u64>,
    },

    /// A poller flipped between responsive and unresponsive
    ResponsiveInstance(ResponsiveInstance),
}

/// Downstream sink for derived events. Publishing is fire and forget.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, event: DerivedEvent);
}

/// Fan-out publisher backed by a tokio broadcast channel
pub struct BroadcastPublisher {
    sender: tokio::sync::broadcast::Sender<DerivedEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        BroadcastPublisher { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DerivedEvent> {
        self.sender.subscribe()
    }
}

#[async_trait::async_trait]
impl Publisher for BroadcastPublisher {
    async fn publish(&self, event: DerivedEvent) {
        // Lagging or absent subscribers are not an error.
        let _ = self.sender.send(event);
    }
}

/// Publisher that drops everything, for setups without downstream consumers
pub struct NullPublisher;

#[async_trait::async_trait]
impl Publisher for NullPublisher {
    async fn publish(&self, _event: DerivedEvent) {}
}
