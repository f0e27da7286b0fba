//! Prepared statements registered on every connection at startup

use crate::db::{Database, DbResult, Statement};

pub struct Statements {
    pub instance_insupdate: Statement,
    pub instance_status_update: Statement,
    pub host_insupdate: Statement,
    pub host_status_update: Statement,
    pub host_check_update: Statement,
    pub service_insupdate: Statement,
    pub service_status_update: Statement,
    pub service_check_update: Statement,
    pub ack_insupdate: Statement,
    pub comment_insupdate: Statement,
    pub host_parent_insert: Statement,
    pub host_parent_delete: Statement,
    pub hostgroup_insupdate: Statement,
    pub hostgroup_member_insert: Statement,
    pub hostgroup_member_delete: Statement,
    pub servicegroup_insupdate: Statement,
    pub servicegroup_member_insert: Statement,
    pub servicegroup_member_delete: Statement,
    pub severity_insert: Statement,
    pub severity_update: Statement,
    pub severity_delete: Statement,
    pub tag_insert: Statement,
    pub tag_update: Statement,
    pub tag_delete: Statement,
    pub index_data_insert: Statement,
    pub index_data_update: Statement,
    pub metrics_insert: Statement,
}

impl Statements {
    pub fn new() -> Self {
        Statements {
            instance_insupdate: Statement::new(
                "INSERT INTO instances (instance_id, name, version, pid, running, \
                 start_time, end_time, deleted, outdated) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0) \
                 ON CONFLICT(instance_id) DO UPDATE SET name=excluded.name, \
                 version=excluded.version, pid=excluded.pid, running=excluded.running, \
                 start_time=excluded.start_time, end_time=excluded.end_time, \
                 deleted=0",
            ),
            instance_status_update: Statement::new(
                "UPDATE instances SET last_alive=?, last_command_check=?, \
                 active_host_checks=?, active_service_checks=?, \
                 check_hosts_freshness=?, check_services_freshness=?, \
                 global_host_event_handler=?, global_service_event_handler=? \
                 WHERE instance_id=?",
            ),
            host_insupdate: Statement::new(
                "INSERT INTO hosts (host_id, instance_id, name, address, alias, \
                 active_checks, check_interval, max_check_attempts, notify, enabled) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(host_id) DO UPDATE SET instance_id=excluded.instance_id, \
                 name=excluded.name, address=excluded.address, alias=excluded.alias, \
                 active_checks=excluded.active_checks, \
                 check_interval=excluded.check_interval, \
                 max_check_attempts=excluded.max_check_attempts, \
                 notify=excluded.notify, enabled=excluded.enabled",
            ),
            host_status_update: Statement::new(
                "UPDATE hosts SET checked=?, check_type=?, state=?, state_type=?, \
                 last_check=?, next_check=?, last_hard_state=?, check_attempt=?, \
                 output=?, perfdata=?, flapping=?, acknowledged=?, \
                 scheduled_downtime_depth=? WHERE host_id=?",
            ),
            host_check_update: Statement::new(
                "UPDATE hosts SET command_line=? WHERE host_id=?",
            ),
            service_insupdate: Statement::new(
                "INSERT INTO services (host_id, service_id, description, active_checks, \
                 check_interval, max_check_attempts, notify, enabled) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(host_id, service_id) DO UPDATE SET \
                 description=excluded.description, \
                 active_checks=excluded.active_checks, \
                 check_interval=excluded.check_interval, \
                 max_check_attempts=excluded.max_check_attempts, \
                 notify=excluded.notify, enabled=excluded.enabled",
            ),
            service_status_update: Statement::new(
                "UPDATE services SET checked=?, check_type=?, state=?, state_type=?, \
                 last_check=?, next_check=?, last_hard_state=?, check_attempt=?, \
                 output=?, perfdata=?, flapping=?, acknowledged=?, \
                 scheduled_downtime_depth=? WHERE host_id=? AND service_id=?",
            ),
            service_check_update: Statement::new(
                "UPDATE services SET command_line=? WHERE host_id=? AND service_id=?",
            ),
            ack_insupdate: Statement::new(
                "INSERT INTO acknowledgements (entry_time, host_id, service_id, \
                 instance_id, author, comment_data, deletion_time, notify_contacts, \
                 persistent_comment, sticky, state) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(entry_time, host_id, service_id) DO UPDATE SET \
                 author=excluded.author, comment_data=excluded.comment_data, \
                 deletion_time=excluded.deletion_time, \
                 notify_contacts=excluded.notify_contacts, \
                 persistent_comment=excluded.persistent_comment, \
                 sticky=excluded.sticky, state=excluded.state",
            ),
            comment_insupdate: Statement::new(
                "INSERT INTO comments (host_id, service_id, instance_id, internal_id, \
                 entry_time, entry_type, expire_time, expires, persistent, source, \
                 author, data, deletion_time) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT(host_id, service_id, entry_time, instance_id, internal_id) \
                 DO UPDATE SET entry_type=excluded.entry_type, \
                 expire_time=excluded.expire_time, expires=excluded.expires, \
                 persistent=excluded.persistent, source=excluded.source, \
                 author=excluded.author, data=excluded.data, \
                 deletion_time=excluded.deletion_time",
            ),
            host_parent_insert: Statement::new(
                "INSERT OR IGNORE INTO hosts_hosts_parents (child_id, parent_id) \
                 VALUES (?, ?)",
            ),
            host_parent_delete: Statement::new(
                "DELETE FROM hosts_hosts_parents WHERE child_id=? AND parent_id=?",
            ),
            hostgroup_insupdate: Statement::new(
                "INSERT INTO hostgroups (hostgroup_id, name) VALUES (?, ?) \
                 ON CONFLICT(hostgroup_id) DO UPDATE SET name=excluded.name",
            ),
            hostgroup_member_insert: Statement::new(
                "INSERT OR IGNORE INTO hosts_hostgroups (host_id, hostgroup_id) \
                 VALUES (?, ?)",
            ),
            hostgroup_member_delete: Statement::new(
                "DELETE FROM hosts_hostgroups WHERE host_id=? AND hostgroup_id=?",
            ),
            servicegroup_insupdate: Statement::new(
                "INSERT INTO servicegroups (servicegroup_id, name) VALUES (?, ?) \
                 ON CONFLICT(servicegroup_id) DO UPDATE SET name=excluded.name",
            ),
            servicegroup_member_insert: Statement::new(
                "INSERT OR IGNORE INTO services_servicegroups \
                 (host_id, service_id, servicegroup_id) VALUES (?, ?, ?)",
            ),
            servicegroup_member_delete: Statement::new(
                "DELETE FROM services_servicegroups \
                 WHERE host_id=? AND service_id=? AND servicegroup_id=?",
            ),
            severity_insert: Statement::new(
                "INSERT INTO severities (id, type, name, level, icon_id) \
                 VALUES (?, ?, ?, ?, ?)",
            ),
            severity_update: Statement::new(
                "UPDATE severities SET name=?, level=?, icon_id=? WHERE severity_id=?",
            ),
            severity_delete: Statement::new(
                "DELETE FROM severities WHERE severity_id=?",
            ),
            tag_insert: Statement::new(
                "INSERT INTO tags (id, type, name) VALUES (?, ?, ?)",
            ),
            tag_update: Statement::new("UPDATE tags SET name=? WHERE tag_id=?"),
            tag_delete: Statement::new("DELETE FROM tags WHERE tag_id=?"),
            index_data_insert: Statement::new(
                "INSERT INTO index_data (host_id, service_id, host_name, \
                 service_description, check_interval, special) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            ),
            index_data_update: Statement::new(
                "UPDATE index_data SET host_name=?, service_description=?, \
                 check_interval=?, special=? WHERE id=?",
            ),
            metrics_insert: Statement::new(
                "INSERT INTO metrics (index_id, metric_name, unit_name, warn, \
                 warn_low, warn_threshold_mode, crit, crit_low, crit_threshold_mode, \
                 min, max, current_value, data_source_type) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ),
        }
    }

    /// Register every statement on every connection
    pub async fn prepare_all(&self, db: &Database) -> DbResult<()> {
        for stmt in [
            &self.instance_insupdate,
            &self.instance_status_update,
            &self.host_insupdate,
            &self.host_status_update,
            &self.host_check_update,
            &self.service_insupdate,
            &self.service_status_update,
            &self.service_check_update,
            &self.ack_insupdate,
            &self.comment_insupdate,
            &self.host_parent_insert,
            &self.host_parent_delete,
            &self.hostgroup_insupdate,
            &self.hostgroup_member_insert,
            &self.hostgroup_member_delete,
            &self.servicegroup_insupdate,
            &self.servicegroup_member_insert,
            &self.servicegroup_member_delete,
            &self.severity_insert,
            &self.severity_update,
            &self.severity_delete,
            &self.tag_insert,
            &self.tag_update,
            &self.tag_delete,
            &self.index_data_insert,
            &self.index_data_update,
            &self.metrics_insert,
        ] {
            db.prepare_statement(stmt).await?;
        }
        Ok(())
    }
}

impl Default for Statements {
    fn default() -> Self {
        Statements::new()
    }
}
