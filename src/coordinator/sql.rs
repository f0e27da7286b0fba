//! Handlers for the configuration and status events of the Sql stream

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::db::{Binds, DbResult};
use crate::events::{
    Acknowledgement, Comment, CustomVariable, CustomVariableStatus, Downtime, Event, Host,
    HostCheck, HostGroup, HostGroupMember, HostParent, HostStatus, Instance, InstanceStatus,
    LogEntry, ResponsiveInstance, Service, ServiceCheck, ServiceGroup, ServiceGroupMember,
    ServiceStatus, Severity, Tag,
};

use super::actions::action;
use super::cache::InstanceTimestamp;
use super::{escape, special, Inner, BULK_FLUSH_INTERVAL, DOWNTIME_FLUSH_INTERVAL};

/// Sentinel states written while a poller is unresponsive
const HOST_UNREACHABLE: i16 = 2;
const SERVICE_UNKNOWN: i16 = 3;

fn fmt_opt(v: Option<i64>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => "NULL".to_string(),
    }
}

impl Inner {
    pub(crate) async fn handle_sql_event(&mut self, event: Event) -> DbResult<()> {
        match event {
            Event::Instance(ev) => self.handle_instance(ev).await,
            Event::InstanceStatus(ev) => self.handle_instance_status(ev).await,
            Event::Host(ev) => self.handle_host(ev).await,
            Event::HostStatus(ev) => self.handle_host_status(ev).await,
            Event::HostCheck(ev) => self.handle_host_check(ev).await,
            Event::Service(ev) => self.handle_service(ev).await,
            Event::ServiceStatus(ev) => self.handle_service_status(ev).await,
            Event::ServiceCheck(ev) => self.handle_service_check(ev).await,
            Event::Acknowledgement(ev) => self.handle_acknowledgement(ev).await,
            Event::Comment(ev) => self.handle_comment(ev).await,
            Event::HostGroup(ev) => self.handle_host_group(ev).await,
            Event::HostGroupMember(ev) => self.handle_host_group_member(ev).await,
            Event::ServiceGroup(ev) => self.handle_service_group(ev).await,
            Event::ServiceGroupMember(ev) => self.handle_service_group_member(ev).await,
            Event::HostParent(ev) => self.handle_host_parent(ev).await,
            Event::Severity(ev) => self.handle_severity(ev).await,
            Event::Tag(ev) => self.handle_tag(ev).await,
            // Derived events looping back through the feed carry no work.
            Event::ResponsiveInstance(ResponsiveInstance { .. }) => Ok(()),
            // Staged variants are routed before reaching this point.
            Event::CustomVariable(_)
            | Event::CustomVariableStatus(_)
            | Event::Downtime(_)
            | Event::Log(_) => Ok(()),
        }
    }

    /// Discard events from deleted pollers; refresh the liveness timestamp
    /// otherwise, restoring an unresponsive poller on its first sign of life.
    pub(crate) async fn is_valid_poller(&mut self, poller_id: u64) -> DbResult<bool> {
        if self.caches.deleted_instances.contains(&poller_id) {
            debug!("event from deleted poller {} discarded", poller_id);
            return Ok(false);
        }
        let now = Utc::now().timestamp();
        let entry = self
            .caches
            .stored_timestamps
            .entry(poller_id)
            .or_insert(InstanceTimestamp {
                last_seen: now,
                responsive: true,
            });
        entry.last_seen = now;
        let needs_restore = !entry.responsive;
        if needs_restore {
            self.set_instance_responsive(poller_id, true).await?;
        }
        Ok(true)
    }

    /// Flag pollers whose latest event is older than `instance_timeout`
    pub(crate) async fn check_outdated_instances(&mut self) -> DbResult<()> {
        let deadline = Utc::now().timestamp() - self.cfg.instance_timeout as i64;
        let overdue: Vec<u64> = self
            .caches
            .stored_timestamps
            .iter()
            .filter(|(_, t)| t.responsive && t.last_seen < deadline)
            .map(|(id, _)| *id)
            .collect();
        for poller_id in overdue {
            warn!("poller {} stopped responding", poller_id);
            self.set_instance_responsive(poller_id, false).await?;
        }
        Ok(())
    }

    /// Flip a poller between responsive and unresponsive. Host and service
    /// states are parked in `real_state` while the poller is silent and put
    /// back on its return; the transition publishes a responsiveness event
    /// exactly once.
    async fn set_instance_responsive(&mut self, poller_id: u64, responsive: bool) -> DbResult<()> {
        if let Some(entry) = self.caches.stored_timestamps.get_mut(&poller_id) {
            entry.responsive = responsive;
        }
        let conn = self.db.connection_by_instance(poller_id);
        if responsive {
            info!("poller {} is back, restoring states", poller_id);
            self.db.run_query(
                format!(
                    "UPDATE instances SET outdated=0 WHERE instance_id={}",
                    poller_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "UPDATE hosts SET state=COALESCE(real_state, state), real_state=NULL \
                     WHERE instance_id={}",
                    poller_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "UPDATE services SET state=COALESCE(real_state, state), real_state=NULL \
                     WHERE host_id IN (SELECT host_id FROM hosts WHERE instance_id={})",
                    poller_id
                ),
                conn,
            )?;
        } else {
            self.db.run_query(
                format!(
                    "UPDATE instances SET outdated=1 WHERE instance_id={}",
                    poller_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "UPDATE hosts SET real_state=state, state={} WHERE instance_id={}",
                    HOST_UNREACHABLE, poller_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "UPDATE services SET real_state=state, state={} \
                     WHERE host_id IN (SELECT host_id FROM hosts WHERE instance_id={})",
                    SERVICE_UNKNOWN, poller_id
                ),
                conn,
            )?;
        }
        self.actions
            .add(conn, action::INSTANCES | action::HOSTS | action::SERVICES);
        self.publisher
            .publish(crate::events::DerivedEvent::ResponsiveInstance(
                ResponsiveInstance {
                    poller_id,
                    responsive,
                },
            ))
            .await;
        Ok(())
    }

    /// A (re)starting poller resends its whole configuration; retire what
    /// the previous run left behind.
    fn clean_tables(&mut self, poller_id: u64, conn: usize) -> DbResult<()> {
        debug!("cleaning tables of poller {}", poller_id);
        self.db.run_query(
            format!("UPDATE hosts SET enabled=0 WHERE instance_id={}", poller_id),
            conn,
        )?;
        self.db.run_query(
            format!(
                "UPDATE services SET enabled=0 \
                 WHERE host_id IN (SELECT host_id FROM hosts WHERE instance_id={})",
                poller_id
            ),
            conn,
        )?;
        self.db.run_query(
            format!(
                "DELETE FROM hosts_hostgroups \
                 WHERE host_id IN (SELECT host_id FROM hosts WHERE instance_id={})",
                poller_id
            ),
            conn,
        )?;
        self.db.run_query(
            format!(
                "DELETE FROM services_servicegroups \
                 WHERE host_id IN (SELECT host_id FROM hosts WHERE instance_id={})",
                poller_id
            ),
            conn,
        )?;
        self.actions.add(
            conn,
            action::HOSTS
                | action::SERVICES
                | action::HOST_HOSTGROUPS
                | action::SERVICE_SERVICEGROUPS,
        );
        Ok(())
    }

    async fn handle_instance(&mut self, ev: Instance) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(ev.poller_id);
        // The incoming configuration supersedes anything still uncommitted.
        self.finish_action(
            None,
            action::HOSTS
                | action::SERVICES
                | action::ACKNOWLEDGEMENTS
                | action::COMMENTS
                | action::DOWNTIMES
                | action::CUSTOM_VARIABLES,
        )
        .await?;
        self.clean_tables(ev.poller_id, conn)?;
        if !ev.running {
            // A cleanly stopped poller must not trip the outdated scan.
            self.caches.stored_timestamps.remove(&ev.poller_id);
        }
        let mut binds = Binds::new();
        binds
            .push(ev.poller_id)
            .push(ev.name)
            .push(ev.version)
            .push(ev.pid)
            .push(ev.running)
            .push(ev.start_time)
            .push(ev.end_time);
        self.db
            .run_statement(self.stmts.instance_insupdate.id, binds, conn)?;
        self.actions.add(conn, action::INSTANCES);
        Ok(())
    }

    async fn handle_instance_status(&mut self, ev: InstanceStatus) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(ev.poller_id);
        let mut binds = Binds::new();
        binds
            .push(ev.last_alive)
            .push(ev.last_command_check)
            .push(ev.active_host_checks)
            .push(ev.active_service_checks)
            .push(ev.check_hosts_freshness)
            .push(ev.check_services_freshness)
            .push(ev.global_host_event_handler)
            .push(ev.global_service_event_handler)
            .push(ev.poller_id);
        self.db
            .run_statement(self.stmts.instance_status_update.id, binds, conn)?;
        self.actions.add(conn, action::INSTANCES);
        Ok(())
    }

    async fn handle_host(&mut self, ev: Host) -> DbResult<()> {
        if ev.host_id == 0 {
            warn!("host '{}' has no id, skipped", ev.name);
            return Ok(());
        }
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        // Membership and parent rows reference hosts across connections.
        self.finish_action(None, action::HOST_HOSTGROUPS | action::HOST_PARENTS)
            .await?;
        self.caches.host_instance.insert(ev.host_id, ev.poller_id);
        let conn = self.db.connection_by_instance(ev.poller_id);
        let mut binds = Binds::new();
        binds
            .push(ev.host_id)
            .push(ev.poller_id)
            .push(ev.name)
            .push(ev.address)
            .push(ev.alias)
            .push(ev.active_checks)
            .push(ev.check_interval)
            .push(ev.max_check_attempts)
            .push(ev.notify)
            .push(ev.enabled);
        self.db
            .run_statement(self.stmts.host_insupdate.id, binds, conn)?;
        self.actions.add(conn, action::HOSTS);
        Ok(())
    }

    fn instance_of_host(&self, host_id: u64) -> Option<u64> {
        self.caches.host_instance.get(&host_id).copied()
    }

    async fn handle_host_status(&mut self, ev: HostStatus) -> DbResult<()> {
        let Some(instance_id) = self.instance_of_host(ev.host_id) else {
            warn!("status for unknown host {} discarded", ev.host_id);
            return Ok(());
        };
        if !self.is_valid_poller(instance_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(instance_id);
        let mut binds = Binds::new();
        binds
            .push(ev.checked)
            .push(ev.check_type)
            .push(ev.state)
            .push(ev.state_type)
            .push(ev.last_check)
            .push(ev.next_check)
            .push(ev.last_hard_state)
            .push(ev.current_check_attempt)
            .push(ev.output)
            .push(ev.perfdata)
            .push(ev.flapping)
            .push(ev.acknowledged)
            .push(ev.downtime_depth)
            .push(ev.host_id);
        self.db
            .run_statement(self.stmts.host_status_update.id, binds, conn)?;
        self.actions.add(conn, action::HOSTS);
        Ok(())
    }

    async fn handle_host_check(&mut self, ev: HostCheck) -> DbResult<()> {
        let Some(instance_id) = self.instance_of_host(ev.host_id) else {
            warn!("check for unknown host {} discarded", ev.host_id);
            return Ok(());
        };
        if !self.is_valid_poller(instance_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(instance_id);
        let mut binds = Binds::new();
        binds.push(ev.command_line).push(ev.host_id);
        self.db
            .run_statement(self.stmts.host_check_update.id, binds, conn)?;
        self.actions.add(conn, action::HOSTS);
        Ok(())
    }

    async fn handle_service(&mut self, ev: Service) -> DbResult<()> {
        let Some(instance_id) = self.instance_of_host(ev.host_id) else {
            warn!(
                "service {} of unknown host {} discarded",
                ev.service_id, ev.host_id
            );
            return Ok(());
        };
        if !self.is_valid_poller(instance_id).await? {
            return Ok(());
        }
        self.finish_action(None, action::SERVICE_SERVICEGROUPS).await?;
        let conn = self.db.connection_by_instance(instance_id);
        let mut binds = Binds::new();
        binds
            .push(ev.host_id)
            .push(ev.service_id)
            .push(ev.description)
            .push(ev.active_checks)
            .push(ev.check_interval)
            .push(ev.max_check_attempts)
            .push(ev.notify)
            .push(ev.enabled);
        self.db
            .run_statement(self.stmts.service_insupdate.id, binds, conn)?;
        self.actions.add(conn, action::SERVICES);
        Ok(())
    }

    async fn handle_service_status(&mut self, ev: ServiceStatus) -> DbResult<()> {
        let Some(instance_id) = self.instance_of_host(ev.host_id) else {
            warn!(
                "status for unknown service ({}, {}) discarded",
                ev.host_id, ev.service_id
            );
            return Ok(());
        };
        if !self.is_valid_poller(instance_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(instance_id);
        let mut binds = Binds::new();
        binds
            .push(ev.checked)
            .push(ev.check_type)
            .push(ev.state)
            .push(ev.state_type)
            .push(ev.last_check)
            .push(ev.next_check)
            .push(ev.last_hard_state)
            .push(ev.current_check_attempt)
            .push(ev.output)
            .push(ev.perfdata)
            .push(ev.flapping)
            .push(ev.acknowledged)
            .push(ev.downtime_depth)
            .push(ev.host_id)
            .push(ev.service_id);
        self.db
            .run_statement(self.stmts.service_status_update.id, binds, conn)?;
        self.actions.add(conn, action::SERVICES);
        Ok(())
    }

    async fn handle_service_check(&mut self, ev: ServiceCheck) -> DbResult<()> {
        let Some(instance_id) = self.instance_of_host(ev.host_id) else {
            return Ok(());
        };
        if !self.is_valid_poller(instance_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(instance_id);
        let mut binds = Binds::new();
        binds
            .push(ev.command_line)
            .push(ev.host_id)
            .push(ev.service_id);
        self.db
            .run_statement(self.stmts.service_check_update.id, binds, conn)?;
        self.actions.add(conn, action::SERVICES);
        Ok(())
    }

    async fn handle_acknowledgement(&mut self, ev: Acknowledgement) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(ev.poller_id);
        let mut binds = Binds::new();
        binds
            .push(ev.entry_time)
            .push(ev.host_id)
            .push(ev.service_id)
            .push(ev.poller_id)
            .push(ev.author)
            .push(ev.comment)
            .push(ev.deletion_time)
            .push(ev.notify_contacts)
            .push(ev.persistent_comment)
            .push(ev.sticky)
            .push(ev.state);
        self.db
            .run_statement(self.stmts.ack_insupdate.id, binds, conn)?;
        self.actions.add(conn, action::ACKNOWLEDGEMENTS);
        Ok(())
    }

    async fn handle_comment(&mut self, ev: Comment) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.db.connection_by_instance(ev.poller_id);
        let mut binds = Binds::new();
        binds
            .push(ev.host_id)
            .push(ev.service_id)
            .push(ev.poller_id)
            .push(ev.internal_id)
            .push(ev.entry_time)
            .push(ev.entry_type)
            .push(ev.expire_time)
            .push(ev.expires)
            .push(ev.persistent)
            .push(ev.source)
            .push(ev.author)
            .push(ev.data)
            .push(ev.deletion_time);
        self.db
            .run_statement(self.stmts.comment_insupdate.id, binds, conn)?;
        self.actions.add(conn, action::COMMENTS);
        Ok(())
    }

    async fn handle_host_group(&mut self, ev: HostGroup) -> DbResult<()> {
        let conn = self.special_conn(special::HOST_GROUP);
        if ev.enabled {
            let mut binds = Binds::new();
            binds.push(ev.hostgroup_id).push(ev.name);
            self.db
                .run_statement(self.stmts.hostgroup_insupdate.id, binds, conn)?;
            self.caches.hostgroups.insert(ev.hostgroup_id);
            self.actions.add(conn, action::HOSTGROUPS);
        } else {
            self.db.run_query(
                format!(
                    "DELETE FROM hosts_hostgroups WHERE hostgroup_id={}",
                    ev.hostgroup_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "DELETE FROM hostgroups WHERE hostgroup_id={}",
                    ev.hostgroup_id
                ),
                conn,
            )?;
            self.caches.hostgroups.remove(&ev.hostgroup_id);
            self.actions
                .add(conn, action::HOSTGROUPS | action::HOST_HOSTGROUPS);
        }
        Ok(())
    }

    async fn handle_host_group_member(&mut self, ev: HostGroupMember) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.special_conn(special::HOST_GROUP);
        if ev.enabled {
            if !self.caches.hostgroups.contains(&ev.hostgroup_id) {
                // Membership can arrive before its group definition.
                let mut binds = Binds::new();
                binds.push(ev.hostgroup_id).push(ev.group_name.as_str());
                self.db
                    .run_statement(self.stmts.hostgroup_insupdate.id, binds, conn)?;
                self.caches.hostgroups.insert(ev.hostgroup_id);
                self.actions.add(conn, action::HOSTGROUPS);
            }
            // The membership row joins hosts written on other connections.
            self.finish_action(None, action::HOSTS).await?;
            let mut binds = Binds::new();
            binds.push(ev.host_id).push(ev.hostgroup_id);
            self.db
                .run_statement(self.stmts.hostgroup_member_insert.id, binds, conn)?;
            self.actions.add(conn, action::HOST_HOSTGROUPS);
        } else {
            let mut binds = Binds::new();
            binds.push(ev.host_id).push(ev.hostgroup_id);
            self.db
                .run_statement(self.stmts.hostgroup_member_delete.id, binds, conn)?;
            self.actions.add(conn, action::HOST_HOSTGROUPS);
        }
        Ok(())
    }

    async fn handle_service_group(&mut self, ev: ServiceGroup) -> DbResult<()> {
        let conn = self.special_conn(special::SERVICE_GROUP);
        if ev.enabled {
            let mut binds = Binds::new();
            binds.push(ev.servicegroup_id).push(ev.name);
            self.db
                .run_statement(self.stmts.servicegroup_insupdate.id, binds, conn)?;
            self.caches.servicegroups.insert(ev.servicegroup_id);
            self.actions.add(conn, action::SERVICEGROUPS);
        } else {
            self.db.run_query(
                format!(
                    "DELETE FROM services_servicegroups WHERE servicegroup_id={}",
                    ev.servicegroup_id
                ),
                conn,
            )?;
            self.db.run_query(
                format!(
                    "DELETE FROM servicegroups WHERE servicegroup_id={}",
                    ev.servicegroup_id
                ),
                conn,
            )?;
            self.caches.servicegroups.remove(&ev.servicegroup_id);
            self.actions
                .add(conn, action::SERVICEGROUPS | action::SERVICE_SERVICEGROUPS);
        }
        Ok(())
    }

    async fn handle_service_group_member(&mut self, ev: ServiceGroupMember) -> DbResult<()> {
        if !self.is_valid_poller(ev.poller_id).await? {
            return Ok(());
        }
        let conn = self.special_conn(special::SERVICE_GROUP);
        if ev.enabled {
            if !self.caches.servicegroups.contains(&ev.servicegroup_id) {
                let mut binds = Binds::new();
                binds.push(ev.servicegroup_id).push(ev.group_name.as_str());
                self.db
                    .run_statement(self.stmts.servicegroup_insupdate.id, binds, conn)?;
                self.caches.servicegroups.insert(ev.servicegroup_id);
                self.actions.add(conn, action::SERVICEGROUPS);
            }
            self.finish_action(None, action::SERVICES).await?;
            let mut binds = Binds::new();
            binds
                .push(ev.host_id)
                .push(ev.service_id)
                .push(ev.servicegroup_id);
            self.db
                .run_statement(self.stmts.servicegroup_member_insert.id, binds, conn)?;
            self.actions.add(conn, action::SERVICE_SERVICEGROUPS);
        } else {
            let mut binds = Binds::new();
            binds
                .push(ev.host_id)
                .push(ev.service_id)
                .push(ev.servicegroup_id);
            self.db
                .run_statement(self.stmts.servicegroup_member_delete.id, binds, conn)?;
            self.actions.add(conn, action::SERVICE_SERVICEGROUPS);
        }
        Ok(())
    }

    async fn handle_host_parent(&mut self, ev: HostParent) -> DbResult<()> {
        let conn = self.special_conn(special::HOST_PARENT);
        if ev.enabled {
            // Both endpoints must be committed hosts.
            self.finish_action(None, action::HOSTS).await?;
            let mut binds = Binds::new();
            binds.push(ev.child_id).push(ev.parent_id);
            self.db
                .run_statement(self.stmts.host_parent_insert.id, binds, conn)?;
        } else {
            let mut binds = Binds::new();
            binds.push(ev.child_id).push(ev.parent_id);
            self.db
                .run_statement(self.stmts.host_parent_delete.id, binds, conn)?;
        }
        self.actions.add(conn, action::HOST_PARENTS);
        Ok(())
    }

    async fn handle_severity(&mut self, ev: Severity) -> DbResult<()> {
        let conn = self.special_conn(special::SEVERITY);
        let key = (ev.id, ev.severity_type);
        if ev.enabled {
            match self.caches.severities.get(&key).copied() {
                Some(severity_id) => {
                    let mut binds = Binds::new();
                    binds
                        .push(ev.name)
                        .push(ev.level)
                        .push(ev.icon_id)
                        .push(severity_id);
                    self.db
                        .run_statement(self.stmts.severity_update.id, binds, conn)?;
                }
                None => {
                    let mut binds = Binds::new();
                    binds
                        .push(ev.id)
                        .push(ev.severity_type)
                        .push(ev.name)
                        .push(ev.level)
                        .push(ev.icon_id);
                    let summary = self
                        .db
                        .run_statement_and_get_write(self.stmts.severity_insert.id, binds, conn)
                        .await?;
                    self.caches
                        .severities
                        .insert(key, summary.last_insert_id as u64);
                }
            }
            self.actions.add(conn, action::SEVERITIES);
        } else if let Some(severity_id) = self.caches.severities.remove(&key) {
            self.db.run_statement(
                self.stmts.severity_delete.id,
                Binds::from([severity_id]),
                conn,
            )?;
            self.actions.add(conn, action::SEVERITIES);
        }
        Ok(())
    }

    async fn handle_tag(&mut self, ev: Tag) -> DbResult<()> {
        let conn = self.special_conn(special::TAG);
        let key = (ev.id, ev.tag_type);
        if ev.enabled {
            match self.caches.tags.get(&key).copied() {
                Some(tag_id) => {
                    let mut binds = Binds::new();
                    binds.push(ev.name).push(tag_id);
                    self.db
                        .run_statement(self.stmts.tag_update.id, binds, conn)?;
                }
                None => {
                    let mut binds = Binds::new();
                    binds.push(ev.id).push(ev.tag_type).push(ev.name);
                    let summary = self
                        .db
                        .run_statement_and_get_write(self.stmts.tag_insert.id, binds, conn)
                        .await?;
                    self.caches.tags.insert(key, summary.last_insert_id as u64);
                }
            }
            self.actions.add(conn, action::TAGS);
        } else if let Some(tag_id) = self.caches.tags.remove(&key) {
            self.db
                .run_statement(self.stmts.tag_delete.id, Binds::from([tag_id]), conn)?;
            self.actions.add(conn, action::TAGS);
        }
        Ok(())
    }

    // --- batched queues -------------------------------------------------

    pub(crate) async fn stage_custom_variable(
        &mut self,
        ev: CustomVariable,
        done: Arc<AtomicBool>,
    ) -> DbResult<()> {
        if ev.deleted {
            // A delete must not be overtaken by upserts still queued for
            // the same variable.
            self.flush_custom_variables().await?;
            let conn = self.special_conn(special::CUSTOM_VARIABLE);
            self.db.run_query(
                format!(
                    "DELETE FROM customvariables \
                     WHERE host_id={} AND service_id={} AND name='{}'",
                    ev.host_id,
                    ev.service_id,
                    escape(&ev.name)
                ),
                conn,
            )?;
            self.actions.add(conn, action::CUSTOM_VARIABLES);
            return Ok(());
        }
        self.cv_queue.push((ev, done));
        if self.cv_queue.len() + self.cvs_queue.len() >= self.max_cv {
            self.flush_custom_variables().await?;
        }
        Ok(())
    }

    pub(crate) async fn stage_custom_variable_status(
        &mut self,
        ev: CustomVariableStatus,
        done: Arc<AtomicBool>,
    ) -> DbResult<()> {
        self.cvs_queue.push((ev, done));
        if self.cv_queue.len() + self.cvs_queue.len() >= self.max_cv {
            self.flush_custom_variables().await?;
        }
        Ok(())
    }

    pub(crate) async fn stage_downtime(
        &mut self,
        ev: Downtime,
        done: Arc<AtomicBool>,
    ) -> DbResult<()> {
        self.downtimes_queue.push((ev, done));
        if self.downtimes_queue.len() >= self.max_downtimes {
            self.flush_downtimes().await?;
        }
        Ok(())
    }

    pub(crate) async fn stage_log(&mut self, ev: LogEntry, done: Arc<AtomicBool>) -> DbResult<()> {
        self.logs_queue.push((ev, done));
        if self.logs_queue.len() >= self.max_logs {
            self.flush_logs().await?;
        }
        Ok(())
    }

    pub(crate) async fn flush_custom_variables(&mut self) -> DbResult<()> {
        self.next_cv_flush = Instant::now() + BULK_FLUSH_INTERVAL;
        if !self.cv_queue.is_empty() {
            let conn = self.special_conn(special::CUSTOM_VARIABLE);
            let mut sql = String::from(
                "INSERT INTO customvariables (host_id, service_id, name, value, \
                 default_value, modified, type, update_time) VALUES ",
            );
            for (i, (ev, _)) in self.cv_queue.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push_str(&format!(
                    "({},{},'{}','{}','{}',{},{},{})",
                    ev.host_id,
                    ev.service_id,
                    escape(&ev.name),
                    escape(&ev.value),
                    escape(&ev.default_value),
                    ev.modified as i32,
                    ev.var_type,
                    ev.update_time
                ));
            }
            sql.push_str(
                " ON CONFLICT(host_id, name, service_id) DO UPDATE SET \
                 value=excluded.value, default_value=excluded.default_value, \
                 modified=excluded.modified, type=excluded.type, \
                 update_time=excluded.update_time",
            );
            trace!("flushing {} custom variables", self.cv_queue.len());
            self.db.run_query(sql, conn)?;
            self.actions.add(conn, action::CUSTOM_VARIABLES);
            for (_, marker) in self.cv_queue.drain(..) {
                marker.store(true, Ordering::Release);
            }
        }
        if !self.cvs_queue.is_empty() {
            let conn = self.special_conn(special::CUSTOM_VARIABLE);
            let mut sql = String::from(
                "INSERT INTO customvariables (host_id, service_id, name, value, \
                 modified, update_time) VALUES ",
            );
            for (i, (ev, _)) in self.cvs_queue.iter().enumerate() {
                if i > 0 {
                    sql.push(',');
                }
                sql.push_str(&format!(
                    "({},{},'{}','{}',{},{})",
                    ev.host_id,
                    ev.service_id,
                    escape(&ev.name),
                    escape(&ev.value),
                    ev.modified as i32,
                    ev.update_time
                ));
            }
            sql.push_str(
                " ON CONFLICT(host_id, name, service_id) DO UPDATE SET \
                 value=excluded.value, modified=excluded.modified, \
                 update_time=excluded.update_time",
            );
            trace!("flushing {} custom variable statuses", self.cvs_queue.len());
            self.db.run_query(sql, conn)?;
            self.actions.add(conn, action::CUSTOM_VARIABLES);
            for (_, marker) in self.cvs_queue.drain(..) {
                marker.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    pub(crate) async fn flush_downtimes(&mut self) -> DbResult<()> {
        self.next_downtimes_flush = Instant::now() + DOWNTIME_FLUSH_INTERVAL;
        if self.downtimes_queue.is_empty() {
            return Ok(());
        }
        let conn = self.special_conn(special::DOWNTIME);
        let mut sql = String::from(
            "INSERT INTO downtimes (entry_time, instance_id, internal_id, host_id, \
             service_id, author, cancelled, comment_data, deletion_time, duration, \
             end_time, fixed, start_time, actual_start_time, actual_end_time, \
             started, type) VALUES ",
        );
        for (i, (ev, _)) in self.downtimes_queue.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&format!(
                "({},{},{},{},{},'{}',{},'{}',{},{},{},{},{},{},{},{},{})",
                ev.entry_time,
                ev.poller_id,
                ev.internal_id,
                ev.host_id,
                ev.service_id,
                escape(&ev.author),
                ev.cancelled as i32,
                escape(&ev.comment),
                fmt_opt(ev.deletion_time),
                ev.duration,
                ev.end_time,
                ev.fixed as i32,
                ev.start_time,
                fmt_opt(ev.actual_start_time),
                fmt_opt(ev.actual_end_time),
                ev.started as i32,
                ev.downtime_type
            ));
        }
        // The actual window only ever widens: the start is the first one
        // observed, the end the latest.
        sql.push_str(
            " ON CONFLICT(entry_time, instance_id, internal_id) DO UPDATE SET \
             host_id=excluded.host_id, service_id=excluded.service_id, \
             author=excluded.author, cancelled=MAX(downtimes.cancelled, excluded.cancelled), \
             comment_data=excluded.comment_data, deletion_time=excluded.deletion_time, \
             duration=excluded.duration, end_time=excluded.end_time, \
             fixed=excluded.fixed, start_time=excluded.start_time, \
             actual_start_time=COALESCE(downtimes.actual_start_time, excluded.actual_start_time), \
             actual_end_time=NULLIF(MAX(COALESCE(downtimes.actual_end_time, -1), \
             COALESCE(excluded.actual_end_time, -1)), -1), \
             started=MAX(downtimes.started, excluded.started), \
             type=excluded.type",
        );
        trace!("flushing {} downtimes", self.downtimes_queue.len());
        self.db.run_query(sql, conn)?;
        self.actions.add(conn, action::DOWNTIMES);
        for (_, marker) in self.downtimes_queue.drain(..) {
            marker.store(true, Ordering::Release);
        }
        Ok(())
    }

    pub(crate) async fn flush_logs(&mut self) -> DbResult<()> {
        self.next_logs_flush = Instant::now() + BULK_FLUSH_INTERVAL;
        if self.logs_queue.is_empty() {
            return Ok(());
        }
        let conn = self.special_conn(special::LOG);
        let mut sql = String::from(
            "INSERT INTO logs (ctime, host_id, service_id, host_name, instance_name, \
             msg_type, status, retry, output) VALUES ",
        );
        for (i, (ev, _)) in self.logs_queue.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&format!(
                "({},{},{},'{}','{}',{},{},{},'{}')",
                ev.ctime,
                ev.host_id,
                ev.service_id,
                escape(&ev.host_name),
                escape(&ev.instance_name),
                ev.msg_type,
                ev.status,
                ev.retry,
                escape(&ev.output)
            ));
        }
        trace!("flushing {} log entries", self.logs_queue.len());
        self.db.run_query(sql, conn)?;
        self.actions.add(conn, action::LOGS);
        for (_, marker) in self.logs_queue.drain(..) {
            marker.store(true, Ordering::Release);
        }
        Ok(())
    }
}
