//! Per-connection pending-write flags and commit barriers
//!
//! Every write queued on a connection raises a flag for the table family it
//! touches. Before a statement that joins against a table with uncommitted
//! writes on another connection, the coordinator issues a barrier: commit
//! the connections holding a conflicting flag and clear their flags.

/// One bit per table family
pub mod action {
    pub const NONE: u32 = 0;
    pub const HOSTS: u32 = 1 << 0;
    pub const SERVICES: u32 = 1 << 1;
    pub const INSTANCES: u32 = 1 << 2;
    pub const ACKNOWLEDGEMENTS: u32 = 1 << 3;
    pub const COMMENTS: u32 = 1 << 4;
    pub const CUSTOM_VARIABLES: u32 = 1 << 5;
    pub const DOWNTIMES: u32 = 1 << 6;
    pub const HOST_HOSTGROUPS: u32 = 1 << 7;
    pub const HOST_PARENTS: u32 = 1 << 8;
    pub const HOSTGROUPS: u32 = 1 << 9;
    pub const SERVICE_SERVICEGROUPS: u32 = 1 << 10;
    pub const SERVICEGROUPS: u32 = 1 << 11;
    pub const INDEX_DATA: u32 = 1 << 12;
    pub const METRICS: u32 = 1 << 13;
    pub const SEVERITIES: u32 = 1 << 14;
    pub const TAGS: u32 = 1 << 15;
    pub const LOGS: u32 = 1 << 16;
}

/// Pending flags for every connection of the database
#[derive(Debug, Clone)]
pub struct ActionTable {
    flags: Vec<u32>,
}

impl ActionTable {
    pub fn new(connections: usize) -> Self {
        ActionTable {
            flags: vec![action::NONE; connections],
        }
    }

    /// Record that a write touching `flag` tables was queued on `conn`
    pub fn add(&mut self, conn: usize, flag: u32) {
        if let Some(f) = self.flags.get_mut(conn) {
            *f |= flag;
        }
    }

    pub fn pending(&self, conn: usize) -> u32 {
        self.flags.get(conn).copied().unwrap_or(action::NONE)
    }

    /// Connections whose pending flags intersect `mask`
    pub fn conflicting(&self, mask: u32) -> Vec<usize> {
        self.flags
            .iter()
            .enumerate()
            .filter(|(_, f)| **f & mask != 0)
            .map(|(i, _)| i)
            .collect()
    }

    /// A commit clears every flag of the committed connection
    pub fn clear(&mut self, conn: usize) {
        if let Some(f) = self.flags.get_mut(conn) {
            *f = action::NONE;
        }
    }

    pub fn clear_all(&mut self) {
        self.flags.fill(action::NONE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_conflicts_per_connection() {
        let mut table = ActionTable::new(3);
        table.add(0, action::HOSTS);
        table.add(2, action::SERVICES | action::COMMENTS);

        assert_eq!(table.conflicting(action::HOSTS), vec![0]);
        assert_eq!(table.conflicting(action::SERVICES), vec![2]);
        assert_eq!(
            table.conflicting(action::HOSTS | action::COMMENTS),
            vec![0, 2]
        );
        assert!(table.conflicting(action::DOWNTIMES).is_empty());

        table.clear(2);
        assert!(table.conflicting(action::SERVICES).is_empty());
    }
}
