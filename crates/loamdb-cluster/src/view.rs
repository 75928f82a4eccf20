//! Read-only cluster state snapshots.
//!
//! A view is built from one consensus read, so everything it answers is
//! internally consistent: topology, shard layout, migrations, task
//! definitions, and the deletion-in-progress set all come from the same
//! record version.

use loamdb_store::{BucketMigration, ShardRange};

use crate::consensus::ConsensusLog;
use crate::error::Result;
use crate::record::{ClusterMember, DatabaseRecord};
use crate::tasks::whose_task_is_it;

/// A consistent snapshot of the cluster state for one database, evaluated
/// from the perspective of one node.
#[derive(Debug, Clone)]
pub struct ClusterStateView {
    record: DatabaseRecord,
    commit_index: u64,
    node_tag: String,
}

impl ClusterStateView {
    /// Capture a snapshot from the consensus log. Returns None when the
    /// database record does not exist.
    pub fn capture(
        consensus: &dyn ConsensusLog,
        database: &str,
        node_tag: &str,
    ) -> Result<Option<Self>> {
        Ok(consensus
            .read_raw_database_record(database)?
            .map(|(record, commit_index)| Self::from_record(record, commit_index, node_tag)))
    }

    /// Build a view from an already-read record.
    pub fn from_record(record: DatabaseRecord, commit_index: u64, node_tag: &str) -> Self {
        Self {
            record,
            commit_index,
            node_tag: node_tag.to_string(),
        }
    }

    /// The underlying record.
    pub fn record(&self) -> &DatabaseRecord {
        &self.record
    }

    /// The commit index this snapshot was read at.
    pub fn commit_index(&self) -> u64 {
        self.commit_index
    }

    /// The node this view is evaluated for.
    pub fn node_tag(&self) -> &str {
        &self.node_tag
    }

    /// True when this node is not a member of the database group.
    pub fn is_passive(&self) -> bool {
        self.record.topology.member(&self.node_tag).is_none()
    }

    /// The members this node replicates to: every member except itself and
    /// except nodes being removed from the group.
    pub fn internal_peers(&self) -> Vec<&ClusterMember> {
        self.record
            .topology
            .members
            .iter()
            .filter(|m| m.node_tag != self.node_tag)
            .filter(|m| !self.record.deletion_in_progress.contains(&m.node_tag))
            .collect()
    }

    /// True when the assignment function places the given task on this node.
    pub fn is_my_task(&self, task_id: u64, mentor_node: Option<&str>) -> bool {
        whose_task_is_it(
            &self.record.topology,
            &self.record.deletion_in_progress,
            mentor_node,
            task_id,
            self.commit_index,
        )
        .as_deref()
            == Some(self.node_tag.as_str())
    }

    /// Shard ranges; empty for an unsharded database.
    pub fn shard_ranges(&self) -> &[ShardRange] {
        &self.record.shard_ranges
    }

    /// Active bucket migrations.
    pub fn migrations(&self) -> &[BucketMigration] {
        &self.record.migrations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{ClusterCommand, InMemoryConsensusLog};
    use crate::record::{ClusterMember, DatabaseTopology};

    fn record() -> DatabaseRecord {
        let mut r = DatabaseRecord::new("north");
        r.topology = DatabaseTopology {
            members: vec![
                ClusterMember::new("A", "tcp://a:10300"),
                ClusterMember::new("B", "tcp://b:10300"),
                ClusterMember::new("C", "tcp://c:10300"),
            ],
        };
        r
    }

    #[tokio::test]
    async fn test_capture_reads_record_and_index() {
        let log = InMemoryConsensusLog::new();
        log.append_command(ClusterCommand::PutDatabaseRecord(record()))
            .await
            .unwrap();

        let view = ClusterStateView::capture(&log, "north", "A").unwrap().unwrap();
        assert_eq!(view.commit_index(), 1);
        assert_eq!(view.record().database, "north");
        assert!(ClusterStateView::capture(&log, "south", "A").unwrap().is_none());
    }

    #[test]
    fn test_internal_peers_excludes_self_and_leaving() {
        let mut r = record();
        r.deletion_in_progress.insert("C".to_string());
        let view = ClusterStateView::from_record(r, 3, "A");

        let peers: Vec<&str> = view.internal_peers().iter().map(|m| m.node_tag.as_str()).collect();
        assert_eq!(peers, vec!["B"]);
    }

    #[test]
    fn test_passive_when_not_member() {
        let view = ClusterStateView::from_record(record(), 1, "Z");
        assert!(view.is_passive());
        assert!(view.internal_peers().len() == 3);
    }

    #[test]
    fn test_exactly_one_owner_per_task() {
        let r = record();
        for task_id in 0..16u64 {
            let owners: Vec<&str> = ["A", "B", "C"]
                .iter()
                .filter(|tag| {
                    ClusterStateView::from_record(r.clone(), 5, tag).is_my_task(task_id, None)
                })
                .copied()
                .collect();
            assert_eq!(owners.len(), 1, "task {task_id} must have one owner");
        }
    }

    #[test]
    fn test_mentor_assignment_visible_through_view() {
        let r = record();
        let view_b = ClusterStateView::from_record(r.clone(), 5, "B");
        let view_a = ClusterStateView::from_record(r, 5, "A");
        assert!(view_b.is_my_task(9, Some("B")));
        assert!(!view_a.is_my_task(9, Some("B")));
    }
}
