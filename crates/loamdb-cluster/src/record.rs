//! The raw database record stored in the consensus log.
//!
//! The record is the single source of truth for topology, shard layout,
//! replication tasks, and subscription definitions. Nodes react to record
//! changes through the replication loader's reconciler; they never mutate
//! connection state directly.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use loamdb_store::{BucketMigration, ShardRange};

/// One member of a database group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMember {
    /// Node tag (e.g. "A").
    pub node_tag: String,
    /// The node's cluster-internal URL.
    pub url: String,
}

impl ClusterMember {
    /// Create a new member.
    pub fn new(node_tag: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            node_tag: node_tag.into(),
            url: url.into(),
        }
    }
}

/// The members of a database group, in promotion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    /// Full members serving reads and writes.
    pub members: Vec<ClusterMember>,
}

impl DatabaseTopology {
    /// Look up a member by node tag.
    pub fn member(&self, node_tag: &str) -> Option<&ClusterMember> {
        self.members.iter().find(|m| m.node_tag == node_tag)
    }
}

/// A named connection string to an external database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionString {
    /// Name under which the string is registered.
    pub name: String,
    /// Destination URL.
    pub url: String,
    /// Destination database name.
    pub database: String,
}

/// An external (push) replication task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReplication {
    /// Cluster-wide task id.
    pub task_id: u64,
    /// Task name.
    pub name: String,
    /// Where to replicate to.
    pub connection_string: ConnectionString,
    /// Hold back entries younger than this many milliseconds.
    pub delay_ms: u64,
    /// Preferred owning node, if any.
    pub mentor_node: Option<String>,
    /// True when the task is declared but must not run.
    pub disabled: bool,
}

/// A pull-replication sink task: this node initiates a connection to a hub
/// and is served as if the hub were replicating outbound to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReplicationSink {
    /// Cluster-wide task id.
    pub task_id: u64,
    /// The hub to pull from.
    pub hub_name: String,
    /// Where the hub lives.
    pub connection_string: ConnectionString,
    /// Optional PEM certificate presented to the hub.
    pub certificate: Option<String>,
    /// Preferred owning node, if any.
    pub mentor_node: Option<String>,
    /// True when the task is declared but must not run.
    pub disabled: bool,
}

/// A pull-replication hub definition: remote sinks may connect and be
/// served from this database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullReplicationDefinition {
    /// Hub name sinks connect with.
    pub name: String,
    /// True when the hub must reject sink connections.
    pub disabled: bool,
}

/// A subscription definition replicated through consensus.
///
/// Persisted as a single blob under `subscriptions/<db>/<name>`; the cursor
/// is the exclusive lower bound of the next batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    /// Cluster-assigned subscription id.
    pub id: u64,
    /// Subscription name.
    pub name: String,
    /// The filter query, as text.
    pub query: String,
    /// Exclusive lower bound of the next batch, as a change-vector string.
    pub change_vector_cursor: String,
    /// Preferred owning node, if any.
    pub mentor_node: Option<String>,
    /// True when the subscription must not be served.
    pub disabled: bool,
    /// Description of the most recent worker connection, for operators.
    pub last_connection_info: Option<String>,
    /// Description of the most recent acknowledged batch, for operators.
    pub last_batch_info: Option<String>,
}

/// The raw database record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    /// Database name.
    pub database: String,
    /// Group topology.
    pub topology: DatabaseTopology,
    /// Bucket ranges per shard; empty for an unsharded database.
    pub shard_ranges: Vec<ShardRange>,
    /// Active bucket migrations, at most one per bucket.
    pub migrations: Vec<BucketMigration>,
    /// Declared external replication tasks.
    pub external_replications: Vec<ExternalReplication>,
    /// Declared pull-replication sink tasks.
    pub sink_pull_replications: Vec<PullReplicationSink>,
    /// Declared pull-replication hubs.
    pub hub_pull_replications: Vec<PullReplicationDefinition>,
    /// Registered connection strings by name.
    pub connection_strings: BTreeMap<String, ConnectionString>,
    /// Node tags currently being removed from the group.
    pub deletion_in_progress: BTreeSet<String>,
    /// True when the whole database is disabled.
    pub disabled: bool,
}

impl DatabaseRecord {
    /// Create an empty record for a database.
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            ..Self::default()
        }
    }

    /// True when the database is sharded.
    pub fn is_sharded(&self) -> bool {
        !self.shard_ranges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_member_lookup() {
        let topo = DatabaseTopology {
            members: vec![
                ClusterMember::new("A", "tcp://a:10300"),
                ClusterMember::new("B", "tcp://b:10300"),
            ],
        };
        assert_eq!(topo.member("B").unwrap().url, "tcp://b:10300");
        assert!(topo.member("C").is_none());
    }

    #[test]
    fn test_record_sharded_flag() {
        let mut record = DatabaseRecord::new("north");
        assert!(!record.is_sharded());
        record.shard_ranges.push(ShardRange::new(0, 1 << 20, 0));
        assert!(record.is_sharded());
    }

    #[test]
    fn test_subscription_record_blob_roundtrip() {
        let sub = SubscriptionRecord {
            id: 3,
            name: "orders-feed".to_string(),
            query: "from Orders".to_string(),
            change_vector_cursor: "A:17".to_string(),
            mentor_node: Some("B".to_string()),
            disabled: false,
            last_connection_info: None,
            last_batch_info: None,
        };
        let blob = bincode::serialize(&sub).unwrap();
        let back: SubscriptionRecord = bincode::deserialize(&blob).unwrap();
        assert_eq!(back, sub);
    }
}
