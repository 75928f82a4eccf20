#![warn(missing_docs)]

//! Cluster-side state for loamdb: the raw database record, read-only
//! cluster state snapshots, the consensus-log contract (consumed as an
//! external collaborator), and deterministic task ownership.

pub mod consensus;
pub mod error;
pub mod record;
pub mod tasks;
pub mod view;

pub use consensus::{
    external_cursor_key, subscription_key, ClusterCommand, ConsensusLog, InMemoryConsensusLog,
};
pub use error::{ClusterError, Result};
pub use record::{
    ClusterMember, ConnectionString, DatabaseRecord, DatabaseTopology, ExternalReplication,
    PullReplicationDefinition, PullReplicationSink, SubscriptionRecord,
};
pub use tasks::whose_task_is_it;
pub use view::ClusterStateView;
