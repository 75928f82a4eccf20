//! Replication destinations and their identity.
//!
//! A destination is either another member of the database group, a
//! pull-replication sink served from a hub, or an external database pushed
//! to directly. Two destinations are the same iff their (kind, url,
//! database, task id) tuple matches; mutable properties like delay and
//! mentor are not part of the identity.

use std::time::Duration;

use loamdb_cluster::record::{ConnectionString, ExternalReplication, PullReplicationSink};

/// The class of a destination, part of its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    /// Another member of this database group.
    Internal,
    /// A pull-replication sink; this node acts as the hub.
    ExternalSink,
    /// A plain external replication target.
    ExternalRegular,
}

/// Identity of a destination: the key of the loader's outgoing map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationId {
    /// Destination class.
    pub kind: DestinationKind,
    /// Destination URL.
    pub url: String,
    /// Destination database name.
    pub database: String,
    /// Cluster task id for external destinations.
    pub task_id: Option<u64>,
}

/// A fully-materialized replication destination.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationDestination {
    /// Another member of the database group.
    Internal {
        /// Peer node tag.
        node_tag: String,
        /// Peer URL.
        url: String,
        /// Database name (same group, same name).
        database: String,
    },
    /// A sink served by this node acting as hub.
    ExternalSink {
        /// Connection details of the sink.
        connection_string: ConnectionString,
        /// Hub the sink pulls from.
        hub_name: String,
        /// Optional PEM certificate the sink authenticates with.
        certificate: Option<String>,
        /// Cluster task id.
        task_id: u64,
        /// Preferred owning node.
        mentor_node: Option<String>,
    },
    /// A plain external replication target.
    ExternalRegular {
        /// Connection details of the target.
        connection_string: ConnectionString,
        /// Cluster task id.
        task_id: u64,
        /// Preferred owning node.
        mentor_node: Option<String>,
        /// Hold back entries younger than this.
        delay: Duration,
    },
}

impl ReplicationDestination {
    /// Build the internal destination for a group member.
    pub fn internal(node_tag: &str, url: &str, database: &str) -> Self {
        ReplicationDestination::Internal {
            node_tag: node_tag.to_string(),
            url: url.to_string(),
            database: database.to_string(),
        }
    }

    /// Materialize an external replication task.
    pub fn from_external(task: &ExternalReplication) -> Self {
        ReplicationDestination::ExternalRegular {
            connection_string: task.connection_string.clone(),
            task_id: task.task_id,
            mentor_node: task.mentor_node.clone(),
            delay: Duration::from_millis(task.delay_ms),
        }
    }

    /// Materialize a pull-replication sink task.
    pub fn from_sink(task: &PullReplicationSink) -> Self {
        ReplicationDestination::ExternalSink {
            connection_string: task.connection_string.clone(),
            hub_name: task.hub_name.clone(),
            certificate: task.certificate.clone(),
            task_id: task.task_id,
            mentor_node: task.mentor_node.clone(),
        }
    }

    /// The identity tuple of this destination.
    pub fn id(&self) -> DestinationId {
        match self {
            ReplicationDestination::Internal { url, database, .. } => DestinationId {
                kind: DestinationKind::Internal,
                url: url.clone(),
                database: database.clone(),
                task_id: None,
            },
            ReplicationDestination::ExternalSink {
                connection_string,
                task_id,
                ..
            } => DestinationId {
                kind: DestinationKind::ExternalSink,
                url: connection_string.url.clone(),
                database: connection_string.database.clone(),
                task_id: Some(*task_id),
            },
            ReplicationDestination::ExternalRegular {
                connection_string,
                task_id,
                ..
            } => DestinationId {
                kind: DestinationKind::ExternalRegular,
                url: connection_string.url.clone(),
                database: connection_string.database.clone(),
                task_id: Some(*task_id),
            },
        }
    }

    /// Destination URL.
    pub fn url(&self) -> &str {
        match self {
            ReplicationDestination::Internal { url, .. } => url,
            ReplicationDestination::ExternalSink {
                connection_string, ..
            }
            | ReplicationDestination::ExternalRegular {
                connection_string, ..
            } => &connection_string.url,
        }
    }

    /// Destination database name.
    pub fn database(&self) -> &str {
        match self {
            ReplicationDestination::Internal { database, .. } => database,
            ReplicationDestination::ExternalSink {
                connection_string, ..
            }
            | ReplicationDestination::ExternalRegular {
                connection_string, ..
            } => &connection_string.database,
        }
    }

    /// Cluster task id, for external destinations.
    pub fn task_id(&self) -> Option<u64> {
        match self {
            ReplicationDestination::Internal { .. } => None,
            ReplicationDestination::ExternalSink { task_id, .. }
            | ReplicationDestination::ExternalRegular { task_id, .. } => Some(*task_id),
        }
    }

    /// Preferred owning node, for external destinations.
    pub fn mentor_node(&self) -> Option<&str> {
        match self {
            ReplicationDestination::Internal { .. } => None,
            ReplicationDestination::ExternalSink { mentor_node, .. }
            | ReplicationDestination::ExternalRegular { mentor_node, .. } => mentor_node.as_deref(),
        }
    }

    /// Replication delay; zero for everything but delayed externals.
    pub fn delay(&self) -> Duration {
        match self {
            ReplicationDestination::ExternalRegular { delay, .. } => *delay,
            _ => Duration::ZERO,
        }
    }

    /// Operator-facing description.
    pub fn describe(&self) -> String {
        match self {
            ReplicationDestination::Internal { node_tag, url, .. } => {
                format!("internal peer {node_tag} at {url}")
            }
            ReplicationDestination::ExternalSink {
                hub_name,
                connection_string,
                ..
            } => format!("sink of hub '{hub_name}' at {}", connection_string.url),
            ReplicationDestination::ExternalRegular {
                connection_string, ..
            } => format!(
                "external '{}' at {}",
                connection_string.database, connection_string.url
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(url: &str, database: &str) -> ConnectionString {
        ConnectionString {
            name: "cs".to_string(),
            url: url.to_string(),
            database: database.to_string(),
        }
    }

    #[test]
    fn test_identity_ignores_mutable_properties() {
        let a = ReplicationDestination::ExternalRegular {
            connection_string: conn("tcp://x:1", "north"),
            task_id: 7,
            mentor_node: Some("A".into()),
            delay: Duration::from_secs(5),
        };
        let b = ReplicationDestination::ExternalRegular {
            connection_string: conn("tcp://x:1", "north"),
            task_id: 7,
            mentor_node: Some("B".into()),
            delay: Duration::ZERO,
        };
        assert_eq!(a.id(), b.id());
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_distinguishes_kind() {
        let regular = ReplicationDestination::ExternalRegular {
            connection_string: conn("tcp://x:1", "north"),
            task_id: 7,
            mentor_node: None,
            delay: Duration::ZERO,
        };
        let sink = ReplicationDestination::ExternalSink {
            connection_string: conn("tcp://x:1", "north"),
            hub_name: "hub".into(),
            certificate: None,
            task_id: 7,
            mentor_node: None,
        };
        assert_ne!(regular.id(), sink.id());
    }

    #[test]
    fn test_identity_distinguishes_task_id() {
        let a = ReplicationDestination::ExternalRegular {
            connection_string: conn("tcp://x:1", "north"),
            task_id: 7,
            mentor_node: None,
            delay: Duration::ZERO,
        };
        let b = ReplicationDestination::ExternalRegular {
            connection_string: conn("tcp://x:1", "north"),
            task_id: 8,
            mentor_node: None,
            delay: Duration::ZERO,
        };
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_internal_identity() {
        let a = ReplicationDestination::internal("B", "tcp://b:1", "north");
        let b = ReplicationDestination::internal("B", "tcp://b:1", "north");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.delay(), Duration::ZERO);
        assert_eq!(a.task_id(), None);
    }
}
