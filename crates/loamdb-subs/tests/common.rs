//! Common test utilities for subscription integration tests.
//!
//! Builds a single-node in-process database: document store, in-memory
//! consensus log, and subscription supervisor, wired to workers over
//! in-process duplex pipes instead of sockets.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use loamdb_cluster::{
    ClusterCommand, ClusterMember, ConsensusLog, DatabaseRecord, DatabaseTopology,
    InMemoryConsensusLog,
};
use loamdb_store::{DocumentStore, StoreConfig};
use loamdb_subs::{
    SubscriptionConfig, SubscriptionSupervisor, SubscriptionTransport, SubscriptionWorker,
    WorkerOptions,
};
use loamdb_transport::{read_json_frame, DynStream, HeartbeatConfig, TcpConnectionHeader};

/// A single-node database with a subscription supervisor.
pub struct TestNode {
    pub store: Arc<DocumentStore>,
    pub consensus: Arc<InMemoryConsensusLog>,
    pub supervisor: Arc<SubscriptionSupervisor>,
}

impl TestNode {
    /// Build a node hosting `database` as node "A".
    pub async fn new(database: &str) -> Self {
        let store = DocumentStore::new(StoreConfig {
            database: database.to_string(),
            node_tag: "A".to_string(),
            revisions_enabled: false,
            shard: None,
        });
        let consensus = Arc::new(InMemoryConsensusLog::new());

        let mut record = DatabaseRecord::new(database);
        record.topology = DatabaseTopology {
            members: vec![ClusterMember::new("A", "tcp://a:10300")],
        };
        consensus
            .append_command(ClusterCommand::PutDatabaseRecord(record))
            .await
            .expect("record install");

        let supervisor = SubscriptionSupervisor::new(
            store.clone(),
            consensus.clone(),
            SubscriptionConfig {
                heartbeat: HeartbeatConfig {
                    interval: Duration::from_millis(100),
                    max_inactive: Duration::from_secs(60),
                },
            },
        );

        Self {
            store,
            consensus,
            supervisor,
        }
    }

    /// An in-process transport dialing this node's supervisor.
    pub fn transport(&self) -> Arc<NodeTransport> {
        Arc::new(NodeTransport {
            supervisor: self.supervisor.clone(),
        })
    }

    /// Build a worker against this node.
    pub fn worker(&self, options: WorkerOptions) -> SubscriptionWorker {
        SubscriptionWorker::new(self.transport(), self.store.database(), options)
    }

    /// Simulate a hard database delete: the store rejects everything, the
    /// cluster record and subscriptions disappear, and every connection is
    /// torn down with the deletion message.
    pub async fn delete_database(&self) {
        self.store.delete_database();
        self.consensus
            .append_command(ClusterCommand::DeleteDatabaseRecord {
                database: self.store.database().to_string(),
            })
            .await
            .expect("delete record");
        self.supervisor.database_deleted();
    }
}

/// Dials the node's subscription listener through an in-process pipe.
pub struct NodeTransport {
    supervisor: Arc<SubscriptionSupervisor>,
}

#[async_trait]
impl SubscriptionTransport for NodeTransport {
    async fn connect(&self) -> loamdb_subs::Result<DynStream> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            let mut stream: DynStream = Box::new(server);
            if let Ok(header) = read_json_frame::<_, TcpConnectionHeader>(&mut stream).await {
                let _ = supervisor.accept_connection(stream, header).await;
            }
        });
        Ok(Box::new(client))
    }
}

/// Poll until `predicate` returns true or the deadline passes.
pub async fn wait_until<F>(deadline: Duration, mut predicate: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    predicate()
}
