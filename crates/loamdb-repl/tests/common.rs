//! Common test utilities for replication integration tests.
//!
//! Builds an in-process cluster: every node gets its own store and loader,
//! all sharing one in-memory consensus log. Outbound workers dial peers
//! through a URL registry that hands out duplex pipes instead of sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use loamdb_cluster::{
    ClusterCommand, ClusterMember, ConsensusLog, DatabaseRecord, DatabaseTopology,
    InMemoryConsensusLog,
};
use loamdb_repl::{Connector, ReplicationConfig, ReplicationLoader};
use loamdb_store::{DocumentStore, StoreConfig};
use loamdb_transport::{
    read_json_frame, DynStream, HeartbeatConfig, TcpConnectionHeader, TransportError,
};

/// Maps URLs to loaders, standing in for the network.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: Mutex<HashMap<String, Arc<ReplicationLoader>>>,
}

impl LoaderRegistry {
    pub fn register(&self, url: &str, loader: Arc<ReplicationLoader>) {
        self.loaders
            .lock()
            .expect("lock poisoned")
            .insert(url.to_string(), loader);
    }
}

/// Dials registered loaders through in-process pipes.
pub struct RegistryConnector {
    registry: Arc<LoaderRegistry>,
}

impl RegistryConnector {
    pub fn new(registry: Arc<LoaderRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Connector for RegistryConnector {
    async fn connect(&self, url: &str) -> loamdb_repl::Result<DynStream> {
        let loader = self
            .registry
            .loaders
            .lock()
            .expect("lock poisoned")
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionRefused {
                addr: url.to_string(),
            })?;

        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(async move {
            let mut stream: DynStream = Box::new(server);
            if let Ok(header) = read_json_frame::<_, TcpConnectionHeader>(&mut stream).await {
                let _ = loader.accept_incoming_connection(stream, header).await;
            }
        });
        Ok(Box::new(client))
    }
}

/// One node of the test cluster.
pub struct TestNode {
    pub tag: String,
    pub url: String,
    pub store: Arc<DocumentStore>,
    pub loader: Arc<ReplicationLoader>,
}

/// An in-process cluster sharing one consensus log.
pub struct TestCluster {
    pub consensus: Arc<InMemoryConsensusLog>,
    pub registry: Arc<LoaderRegistry>,
    pub nodes: Vec<TestNode>,
    pub record: DatabaseRecord,
    pub commit_index: u64,
}

/// Fast timings for tests.
pub fn test_config() -> ReplicationConfig {
    ReplicationConfig {
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(100),
            max_inactive: Duration::from_secs(10),
        },
        retry_replicate_after: Duration::from_millis(200),
        reply_timeout: Duration::from_secs(10),
        ..ReplicationConfig::default()
    }
}

impl TestCluster {
    /// Build a cluster of the given node tags, all members of `database`,
    /// with every loader initialized against the installed record.
    pub async fn new(database: &str, tags: &[&str]) -> Self {
        let consensus = Arc::new(InMemoryConsensusLog::new());
        let registry = Arc::new(LoaderRegistry::default());

        let mut record = DatabaseRecord::new(database);
        record.topology = DatabaseTopology {
            members: tags
                .iter()
                .map(|t| ClusterMember::new(*t, format!("tcp://{}:10300", t.to_lowercase())))
                .collect(),
        };
        let commit_index = consensus
            .append_command(ClusterCommand::PutDatabaseRecord(record.clone()))
            .await
            .expect("record install");

        let mut nodes = Vec::new();
        for tag in tags {
            let url = format!("tcp://{}:10300", tag.to_lowercase());
            let store = DocumentStore::new(StoreConfig {
                database: database.to_string(),
                node_tag: tag.to_string(),
                revisions_enabled: false,
                shard: None,
            });
            let loader = ReplicationLoader::new(
                store.clone(),
                consensus.clone(),
                Arc::new(RegistryConnector::new(registry.clone())),
                test_config(),
            );
            registry.register(&url, loader.clone());
            nodes.push(TestNode {
                tag: tag.to_string(),
                url,
                store,
                loader,
            });
        }

        for node in &nodes {
            node.loader.initialize(record.clone(), commit_index).await;
        }

        Self {
            consensus,
            registry,
            nodes,
            record,
            commit_index,
        }
    }

    pub fn node(&self, tag: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.tag == tag)
            .expect("unknown node tag")
    }

    /// Push a new record through consensus and every node's reconciler.
    pub async fn update_record(&mut self, record: DatabaseRecord) {
        self.commit_index = self
            .consensus
            .append_command(ClusterCommand::PutDatabaseRecord(record.clone()))
            .await
            .expect("record update");
        for node in &self.nodes {
            node.loader
                .handle_database_record_change(Some(record.clone()), self.commit_index)
                .await;
        }
        self.record = record;
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
