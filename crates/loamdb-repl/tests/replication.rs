//! End-to-end replication scenarios: member-to-member convergence,
//! tombstone interlock, reconciliation on topology change, admission
//! control, and the pull-replication hub path.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{test_config, wait_until, RegistryConnector, TestCluster};
use loamdb_cluster::{ClusterCommand, ConnectionString, ConsensusLog, PullReplicationDefinition, PullReplicationSink};
use loamdb_repl::ReplicationLoader;
use loamdb_store::{DocumentStore, StoreConfig, TombstoneCleaner};
use loamdb_transport::{
    read_json_frame, write_json_frame, DynStream, ReplicationLatestEtagRequest,
    ReplicationMessageReply, ReplyType, TcpConnectionHeader, TcpOperation,
    REPLICATION_PROTOCOL_VERSION,
};

#[tokio::test]
async fn test_documents_replicate_between_members() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;

    cluster
        .node("A")
        .store
        .put_document("users/1", "Users", json!({"Name": "oren"}))
        .unwrap();

    let b = cluster.node("B").store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            b.get_document("users/1").map(|d| d.is_some()).unwrap_or(false)
        })
        .await,
        "document never reached node B"
    );

    // Both directions: a write on B reaches A.
    cluster
        .node("B")
        .store
        .put_document("users/2", "Users", json!({"Name": "ayende"}))
        .unwrap();
    let a = cluster.node("A").store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            a.get_document("users/2").map(|d| d.is_some()).unwrap_or(false)
        })
        .await
    );
}

#[tokio::test]
async fn test_tombstones_replicate() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A").store.clone();
    let b = cluster.node("B").store.clone();

    a.put_document("users/1", "Users", json!({})).unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            b.get_document("users/1").map(|d| d.is_some()).unwrap_or(false)
        })
        .await
    );

    a.delete_document("users/1").unwrap();
    assert!(
        wait_until(Duration::from_secs(10), || {
            b.get_document("users/1").map(|d| d.is_none()).unwrap_or(false)
        })
        .await,
        "delete never reached node B"
    );
}

#[tokio::test]
async fn test_minimal_etag_gates_tombstone_collection() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A").store.clone();
    let loader_a = cluster.node("A").loader.clone();

    a.put_document("users/1", "Users", json!({})).unwrap();
    let tomb = a.delete_document("users/1").unwrap().unwrap();
    // A later write pushes the acknowledged frontier past the tombstone.
    a.put_document("users/2", "Users", json!({})).unwrap();

    let cleaner = TombstoneCleaner::new(a.clone(), loader_a.clone());

    // Until the peer has acknowledged past the tombstone, nothing may go.
    assert!(
        wait_until(Duration::from_secs(10), || {
            loader_a.get_minimal_etag_for_replication() > tomb.etag
        })
        .await,
        "peer never acknowledged past the tombstone (min {})",
        loader_a.get_minimal_etag_for_replication()
    );

    assert_eq!(cleaner.clean().unwrap(), 1);
    assert!(a.tombstone_entries().is_empty());

    // And the peer indeed applied the delete before collection happened.
    let b = cluster.node("B").store.clone();
    assert!(b.get_document("users/1").unwrap().is_none());
}

#[tokio::test]
async fn test_published_etags_are_monotone_under_load() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A");

    let mut per_destination: std::collections::HashMap<_, Vec<u64>> =
        std::collections::HashMap::new();
    for i in 0..20 {
        a.store
            .put_document(&format!("users/{i}"), "Users", json!({"i": i}))
            .unwrap();
        for (id, etag) in a.loader.last_sent_etags() {
            per_destination.entry(id).or_default().push(etag);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let last = a.store.last_etag();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let etags = a.loader.last_sent_etags();
            !etags.is_empty() && etags.values().all(|e| *e == last)
        })
        .await
    );
    for (id, samples) in per_destination {
        assert!(
            samples.windows(2).all(|w| w[0] <= w[1]),
            "published etag regressed for {id:?}: {samples:?}"
        );
    }
}

#[tokio::test]
async fn test_reconciler_drops_removed_member() {
    let mut cluster = TestCluster::new("north", &["A", "B", "C"]).await;
    let a = cluster.node("A");
    assert!(wait_until(Duration::from_secs(10), || a.loader.outgoing_count() == 2).await);

    let mut record = cluster.record.clone();
    record.topology.members.retain(|m| m.node_tag != "C");
    cluster.update_record(record).await;

    let a = cluster.node("A");
    assert!(
        wait_until(Duration::from_secs(10), || a.loader.outgoing_count() == 1).await,
        "worker for removed member C survived reconciliation"
    );
}

#[tokio::test]
async fn test_passive_record_drops_everything() {
    let mut cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A");
    assert!(wait_until(Duration::from_secs(10), || a.loader.outgoing_count() == 1).await);

    // A record that no longer lists this node makes it passive.
    let mut record = cluster.record.clone();
    record.topology.members.retain(|m| m.node_tag == "B");
    cluster.update_record(record).await;

    let a = cluster.node("A");
    assert!(wait_until(Duration::from_secs(10), || a.loader.outgoing_count() == 0).await);
}

async fn handshake(
    loader: &Arc<ReplicationLoader>,
    source_db_id: &str,
    database: &str,
) -> (DynStream, ReplicationMessageReply) {
    let (client, server) = tokio::io::duplex(1 << 16);
    let mut client: DynStream = Box::new(client);
    let loader = loader.clone();
    tokio::spawn(async move {
        let mut stream: DynStream = Box::new(server);
        if let Ok(header) = read_json_frame::<_, TcpConnectionHeader>(&mut stream).await {
            let _ = loader.accept_incoming_connection(stream, header).await;
        }
    });

    let header = TcpConnectionHeader {
        operation: TcpOperation::Replication,
        protocol_version: REPLICATION_PROTOCOL_VERSION,
        database: database.to_string(),
    };
    write_json_frame(&mut client, &header).await.unwrap();
    let request = ReplicationLatestEtagRequest {
        source_node_tag: "X".to_string(),
        source_machine_name: "test".to_string(),
        source_database_id: source_db_id.to_string(),
        source_database_name: database.to_string(),
        source_url: "tcp://x:1".to_string(),
        last_sent_etag: 0,
        serve_as_hub: None,
    };
    write_json_frame(&mut client, &request).await.unwrap();
    let reply: ReplicationMessageReply = read_json_frame(&mut client).await.unwrap();
    (client, reply)
}

#[tokio::test]
async fn test_self_replication_rejected() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A");
    let own_id = a.store.database_id().to_string();

    let (_stream, reply) = handshake(&a.loader, &own_id, "north").await;
    assert_eq!(reply.reply_type, ReplyType::Error);
    assert!(reply.message.unwrap().contains("replication loop"));

    let reasons = a.loader.rejection_reasons(&own_id);
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].contains("replication loop"));
}

#[tokio::test]
async fn test_single_inbound_per_source() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A");

    let (_keep_alive, first) = handshake(&a.loader, "peer-db-1", "north").await;
    assert_eq!(first.reply_type, ReplyType::Ok);
    assert!(
        wait_until(Duration::from_secs(5), || {
            a.loader.incoming_sources().contains(&"peer-db-1".to_string())
        })
        .await
    );

    // A second live connection from the same source is turned away.
    let (_second_stream, second) = handshake(&a.loader, "peer-db-1", "north").await;
    assert_eq!(second.reply_type, ReplyType::Error);
    assert!(second.message.unwrap().contains("already active"));
    assert_eq!(
        a.loader
            .incoming_sources()
            .iter()
            .filter(|s| s.as_str() == "peer-db-1")
            .count(),
        1
    );
    assert!(!a.loader.rejection_reasons("peer-db-1").is_empty());
}

#[tokio::test]
async fn test_unknown_database_rejected() {
    let cluster = TestCluster::new("north", &["A", "B"]).await;
    let a = cluster.node("A");

    let (_stream, reply) = handshake(&a.loader, "peer-db-9", "nowhere").await;
    assert_eq!(reply.reply_type, ReplyType::Error);
    assert!(reply
        .message
        .unwrap()
        .contains("Database 'nowhere' does not exist."));
}

#[tokio::test]
async fn test_hub_serves_pull_replication_sink() {
    // Hub database "north" on node A; a separate database "south" pulls
    // from it through a declared sink task.
    let cluster = TestCluster::new("north", &["A"]).await;
    let hub_node = cluster.node("A");

    let mut record = cluster.record.clone();
    record.hub_pull_replications.push(PullReplicationDefinition {
        name: "events".to_string(),
        disabled: false,
    });
    cluster
        .consensus
        .append_command(ClusterCommand::PutDatabaseRecord(record.clone()))
        .await
        .unwrap();
    hub_node
        .loader
        .handle_database_record_change(Some(record), cluster.commit_index + 1)
        .await;

    // The sink database lives outside the hub's cluster record.
    let sink_store = DocumentStore::new(StoreConfig {
        database: "south".to_string(),
        node_tag: "S".to_string(),
        revisions_enabled: false,
        shard: None,
    });
    let sink_consensus = Arc::new(loamdb_cluster::InMemoryConsensusLog::new());
    let mut sink_record = loamdb_cluster::DatabaseRecord::new("south");
    sink_record.topology.members.push(loamdb_cluster::ClusterMember::new("S", "tcp://s:10300"));
    sink_record.sink_pull_replications.push(PullReplicationSink {
        task_id: 1,
        hub_name: "events".to_string(),
        connection_string: ConnectionString {
            name: "to-hub".to_string(),
            url: hub_node.url.clone(),
            database: "north".to_string(),
        },
        certificate: None,
        mentor_node: None,
        disabled: false,
    });
    let index = sink_consensus
        .append_command(ClusterCommand::PutDatabaseRecord(sink_record.clone()))
        .await
        .unwrap();

    let sink_loader = ReplicationLoader::new(
        sink_store.clone(),
        sink_consensus,
        Arc::new(RegistryConnector::new(cluster.registry.clone())),
        test_config(),
    );
    sink_loader.initialize(sink_record, index).await;

    hub_node
        .store
        .put_document("events/1", "Events", json!({"what": "launch"}))
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            sink_store
                .get_document("events/1")
                .map(|d| d.is_some())
                .unwrap_or(false)
        })
        .await,
        "sink never received the hub's document"
    );
}
