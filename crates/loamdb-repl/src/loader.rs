//! The replication loader.
//!
//! Supervises every inbound and outbound replication connection of one
//! database: reconciles the connection set against the database record,
//! admits or rejects inbound peers, drives the reconnect queue, and
//! publishes the minimum etag the tombstone cleaner must not pass.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use loamdb_cluster::{ClusterStateView, ConsensusLog, ClusterCommand, DatabaseRecord};
use loamdb_store::{DocumentStore, MinimalEtagProvider};
use loamdb_transport::{
    cancel_pair, ensure_supported, read_json_frame, write_json_frame, CancelHandle, CancelReason,
    CancelToken, DynStream, HeartbeatConfig, MessageType, ReplicationLatestEtagRequest,
    ReplicationMessageReply, ReplyType, TcpConnectionHeader, TcpOperation,
    REPLICATION_PROTOCOL_VERSION,
};

use crate::backoff::ConnectionShutdownInfo;
use crate::connector::Connector;
use crate::destination::{DestinationId, ReplicationDestination};
use crate::error::{ReplError, Result};
use crate::incoming::{IncomingReplicationHandler, SourceInfo};
use crate::outgoing::{OutgoingReplicationHandler, OutgoingState};

/// Tunables for the replication subsystem.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Upper bound on entries per outbound batch.
    pub max_items_per_batch: usize,
    /// How long to wait for a per-batch acknowledgement.
    pub reply_timeout: Duration,
    /// Heartbeat timing for both directions.
    pub heartbeat: HeartbeatConfig,
    /// Period of the reconnect sweep timer.
    pub retry_replicate_after: Duration,
    /// Cap on the per-destination exponential backoff.
    pub max_retry_timeout: Duration,
    /// Period of the background conflict resolver.
    pub conflict_resolve_interval: Duration,
    /// An inbound peer silent for longer than this loses its slot to a
    /// fresh connection from the same source.
    pub stale_incoming_takeover: Duration,
    /// Retained rejection records per source.
    pub rejection_window: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_items_per_batch: 1024,
            reply_timeout: Duration::from_secs(60),
            heartbeat: HeartbeatConfig::default(),
            retry_replicate_after: Duration::from_secs(5),
            max_retry_timeout: Duration::from_secs(60),
            conflict_resolve_interval: Duration::from_millis(500),
            stale_incoming_takeover: Duration::from_secs(60),
            rejection_window: 16,
        }
    }
}

/// A recorded inbound rejection, kept for operators.
#[derive(Debug, Clone)]
pub struct Rejection {
    /// Why the connection was rejected.
    pub reason: String,
    /// When it was rejected.
    pub at: Instant,
}

struct OutgoingEntry {
    handler: Arc<OutgoingReplicationHandler>,
    cancel: CancelHandle,
    /// True when this worker reads our change log (internal peers,
    /// external pushes, hub-served sinks). Sink workers receive instead
    /// and do not gate tombstone collection.
    consumes_log: bool,
}

struct IncomingEntry {
    handler: Arc<IncomingReplicationHandler>,
    cancel: CancelHandle,
}

#[derive(Debug, Clone, Copy, Default)]
struct Progress {
    etag: u64,
    acked: bool,
}

/// Supervises all replication connections of one database.
pub struct ReplicationLoader {
    store: Arc<DocumentStore>,
    consensus: Arc<dyn ConsensusLog>,
    connector: Arc<dyn Connector>,
    config: ReplicationConfig,
    /// Reconciler takes read; disposal takes write and flips the flag.
    disposal: tokio::sync::RwLock<bool>,
    initialized: AtomicBool,
    outgoing: Mutex<HashMap<DestinationId, OutgoingEntry>>,
    incoming: Mutex<HashMap<String, IncomingEntry>>,
    failures: Mutex<HashMap<DestinationId, Arc<Mutex<ConnectionShutdownInfo>>>>,
    /// Last published etag per consuming destination, surviving reconnects.
    progress: Mutex<HashMap<DestinationId, Progress>>,
    reconnect_queue: Mutex<HashMap<DestinationId, ReplicationDestination>>,
    reconnect_latch: AtomicBool,
    rejections: Mutex<HashMap<String, VecDeque<Rejection>>>,
    last_record: Mutex<Option<(DatabaseRecord, u64)>>,
    cancel_token: CancelToken,
    cancel_handle: CancelHandle,
}

impl ReplicationLoader {
    /// Create a loader. Call `initialize` before use.
    pub fn new(
        store: Arc<DocumentStore>,
        consensus: Arc<dyn ConsensusLog>,
        connector: Arc<dyn Connector>,
        config: ReplicationConfig,
    ) -> Arc<Self> {
        let (cancel_token, cancel_handle) = cancel_pair();
        Arc::new(Self {
            store,
            consensus,
            connector,
            config,
            disposal: tokio::sync::RwLock::new(false),
            initialized: AtomicBool::new(false),
            outgoing: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            progress: Mutex::new(HashMap::new()),
            reconnect_queue: Mutex::new(HashMap::new()),
            reconnect_latch: AtomicBool::new(false),
            rejections: Mutex::new(HashMap::new()),
            last_record: Mutex::new(None),
            cancel_token,
            cancel_handle,
        })
    }

    /// The store this loader replicates.
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Idempotent startup: begins the conflict resolver and the reconnect
    /// timer, then runs the reconciler against the given record.
    pub async fn initialize(self: &Arc<Self>, record: DatabaseRecord, commit_index: u64) {
        if !self.initialized.swap(true, Ordering::SeqCst) {
            self.spawn_conflict_resolver();
            self.spawn_reconnect_timer();
        }
        self.handle_database_record_change(Some(record), commit_index)
            .await;
    }

    fn spawn_conflict_resolver(self: &Arc<Self>) {
        let loader = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loader.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(loader.config.conflict_resolve_interval) => {}
                }
                if let Err(e) = loader.store.resolve_conflicts() {
                    debug!(error = %e, "conflict resolver stopping");
                    return;
                }
            }
        });
    }

    fn spawn_reconnect_timer(self: &Arc<Self>) {
        let loader = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loader.cancel_token.cancelled() => return,
                    _ = tokio::time::sleep(loader.config.retry_replicate_after) => {}
                }
                loader.run_reconnect_sweep().await;
                loader.publish_external_cursors().await;
            }
        });
    }

    /// The reconciler: diff the declared destination set against the live
    /// one and converge without recycling kept workers.
    pub async fn handle_database_record_change(
        self: &Arc<Self>,
        record: Option<DatabaseRecord>,
        commit_index: u64,
    ) {
        let disposal = self.disposal.read().await;
        if *disposal {
            return;
        }

        *self.last_record.lock().expect("lock poisoned") =
            record.clone().map(|r| (r, commit_index));

        let view = match &record {
            Some(r) if !r.disabled => {
                let view = ClusterStateView::from_record(r.clone(), commit_index, self.store.node_tag());
                if view.is_passive() {
                    None
                } else {
                    Some(view)
                }
            }
            _ => None,
        };

        let Some(view) = view else {
            info!(database = %self.store.database(), "record gone or node passive; dropping all replication connections");
            self.drop_all_outgoing(CancelReason::Shutdown);
            self.drop_all_incoming(CancelReason::Shutdown);
            self.reconnect_queue.lock().expect("lock poisoned").clear();
            return;
        };
        let record = view.record().clone();

        let mut desired: HashMap<DestinationId, ReplicationDestination> = HashMap::new();
        for member in view.internal_peers() {
            let destination =
                ReplicationDestination::internal(&member.node_tag, &member.url, &record.database);
            desired.insert(destination.id(), destination);
        }
        for task in &record.external_replications {
            if !task.disabled && view.is_my_task(task.task_id, task.mentor_node.as_deref()) {
                let destination = ReplicationDestination::from_external(task);
                desired.insert(destination.id(), destination);
            }
        }
        for task in &record.sink_pull_replications {
            if !task.disabled && view.is_my_task(task.task_id, task.mentor_node.as_deref()) {
                let destination = ReplicationDestination::from_sink(task);
                desired.insert(destination.id(), destination);
            }
        }

        let mut removed_internal_tags: Vec<String> = Vec::new();
        let mut additions: Vec<ReplicationDestination> = Vec::new();
        {
            let mut outgoing = self.outgoing.lock().expect("lock poisoned");
            let current_ids: Vec<DestinationId> = outgoing.keys().cloned().collect();
            for id in current_ids {
                if !desired.contains_key(&id) {
                    if let Some(entry) = outgoing.remove(&id) {
                        if let ReplicationDestination::Internal { node_tag, .. } =
                            entry.handler.destination()
                        {
                            removed_internal_tags.push(node_tag);
                        }
                        dispose_outgoing(entry);
                    }
                }
            }

            let mut reconnect = self.reconnect_queue.lock().expect("lock poisoned");
            reconnect.retain(|id, _| desired.contains_key(id));

            for (id, destination) in &desired {
                if let Some(entry) = outgoing.get(id) {
                    // Kept destination: mutate the live worker in place.
                    entry.handler.update_destination(destination.clone());
                } else if let Some(queued) = reconnect.get_mut(id) {
                    *queued = destination.clone();
                } else {
                    additions.push(destination.clone());
                }
            }
        }

        for tag in removed_internal_tags {
            self.drop_incoming_from_node(&tag, CancelReason::ConnectionDropped);
        }
        drop(disposal);

        for destination in additions {
            self.add_and_start_outgoing(destination).await;
        }
    }

    /// Register and start a worker for a destination. Silently abandoned
    /// when the database is being disposed.
    pub async fn add_and_start_outgoing(self: &Arc<Self>, destination: ReplicationDestination) {
        let Ok(disposal) = self.disposal.try_read() else {
            // Disposal holds the write lock; the database is going away.
            return;
        };
        if *disposal {
            return;
        }

        let id = destination.id();
        let consumes_log = !matches!(destination, ReplicationDestination::ExternalSink { .. });
        let handler = {
            let mut outgoing = self.outgoing.lock().expect("lock poisoned");
            if outgoing.contains_key(&id) {
                return;
            }
            let (token, handle) = self.cancel_token.child();
            let handler = OutgoingReplicationHandler::new(
                self.store.clone(),
                destination,
                self.config.clone(),
                token,
            );
            if let Some(progress) = self.progress.lock().expect("lock poisoned").get(&id) {
                handler.publish_etag_floor(progress.etag, progress.acked);
            }
            outgoing.insert(
                id.clone(),
                OutgoingEntry {
                    handler: handler.clone(),
                    cancel: handle,
                    consumes_log,
                },
            );
            handler
        };
        drop(disposal);

        let loader = self.clone();
        tokio::spawn(async move {
            loader.run_outgoing(id, handler, consumes_log).await;
        });
    }

    async fn run_outgoing(
        self: Arc<Self>,
        id: DestinationId,
        handler: Arc<OutgoingReplicationHandler>,
        consumes_log: bool,
    ) {
        let result = handler.connect_and_run(self.connector.as_ref()).await;

        if consumes_log {
            let mut progress = self.progress.lock().expect("lock poisoned");
            let entry = progress.entry(id.clone()).or_default();
            entry.etag = entry.etag.max(handler.published_etag());
            entry.acked |= handler.has_acked();
        }
        self.outgoing.lock().expect("lock poisoned").remove(&id);

        let destination = handler.destination();
        match result {
            Ok(()) => {
                handler.set_state(OutgoingState::Closed);
            }
            Err(e) if e.is_recoverable() => {
                let failure = self.failure_for(&id);
                let (timeout, consecutive) = {
                    let mut failure = failure.lock().expect("lock poisoned");
                    let exchanged = handler.stats.batches_sent.load(Ordering::Relaxed)
                        + handler.stats.heartbeats_sent.load(Ordering::Relaxed)
                        > 0;
                    if exchanged {
                        // The connection was healthy before this failure.
                        failure.reset();
                    }
                    let timeout = failure.on_error(e.to_string());
                    (timeout, failure.retries())
                };
                // A protocol violation gets one reconnect; a peer that keeps
                // violating the protocol is dropped rather than retried.
                if matches!(e, ReplError::Protocol { .. }) && consecutive > 2 {
                    warn!(
                        destination = %destination.describe(),
                        error = %e,
                        "repeated protocol violations; dropping destination"
                    );
                    handler.set_state(OutgoingState::Closed);
                    return;
                }
                warn!(
                    destination = %destination.describe(),
                    error = %e,
                    retry_in_ms = timeout.as_millis() as u64,
                    "outbound replication failed; queued for reconnect"
                );
                handler.set_state(OutgoingState::Reconnecting);
                self.reconnect_queue
                    .lock()
                    .expect("lock poisoned")
                    .insert(id, destination);
            }
            Err(ReplError::NotOwner { task }) => {
                // The peer disagrees about ownership; re-check topology.
                let still_mine = self.is_still_my_task(&destination);
                if still_mine {
                    info!(%task, "destination claims we are not the owner; will retry");
                    self.reconnect_queue
                        .lock()
                        .expect("lock poisoned")
                        .insert(id, destination);
                } else {
                    info!(%task, "task moved to another node; dropping destination");
                }
                handler.set_state(OutgoingState::Closed);
            }
            Err(ReplError::Cancelled(reason)) => {
                debug!(destination = %destination.describe(), %reason, "outbound worker cancelled");
                handler.set_state(OutgoingState::Closed);
            }
            Err(e) => {
                warn!(
                    destination = %destination.describe(),
                    error = %e,
                    "outbound replication terminally failed; destination dropped"
                );
                handler.set_state(OutgoingState::Closed);
            }
        }
    }

    fn is_still_my_task(&self, destination: &ReplicationDestination) -> bool {
        let record = self.last_record.lock().expect("lock poisoned").clone();
        let Some((record, index)) = record else {
            return false;
        };
        let Some(task_id) = destination.task_id() else {
            // Internal destinations are always ours while declared.
            return true;
        };
        ClusterStateView::from_record(record, index, self.store.node_tag())
            .is_my_task(task_id, destination.mentor_node())
    }

    fn failure_for(&self, id: &DestinationId) -> Arc<Mutex<ConnectionShutdownInfo>> {
        self.failures
            .lock()
            .expect("lock poisoned")
            .entry(id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConnectionShutdownInfo::new(
                    self.config.max_retry_timeout,
                )))
            })
            .clone()
    }

    /// One pass of the reconnect timer: retry due destinations that are
    /// still this node's task. Serialized by a compare-and-swap latch so
    /// concurrent wake-ups coalesce.
    pub async fn run_reconnect_sweep(self: &Arc<Self>) {
        if self
            .reconnect_latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let now = Instant::now();
        let due: Vec<(DestinationId, ReplicationDestination)> = {
            let mut queue = self.reconnect_queue.lock().expect("lock poisoned");
            let mut due = Vec::new();
            queue.retain(|id, destination| {
                if !self.is_still_my_task(destination) {
                    debug!(destination = %destination.describe(), "no longer my task; dropping from reconnect queue");
                    return false;
                }
                let ready = self
                    .failure_for(id)
                    .lock()
                    .expect("lock poisoned")
                    .is_due(now);
                if ready {
                    due.push((id.clone(), destination.clone()));
                    return false;
                }
                true
            });
            due
        };

        for (_, destination) in due {
            self.add_and_start_outgoing(destination).await;
        }

        self.reconnect_latch.store(false, Ordering::SeqCst);
    }

    /// Persist the confirmed cursor of every external push task so the
    /// minimal-etag rule survives restarts cluster-wide.
    async fn publish_external_cursors(self: &Arc<Self>) {
        let updates: Vec<(u64, u64)> = {
            let outgoing = self.outgoing.lock().expect("lock poisoned");
            outgoing
                .values()
                .filter(|e| e.consumes_log && e.handler.has_acked())
                .filter_map(|e| {
                    e.handler
                        .destination()
                        .task_id()
                        .map(|task| (task, e.handler.published_etag()))
                })
                .collect()
        };
        for (task_id, etag) in updates {
            let command = ClusterCommand::UpdateExternalCursor {
                database: self.store.database().to_string(),
                task_id,
                etag,
            };
            if let Err(e) = self.consensus.append_command(command).await {
                debug!(error = %e, task_id, "failed to persist external cursor");
            }
        }
    }

    /// Dispatch an accepted connection whose header named the Replication
    /// operation. Reads the etag request, applies the admission rules, and
    /// either spawns a handler or rejects with a recorded reason.
    pub async fn accept_incoming_connection(
        self: &Arc<Self>,
        mut stream: DynStream,
        header: TcpConnectionHeader,
    ) -> Result<()> {
        if header.operation != TcpOperation::Replication {
            return Err(ReplError::Protocol {
                msg: format!("unexpected operation {:?} on replication listener", header.operation),
            });
        }
        if let Err(e) = ensure_supported(REPLICATION_PROTOCOL_VERSION, header.protocol_version) {
            let reason = e.to_string();
            self.record_rejection("unknown", &reason);
            let _ = self.send_rejection(&mut stream, &reason).await;
            return Err(ReplError::Transport(e));
        }

        let request: ReplicationLatestEtagRequest = read_json_frame(&mut stream).await?;
        let source = SourceInfo::from(&request);

        if let Err(reason) = self.admission_check(&header, &request) {
            self.record_rejection(&source.database_id, &reason);
            warn!(source = %source.database_id, %reason, "rejected inbound replication");
            let _ = self.send_rejection(&mut stream, &reason).await;
            return Err(ReplError::Protocol { msg: reason });
        }

        if let Some(hub_name) = request.serve_as_hub.clone() {
            return self.serve_as_hub(stream, request, hub_name).await;
        }

        {
            let mut incoming = self.incoming.lock().expect("lock poisoned");
            if incoming.get(&source.database_id).is_some() {
                drop(incoming);
                let _ = self.send_rejection(&mut stream, "busy").await;
                return Err(ReplError::Protocol { msg: "busy".into() });
            }
            drop(incoming);
            let handler = IncomingReplicationHandler::new(
                self.store.clone(),
                source.clone(),
                &self.config,
                self.cancel_token.child().0,
            );
            self.incoming.lock().expect("lock poisoned").insert(
                source.database_id.clone(),
                IncomingEntry {
                    handler: handler.clone(),
                    cancel: self.cancel_token.child().1,
                },
            );
            let loader = self.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                let _ = handler.run(&mut stream, &config).await;
                let mut incoming = loader.incoming.lock().expect("lock poisoned");
                if let Some(entry) = incoming.get(&handler.source().database_id) {
                    if Arc::ptr_eq(&entry.handler, &handler) {
                        incoming.remove(&handler.source().database_id);
                    }
                }
            });
        }
        Ok(())
    }

    fn admission_check(
        &self,
        header: &TcpConnectionHeader,
        request: &ReplicationLatestEtagRequest,
    ) -> std::result::Result<(), String> {
        if self.cancel_token.is_cancelled() || self.store.is_deleted() {
            return Err(format!(
                "Database '{}' does not exist.",
                self.store.database()
            ));
        }
        if header.database != self.store.database() {
            return Err(format!("Database '{}' does not exist.", header.database));
        }
        if request.source_database_id == self.store.database_id() {
            return Err("replication loop detected: source database id equals local database id"
                .to_string());
        }

        let record = self.last_record.lock().expect("lock poisoned").clone();
        let passive = match &record {
            None => true,
            Some((record, index)) => {
                ClusterStateView::from_record(record.clone(), *index, self.store.node_tag())
                    .is_passive()
            }
        };
        if passive {
            return Err("node is passive and accepts no replication".to_string());
        }

        if let Some(hub) = &request.serve_as_hub {
            let declared = record
                .as_ref()
                .map(|(r, _)| {
                    r.hub_pull_replications
                        .iter()
                        .any(|h| &h.name == hub && !h.disabled)
                })
                .unwrap_or(false);
            if !declared {
                return Err(format!("no enabled pull-replication hub named '{hub}'"));
            }
        }
        Ok(())
    }

    async fn serve_as_hub(
        self: &Arc<Self>,
        mut stream: DynStream,
        request: ReplicationLatestEtagRequest,
        hub_name: String,
    ) -> Result<()> {
        let destination = ReplicationDestination::ExternalSink {
            connection_string: loamdb_cluster::ConnectionString {
                name: hub_name.clone(),
                url: request.source_url.clone(),
                database: request.source_database_name.clone(),
            },
            hub_name: hub_name.clone(),
            certificate: None,
            task_id: 0,
            mentor_node: None,
        };
        let id = destination.id();
        let (token, handle) = self.cancel_token.child();
        let handler = OutgoingReplicationHandler::new(
            self.store.clone(),
            destination,
            self.config.clone(),
            token,
        );
        {
            let mut outgoing = self.outgoing.lock().expect("lock poisoned");
            if let Some(previous) = outgoing.remove(&id) {
                previous.cancel.cancel(CancelReason::Superseded);
            }
            outgoing.insert(
                id.clone(),
                OutgoingEntry {
                    handler: handler.clone(),
                    cancel: handle,
                    // A served sink reads our change log like any outbound.
                    consumes_log: true,
                },
            );
        }
        info!(hub = %hub_name, sink = %request.source_database_id, "serving sink from hub");

        let loader = self.clone();
        let start_etag = request.last_sent_etag;
        tokio::spawn(async move {
            let result = handler.run_as_hub(&mut stream, start_etag).await;
            if let Err(e) = result {
                debug!(error = %e, "hub-served sink disconnected");
            }
            {
                let mut progress = loader.progress.lock().expect("lock poisoned");
                let entry = progress.entry(id.clone()).or_default();
                entry.etag = entry.etag.max(handler.published_etag());
                entry.acked |= handler.has_acked();
            }
            loader.outgoing.lock().expect("lock poisoned").remove(&id);
        });
        Ok(())
    }

    async fn send_rejection(&self, stream: &mut DynStream, reason: &str) -> Result<()> {
        let reply = ReplicationMessageReply {
            reply_type: ReplyType::Error,
            message_type: MessageType::Heartbeat,
            last_etag_accepted: 0,
            node_tag: self.store.node_tag().to_string(),
            database_change_vector: String::new(),
            message: Some(reason.to_string()),
        };
        write_json_frame(stream, &reply)
            .await
            .map_err(ReplError::Transport)
    }

    fn record_rejection(&self, source_db_id: &str, reason: &str) {
        let mut rejections = self.rejections.lock().expect("lock poisoned");
        let ring = rejections.entry(source_db_id.to_string()).or_default();
        if ring.len() == self.config.rejection_window {
            ring.pop_front();
        }
        ring.push_back(Rejection {
            reason: reason.to_string(),
            at: Instant::now(),
        });
    }

    /// The retained rejection reasons for a source, oldest first.
    pub fn rejection_reasons(&self, source_db_id: &str) -> Vec<String> {
        self.rejections
            .lock()
            .expect("lock poisoned")
            .get(source_db_id)
            .map(|ring| ring.iter().map(|r| r.reason.clone()).collect())
            .unwrap_or_default()
    }

    /// The minimum etag replication still needs: the tombstone cleaner may
    /// only collect strictly below this value.
    ///
    /// Rules: a declared-but-disabled destination pins the minimum at 0; a
    /// destination that has never acknowledged pins it at 0; otherwise it
    /// is the minimum over the published etags, further lowered by the
    /// persisted external-replication cursors from the cluster log.
    pub fn get_minimal_etag_for_replication(&self) -> u64 {
        let record = self.last_record.lock().expect("lock poisoned").clone();
        let Some((record, commit_index)) = record else {
            // Nothing declared; nothing gates collection.
            return u64::MAX;
        };

        if record.external_replications.iter().any(|t| t.disabled)
            || record.sink_pull_replications.iter().any(|t| t.disabled)
        {
            return 0;
        }

        let view =
            ClusterStateView::from_record(record.clone(), commit_index, self.store.node_tag());
        let expected = view.internal_peers().len()
            + record
                .external_replications
                .iter()
                .filter(|t| view.is_my_task(t.task_id, t.mentor_node.as_deref()))
                .count();

        let mut min = u64::MAX;
        let mut tracked = 0usize;
        {
            let outgoing = self.outgoing.lock().expect("lock poisoned");
            let progress = self.progress.lock().expect("lock poisoned");
            let queue = self.reconnect_queue.lock().expect("lock poisoned");

            for entry in outgoing.values().filter(|e| e.consumes_log) {
                tracked += 1;
                if !entry.handler.has_acked() {
                    return 0;
                }
                min = min.min(entry.handler.published_etag());
            }
            for (id, _) in queue.iter() {
                match progress.get(id) {
                    Some(p) if p.acked => {
                        tracked += 1;
                        min = min.min(p.etag);
                    }
                    _ => return 0,
                }
            }
        }

        if tracked < expected {
            // Workers still starting; assume the worst.
            return 0;
        }

        for task in &record.external_replications {
            let cursor = self
                .consensus
                .read_external_cursor(self.store.database(), task.task_id);
            min = min.min(cursor);
        }
        min
    }

    /// Live outbound worker count.
    pub fn outgoing_count(&self) -> usize {
        self.outgoing.lock().expect("lock poisoned").len()
    }

    /// Source database ids with an active inbound handler.
    pub fn incoming_sources(&self) -> Vec<String> {
        self.incoming
            .lock()
            .expect("lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Published last-sent etag per destination.
    pub fn last_sent_etags(&self) -> HashMap<DestinationId, u64> {
        self.outgoing
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(id, entry)| (id.clone(), entry.handler.published_etag()))
            .collect()
    }

    fn drop_all_outgoing(&self, reason: CancelReason) {
        let mut outgoing = self.outgoing.lock().expect("lock poisoned");
        for (_, entry) in outgoing.drain() {
            entry.cancel.cancel(reason);
        }
    }

    fn drop_all_incoming(&self, reason: CancelReason) {
        let mut incoming = self.incoming.lock().expect("lock poisoned");
        for (_, entry) in incoming.drain() {
            entry.cancel.cancel(reason);
        }
    }

    fn drop_incoming_from_node(&self, node_tag: &str, reason: CancelReason) {
        let mut incoming = self.incoming.lock().expect("lock poisoned");
        let doomed: Vec<String> = incoming
            .iter()
            .filter(|(_, entry)| entry.handler.source().node_tag == node_tag)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            if let Some(entry) = incoming.remove(&key) {
                entry.cancel.cancel(reason);
            }
        }
    }

    /// Tear the loader down: blocks new reconciliation, cancels every
    /// worker, and drops all connection state.
    pub async fn dispose(&self) {
        let mut disposal = self.disposal.write().await;
        *disposal = true;
        self.cancel_handle.cancel(CancelReason::Shutdown);
        self.drop_all_outgoing(CancelReason::Shutdown);
        self.drop_all_incoming(CancelReason::Shutdown);
        self.reconnect_queue.lock().expect("lock poisoned").clear();
    }
}

fn dispose_outgoing(entry: OutgoingEntry) {
    // Teardown is fire-and-forget: the worker task observes the cancel and
    // exits on its own; the reconciler never waits for it.
    entry.cancel.cancel(CancelReason::ConnectionDropped);
}

impl MinimalEtagProvider for ReplicationLoader {
    fn minimal_etag_for_replication(&self) -> u64 {
        self.get_minimal_etag_for_replication()
    }
}
