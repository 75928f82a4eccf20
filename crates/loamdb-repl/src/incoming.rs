//! Inbound replication handler.
//!
//! Accepts a negotiated peer connection, answers the etag request with the
//! resume point and this database's change vector, then applies incoming
//! batches in order, replying after each one. Replay of already-seen etags
//! from the same source is a no-op.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use loamdb_store::DocumentStore;
use loamdb_transport::{
    write_json_frame, CancelToken, DynStream, HeartbeatClock, MessageType,
    ReplicationLatestEtagRequest, ReplicationMessageReply, ReplyType, TransportError,
};

use crate::batch::read_batch;
use crate::error::{ReplError, Result};
use crate::loader::ReplicationConfig;

/// Identity of a replication source, learned from its etag request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// Unique database id of the source.
    pub database_id: String,
    /// Database name of the source.
    pub database: String,
    /// Node tag of the source.
    pub node_tag: String,
    /// URL of the source.
    pub url: String,
    /// Machine name of the source, for operators.
    pub machine_name: String,
}

impl From<&ReplicationLatestEtagRequest> for SourceInfo {
    fn from(request: &ReplicationLatestEtagRequest) -> Self {
        Self {
            database_id: request.source_database_id.clone(),
            database: request.source_database_name.clone(),
            node_tag: request.source_node_tag.clone(),
            url: request.source_url.clone(),
            machine_name: request.source_machine_name.clone(),
        }
    }
}

/// Counters for one inbound connection.
#[derive(Debug, Default)]
pub struct IncomingStats {
    /// Batches applied.
    pub batches_received: AtomicU64,
    /// Entries applied.
    pub entries_received: AtomicU64,
}

/// One inbound replication connection from a peer.
pub struct IncomingReplicationHandler {
    store: Arc<DocumentStore>,
    source: SourceInfo,
    last_accepted_etag: AtomicU64,
    heartbeat: HeartbeatClock,
    cancel: CancelToken,
    /// Connection counters.
    pub stats: IncomingStats,
}

impl IncomingReplicationHandler {
    /// Create a handler for an admitted source.
    pub fn new(
        store: Arc<DocumentStore>,
        source: SourceInfo,
        config: &ReplicationConfig,
        cancel: CancelToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            last_accepted_etag: AtomicU64::new(0),
            heartbeat: HeartbeatClock::new(config.heartbeat.max_inactive),
            cancel,
            stats: IncomingStats::default(),
        })
    }

    /// The source peer.
    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    /// Highest etag accepted from this source.
    pub fn last_accepted_etag(&self) -> u64 {
        self.last_accepted_etag.load(Ordering::SeqCst)
    }

    /// Time since the source was last heard from.
    pub fn heartbeat_elapsed(&self) -> std::time::Duration {
        self.heartbeat.elapsed()
    }

    /// True while the source is within its liveness window.
    pub fn is_alive(&self) -> bool {
        self.heartbeat.is_alive()
    }

    /// Stop this connection.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Run the receive loop. Sends the initial reply (resume etag, change
    /// vector, node tag), then applies batches until the transport fails,
    /// the peer goes silent, or the handler is cancelled.
    pub async fn run(
        self: &Arc<Self>,
        stream: &mut DynStream,
        config: &ReplicationConfig,
    ) -> Result<()> {
        info!(
            source = %self.source.database_id,
            node_tag = %self.source.node_tag,
            "inbound replication connected"
        );
        send_reply(
            &self.store,
            stream,
            MessageType::Heartbeat,
            self.last_accepted_etag(),
        )
        .await?;

        let result = receive_batches(
            &self.store,
            stream,
            &self.last_accepted_etag,
            config,
            &self.cancel,
            Some(self),
        )
        .await;
        if let Err(e) = &result {
            debug!(source = %self.source.database_id, error = %e, "inbound replication ended");
        }
        result
    }
}

async fn send_reply(
    store: &Arc<DocumentStore>,
    stream: &mut DynStream,
    message_type: MessageType,
    last_etag_accepted: u64,
) -> Result<()> {
    let reply = ReplicationMessageReply {
        reply_type: ReplyType::Ok,
        message_type,
        last_etag_accepted,
        node_tag: store.node_tag().to_string(),
        database_change_vector: store.database_change_vector().to_string(),
        message: None,
    };
    write_json_frame(stream, &reply).await.map_err(ReplError::Transport)
}

async fn send_error_reply(
    store: &Arc<DocumentStore>,
    stream: &mut DynStream,
    message: String,
) -> Result<()> {
    let reply = ReplicationMessageReply {
        reply_type: ReplyType::Error,
        message_type: MessageType::Batch,
        last_etag_accepted: 0,
        node_tag: store.node_tag().to_string(),
        database_change_vector: store.database_change_vector().to_string(),
        message: Some(message),
    };
    write_json_frame(stream, &reply).await.map_err(ReplError::Transport)
}

/// The shared receive loop: used by the inbound handler and, inside-out, by
/// pull-replication sink workers receiving from a hub.
pub(crate) async fn receive_batches(
    store: &Arc<DocumentStore>,
    stream: &mut DynStream,
    last_accepted: &AtomicU64,
    config: &ReplicationConfig,
    cancel: &CancelToken,
    observer: Option<&Arc<IncomingReplicationHandler>>,
) -> Result<()> {
    loop {
        let (message, payloads) = tokio::select! {
            reason = cancel.cancelled() => return Err(ReplError::Cancelled(reason)),
            read = tokio::time::timeout(config.heartbeat.max_inactive, read_batch(stream)) => {
                match read {
                    Err(_) => {
                        return Err(ReplError::Transport(TransportError::Timeout {
                            timeout_ms: config.heartbeat.max_inactive.as_millis() as u64,
                        }))
                    }
                    Ok(result) => result?,
                }
            }
        };

        if let Some(handler) = observer {
            handler.heartbeat.touch();
        }

        if message.is_heartbeat() {
            send_reply(store, stream, MessageType::Heartbeat, last_accepted.load(Ordering::SeqCst))
                .await?;
            continue;
        }

        let seen = last_accepted.load(Ordering::SeqCst);
        if message.last_etag_in_batch <= seen {
            // Replay of an already-applied batch; acknowledge and move on.
            debug!(
                last_etag = message.last_etag_in_batch,
                seen, "skipping replayed batch"
            );
            send_reply(store, stream, MessageType::Batch, seen).await?;
            continue;
        }

        if let Err(e) = store.apply_replicated(payloads) {
            warn!(error = %e, "failed to apply replicated batch");
            let text = e.to_string();
            let _ = send_error_reply(store, stream, text).await;
            return Err(ReplError::Store(e));
        }

        last_accepted.fetch_max(message.last_etag_in_batch, Ordering::SeqCst);
        if let Some(handler) = observer {
            handler.stats.batches_received.fetch_add(1, Ordering::Relaxed);
            handler
                .stats
                .entries_received
                .fetch_add(message.items.len() as u64, Ordering::Relaxed);
        }
        send_reply(
            store,
            stream,
            MessageType::Batch,
            last_accepted.load(Ordering::SeqCst),
        )
        .await?;
    }
}
