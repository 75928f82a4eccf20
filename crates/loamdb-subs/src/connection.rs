//! The per-worker subscription connection.
//!
//! Runs the fetch-filter-batch-ack loop over one accepted worker stream:
//! resolve the cursor from the consensus-stored definition, scan the change
//! log strictly above it (bucket order on a sharded node), filter, ship a
//! batch, and advance the cursor on acknowledgement. Because the cursor is
//! re-read from the definition every round, an administrative cursor jump
//! takes effect at the next batch boundary and skipped entries are never
//! delivered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;
use uuid::Uuid;

use loamdb_cluster::{ClusterStateView, ConsensusLog};
use loamdb_store::bucket::is_authoritative;
use loamdb_store::{ChangeVector, DocumentStore, EntryKind, Payload, StoreError};
use loamdb_transport::{
    read_json_frame, write_json_frame, CancelToken, DynStream,
};

use crate::criteria::SubscriptionCriteria;
use crate::error::{Result, SubscriptionError};
use crate::messages::{
    BatchAck, BatchItem, DropCause, ServerFrame, SubscriptionConnectOptions, SubscriptionStatus,
    SubscriptionStatusMessage,
};
use crate::state::SubscriptionStore;
use crate::supervisor::{SubscriptionConfig, SubscriptionSupervisor};

/// Counters for one subscription connection.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Batches shipped to the worker.
    pub batches_sent: AtomicU64,
    /// Documents shipped to the worker.
    pub docs_sent: AtomicU64,
    /// Acknowledgements received.
    pub acks_received: AtomicU64,
}

/// A pending drop requested by the supervisor, delivered to the worker as
/// a terminal frame.
pub(crate) type DropSignal = Arc<Mutex<Option<(DropCause, String)>>>;

/// One active worker connection.
pub struct SubscriptionConnection {
    store: Arc<DocumentStore>,
    consensus: Arc<dyn ConsensusLog>,
    subs: Arc<SubscriptionStore>,
    config: SubscriptionConfig,
    name: String,
    sub_id: u64,
    worker_id: Uuid,
    options: SubscriptionConnectOptions,
    cancel: CancelToken,
    drop_signal: DropSignal,
    /// FIFO turn lock shared by Concurrent workers of one subscription;
    /// None for single-active strategies.
    turn: Option<Arc<tokio::sync::Mutex<()>>>,
    /// Connection counters.
    pub stats: ConnectionStats,
}

impl SubscriptionConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<DocumentStore>,
        consensus: Arc<dyn ConsensusLog>,
        subs: Arc<SubscriptionStore>,
        config: SubscriptionConfig,
        name: String,
        sub_id: u64,
        worker_id: Uuid,
        options: SubscriptionConnectOptions,
        cancel: CancelToken,
        drop_signal: DropSignal,
        turn: Option<Arc<tokio::sync::Mutex<()>>>,
    ) -> Self {
        Self {
            store,
            consensus,
            subs,
            config,
            name,
            sub_id,
            worker_id,
            options,
            cancel,
            drop_signal,
            turn,
            stats: ConnectionStats::default(),
        }
    }

    /// The worker this connection serves.
    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    fn deletion_error(&self) -> SubscriptionError {
        SubscriptionError::SubscriptionDoesNotExist {
            name: self.name.clone(),
            node_tag: self.store.node_tag().to_string(),
            database: self.store.database().to_string(),
        }
    }

    async fn send_drop(
        &self,
        stream: &mut DynStream,
        cause: DropCause,
        message: String,
    ) -> Result<()> {
        let frame = ServerFrame::Dropped { cause, message };
        write_json_frame(stream, &frame)
            .await
            .map_err(SubscriptionError::Transport)
    }

    async fn handle_cancel(&self, stream: &mut DynStream) -> SubscriptionError {
        let pending = self.drop_signal.lock().expect("lock poisoned").take();
        let (cause, message) = pending.unwrap_or((
            DropCause::Dropped,
            "connection closed".to_string(),
        ));
        if cause == DropCause::DatabaseDeleted {
            let err = self.deletion_error();
            let _ = self.send_drop(stream, cause, err.to_string()).await;
            return err;
        }
        let _ = self.send_drop(stream, cause, message.clone()).await;
        SubscriptionError::Closed {
            name: self.name.clone(),
            reason: message,
        }
    }

    /// Serve the worker until the stream fails, the worker is dropped, or
    /// the database goes away.
    pub async fn run(
        &self,
        stream: &mut DynStream,
        supervisor: &Arc<SubscriptionSupervisor>,
    ) -> Result<()> {
        write_json_frame(
            stream,
            &SubscriptionStatusMessage {
                status: SubscriptionStatus::Accepted,
                message: None,
            },
        )
        .await
        .map_err(SubscriptionError::Transport)?;

        loop {
            if self.cancel.is_cancelled() {
                return Err(self.handle_cancel(stream).await);
            }
            if self.store.is_deleted() {
                let err = self.deletion_error();
                let _ = self
                    .send_drop(stream, DropCause::DatabaseDeleted, err.to_string())
                    .await;
                return Err(err);
            }

            // Hold the turn before resolving the cursor so Concurrent
            // workers each see the cursor left by the previous batch.
            let _turn = match &self.turn {
                Some(turn) => Some(turn.lock().await),
                None => None,
            };

            let record = match self.subs.get(&self.name)? {
                Some(record) => record,
                None => {
                    if self.store.is_deleted() {
                        let err = self.deletion_error();
                        let _ = self
                            .send_drop(stream, DropCause::DatabaseDeleted, err.to_string())
                            .await;
                        return Err(err);
                    }
                    let err = SubscriptionError::NotFound {
                        name: self.name.clone(),
                    };
                    let _ = self
                        .send_drop(stream, DropCause::SubscriptionRemoved, err.to_string())
                        .await;
                    return Err(err);
                }
            };
            if record.disabled {
                let reason = format!("subscription '{}' was disabled", self.name);
                let _ = self.send_drop(stream, DropCause::Dropped, reason.clone()).await;
                return Err(SubscriptionError::Closed {
                    name: self.name.clone(),
                    reason,
                });
            }

            let criteria = SubscriptionCriteria::parse(&record.query)?;
            let cursor: ChangeVector = record.change_vector_cursor.parse().unwrap_or_default();
            let from_etag = cursor.etag_for(self.store.database_id());

            let (items, next_cursor, scanned_tail) =
                match self.collect_batch(&criteria, &cursor, from_etag) {
                    Ok(collected) => collected,
                    Err(SubscriptionError::Store(StoreError::DatabaseDoesNotExist { .. })) => {
                        let err = self.deletion_error();
                        let _ = self
                            .send_drop(stream, DropCause::DatabaseDeleted, err.to_string())
                            .await;
                        return Err(err);
                    }
                    Err(e) => return Err(e),
                };

            if items.is_empty() {
                drop(_turn);
                match self.wait_at_tail(stream, scanned_tail.max(from_etag)).await {
                    Ok(()) => continue,
                    Err(e) => return Err(e),
                }
            }

            let frame = ServerFrame::Batch {
                items: items.clone(),
                last_change_vector: next_cursor.to_string(),
            };
            write_json_frame(stream, &frame)
                .await
                .map_err(SubscriptionError::Transport)?;
            self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
            self.stats
                .docs_sent
                .fetch_add(items.len() as u64, Ordering::Relaxed);

            let ack = match self.read_ack(stream).await {
                Ok(ack) => ack,
                Err(SubscriptionError::Cancelled(_)) => {
                    return Err(self.handle_cancel(stream).await)
                }
                Err(e) => return Err(e),
            };
            self.stats.acks_received.fetch_add(1, Ordering::Relaxed);

            if ack.is_ok() || self.options.ignore_subscriber_errors {
                self.subs
                    .acknowledge(
                        &self.name,
                        &next_cursor,
                        Some(format!("{} documents", items.len())),
                    )
                    .await?;
                supervisor.note_success(self.sub_id);
            } else {
                // Leave the cursor intact and surface a connection error;
                // the worker reconnects and the batch is re-served.
                let message = ack.error.unwrap_or_else(|| "subscriber failed".to_string());
                let _ = self
                    .send_drop(stream, DropCause::SubscriberError, message.clone())
                    .await;
                return Err(SubscriptionError::SubscriberError { message });
            }
        }
    }

    /// Collect up to `max_docs_per_batch` matching documents strictly above
    /// the cursor. Returns the batch, the cursor after it, and the highest
    /// etag the scan looked at (for tail waits).
    fn collect_batch(
        &self,
        criteria: &SubscriptionCriteria,
        cursor: &ChangeVector,
        from_etag: u64,
    ) -> Result<(Vec<BatchItem>, ChangeVector, u64)> {
        let view = ClusterStateView::capture(
            self.consensus.as_ref(),
            self.store.database(),
            self.store.node_tag(),
        )?;
        let sharded = view.as_ref().map(|v| v.record().is_sharded()).unwrap_or(false);

        let scan = if sharded {
            self.store.scan_all_by_bucket_order(from_etag)?
        } else {
            self.store.scan_all(from_etag)?
        };

        let mut items = Vec::new();
        let mut next_cursor = cursor.clone();
        let mut scanned_tail = from_etag;
        for entry in scan {
            scanned_tail = scanned_tail.max(entry.etag);
            if entry.kind != EntryKind::Document {
                continue;
            }
            if sharded {
                if let (Some(shard), Some(view)) = (self.store.shard(), view.as_ref()) {
                    let authoritative = is_authoritative(
                        shard,
                        entry.bucket,
                        view.shard_ranges(),
                        view.migrations(),
                    )
                    .unwrap_or(false);
                    if !authoritative {
                        let owner = loamdb_store::bucket::shard_for_write(
                            entry.bucket,
                            view.shard_ranges(),
                            view.migrations(),
                        )
                        .unwrap_or(shard);
                        debug!(id = %entry.id, "skipping document: owner is shard {owner}");
                        continue;
                    }
                }
            }

            let doc = match self.store.payload_for(&entry) {
                Ok(Payload::Document(doc)) => doc,
                Ok(_) => continue,
                Err(StoreError::DocumentNotFound { .. }) => continue,
                Err(e) => return Err(SubscriptionError::Store(e)),
            };
            if !criteria.matches(&doc.collection, &doc.data) {
                continue;
            }

            next_cursor.merge(&entry.change_vector);
            items.push(BatchItem {
                id: doc.id,
                collection: doc.collection,
                data: doc.data,
                change_vector: entry.change_vector.to_string(),
            });
            if items.len() >= self.options.max_docs_per_batch.max(1) {
                break;
            }
        }
        Ok((items, next_cursor, scanned_tail))
    }

    /// At the tail: wait for a change, heartbeating so the transport stays
    /// alive, and watching for cancellation.
    async fn wait_at_tail(&self, stream: &mut DynStream, seen_etag: u64) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            changed = self.store.wait_for_change(seen_etag) => {
                match changed {
                    Ok(()) => Ok(()),
                    Err(StoreError::DatabaseDoesNotExist { .. }) => {
                        let err = self.deletion_error();
                        let _ = self
                            .send_drop(stream, DropCause::DatabaseDeleted, err.to_string())
                            .await;
                        Err(err)
                    }
                    Err(e) => Err(SubscriptionError::Store(e)),
                }
            }
            _ = tokio::time::sleep(self.config.heartbeat.interval) => {
                write_json_frame(stream, &ServerFrame::Heartbeat)
                    .await
                    .map_err(SubscriptionError::Transport)?;
                Ok(())
            }
        }
    }

    async fn read_ack(&self, stream: &mut DynStream) -> Result<BatchAck> {
        let deadline = self.config.heartbeat.max_inactive;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(SubscriptionError::Cancelled(
                    self.cancel.reason().unwrap_or_default(),
                ))
            }
            read = tokio::time::timeout(deadline, read_json_frame::<_, BatchAck>(stream)) => {
                match read {
                    Err(_) => Err(SubscriptionError::Transport(
                        loamdb_transport::TransportError::Timeout {
                            timeout_ms: deadline.as_millis() as u64,
                        },
                    )),
                    Ok(result) => result.map_err(SubscriptionError::Transport),
                }
            }
        }
    }
}
