//! Outbound replication worker.
//!
//! One worker per destination. A worker owns a single connection attempt:
//! dial, handshake, then stream change-log entries in ascending etag order,
//! batch by batch, acknowledged in order. On failure the worker reports to
//! the loader, which re-queues it with backoff; the published etag survives
//! the failure so progress is never lost.
//!
//! A pull-replication sink runs the same worker inside-out: it dials the
//! hub, asks to be served, and then receives like an inbound handler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use loamdb_store::{ChangeVector, DocumentStore, StoreError};
use loamdb_transport::{
    write_json_frame, BatchMessage, CancelToken, DynStream, MessageType,
    ReplicationLatestEtagRequest, ReplicationMessageReply, ReplyType, TcpConnectionHeader,
    TcpOperation, REPLICATION_PROTOCOL_VERSION,
};

use crate::batch::{classify_error_reply, read_reply, send_batch};
use crate::connector::Connector;
use crate::destination::ReplicationDestination;
use crate::error::{ReplError, Result};
use crate::incoming::receive_batches;
use crate::loader::ReplicationConfig;

/// Life-cycle of an outbound worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutgoingState {
    /// Created, not yet dialing.
    NotStarted,
    /// Establishing the TCP connection.
    Connecting,
    /// Version handshake and etag negotiation.
    Negotiating,
    /// Sending batches.
    Streaming,
    /// Caught up; waiting for changes, heartbeating.
    Idle,
    /// Queued for another connection attempt after a failure.
    Reconnecting,
    /// Terminated.
    Closed,
}

/// Counters for one outbound worker.
#[derive(Debug, Default)]
pub struct OutgoingStats {
    /// Batches acknowledged by the destination.
    pub batches_sent: AtomicU64,
    /// Entries acknowledged by the destination.
    pub entries_sent: AtomicU64,
    /// Heartbeats sent while idle.
    pub heartbeats_sent: AtomicU64,
}

/// One outbound replication worker.
pub struct OutgoingReplicationHandler {
    store: Arc<DocumentStore>,
    destination: Mutex<ReplicationDestination>,
    config: ReplicationConfig,
    state: Mutex<OutgoingState>,
    last_sent_etag: AtomicU64,
    has_acked: AtomicBool,
    last_accepted_change_vector: Mutex<Option<ChangeVector>>,
    delay: Mutex<Duration>,
    next_replicate_at: Mutex<Option<Instant>>,
    settings_changed: Notify,
    cancel: CancelToken,
    /// Worker counters.
    pub stats: OutgoingStats,
}

impl OutgoingReplicationHandler {
    /// Create a worker for a destination.
    pub fn new(
        store: Arc<DocumentStore>,
        destination: ReplicationDestination,
        config: ReplicationConfig,
        cancel: CancelToken,
    ) -> Arc<Self> {
        let delay = destination.delay();
        Arc::new(Self {
            store,
            destination: Mutex::new(destination),
            config,
            state: Mutex::new(OutgoingState::NotStarted),
            last_sent_etag: AtomicU64::new(0),
            has_acked: AtomicBool::new(false),
            last_accepted_change_vector: Mutex::new(None),
            delay: Mutex::new(delay),
            next_replicate_at: Mutex::new(None),
            settings_changed: Notify::new(),
            cancel,
            stats: OutgoingStats::default(),
        })
    }

    /// Current life-cycle state.
    pub fn state(&self) -> OutgoingState {
        *self.state.lock().expect("lock poisoned")
    }

    pub(crate) fn set_state(&self, state: OutgoingState) {
        *self.state.lock().expect("lock poisoned") = state;
    }

    /// A copy of the destination this worker serves.
    pub fn destination(&self) -> ReplicationDestination {
        self.destination.lock().expect("lock poisoned").clone()
    }

    /// Highest etag the destination has acknowledged. Monotone.
    pub fn published_etag(&self) -> u64 {
        self.last_sent_etag.load(Ordering::SeqCst)
    }

    /// True once the destination has acknowledged at least one exchange.
    pub fn has_acked(&self) -> bool {
        self.has_acked.load(Ordering::SeqCst)
    }

    /// The destination's change vector from its latest acknowledgement.
    pub fn last_accepted_change_vector(&self) -> Option<ChangeVector> {
        self.last_accepted_change_vector
            .lock()
            .expect("lock poisoned")
            .clone()
    }

    fn publish_etag(&self, etag: u64) {
        self.last_sent_etag.fetch_max(etag, Ordering::SeqCst);
    }

    /// Seed the published etag from loader-retained progress when a worker
    /// restarts after a failure. Keeps the published value monotone across
    /// reconnects.
    pub(crate) fn publish_etag_floor(&self, etag: u64, acked: bool) {
        self.last_sent_etag.fetch_max(etag, Ordering::SeqCst);
        if acked {
            self.has_acked.store(true, Ordering::SeqCst);
        }
    }

    /// Change the replication delay at runtime. Clears the next-replicate
    /// deadline so the new value takes effect immediately.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().expect("lock poisoned") = delay;
        *self.next_replicate_at.lock().expect("lock poisoned") = None;
        self.settings_changed.notify_waiters();
    }

    /// Current replication delay.
    pub fn delay(&self) -> Duration {
        *self.delay.lock().expect("lock poisoned")
    }

    /// Update mutable destination properties in place. Called by the
    /// reconciler for kept destinations instead of recycling the worker.
    pub fn update_destination(&self, destination: ReplicationDestination) {
        let new_delay = destination.delay();
        let delay_changed = new_delay != self.delay();
        *self.destination.lock().expect("lock poisoned") = destination;
        if delay_changed {
            self.set_delay(new_delay);
        }
    }

    fn check_cancel(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ReplError::Cancelled(
                self.cancel.reason().unwrap_or_default(),
            ));
        }
        Ok(())
    }

    fn etag_request(&self, serve_as_hub: Option<String>) -> ReplicationLatestEtagRequest {
        ReplicationLatestEtagRequest {
            source_node_tag: self.store.node_tag().to_string(),
            source_machine_name: hostname(),
            source_database_id: self.store.database_id().to_string(),
            source_database_name: self.store.database().to_string(),
            source_url: String::new(),
            last_sent_etag: self.published_etag(),
            serve_as_hub,
        }
    }

    /// Run one connection attempt: dial, handshake, stream until failure or
    /// cancellation.
    pub async fn connect_and_run(self: &Arc<Self>, connector: &dyn Connector) -> Result<()> {
        self.check_cancel()?;
        let destination = self.destination();
        self.set_state(OutgoingState::Connecting);
        let mut stream = connector.connect(destination.url()).await?;

        self.set_state(OutgoingState::Negotiating);
        let header = TcpConnectionHeader {
            operation: TcpOperation::Replication,
            protocol_version: REPLICATION_PROTOCOL_VERSION,
            database: destination.database().to_string(),
        };
        write_json_frame(&mut stream, &header).await.map_err(ReplError::Transport)?;

        match &destination {
            ReplicationDestination::ExternalSink { hub_name, .. } => {
                // Sink path: ask the hub to serve us, then receive.
                let request = self.etag_request(Some(hub_name.clone()));
                write_json_frame(&mut stream, &request)
                    .await
                    .map_err(ReplError::Transport)?;
                info!(hub = %hub_name, url = %destination.url(), "pulling from hub");
                self.set_state(OutgoingState::Streaming);
                let result = receive_batches(
                    &self.store,
                    &mut stream,
                    &self.last_sent_etag,
                    &self.config,
                    &self.cancel,
                    None,
                )
                .await;
                self.set_state(OutgoingState::Closed);
                result
            }
            _ => {
                let request = self.etag_request(None);
                write_json_frame(&mut stream, &request)
                    .await
                    .map_err(ReplError::Transport)?;

                let reply = read_reply(&mut stream, self.config.reply_timeout).await?;
                if reply.reply_type == ReplyType::Error {
                    return Err(classify_error_reply(&reply, destination.database()));
                }
                self.accept_reply(&reply);
                debug!(
                    destination = %destination.describe(),
                    resume_from = reply.last_etag_accepted,
                    "negotiated last etag"
                );
                self.stream_batches(&mut stream).await
            }
        }
    }

    fn accept_reply(&self, reply: &ReplicationMessageReply) {
        self.publish_etag(reply.last_etag_accepted);
        self.has_acked.store(true, Ordering::SeqCst);
        if let Ok(vector) = reply.database_change_vector.parse::<ChangeVector>() {
            *self
                .last_accepted_change_vector
                .lock()
                .expect("lock poisoned") = Some(vector);
        }
    }

    /// Serve an already-negotiated inbound socket as if this worker were
    /// outbound: the pull-replication hub path. `start_etag` comes from the
    /// sink's etag request.
    pub async fn run_as_hub(self: &Arc<Self>, stream: &mut DynStream, start_etag: u64) -> Result<()> {
        self.publish_etag(start_etag);
        self.set_state(OutgoingState::Streaming);
        let result = self.stream_batches(stream).await;
        self.set_state(OutgoingState::Closed);
        result
    }

    /// The streaming loop: collect entries above the published etag, send,
    /// await acknowledgement; heartbeat while idle.
    async fn stream_batches(self: &Arc<Self>, stream: &mut DynStream) -> Result<()> {
        loop {
            self.check_cancel()?;

            let pending_hold = {
                let now = Instant::now();
                let mut slot = self.next_replicate_at.lock().expect("lock poisoned");
                match *slot {
                    Some(deadline) if deadline > now => Some(deadline - now),
                    Some(_) => {
                        *slot = None;
                        None
                    }
                    None => None,
                }
            };
            if let Some(remaining) = pending_hold {
                self.set_state(OutgoingState::Idle);
                self.held_wait(stream, remaining).await?;
                continue;
            }

            let delay = self.delay();
            let from = self.published_etag();
            let (items, hold_for) = self.collect_batch(from, delay)?;

            if items.is_empty() {
                if let Some(hold) = hold_for {
                    // Entries exist but are inside the delay window; sleep
                    // instead of spinning on the change notification.
                    *self.next_replicate_at.lock().expect("lock poisoned") =
                        Some(Instant::now() + hold);
                    continue;
                }
                self.set_state(OutgoingState::Idle);
                self.idle_wait(stream).await?;
                continue;
            }

            self.set_state(OutgoingState::Streaming);
            let scanned_max = items.last().map(|e| e.etag).unwrap_or(from);
            let mut payloads = Vec::with_capacity(items.len());
            let mut kept = Vec::with_capacity(items.len());
            for entry in items {
                match self.store.payload_for(&entry) {
                    Ok(payload) => {
                        kept.push(entry);
                        payloads.push(payload);
                    }
                    // Superseded mid-flight; the newer entry will carry it.
                    Err(StoreError::DocumentNotFound { .. }) => continue,
                    Err(e) => return Err(ReplError::Store(e)),
                }
            }
            let last_etag_in_batch = match kept.last() {
                Some(entry) => entry.etag,
                None => {
                    // Everything in the window was superseded; skip past it.
                    self.publish_etag(scanned_max);
                    continue;
                }
            };
            let message = BatchMessage {
                items: kept,
                last_etag_in_batch,
            };
            let count = message.items.len() as u64;
            send_batch(stream, &message, &payloads).await?;

            let reply = read_reply(stream, self.config.reply_timeout).await?;
            match reply.reply_type {
                ReplyType::Ok => {
                    self.accept_reply(&reply);
                    self.publish_etag(last_etag_in_batch);
                    self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.entries_sent.fetch_add(count, Ordering::Relaxed);
                }
                ReplyType::Error => {
                    let destination = self.destination();
                    warn!(destination = %destination.describe(), "batch rejected by peer");
                    return Err(classify_error_reply(&reply, destination.database()));
                }
            }
        }
    }

    /// Gather entries above `from`, oldest first, respecting the delay.
    /// Stops at the first entry still inside the delay window so order per
    /// destination is preserved; returns how long that entry must be held.
    fn collect_batch(
        &self,
        from: u64,
        delay: Duration,
    ) -> Result<(Vec<loamdb_store::ChangeLogEntry>, Option<Duration>)> {
        let now_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let delay_ms = delay.as_millis() as u64;

        let mut items = Vec::new();
        let mut hold_for = None;
        for entry in self.store.scan_all(from)? {
            if delay_ms > 0 {
                let eligible_at = entry.modified_at_ms.saturating_add(delay_ms);
                if eligible_at > now_ms {
                    hold_for = Some(Duration::from_millis(eligible_at - now_ms));
                    break;
                }
            }
            items.push(entry);
            if items.len() >= self.config.max_items_per_batch {
                break;
            }
        }
        Ok((items, hold_for))
    }

    /// Wait for new data, a settings change, or the heartbeat tick. Sends a
    /// heartbeat when the tick fires so the transport stays alive.
    async fn idle_wait(self: &Arc<Self>, stream: &mut DynStream) -> Result<()> {
        let from = self.published_etag();
        tokio::select! {
            reason = self.cancel.cancelled() => Err(ReplError::Cancelled(reason)),
            changed = self.store.wait_for_change(from) => {
                changed?;
                Ok(())
            }
            _ = self.settings_changed.notified() => Ok(()),
            _ = tokio::time::sleep(self.config.heartbeat.interval) => {
                self.send_heartbeat(stream).await
            }
        }
    }

    /// Wait out a delay-replication hold. No change-notification arm: the
    /// held entry is already committed, so waking on writes would spin.
    async fn held_wait(self: &Arc<Self>, stream: &mut DynStream, remaining: Duration) -> Result<()> {
        let sleep_for = remaining
            .min(self.config.heartbeat.interval)
            .max(Duration::from_millis(1));
        tokio::select! {
            reason = self.cancel.cancelled() => Err(ReplError::Cancelled(reason)),
            _ = self.settings_changed.notified() => Ok(()),
            _ = tokio::time::sleep(sleep_for) => {
                if sleep_for >= self.config.heartbeat.interval {
                    self.send_heartbeat(stream).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn send_heartbeat(self: &Arc<Self>, stream: &mut DynStream) -> Result<()> {
        let message = BatchMessage {
            items: vec![],
            last_etag_in_batch: self.published_etag(),
        };
        send_batch(stream, &message, &[]).await?;
        let reply = read_reply(stream, self.config.reply_timeout).await?;
        self.stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        match reply.reply_type {
            ReplyType::Ok => {
                debug_assert!(matches!(
                    reply.message_type,
                    MessageType::Heartbeat | MessageType::Batch
                ));
                self.accept_reply(&reply);
                Ok(())
            }
            ReplyType::Error => {
                let destination = self.destination();
                Err(classify_error_reply(&reply, destination.database()))
            }
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loamdb_store::StoreConfig;
    use loamdb_transport::cancel_pair;
    use serde_json::json;

    fn handler(delay: Duration) -> Arc<OutgoingReplicationHandler> {
        let store = DocumentStore::new(StoreConfig::default());
        let destination = ReplicationDestination::ExternalRegular {
            connection_string: loamdb_cluster::ConnectionString {
                name: "cs".into(),
                url: "tcp://peer:10300".into(),
                database: "north".into(),
            },
            task_id: 1,
            mentor_node: None,
            delay,
        };
        let (token, _handle) = cancel_pair();
        OutgoingReplicationHandler::new(store, destination, ReplicationConfig::default(), token)
    }

    #[test]
    fn test_published_etag_is_monotone() {
        let h = handler(Duration::ZERO);
        h.publish_etag(10);
        h.publish_etag(5);
        assert_eq!(h.published_etag(), 10);
        h.publish_etag(12);
        assert_eq!(h.published_etag(), 12);
    }

    #[test]
    fn test_collect_batch_respects_order_and_size() {
        let h = handler(Duration::ZERO);
        for i in 0..10 {
            h.store
                .put_document(&format!("users/{i}"), "Users", json!({ "i": i }))
                .unwrap();
        }
        let (items, hold) = h.collect_batch(0, Duration::ZERO).unwrap();
        assert_eq!(items.len(), 10);
        assert!(hold.is_none());
        assert!(items.windows(2).all(|w| w[0].etag < w[1].etag));

        let (items, _) = h.collect_batch(5, Duration::ZERO).unwrap();
        assert!(items.iter().all(|e| e.etag > 5));
    }

    #[test]
    fn test_collect_batch_holds_delayed_entries() {
        let h = handler(Duration::from_secs(3600));
        h.store.put_document("users/1", "Users", json!({})).unwrap();
        let (items, hold) = h.collect_batch(0, Duration::from_secs(3600)).unwrap();
        assert!(items.is_empty());
        let hold = hold.expect("fresh write must be held back");
        assert!(hold > Duration::from_secs(3000));
    }

    #[test]
    fn test_set_delay_clears_next_replicate() {
        let h = handler(Duration::from_secs(60));
        *h.next_replicate_at.lock().unwrap() = Some(Instant::now() + Duration::from_secs(60));
        h.set_delay(Duration::ZERO);
        assert!(h.next_replicate_at.lock().unwrap().is_none());
        assert_eq!(h.delay(), Duration::ZERO);
    }

    #[test]
    fn test_update_destination_applies_delay_change() {
        let h = handler(Duration::from_secs(60));
        let mut destination = h.destination();
        if let ReplicationDestination::ExternalRegular { delay, .. } = &mut destination {
            *delay = Duration::from_secs(1);
        }
        h.update_destination(destination);
        assert_eq!(h.delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_initial_state() {
        let h = handler(Duration::ZERO);
        assert_eq!(h.state(), OutgoingState::NotStarted);
        assert!(!h.has_acked());
        assert_eq!(h.published_etag(), 0);
    }
}
