//! The subscription supervisor.
//!
//! Arbitrates workers per subscription id: one active worker unless every
//! party opened Concurrent, a FIFO queue for WaitForFree, eviction for
//! TakeOver, and an explicit drop API. Registration counts as successful
//! communication so rapid worker oscillation never trips the erroneous
//! period on its own.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use loamdb_cluster::{ClusterCommand, ConsensusLog, SubscriptionRecord};
use loamdb_store::DocumentStore;
use loamdb_transport::{
    cancel_pair, ensure_supported, read_json_frame, write_json_frame, CancelHandle, CancelReason,
    CancelToken, DynStream, HeartbeatConfig, TcpConnectionHeader, TcpOperation,
    SUBSCRIPTION_PROTOCOL_VERSION,
};

use crate::connection::{DropSignal, SubscriptionConnection};
use crate::error::{Result, SubscriptionError};
use crate::messages::{
    DropCause, SubscriptionConnectOptions, SubscriptionOpeningStrategy, SubscriptionStatus,
    SubscriptionStatusMessage,
};
use crate::state::SubscriptionStore;

/// Tunables for the subscription engine.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionConfig {
    /// Heartbeat timing for worker connections.
    pub heartbeat: HeartbeatConfig,
}

struct ActiveConnection {
    worker_id: Uuid,
    strategy: SubscriptionOpeningStrategy,
    cancel: CancelHandle,
    drop_signal: DropSignal,
}

struct Parked {
    stream: DynStream,
    options: SubscriptionConnectOptions,
}

struct SubEntry {
    active: Vec<ActiveConnection>,
    waiting: VecDeque<Parked>,
    turn: Arc<tokio::sync::Mutex<()>>,
    last_success: Instant,
}

impl SubEntry {
    fn new() -> Self {
        Self {
            active: Vec::new(),
            waiting: VecDeque::new(),
            turn: Arc::new(tokio::sync::Mutex::new(())),
            last_success: Instant::now(),
        }
    }
}

enum Admit {
    Activate {
        worker_id: Uuid,
        token: CancelToken,
        drop_signal: DropSignal,
        turn: Option<Arc<tokio::sync::Mutex<()>>>,
    },
    Reject(String),
}

/// Arbitrates worker connections for every subscription of one database.
pub struct SubscriptionSupervisor {
    store: Arc<DocumentStore>,
    consensus: Arc<dyn ConsensusLog>,
    subs: Arc<SubscriptionStore>,
    config: SubscriptionConfig,
    entries: Mutex<HashMap<u64, SubEntry>>,
    cancel_token: CancelToken,
    cancel_handle: CancelHandle,
}

impl SubscriptionSupervisor {
    /// Create a supervisor over a store and the cluster log.
    pub fn new(
        store: Arc<DocumentStore>,
        consensus: Arc<dyn ConsensusLog>,
        config: SubscriptionConfig,
    ) -> Arc<Self> {
        let subs = Arc::new(SubscriptionStore::new(consensus.clone(), store.database()));
        let (cancel_token, cancel_handle) = cancel_pair();
        Arc::new(Self {
            store,
            consensus,
            subs,
            config,
            entries: Mutex::new(HashMap::new()),
            cancel_token,
            cancel_handle,
        })
    }

    /// The definition store for this database.
    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subs
    }

    /// Dispatch an accepted connection whose header named the Subscription
    /// operation.
    pub async fn accept_connection(
        self: &Arc<Self>,
        mut stream: DynStream,
        header: TcpConnectionHeader,
    ) -> Result<()> {
        if header.operation != TcpOperation::Subscription {
            return Err(SubscriptionError::Protocol {
                msg: format!(
                    "unexpected operation {:?} on subscription listener",
                    header.operation
                ),
            });
        }
        if let Err(e) = ensure_supported(SUBSCRIPTION_PROTOCOL_VERSION, header.protocol_version) {
            let _ = self
                .send_status(&mut stream, SubscriptionStatus::Invalid, Some(e.to_string()))
                .await;
            return Err(SubscriptionError::Transport(e));
        }
        if header.database != self.store.database() || self.store.is_deleted() {
            let err = SubscriptionError::DatabaseDoesNotExist {
                database: header.database.clone(),
            };
            let _ = self
                .send_status(&mut stream, SubscriptionStatus::DatabaseGone, Some(err.to_string()))
                .await;
            return Err(err);
        }

        let options: SubscriptionConnectOptions = read_json_frame(&mut stream).await?;
        let record = match self.subs.get(&options.subscription_name)? {
            Some(record) => record,
            None => {
                let err = if self.store.is_deleted() {
                    SubscriptionError::DatabaseDoesNotExist {
                        database: self.store.database().to_string(),
                    }
                } else {
                    SubscriptionError::NotFound {
                        name: options.subscription_name.clone(),
                    }
                };
                let status = match &err {
                    SubscriptionError::DatabaseDoesNotExist { .. } => {
                        SubscriptionStatus::DatabaseGone
                    }
                    _ => SubscriptionStatus::NotFound,
                };
                let _ = self.send_status(&mut stream, status, Some(err.to_string())).await;
                return Err(err);
            }
        };
        if record.disabled {
            let reason = format!("subscription '{}' is disabled", record.name);
            let _ = self
                .send_status(&mut stream, SubscriptionStatus::Invalid, Some(reason.clone()))
                .await;
            return Err(SubscriptionError::Closed {
                name: record.name,
                reason,
            });
        }

        self.register(stream, options, record).await
    }

    async fn register(
        self: &Arc<Self>,
        mut stream: DynStream,
        options: SubscriptionConnectOptions,
        record: SubscriptionRecord,
    ) -> Result<()> {
        let admit = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let entry = entries.entry(record.id).or_insert_with(SubEntry::new);

            if entry.active.is_empty() {
                Self::admit_active(&self.cancel_token, entry, &options)
            } else {
                match options.strategy {
                    SubscriptionOpeningStrategy::OpenIfFree => Admit::Reject(format!(
                        "subscription '{}' is in use by another worker",
                        record.name
                    )),
                    SubscriptionOpeningStrategy::TakeOver => {
                        for victim in entry.active.drain(..) {
                            *victim.drop_signal.lock().expect("lock poisoned") =
                                Some((DropCause::TakenOver, "taken over".to_string()));
                            victim.cancel.cancel(CancelReason::Superseded);
                        }
                        info!(subscription = %record.name, "worker taking over subscription");
                        Self::admit_active(&self.cancel_token, entry, &options)
                    }
                    SubscriptionOpeningStrategy::WaitForFree => {
                        debug!(subscription = %record.name, "parking worker until subscription is free");
                        entry.waiting.push_back(Parked { stream, options });
                        return Ok(());
                    }
                    SubscriptionOpeningStrategy::Concurrent => {
                        if entry
                            .active
                            .iter()
                            .all(|a| a.strategy == SubscriptionOpeningStrategy::Concurrent)
                        {
                            Self::admit_active(&self.cancel_token, entry, &options)
                        } else {
                            Admit::Reject(format!(
                                "subscription '{}' is in use with an incompatible strategy",
                                record.name
                            ))
                        }
                    }
                }
            }
        };

        match admit {
            Admit::Activate {
                worker_id,
                token,
                drop_signal,
                turn,
            } => {
                self.start_serving(stream, options, record, worker_id, token, drop_signal, turn);
                Ok(())
            }
            Admit::Reject(reason) => {
                let _ = self
                    .send_status(&mut stream, SubscriptionStatus::InUse, Some(reason.clone()))
                    .await;
                Err(SubscriptionError::InUse { name: record.name })
            }
        }
    }

    fn admit_active(
        root: &CancelToken,
        entry: &mut SubEntry,
        options: &SubscriptionConnectOptions,
    ) -> Admit {
        let worker_id = Uuid::new_v4();
        let (token, handle) = root.child();
        let drop_signal: DropSignal = Arc::new(Mutex::new(None));
        entry.active.push(ActiveConnection {
            worker_id,
            strategy: options.strategy,
            cancel: handle,
            drop_signal: drop_signal.clone(),
        });
        // Registration counts as successful two-way communication.
        entry.last_success = Instant::now();
        let turn = match options.strategy {
            SubscriptionOpeningStrategy::Concurrent => Some(entry.turn.clone()),
            _ => None,
        };
        Admit::Activate {
            worker_id,
            token,
            drop_signal,
            turn,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn start_serving(
        self: &Arc<Self>,
        mut stream: DynStream,
        options: SubscriptionConnectOptions,
        record: SubscriptionRecord,
        worker_id: Uuid,
        token: CancelToken,
        drop_signal: DropSignal,
        turn: Option<Arc<tokio::sync::Mutex<()>>>,
    ) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .set_connection_info(
                    &record.name,
                    Some(format!("worker {worker_id} ({:?})", options.strategy)),
                )
                .await;

            let connection = SubscriptionConnection::new(
                supervisor.store.clone(),
                supervisor.consensus.clone(),
                supervisor.subs.clone(),
                supervisor.config.clone(),
                record.name.clone(),
                record.id,
                worker_id,
                options,
                token,
                drop_signal,
                turn,
            );
            let result = connection.run(&mut stream, &supervisor).await;
            match &result {
                Ok(()) => debug!(subscription = %record.name, %worker_id, "connection finished"),
                Err(e) => debug!(subscription = %record.name, %worker_id, error = %e, "connection ended"),
            }

            supervisor.set_connection_info(&record.name, None).await;
            supervisor.connection_closed(record.id, worker_id).await;
        });
    }

    async fn set_connection_info(&self, name: &str, info: Option<String>) {
        let command = ClusterCommand::SetSubscriptionConnectionInfo {
            database: self.store.database().to_string(),
            name: name.to_string(),
            info,
        };
        if let Err(e) = self.consensus.append_command(command).await {
            debug!(error = %e, "failed to record subscription connection info");
        }
    }

    /// Called when an active connection's task exits: runs the promotion
    /// rule, handing the subscription to the head of the WaitForFree queue.
    async fn connection_closed(self: &Arc<Self>, sub_id: u64, worker_id: Uuid) {
        let promoted = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let Some(entry) = entries.get_mut(&sub_id) else {
                return;
            };
            entry.active.retain(|a| a.worker_id != worker_id);
            if entry.active.is_empty() {
                entry.waiting.pop_front()
            } else {
                None
            }
        };

        if let Some(parked) = promoted {
            let name = parked.options.subscription_name.clone();
            debug!(subscription = %name, "promoting parked worker");
            match self.subs.get(&name) {
                Ok(Some(record)) => {
                    if let Err(e) = self.register(parked.stream, parked.options, record).await {
                        warn!(subscription = %name, error = %e, "failed to promote parked worker");
                    }
                }
                _ => {
                    // Subscription vanished while the worker was parked; the
                    // stream closes and the worker surfaces an error.
                    debug!(subscription = %name, "dropping parked worker: subscription gone");
                }
            }
        }
    }

    /// Record a successful two-way exchange for a subscription.
    pub fn note_success(&self, sub_id: u64) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        if let Some(entry) = entries.get_mut(&sub_id) {
            entry.last_success = Instant::now();
        }
    }

    /// Time since the last successful two-way communication, or None when
    /// the subscription has no connection state.
    pub fn time_since_last_success(&self, sub_id: u64) -> Option<Duration> {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(&sub_id).map(|e| e.last_success.elapsed())
    }

    /// Number of currently active workers for a subscription.
    pub fn active_worker_count(&self, sub_id: u64) -> usize {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(&sub_id).map(|e| e.active.len()).unwrap_or(0)
    }

    /// Number of parked WaitForFree workers for a subscription.
    pub fn waiting_worker_count(&self, sub_id: u64) -> usize {
        let entries = self.entries.lock().expect("lock poisoned");
        entries.get(&sub_id).map(|e| e.waiting.len()).unwrap_or(0)
    }

    /// Close the active workers' transports with the given reason and
    /// re-run the promotion rule.
    pub fn drop_subscription_connection(&self, sub_id: u64, reason: &str) {
        let victims: Vec<ActiveConnection> = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            match entries.get_mut(&sub_id) {
                Some(entry) => entry.active.drain(..).collect(),
                None => Vec::new(),
            }
        };
        for victim in victims {
            let cause = if reason == "taken over" {
                DropCause::TakenOver
            } else {
                DropCause::Dropped
            };
            *victim.drop_signal.lock().expect("lock poisoned") =
                Some((cause, reason.to_string()));
            victim.cancel.cancel(CancelReason::ConnectionDropped);
        }
    }

    /// Drop by subscription name.
    pub fn drop_subscription_connection_by_name(&self, name: &str, reason: &str) -> Result<()> {
        let record = self.subs.get(name)?.ok_or(SubscriptionError::NotFound {
            name: name.to_string(),
        })?;
        self.drop_subscription_connection(record.id, reason);
        Ok(())
    }

    /// Tear every connection down because the database is being deleted.
    /// Workers surface the deletion message rather than a generic close.
    pub fn database_deleted(&self) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        for entry in entries.values_mut() {
            for victim in entry.active.drain(..) {
                *victim.drop_signal.lock().expect("lock poisoned") =
                    Some((DropCause::DatabaseDeleted, String::new()));
                victim.cancel.cancel(CancelReason::DatabaseDeleted);
            }
            entry.waiting.clear();
        }
    }

    /// Shut the supervisor down; every connection observes cancellation.
    pub fn dispose(&self) {
        self.cancel_handle.cancel(CancelReason::Shutdown);
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.clear();
    }

    async fn send_status(
        &self,
        stream: &mut DynStream,
        status: SubscriptionStatus,
        message: Option<String>,
    ) -> Result<()> {
        write_json_frame(stream, &SubscriptionStatusMessage { status, message })
            .await
            .map_err(SubscriptionError::Transport)
    }
}
