//! The consensus-log contract and its in-memory implementation.
//!
//! The consensus protocol itself is an external collaborator. This module
//! defines the commands the replication and subscription engines append,
//! the read surface they consume, and an in-process implementation with the
//! same command semantics, used by tests and single-node deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use loamdb_store::{ChangeVector, VectorOrder};

use crate::error::{ClusterError, Result};
use crate::record::{DatabaseRecord, SubscriptionRecord};

/// Cluster key of a subscription blob.
pub fn subscription_key(database: &str, name: &str) -> String {
    format!("subscriptions/{database}/{name}")
}

/// Cluster key of an external replication task's persisted cursor.
pub fn external_cursor_key(database: &str, task_id: u64) -> String {
    format!("external-cursors/{database}/{task_id}")
}

/// A command appended to the consensus log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterCommand {
    /// Install or replace a database record.
    PutDatabaseRecord(DatabaseRecord),
    /// Remove a database record and every value stored under it.
    DeleteDatabaseRecord {
        /// The database to remove.
        database: String,
    },
    /// Install or replace a subscription definition. An id of 0 asks the
    /// state machine to assign the next free id.
    PutSubscription {
        /// Owning database.
        database: String,
        /// The definition to store.
        record: SubscriptionRecord,
    },
    /// Remove a subscription definition.
    DeleteSubscription {
        /// Owning database.
        database: String,
        /// Subscription name.
        name: String,
    },
    /// Advance a subscription's cursor after a worker acknowledgement.
    /// Out-of-order acknowledgements (cursor not strictly ahead of the
    /// stored one) are discarded by the state machine.
    AcknowledgeSubscription {
        /// Owning database.
        database: String,
        /// Subscription name.
        name: String,
        /// The acknowledged change vector.
        change_vector: String,
        /// Operator-facing description of the acknowledged batch.
        batch_info: Option<String>,
    },
    /// Record who is connected to a subscription, for operators. Touches
    /// only the connection-info field so it can never clobber a cursor.
    SetSubscriptionConnectionInfo {
        /// Owning database.
        database: String,
        /// Subscription name.
        name: String,
        /// Operator-facing description of the connection, or None when the
        /// worker disconnected.
        info: Option<String>,
    },
    /// Raise the persisted cursor of an external replication task.
    UpdateExternalCursor {
        /// Owning database.
        database: String,
        /// The external task.
        task_id: u64,
        /// Last confirmed etag; only ever raises the stored value.
        etag: u64,
    },
}

/// The read/append surface of the cluster's consensus log.
#[async_trait]
pub trait ConsensusLog: Send + Sync {
    /// Read the raw database record and the commit index it was read at.
    fn read_raw_database_record(&self, database: &str) -> Result<Option<(DatabaseRecord, u64)>>;

    /// Read a raw cluster value by key.
    fn read_value(&self, key: &str) -> Option<Vec<u8>>;

    /// Read every value whose key starts with `prefix`, sorted by key.
    fn read_values_with_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)>;

    /// Append a command. Resolves to the commit index once accepted.
    async fn append_command(&self, command: ClusterCommand) -> Result<u64>;

    /// Wait until the state machine has applied the given commit index.
    async fn wait_for_index_notification(&self, index: u64, timeout: Duration) -> Result<()>;

    /// Decode the subscription stored under `subscriptions/<db>/<name>`.
    fn read_subscription(&self, database: &str, name: &str) -> Result<Option<SubscriptionRecord>> {
        let key = subscription_key(database, name);
        match self.read_value(&key) {
            None => Ok(None),
            Some(blob) => bincode::deserialize(&blob)
                .map(Some)
                .map_err(|_| ClusterError::MalformedValue { key }),
        }
    }

    /// Decode every subscription of a database.
    fn list_subscriptions(&self, database: &str) -> Result<Vec<SubscriptionRecord>> {
        let prefix = format!("subscriptions/{database}/");
        let mut out = Vec::new();
        for (key, blob) in self.read_values_with_prefix(&prefix) {
            let record = bincode::deserialize(&blob)
                .map_err(|_| ClusterError::MalformedValue { key })?;
            out.push(record);
        }
        Ok(out)
    }

    /// The persisted cursor of an external replication task, or 0.
    fn read_external_cursor(&self, database: &str, task_id: u64) -> u64 {
        self.read_value(&external_cursor_key(database, task_id))
            .and_then(|blob| bincode::deserialize::<u64>(&blob).ok())
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct LogState {
    index: u64,
    next_subscription_id: u64,
    records: HashMap<String, (DatabaseRecord, u64)>,
    values: BTreeMap<String, Vec<u8>>,
}

/// In-process consensus log with the production command semantics.
pub struct InMemoryConsensusLog {
    state: Mutex<LogState>,
    committed_tx: watch::Sender<u64>,
    committed_rx: watch::Receiver<u64>,
}

impl Default for InMemoryConsensusLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConsensusLog {
    /// Create an empty log.
    pub fn new() -> Self {
        let (committed_tx, committed_rx) = watch::channel(0);
        Self {
            state: Mutex::new(LogState::default()),
            committed_tx,
            committed_rx,
        }
    }

    fn apply(state: &mut LogState, command: ClusterCommand) -> Result<()> {
        match command {
            ClusterCommand::PutDatabaseRecord(record) => {
                let index = state.index;
                state
                    .records
                    .insert(record.database.clone(), (record, index));
                Ok(())
            }
            ClusterCommand::DeleteDatabaseRecord { database } => {
                state.records.remove(&database);
                let sub_prefix = format!("subscriptions/{database}/");
                let cursor_prefix = format!("external-cursors/{database}/");
                state
                    .values
                    .retain(|k, _| !k.starts_with(&sub_prefix) && !k.starts_with(&cursor_prefix));
                Ok(())
            }
            ClusterCommand::PutSubscription { database, mut record } => {
                if record.id == 0 {
                    state.next_subscription_id += 1;
                    record.id = state.next_subscription_id;
                }
                let key = subscription_key(&database, &record.name);
                state.values.insert(key, bincode::serialize(&record)?);
                Ok(())
            }
            ClusterCommand::DeleteSubscription { database, name } => {
                state.values.remove(&subscription_key(&database, &name));
                Ok(())
            }
            ClusterCommand::AcknowledgeSubscription {
                database,
                name,
                change_vector,
                batch_info,
            } => {
                let key = subscription_key(&database, &name);
                let blob = state.values.get(&key).ok_or_else(|| {
                    ClusterError::CommandRejected {
                        msg: format!("no subscription '{name}' in database '{database}'"),
                    }
                })?;
                let mut record: SubscriptionRecord = bincode::deserialize(blob)
                    .map_err(|_| ClusterError::MalformedValue { key: key.clone() })?;

                let stored: ChangeVector =
                    record.change_vector_cursor.parse().unwrap_or_default();
                let acked: ChangeVector = change_vector.parse().unwrap_or_default();
                match stored.compare(&acked) {
                    VectorOrder::After | VectorOrder::Equal => {
                        // Out-of-order or duplicate ack; the stored cursor
                        // already covers it.
                        debug!(%name, "discarding out-of-order subscription ack");
                    }
                    VectorOrder::Before => {
                        record.change_vector_cursor = acked.to_string();
                        record.last_batch_info = batch_info;
                        state.values.insert(key, bincode::serialize(&record)?);
                    }
                    VectorOrder::Concurrent => {
                        record.change_vector_cursor = stored.merged(&acked).to_string();
                        record.last_batch_info = batch_info;
                        state.values.insert(key, bincode::serialize(&record)?);
                    }
                }
                Ok(())
            }
            ClusterCommand::SetSubscriptionConnectionInfo { database, name, info } => {
                let key = subscription_key(&database, &name);
                if let Some(blob) = state.values.get(&key) {
                    let mut record: SubscriptionRecord = bincode::deserialize(blob)
                        .map_err(|_| ClusterError::MalformedValue { key: key.clone() })?;
                    record.last_connection_info = info;
                    state.values.insert(key, bincode::serialize(&record)?);
                }
                Ok(())
            }
            ClusterCommand::UpdateExternalCursor {
                database,
                task_id,
                etag,
            } => {
                let key = external_cursor_key(&database, task_id);
                let current = state
                    .values
                    .get(&key)
                    .and_then(|b| bincode::deserialize::<u64>(b).ok())
                    .unwrap_or(0);
                if etag > current {
                    state.values.insert(key, bincode::serialize(&etag)?);
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ConsensusLog for InMemoryConsensusLog {
    fn read_raw_database_record(&self, database: &str) -> Result<Option<(DatabaseRecord, u64)>> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.records.get(database).cloned())
    }

    fn read_value(&self, key: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().expect("lock poisoned");
        state.values.get(key).cloned()
    }

    fn read_values_with_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        let state = self.state.lock().expect("lock poisoned");
        state
            .values
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    async fn append_command(&self, command: ClusterCommand) -> Result<u64> {
        let index = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.index += 1;
            let index = state.index;
            Self::apply(&mut state, command)?;
            index
        };
        let _ = self.committed_tx.send(index);
        Ok(index)
    }

    async fn wait_for_index_notification(&self, index: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.committed_rx.clone();
        let wait = async {
            loop {
                if *rx.borrow() >= index {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClusterError::IndexTimeout {
                index,
                timeout_ms: timeout.as_millis() as u64,
            })
    }
}
