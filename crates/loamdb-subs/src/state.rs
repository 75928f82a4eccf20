//! Subscription definitions persisted through consensus.
//!
//! Every definition lives under `subscriptions/<db>/<name>` in the cluster
//! log; the cursor advances only through the acknowledge command, which
//! serializes concurrent acks per subscription and discards out-of-order
//! ones.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use loamdb_cluster::{ClusterCommand, ConsensusLog, SubscriptionRecord};
use loamdb_store::ChangeVector;

use crate::criteria::SubscriptionCriteria;
use crate::error::{Result, SubscriptionError};

/// Reads and writes subscription definitions for one database.
pub struct SubscriptionStore {
    consensus: Arc<dyn ConsensusLog>,
    database: String,
    commit_timeout: Duration,
}

impl SubscriptionStore {
    /// Create a store over the cluster log.
    pub fn new(consensus: Arc<dyn ConsensusLog>, database: impl Into<String>) -> Self {
        Self {
            consensus,
            database: database.into(),
            commit_timeout: Duration::from_secs(15),
        }
    }

    /// The database these subscriptions belong to.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Create or replace a subscription and wait for the commit. Returns
    /// the stored record with its assigned id.
    pub async fn create(
        &self,
        name: &str,
        criteria: &SubscriptionCriteria,
        initial_cursor: Option<String>,
    ) -> Result<SubscriptionRecord> {
        let record = SubscriptionRecord {
            id: 0,
            name: name.to_string(),
            query: criteria.to_query(),
            change_vector_cursor: initial_cursor.unwrap_or_default(),
            mentor_node: None,
            disabled: false,
            last_connection_info: None,
            last_batch_info: None,
        };
        let index = self
            .consensus
            .append_command(ClusterCommand::PutSubscription {
                database: self.database.clone(),
                record,
            })
            .await?;
        self.consensus
            .wait_for_index_notification(index, self.commit_timeout)
            .await?;
        info!(subscription = %name, database = %self.database, "subscription created");
        self.get(name)?.ok_or(SubscriptionError::NotFound {
            name: name.to_string(),
        })
    }

    /// Read a definition.
    pub fn get(&self, name: &str) -> Result<Option<SubscriptionRecord>> {
        Ok(self.consensus.read_subscription(&self.database, name)?)
    }

    /// All definitions of this database.
    pub fn list(&self) -> Result<Vec<SubscriptionRecord>> {
        Ok(self.consensus.list_subscriptions(&self.database)?)
    }

    /// Remove a definition.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let index = self
            .consensus
            .append_command(ClusterCommand::DeleteSubscription {
                database: self.database.clone(),
                name: name.to_string(),
            })
            .await?;
        self.consensus
            .wait_for_index_notification(index, self.commit_timeout)
            .await?;
        Ok(())
    }

    /// Advance the cursor after a worker acknowledgement. Out-of-order
    /// acknowledgements are discarded by the consensus state machine, so
    /// an admin cursor jump is never clobbered by an in-flight batch.
    pub async fn acknowledge(
        &self,
        name: &str,
        cursor: &ChangeVector,
        batch_info: Option<String>,
    ) -> Result<()> {
        let index = self
            .consensus
            .append_command(ClusterCommand::AcknowledgeSubscription {
                database: self.database.clone(),
                name: name.to_string(),
                change_vector: cursor.to_string(),
                batch_info,
            })
            .await?;
        self.consensus
            .wait_for_index_notification(index, self.commit_timeout)
            .await?;
        Ok(())
    }

    /// Administrative cursor overwrite: replaces the stored cursor
    /// unconditionally. Writes made below the new cursor will never be
    /// delivered.
    pub async fn overwrite_cursor(&self, name: &str, cursor: &str) -> Result<()> {
        let mut record = self.get(name)?.ok_or(SubscriptionError::NotFound {
            name: name.to_string(),
        })?;
        record.change_vector_cursor = cursor.to_string();
        let index = self
            .consensus
            .append_command(ClusterCommand::PutSubscription {
                database: self.database.clone(),
                record,
            })
            .await?;
        self.consensus
            .wait_for_index_notification(index, self.commit_timeout)
            .await?;
        Ok(())
    }

    /// Export every definition, for moving a database.
    pub fn export(&self) -> Result<Vec<SubscriptionRecord>> {
        self.list()
    }

    /// Import definitions into this (presumably empty) database.
    pub async fn import(&self, records: Vec<SubscriptionRecord>) -> Result<()> {
        for record in records {
            let index = self
                .consensus
                .append_command(ClusterCommand::PutSubscription {
                    database: self.database.clone(),
                    record,
                })
                .await?;
            self.consensus
                .wait_for_index_notification(index, self.commit_timeout)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loamdb_cluster::InMemoryConsensusLog;
    use std::collections::BTreeSet;

    fn store() -> SubscriptionStore {
        SubscriptionStore::new(Arc::new(InMemoryConsensusLog::new()), "north")
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_query() {
        let s = store();
        let record = s
            .create("people", &SubscriptionCriteria::collection("Users"), None)
            .await
            .unwrap();
        assert!(record.id > 0);
        assert_eq!(record.query, "from Users");
        assert_eq!(record.change_vector_cursor, "");
    }

    #[tokio::test]
    async fn test_acknowledge_advances() {
        let s = store();
        s.create("people", &SubscriptionCriteria::collection("Users"), None)
            .await
            .unwrap();
        let cursor: ChangeVector = "X:4".parse().unwrap();
        s.acknowledge("people", &cursor, Some("4 docs".into())).await.unwrap();

        let record = s.get("people").unwrap().unwrap();
        assert_eq!(record.change_vector_cursor, "X:4");
        assert_eq!(record.last_batch_info.as_deref(), Some("4 docs"));
    }

    #[tokio::test]
    async fn test_stale_ack_does_not_regress_cursor() {
        let s = store();
        s.create("people", &SubscriptionCriteria::collection("Users"), None)
            .await
            .unwrap();
        s.overwrite_cursor("people", "X:10").await.unwrap();

        let stale: ChangeVector = "X:4".parse().unwrap();
        s.acknowledge("people", &stale, None).await.unwrap();
        assert_eq!(s.get("people").unwrap().unwrap().change_vector_cursor, "X:10");
    }

    #[tokio::test]
    async fn test_export_import_parity() {
        let source = store();
        source
            .create("a", &SubscriptionCriteria::collection("Users"), None)
            .await
            .unwrap();
        source
            .create("b", &SubscriptionCriteria::collection("Orders"), Some("X:9".into()))
            .await
            .unwrap();

        let target = SubscriptionStore::new(Arc::new(InMemoryConsensusLog::new()), "north");
        target.import(source.export().unwrap()).await.unwrap();

        let names = |s: &SubscriptionStore| -> BTreeSet<(String, String, String)> {
            s.list()
                .unwrap()
                .into_iter()
                .map(|r| (r.name, r.query, r.change_vector_cursor))
                .collect()
        };
        assert_eq!(names(&source), names(&target));
    }

    #[tokio::test]
    async fn test_delete_removes_definition() {
        let s = store();
        s.create("people", &SubscriptionCriteria::collection("Users"), None)
            .await
            .unwrap();
        s.delete("people").await.unwrap();
        assert!(s.get("people").unwrap().is_none());
    }
}
