//! Tombstone cleanup gated by replication progress.
//!
//! Tombstones must survive until every replication destination has observed
//! them. The replication loader publishes the minimum etag still required;
//! the cleaner deletes tombstones strictly below it.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::store::DocumentStore;

/// Source of the cluster-wide minimum etag still required by replication.
///
/// A returned value of 0 means "nothing may be collected" (some destination
/// is disabled or has never acknowledged).
pub trait MinimalEtagProvider: Send + Sync {
    /// The minimum etag any destination still needs. Tombstones with an
    /// etag strictly below this value are collectable.
    fn minimal_etag_for_replication(&self) -> u64;
}

/// Deletes tombstones that every destination has already seen.
pub struct TombstoneCleaner {
    store: Arc<DocumentStore>,
    provider: Arc<dyn MinimalEtagProvider>,
}

impl TombstoneCleaner {
    /// Create a cleaner over a store, consulting the given provider.
    pub fn new(store: Arc<DocumentStore>, provider: Arc<dyn MinimalEtagProvider>) -> Self {
        Self { store, provider }
    }

    /// Run one cleanup pass. Returns the number of tombstones removed.
    pub fn clean(&self) -> Result<usize> {
        let min_etag = self.provider.minimal_etag_for_replication();
        if min_etag == 0 {
            return Ok(0);
        }
        let removed = self.store.purge_tombstones_below(min_etag);
        if removed > 0 {
            debug!(min_etag, removed, "collected tombstones");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FixedMin(AtomicU64);

    impl MinimalEtagProvider for FixedMin {
        fn minimal_etag_for_replication(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn setup() -> (Arc<DocumentStore>, Arc<FixedMin>, TombstoneCleaner) {
        let store = DocumentStore::new(StoreConfig::default());
        let min = Arc::new(FixedMin(AtomicU64::new(0)));
        let cleaner = TombstoneCleaner::new(store.clone(), min.clone());
        (store, min, cleaner)
    }

    #[test]
    fn test_zero_min_collects_nothing() {
        let (store, _min, cleaner) = setup();
        store.put_document("users/1", "Users", json!({})).unwrap();
        store.delete_document("users/1").unwrap();

        assert_eq!(cleaner.clean().unwrap(), 0);
        assert_eq!(store.tombstone_entries().len(), 1);
    }

    #[test]
    fn test_min_is_strict_lower_bound() {
        let (store, min, cleaner) = setup();
        store.put_document("users/1", "Users", json!({})).unwrap();
        let tomb = store.delete_document("users/1").unwrap().unwrap();

        // Tombstones with etag >= the published minimum survive.
        min.0.store(tomb.etag, Ordering::SeqCst);
        assert_eq!(cleaner.clean().unwrap(), 0);
        assert_eq!(store.tombstone_entries().len(), 1);

        min.0.store(tomb.etag + 1, Ordering::SeqCst);
        assert_eq!(cleaner.clean().unwrap(), 1);
        assert!(store.tombstone_entries().is_empty());
    }

    #[test]
    fn test_partial_collection() {
        let (store, min, cleaner) = setup();
        store.put_document("users/1", "Users", json!({})).unwrap();
        store.put_document("users/2", "Users", json!({})).unwrap();
        let t1 = store.delete_document("users/1").unwrap().unwrap();
        let t2 = store.delete_document("users/2").unwrap().unwrap();
        assert!(t2.etag > t1.etag);

        min.0.store(t2.etag, Ordering::SeqCst);
        assert_eq!(cleaner.clean().unwrap(), 1);
        let remaining = store.tombstone_entries();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].etag, t2.etag);
    }
}
