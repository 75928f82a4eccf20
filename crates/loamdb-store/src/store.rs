//! In-memory multi-model document store with a bucket-addressed change log.
//!
//! Every committed mutation allocates a strictly monotonic etag, is tagged
//! with its bucket, and is indexed in the change log. Replicated writes go
//! through the same commit path and are deduplicated by change vector, so a
//! replayed batch is a no-op.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::bucket::bucket_of;
use crate::change_vector::{ChangeVector, VectorOrder};
use crate::changelog::{ChangeLog, ChangeLogEntry, ChangeLogScan, EntryKind};
use crate::error::{Result, StoreError};

/// Store-level configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database name.
    pub database: String,
    /// Tag of the node hosting this store (e.g. "A").
    pub node_tag: String,
    /// Whether document writes preserve the prior version as a revision.
    pub revisions_enabled: bool,
    /// The shard this node hosts, or None for an unsharded database.
    pub shard: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: "db".to_string(),
            node_tag: "A".to_string(),
            revisions_enabled: false,
            shard: None,
        }
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Collection the document belongs to.
    pub collection: String,
    /// The document body.
    pub data: serde_json::Value,
    /// Vector clock of the latest write.
    pub change_vector: ChangeVector,
    /// Etag of the latest write on the node that performed it.
    pub etag: u64,
    /// Bucket of the document id.
    pub bucket: u32,
    /// Wall-clock write time in milliseconds since the Unix epoch.
    pub modified_at_ms: u64,
}

/// The payload shipped with a change-log entry over replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// A full document.
    Document(Document),
    /// A delete marker.
    Tombstone {
        /// The deleted document id.
        id: String,
        /// Collection of the deleted document, when known.
        collection: Option<String>,
        /// Vector clock of the delete.
        change_vector: ChangeVector,
        /// Wall-clock delete time (ms since epoch).
        modified_at_ms: u64,
    },
    /// A conflicted document version.
    Conflict(Document),
    /// A preserved prior document version.
    Revision(Document),
    /// A named binary attachment.
    Attachment {
        /// Owning document id.
        document_id: String,
        /// Attachment name.
        name: String,
        /// Raw bytes.
        data: Vec<u8>,
        /// Vector clock of the attachment write.
        change_vector: ChangeVector,
    },
    /// A counter group snapshot.
    Counter {
        /// Owning document id.
        document_id: String,
        /// Counter group name.
        group: String,
        /// Counter values by name.
        values: BTreeMap<String, i64>,
        /// Vector clock of the counter write.
        change_vector: ChangeVector,
    },
    /// A time-series segment.
    TimeSeriesSegment {
        /// Owning document id.
        document_id: String,
        /// Series name.
        name: String,
        /// Segment start timestamp (ms since epoch).
        start_ms: u64,
        /// Sample values.
        values: Vec<f64>,
        /// Vector clock of the segment write.
        change_vector: ChangeVector,
    },
}

/// A tombstone left behind by a document delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Tombstone {
    id: String,
    collection: Option<String>,
    change_vector: ChangeVector,
    etag: u64,
    bucket: u32,
    modified_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredAttachment {
    document_id: String,
    name: String,
    data: Vec<u8>,
    change_vector: ChangeVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredCounterGroup {
    document_id: String,
    group: String,
    values: BTreeMap<String, i64>,
    change_vector: ChangeVector,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredSegment {
    document_id: String,
    name: String,
    start_ms: u64,
    values: Vec<f64>,
    change_vector: ChangeVector,
}

#[derive(Default)]
struct StoreInner {
    last_etag: u64,
    documents: BTreeMap<String, Document>,
    tombstones: BTreeMap<String, Tombstone>,
    revisions: HashMap<String, Vec<Document>>,
    conflicts: HashMap<String, Vec<Document>>,
    counters: BTreeMap<(String, String), StoredCounterGroup>,
    attachments: BTreeMap<(String, String), StoredAttachment>,
    time_series: BTreeMap<(String, String), Vec<StoredSegment>>,
    changelog: ChangeLog,
    database_change_vector: ChangeVector,
}

impl StoreInner {
    fn next_etag(&mut self) -> u64 {
        self.last_etag += 1;
        self.last_etag
    }

    fn index(
        &mut self,
        kind: EntryKind,
        id: &str,
        name: Option<&str>,
        collection: Option<&str>,
        change_vector: ChangeVector,
        modified_at_ms: u64,
    ) -> ChangeLogEntry {
        let etag = self.next_etag();
        let entry = ChangeLogEntry {
            kind,
            bucket: bucket_of(id),
            etag,
            id: id.to_string(),
            name: name.map(|s| s.to_string()),
            collection: collection.map(|s| s.to_string()),
            change_vector,
            payload_ref: etag,
            modified_at_ms,
        };
        self.changelog.insert(entry.clone());
        entry
    }
}

/// The local document store.
///
/// Mutations take the write lock; scans collect their results under the
/// read lock, which gives every scan a consistent snapshot.
pub struct DocumentStore {
    database_id: String,
    config: StoreConfig,
    inner: RwLock<StoreInner>,
    changes: Notify,
    deleted: AtomicBool,
}

impl DocumentStore {
    /// Create an empty store with a fresh database id.
    pub fn new(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self {
            database_id: uuid::Uuid::new_v4().simple().to_string(),
            config,
            inner: RwLock::new(StoreInner::default()),
            changes: Notify::new(),
            deleted: AtomicBool::new(false),
        })
    }

    /// The unique id of this database instance.
    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// The database name.
    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// The tag of the node hosting this store.
    pub fn node_tag(&self) -> &str {
        &self.config.node_tag
    }

    /// The shard this node hosts, or None for an unsharded database.
    pub fn shard(&self) -> Option<u32> {
        self.config.shard
    }

    fn check_alive(&self) -> Result<()> {
        if self.deleted.load(Ordering::SeqCst) {
            return Err(StoreError::DatabaseDoesNotExist {
                database: self.config.database.clone(),
            });
        }
        Ok(())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().expect("lock poisoned")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
        self.inner.read().expect("lock poisoned")
    }

    /// Store (create or overwrite) a document. Allocates a new etag and
    /// advances the document's change vector with this node's entry.
    pub fn put_document(
        &self,
        id: &str,
        collection: &str,
        data: serde_json::Value,
    ) -> Result<Document> {
        self.check_alive()?;
        let now = now_ms();
        let mut inner = self.write();

        let previous = inner.documents.get(id).cloned();
        if let Some(prev) = &previous {
            inner
                .changelog
                .remove(EntryKind::Document, prev.bucket, prev.etag);
            if self.config.revisions_enabled {
                let entry = inner.index(
                    EntryKind::Revision,
                    id,
                    None,
                    Some(prev.collection.as_str()),
                    prev.change_vector.clone(),
                    now,
                );
                let mut revision = prev.clone();
                revision.etag = entry.etag;
                inner.revisions.entry(id.to_string()).or_default().push(revision);
            }
        }
        if let Some(tomb) = inner.tombstones.remove(id) {
            inner
                .changelog
                .remove(EntryKind::Tombstone, tomb.bucket, tomb.etag);
        }

        let base_vector = previous
            .as_ref()
            .map(|d| d.change_vector.clone())
            .unwrap_or_default();
        // The etag in the vector is assigned inside index(); reserve it by
        // peeking at last_etag + 1, which index() will allocate next.
        let vector = base_vector.with(&self.database_id, inner.last_etag + 1);
        let entry = inner.index(
            EntryKind::Document,
            id,
            None,
            Some(collection),
            vector.clone(),
            now,
        );

        let doc = Document {
            id: id.to_string(),
            collection: collection.to_string(),
            data,
            change_vector: vector.clone(),
            etag: entry.etag,
            bucket: entry.bucket,
            modified_at_ms: now,
        };
        inner.documents.insert(id.to_string(), doc.clone());
        inner.database_change_vector.merge(&vector);
        drop(inner);

        self.changes.notify_waiters();
        Ok(doc)
    }

    /// Delete a document, leaving a tombstone. Returns the tombstone entry,
    /// or None if the document did not exist.
    pub fn delete_document(&self, id: &str) -> Result<Option<ChangeLogEntry>> {
        self.check_alive()?;
        let now = now_ms();
        let mut inner = self.write();

        let previous = match inner.documents.remove(id) {
            Some(doc) => doc,
            None => return Ok(None),
        };
        inner
            .changelog
            .remove(EntryKind::Document, previous.bucket, previous.etag);

        let vector = previous
            .change_vector
            .with(&self.database_id, inner.last_etag + 1);
        let entry = inner.index(
            EntryKind::Tombstone,
            id,
            None,
            Some(previous.collection.as_str()),
            vector.clone(),
            now,
        );
        inner.tombstones.insert(
            id.to_string(),
            Tombstone {
                id: id.to_string(),
                collection: Some(previous.collection),
                change_vector: vector.clone(),
                etag: entry.etag,
                bucket: entry.bucket,
                modified_at_ms: now,
            },
        );
        inner.database_change_vector.merge(&vector);
        drop(inner);

        self.changes.notify_waiters();
        Ok(Some(entry))
    }

    /// Fetch a document by id.
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.check_alive()?;
        Ok(self.read().documents.get(id).cloned())
    }

    /// Increment a counter inside a counter group. Returns the new value.
    pub fn increment_counter(
        &self,
        document_id: &str,
        group: &str,
        counter: &str,
        delta: i64,
    ) -> Result<i64> {
        self.check_alive()?;
        let now = now_ms();
        let mut inner = self.write();

        let key = (document_id.to_string(), group.to_string());
        let previous_vector = inner
            .counters
            .get(&key)
            .map(|c| c.change_vector.clone())
            .unwrap_or_default();
        if let Some(prev_etag) = inner
            .changelog
            .entries_of_kind(EntryKind::Counter)
            .iter()
            .find(|e| e.id == document_id && e.name.as_deref() == Some(group))
            .map(|e| (e.bucket, e.etag))
        {
            inner.changelog.remove(EntryKind::Counter, prev_etag.0, prev_etag.1);
        }

        let vector = previous_vector.with(&self.database_id, inner.last_etag + 1);
        inner.index(
            EntryKind::Counter,
            document_id,
            Some(group),
            None,
            vector.clone(),
            now,
        );

        let entry = inner.counters.entry(key).or_insert_with(|| StoredCounterGroup {
            document_id: document_id.to_string(),
            group: group.to_string(),
            values: BTreeMap::new(),
            change_vector: ChangeVector::new(),
        });
        let value = entry.values.entry(counter.to_string()).or_insert(0);
        *value += delta;
        let new_value = *value;
        entry.change_vector = vector.clone();
        inner.database_change_vector.merge(&vector);
        drop(inner);

        self.changes.notify_waiters();
        Ok(new_value)
    }

    /// Store a named attachment on a document.
    pub fn put_attachment(&self, document_id: &str, name: &str, data: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        let now = now_ms();
        let mut inner = self.write();

        let key = (document_id.to_string(), name.to_string());
        let previous_vector = inner
            .attachments
            .get(&key)
            .map(|a| a.change_vector.clone())
            .unwrap_or_default();
        if let Some(prev) = inner
            .changelog
            .entries_of_kind(EntryKind::Attachment)
            .iter()
            .find(|e| e.id == document_id && e.name.as_deref() == Some(name))
            .map(|e| (e.bucket, e.etag))
        {
            inner.changelog.remove(EntryKind::Attachment, prev.0, prev.1);
        }

        let vector = previous_vector.with(&self.database_id, inner.last_etag + 1);
        inner.index(
            EntryKind::Attachment,
            document_id,
            Some(name),
            None,
            vector.clone(),
            now,
        );
        inner.attachments.insert(
            key,
            StoredAttachment {
                document_id: document_id.to_string(),
                name: name.to_string(),
                data,
                change_vector: vector.clone(),
            },
        );
        inner.database_change_vector.merge(&vector);
        drop(inner);

        self.changes.notify_waiters();
        Ok(())
    }

    /// Append a time-series segment to a document's series.
    pub fn append_time_series(
        &self,
        document_id: &str,
        series: &str,
        start_ms: u64,
        values: Vec<f64>,
    ) -> Result<()> {
        self.check_alive()?;
        let now = now_ms();
        let mut inner = self.write();

        let vector = ChangeVector::new().with(&self.database_id, inner.last_etag + 1);
        inner.index(
            EntryKind::TimeSeriesSegment,
            document_id,
            Some(series),
            None,
            vector.clone(),
            now,
        );
        inner
            .time_series
            .entry((document_id.to_string(), series.to_string()))
            .or_default()
            .push(StoredSegment {
                document_id: document_id.to_string(),
                name: series.to_string(),
                start_ms,
                values,
                change_vector: vector.clone(),
            });
        inner.database_change_vector.merge(&vector);
        drop(inner);

        self.changes.notify_waiters();
        Ok(())
    }

    /// Scan one mutation kind within one bucket, strictly above
    /// `from_etag_exclusive`, in ascending etag order. The scan is a
    /// snapshot: entries committed after it opens are not included.
    pub fn scan_by_bucket(
        &self,
        kind: EntryKind,
        bucket: u32,
        from_etag_exclusive: u64,
    ) -> Result<ChangeLogScan> {
        self.check_alive()?;
        self.read().changelog.scan_by_bucket(kind, bucket, from_etag_exclusive)
    }

    /// Scan every kind in global etag order.
    pub fn scan_all(&self, from_etag_exclusive: u64) -> Result<ChangeLogScan> {
        self.check_alive()?;
        Ok(self.read().changelog.scan_all(from_etag_exclusive))
    }

    /// Scan every kind in `(bucket, etag)` order, for sharded consumers.
    pub fn scan_all_by_bucket_order(&self, from_etag_exclusive: u64) -> Result<ChangeLogScan> {
        self.check_alive()?;
        Ok(self.read().changelog.scan_all_by_bucket_order(from_etag_exclusive))
    }

    /// The highest allocated etag.
    pub fn last_etag(&self) -> u64 {
        self.read().last_etag
    }

    /// The merged change vector over every write this store has seen.
    pub fn database_change_vector(&self) -> ChangeVector {
        self.read().database_change_vector.clone()
    }

    /// Fetch the current payload for a change-log entry.
    pub fn payload_for(&self, entry: &ChangeLogEntry) -> Result<Payload> {
        self.check_alive()?;
        let inner = self.read();
        match entry.kind {
            EntryKind::Document => inner
                .documents
                .get(&entry.id)
                .map(|d| Payload::Document(d.clone()))
                .ok_or_else(|| StoreError::DocumentNotFound {
                    id: entry.id.clone(),
                }),
            EntryKind::Tombstone => inner
                .tombstones
                .get(&entry.id)
                .map(|t| Payload::Tombstone {
                    id: t.id.clone(),
                    collection: t.collection.clone(),
                    change_vector: t.change_vector.clone(),
                    modified_at_ms: t.modified_at_ms,
                })
                .ok_or_else(|| StoreError::DocumentNotFound {
                    id: entry.id.clone(),
                }),
            EntryKind::Revision => inner
                .revisions
                .get(&entry.id)
                .and_then(|revs| revs.iter().find(|r| r.etag == entry.payload_ref))
                .map(|r| Payload::Revision(r.clone()))
                .ok_or_else(|| StoreError::DocumentNotFound {
                    id: entry.id.clone(),
                }),
            EntryKind::Conflict => inner
                .conflicts
                .get(&entry.id)
                .and_then(|versions| versions.iter().find(|v| v.etag == entry.payload_ref))
                .map(|v| Payload::Conflict(v.clone()))
                .ok_or_else(|| StoreError::DocumentNotFound {
                    id: entry.id.clone(),
                }),
            EntryKind::Counter => {
                let group = entry.name.clone().unwrap_or_default();
                inner
                    .counters
                    .get(&(entry.id.clone(), group.clone()))
                    .map(|c| Payload::Counter {
                        document_id: c.document_id.clone(),
                        group: c.group.clone(),
                        values: c.values.clone(),
                        change_vector: c.change_vector.clone(),
                    })
                    .ok_or_else(|| StoreError::DocumentNotFound {
                        id: entry.id.clone(),
                    })
            }
            EntryKind::Attachment => {
                let name = entry.name.clone().unwrap_or_default();
                inner
                    .attachments
                    .get(&(entry.id.clone(), name))
                    .map(|a| Payload::Attachment {
                        document_id: a.document_id.clone(),
                        name: a.name.clone(),
                        data: a.data.clone(),
                        change_vector: a.change_vector.clone(),
                    })
                    .ok_or_else(|| StoreError::DocumentNotFound {
                        id: entry.id.clone(),
                    })
            }
            EntryKind::TimeSeriesSegment => {
                let name = entry.name.clone().unwrap_or_default();
                inner
                    .time_series
                    .get(&(entry.id.clone(), name))
                    .and_then(|segments| segments.last())
                    .map(|s| Payload::TimeSeriesSegment {
                        document_id: s.document_id.clone(),
                        name: s.name.clone(),
                        start_ms: s.start_ms,
                        values: s.values.clone(),
                        change_vector: s.change_vector.clone(),
                    })
                    .ok_or_else(|| StoreError::DocumentNotFound {
                        id: entry.id.clone(),
                    })
            }
        }
    }

    /// Apply a replicated batch in order inside one write transaction.
    ///
    /// Replay of already-seen payloads (change vector Equal or Before the
    /// local state) is a no-op. Concurrent versions are recorded as
    /// conflicts and resolved latest-modified-wins.
    pub fn apply_replicated(&self, payloads: Vec<Payload>) -> Result<()> {
        self.check_alive()?;
        let now = now_ms();
        let mut changed = false;
        {
            let mut inner = self.write();
            for payload in payloads {
                changed |= self.apply_one(&mut inner, payload, now);
            }
        }
        if changed {
            self.changes.notify_waiters();
        }
        Ok(())
    }

    fn apply_one(&self, inner: &mut StoreInner, payload: Payload, now: u64) -> bool {
        match payload {
            Payload::Document(remote) => self.apply_document(inner, remote, now),
            Payload::Tombstone {
                id,
                collection,
                change_vector,
                modified_at_ms,
            } => self.apply_tombstone(inner, id, collection, change_vector, modified_at_ms, now),
            Payload::Revision(remote) => {
                let entry = inner.index(
                    EntryKind::Revision,
                    remote.id.as_str(),
                    None,
                    Some(remote.collection.as_str()),
                    remote.change_vector.clone(),
                    now,
                );
                inner.database_change_vector.merge(&remote.change_vector);
                let mut stored = remote;
                stored.etag = entry.etag;
                inner.revisions.entry(stored.id.clone()).or_default().push(stored);
                true
            }
            Payload::Conflict(remote) => {
                self.record_conflict(inner, remote, now);
                true
            }
            Payload::Counter {
                document_id,
                group,
                values,
                change_vector,
            } => {
                let key = (document_id.clone(), group.clone());
                let local_vector = inner
                    .counters
                    .get(&key)
                    .map(|c| c.change_vector.clone())
                    .unwrap_or_default();
                match local_vector.compare(&change_vector) {
                    VectorOrder::Equal | VectorOrder::After => false,
                    VectorOrder::Before | VectorOrder::Concurrent => {
                        if let Some(prev) = inner
                            .changelog
                            .entries_of_kind(EntryKind::Counter)
                            .iter()
                            .find(|e| e.id == document_id && e.name.as_deref() == Some(&group))
                            .map(|e| (e.bucket, e.etag))
                        {
                            inner.changelog.remove(EntryKind::Counter, prev.0, prev.1);
                        }
                        let merged = local_vector.merged(&change_vector);
                        inner.index(
                            EntryKind::Counter,
                            document_id.as_str(),
                            Some(group.as_str()),
                            None,
                            merged.clone(),
                            now,
                        );
                        inner.counters.insert(
                            key,
                            StoredCounterGroup {
                                document_id,
                                group,
                                values,
                                change_vector: merged.clone(),
                            },
                        );
                        inner.database_change_vector.merge(&merged);
                        true
                    }
                }
            }
            Payload::Attachment {
                document_id,
                name,
                data,
                change_vector,
            } => {
                let key = (document_id.clone(), name.clone());
                let local_vector = inner
                    .attachments
                    .get(&key)
                    .map(|a| a.change_vector.clone())
                    .unwrap_or_default();
                match local_vector.compare(&change_vector) {
                    VectorOrder::Equal | VectorOrder::After => false,
                    VectorOrder::Before | VectorOrder::Concurrent => {
                        if let Some(prev) = inner
                            .changelog
                            .entries_of_kind(EntryKind::Attachment)
                            .iter()
                            .find(|e| e.id == document_id && e.name.as_deref() == Some(&name))
                            .map(|e| (e.bucket, e.etag))
                        {
                            inner.changelog.remove(EntryKind::Attachment, prev.0, prev.1);
                        }
                        let merged = local_vector.merged(&change_vector);
                        inner.index(
                            EntryKind::Attachment,
                            document_id.as_str(),
                            Some(name.as_str()),
                            None,
                            merged.clone(),
                            now,
                        );
                        inner.attachments.insert(
                            key,
                            StoredAttachment {
                                document_id,
                                name,
                                data,
                                change_vector: merged.clone(),
                            },
                        );
                        inner.database_change_vector.merge(&merged);
                        true
                    }
                }
            }
            Payload::TimeSeriesSegment {
                document_id,
                name,
                start_ms,
                values,
                change_vector,
            } => {
                let key = (document_id.clone(), name.clone());
                let seen = inner
                    .time_series
                    .get(&key)
                    .map(|segments| {
                        segments.iter().any(|s| {
                            s.change_vector.compare(&change_vector) != VectorOrder::Before
                                && s.start_ms == start_ms
                        })
                    })
                    .unwrap_or(false);
                if seen {
                    return false;
                }
                inner.index(
                    EntryKind::TimeSeriesSegment,
                    document_id.as_str(),
                    Some(name.as_str()),
                    None,
                    change_vector.clone(),
                    now,
                );
                inner.database_change_vector.merge(&change_vector);
                inner.time_series.entry(key).or_default().push(StoredSegment {
                    document_id,
                    name,
                    start_ms,
                    values,
                    change_vector,
                });
                true
            }
        }
    }

    fn apply_document(&self, inner: &mut StoreInner, remote: Document, now: u64) -> bool {
        let local = inner.documents.get(&remote.id).cloned();
        let local_vector = local
            .as_ref()
            .map(|d| d.change_vector.clone())
            .or_else(|| inner.tombstones.get(&remote.id).map(|t| t.change_vector.clone()))
            .unwrap_or_default();

        match local_vector.compare(&remote.change_vector) {
            VectorOrder::Equal | VectorOrder::After => false,
            VectorOrder::Before => {
                self.store_replicated_document(inner, remote, now);
                true
            }
            VectorOrder::Concurrent => {
                debug!(id = %remote.id, "concurrent document versions, resolving");
                let winner_is_remote = match &local {
                    Some(l) => remote.modified_at_ms >= l.modified_at_ms,
                    None => true,
                };
                if winner_is_remote {
                    if let Some(loser) = local {
                        self.record_conflict(inner, loser, now);
                    }
                    let mut winner = remote;
                    winner.change_vector = local_vector.merged(&winner.change_vector);
                    self.store_replicated_document(inner, winner, now);
                } else if let Some(mut winner) = local {
                    let remote_vector = remote.change_vector.clone();
                    self.record_conflict(inner, remote, now);
                    winner.change_vector = local_vector.merged(&remote_vector);
                    self.store_replicated_document(inner, winner, now);
                }
                true
            }
        }
    }

    fn store_replicated_document(&self, inner: &mut StoreInner, doc: Document, now: u64) {
        if let Some(prev) = inner.documents.get(&doc.id) {
            let (bucket, etag) = (prev.bucket, prev.etag);
            inner.changelog.remove(EntryKind::Document, bucket, etag);
        }
        if let Some(tomb) = inner.tombstones.remove(&doc.id) {
            inner.changelog.remove(EntryKind::Tombstone, tomb.bucket, tomb.etag);
        }
        let entry = inner.index(
            EntryKind::Document,
            doc.id.as_str(),
            None,
            Some(doc.collection.as_str()),
            doc.change_vector.clone(),
            now,
        );
        inner.database_change_vector.merge(&doc.change_vector);
        let mut stored = doc;
        stored.etag = entry.etag;
        stored.bucket = entry.bucket;
        inner.documents.insert(stored.id.clone(), stored);
    }

    fn apply_tombstone(
        &self,
        inner: &mut StoreInner,
        id: String,
        collection: Option<String>,
        change_vector: ChangeVector,
        modified_at_ms: u64,
        now: u64,
    ) -> bool {
        let local_vector = inner
            .documents
            .get(&id)
            .map(|d| d.change_vector.clone())
            .or_else(|| inner.tombstones.get(&id).map(|t| t.change_vector.clone()))
            .unwrap_or_default();

        match local_vector.compare(&change_vector) {
            VectorOrder::Equal | VectorOrder::After => false,
            VectorOrder::Before | VectorOrder::Concurrent => {
                // A delete that races a write resolves towards the delete
                // when it is the later mutation, matching the document path.
                if let VectorOrder::Concurrent = local_vector.compare(&change_vector) {
                    if let Some(local) = inner.documents.get(&id).cloned() {
                        if local.modified_at_ms > modified_at_ms {
                            return false;
                        }
                        self.record_conflict(inner, local, now);
                    }
                }
                if let Some(doc) = inner.documents.remove(&id) {
                    inner.changelog.remove(EntryKind::Document, doc.bucket, doc.etag);
                }
                if let Some(tomb) = inner.tombstones.remove(&id) {
                    inner.changelog.remove(EntryKind::Tombstone, tomb.bucket, tomb.etag);
                }
                let merged = local_vector.merged(&change_vector);
                let entry = inner.index(
                    EntryKind::Tombstone,
                    &id,
                    None,
                    collection.as_deref(),
                    merged.clone(),
                    now,
                );
                inner.tombstones.insert(
                    id.clone(),
                    Tombstone {
                        id,
                        collection,
                        change_vector: merged.clone(),
                        etag: entry.etag,
                        bucket: entry.bucket,
                        modified_at_ms,
                    },
                );
                inner.database_change_vector.merge(&merged);
                true
            }
        }
    }

    fn record_conflict(&self, inner: &mut StoreInner, version: Document, now: u64) {
        let entry = inner.index(
            EntryKind::Conflict,
            version.id.as_str(),
            None,
            Some(version.collection.as_str()),
            version.change_vector.clone(),
            now,
        );
        inner.database_change_vector.merge(&version.change_vector);
        let mut stored = version;
        stored.etag = entry.etag;
        inner.conflicts.entry(stored.id.clone()).or_default().push(stored);
    }

    /// Resolve every recorded conflict latest-modified-wins. Returns the
    /// number of document ids resolved.
    pub fn resolve_conflicts(&self) -> Result<usize> {
        self.check_alive()?;
        let pending: Vec<(String, Vec<Document>)> = {
            let mut inner = self.write();
            inner.conflicts.drain().collect()
        };
        let mut resolved = 0;
        for (id, versions) in pending {
            let current = self.get_document(&id)?;
            let winner = versions
                .into_iter()
                .chain(current)
                .max_by_key(|d| d.modified_at_ms);
            if let Some(winner) = winner {
                self.put_document(&id, &winner.collection, winner.data)?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Conflicted versions currently recorded for a document id.
    pub fn conflicts_for(&self, id: &str) -> Vec<Document> {
        self.read().conflicts.get(id).cloned().unwrap_or_default()
    }

    /// All tombstone entries, ascending by etag. Consumed by the cleaner.
    pub fn tombstone_entries(&self) -> Vec<ChangeLogEntry> {
        self.read().changelog.entries_of_kind(EntryKind::Tombstone)
    }

    /// Remove tombstones whose etag is strictly below `min_etag`. Returns
    /// how many were removed.
    pub fn purge_tombstones_below(&self, min_etag: u64) -> usize {
        let mut inner = self.write();
        let doomed: Vec<Tombstone> = inner
            .tombstones
            .values()
            .filter(|t| t.etag < min_etag)
            .cloned()
            .collect();
        for tomb in &doomed {
            inner.tombstones.remove(&tomb.id);
            inner
                .changelog
                .remove(EntryKind::Tombstone, tomb.bucket, tomb.etag);
        }
        doomed.len()
    }

    /// Wait until an etag above `last_observed` is committed, or until the
    /// database is deleted. Returns Ok immediately when already ahead.
    pub async fn wait_for_change(&self, last_observed: u64) -> Result<()> {
        loop {
            self.check_alive()?;
            if self.last_etag() > last_observed {
                return Ok(());
            }
            let notified = self.changes.notified();
            tokio::pin!(notified);
            // Register interest, then re-check so a commit between the
            // check and the await cannot be lost.
            notified.as_mut().enable();
            if self.last_etag() > last_observed {
                return Ok(());
            }
            self.check_alive()?;
            notified.await;
        }
    }

    /// Mark the database as deleted and wake every waiter. All subsequent
    /// operations fail with `DatabaseDoesNotExist`.
    pub fn delete_database(&self) {
        self.deleted.store(true, Ordering::SeqCst);
        self.changes.notify_waiters();
    }

    /// True once `delete_database` has been called.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
