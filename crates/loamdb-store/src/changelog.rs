//! The bucket-addressed change log.
//!
//! Every mutation class gets a secondary index keyed by `(bucket, etag)`.
//! Scans are resumable: callers remember the last returned etag and restart
//! from it. Entries come back in strictly ascending etag order and observe
//! the state of the log at the time the scan was opened.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bucket::validate_bucket;
use crate::change_vector::ChangeVector;
use crate::error::{Result, StoreError};

/// The mutation class of a change-log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// A live document.
    Document,
    /// The record left behind by a delete.
    Tombstone,
    /// A conflicted document version awaiting resolution.
    Conflict,
    /// A preserved prior version of a document.
    Revision,
    /// A named binary attachment of a document.
    Attachment,
    /// A distributed counter group value.
    Counter,
    /// A time-series segment.
    TimeSeriesSegment,
}

impl EntryKind {
    /// All kinds, in index order.
    pub const ALL: [EntryKind; 7] = [
        EntryKind::Document,
        EntryKind::Tombstone,
        EntryKind::Conflict,
        EntryKind::Revision,
        EntryKind::Attachment,
        EntryKind::Counter,
        EntryKind::TimeSeriesSegment,
    ];
}

impl FromStr for EntryKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Document" => Ok(EntryKind::Document),
            "Tombstone" => Ok(EntryKind::Tombstone),
            "Conflict" => Ok(EntryKind::Conflict),
            "Revision" => Ok(EntryKind::Revision),
            "Attachment" => Ok(EntryKind::Attachment),
            "Counter" => Ok(EntryKind::Counter),
            "TimeSeriesSegment" => Ok(EntryKind::TimeSeriesSegment),
            other => Err(StoreError::InvalidKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// Common header for every indexed mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    /// Mutation class.
    pub kind: EntryKind,
    /// Bucket derived from the id's routing key.
    pub bucket: u32,
    /// Per-node monotonic write sequence number.
    pub etag: u64,
    /// The document id this mutation belongs to.
    pub id: String,
    /// Attachment name or counter group, for the kinds that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Collection of the document, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Vector clock of the mutation.
    pub change_vector: ChangeVector,
    /// Opaque pointer into the underlying store.
    pub payload_ref: u64,
    /// Wall-clock write time in milliseconds since the Unix epoch.
    pub modified_at_ms: u64,
}

/// A finite ascending scan over change-log entries. The contents are fixed
/// when the scan is opened; later commits are not observed.
#[derive(Debug)]
pub struct ChangeLogScan {
    entries: std::vec::IntoIter<ChangeLogEntry>,
}

impl Iterator for ChangeLogScan {
    type Item = ChangeLogEntry;

    fn next(&mut self) -> Option<ChangeLogEntry> {
        self.entries.next()
    }
}

impl ChangeLogScan {
    fn new(entries: Vec<ChangeLogEntry>) -> Self {
        Self {
            entries: entries.into_iter(),
        }
    }
}

/// Per-kind `(bucket, etag)` indexes plus a global etag index.
///
/// Plain data structure; the owning store serializes access.
#[derive(Debug, Default)]
pub struct ChangeLog {
    by_kind: BTreeMap<(EntryKind, u32, u64), ChangeLogEntry>,
    by_etag: BTreeMap<u64, ChangeLogEntry>,
}

impl ChangeLog {
    /// Create an empty change log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Index an entry under both its `(kind, bucket, etag)` key and the
    /// global etag order.
    pub fn insert(&mut self, entry: ChangeLogEntry) {
        self.by_kind
            .insert((entry.kind, entry.bucket, entry.etag), entry.clone());
        self.by_etag.insert(entry.etag, entry);
    }

    /// Remove an entry. No-op if absent.
    pub fn remove(&mut self, kind: EntryKind, bucket: u32, etag: u64) {
        self.by_kind.remove(&(kind, bucket, etag));
        self.by_etag.remove(&etag);
    }

    /// Scan one kind within one bucket, strictly above `from_etag_exclusive`,
    /// in ascending etag order.
    pub fn scan_by_bucket(
        &self,
        kind: EntryKind,
        bucket: u32,
        from_etag_exclusive: u64,
    ) -> Result<ChangeLogScan> {
        validate_bucket(bucket)?;
        let lo = (kind, bucket, from_etag_exclusive.saturating_add(1));
        let hi = (kind, bucket, u64::MAX);
        let entries: Vec<ChangeLogEntry> = self.by_kind.range(lo..=hi).map(|(_, e)| e.clone()).collect();
        Ok(ChangeLogScan::new(entries))
    }

    /// Scan every kind in global etag order, strictly above
    /// `from_etag_exclusive`.
    pub fn scan_all(&self, from_etag_exclusive: u64) -> ChangeLogScan {
        let entries: Vec<ChangeLogEntry> = self
            .by_etag
            .range(from_etag_exclusive.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect();
        ChangeLogScan::new(entries)
    }

    /// Scan every kind in `(bucket, etag)` order, strictly above
    /// `from_etag_exclusive` within each bucket. Used by sharded
    /// subscription reads.
    pub fn scan_all_by_bucket_order(&self, from_etag_exclusive: u64) -> ChangeLogScan {
        let mut entries: Vec<ChangeLogEntry> = self
            .by_etag
            .range(from_etag_exclusive.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect();
        entries.sort_by_key(|e| (e.bucket, e.etag));
        ChangeLogScan::new(entries)
    }

    /// The highest etag present in the log, or 0 when empty.
    pub fn last_etag(&self) -> u64 {
        self.by_etag.keys().next_back().copied().unwrap_or(0)
    }

    /// Entries of a given kind across all buckets, ascending by etag.
    /// Used by the tombstone cleaner.
    pub fn entries_of_kind(&self, kind: EntryKind) -> Vec<ChangeLogEntry> {
        let mut entries: Vec<ChangeLogEntry> = self
            .by_kind
            .range((kind, 0, 0)..=(kind, u32::MAX, u64::MAX))
            .map(|(_, e)| e.clone())
            .collect();
        entries.sort_by_key(|e| e.etag);
        entries
    }

    /// Total number of indexed entries.
    pub fn len(&self) -> usize {
        self.by_etag.len()
    }

    /// True if the log holds no entries.
    pub fn is_empty(&self) -> bool {
        self.by_etag.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BUCKET_COUNT;

    fn entry(kind: EntryKind, bucket: u32, etag: u64, id: &str) -> ChangeLogEntry {
        ChangeLogEntry {
            kind,
            bucket,
            etag,
            id: id.to_string(),
            name: None,
            collection: Some("Users".to_string()),
            change_vector: format!("A:{etag}").parse().unwrap(),
            payload_ref: etag,
            modified_at_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_entry_kind_from_str() {
        assert_eq!("Document".parse::<EntryKind>().unwrap(), EntryKind::Document);
        assert_eq!(
            "TimeSeriesSegment".parse::<EntryKind>().unwrap(),
            EntryKind::TimeSeriesSegment
        );
        assert!(matches!(
            "Doc".parse::<EntryKind>(),
            Err(StoreError::InvalidKind { .. })
        ));
    }

    #[test]
    fn test_scan_by_bucket_filters_kind_and_bucket() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 5, 1, "a"));
        log.insert(entry(EntryKind::Document, 6, 2, "b"));
        log.insert(entry(EntryKind::Tombstone, 5, 3, "c"));
        log.insert(entry(EntryKind::Document, 5, 4, "d"));

        let got: Vec<_> = log.scan_by_bucket(EntryKind::Document, 5, 0).unwrap().collect();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|e| e.bucket == 5 && e.kind == EntryKind::Document));
        assert_eq!(got[0].etag, 1);
        assert_eq!(got[1].etag, 4);
    }

    #[test]
    fn test_scan_by_bucket_from_is_exclusive() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 5, 1, "a"));
        log.insert(entry(EntryKind::Document, 5, 2, "b"));
        log.insert(entry(EntryKind::Document, 5, 3, "c"));

        let got: Vec<_> = log.scan_by_bucket(EntryKind::Document, 5, 2).unwrap().collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].etag, 3);
    }

    #[test]
    fn test_scan_by_bucket_empty_bucket() {
        let log = ChangeLog::new();
        let got: Vec<_> = log.scan_by_bucket(EntryKind::Document, 7, 0).unwrap().collect();
        assert!(got.is_empty());
    }

    #[test]
    fn test_scan_by_bucket_invalid_bucket() {
        let log = ChangeLog::new();
        assert!(matches!(
            log.scan_by_bucket(EntryKind::Document, BUCKET_COUNT, 0),
            Err(StoreError::InvalidBucket { .. })
        ));
    }

    #[test]
    fn test_scan_ascending_order() {
        let mut log = ChangeLog::new();
        for etag in [5u64, 1, 9, 3] {
            log.insert(entry(EntryKind::Document, 1, etag, "x"));
        }
        let etags: Vec<u64> = log
            .scan_by_bucket(EntryKind::Document, 1, 0)
            .unwrap()
            .map(|e| e.etag)
            .collect();
        assert_eq!(etags, vec![1, 3, 5, 9]);
    }

    #[test]
    fn test_scan_is_snapshot() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 1, 1, "a"));
        let scan = log.scan_by_bucket(EntryKind::Document, 1, 0).unwrap();
        log.insert(entry(EntryKind::Document, 1, 2, "b"));
        assert_eq!(scan.count(), 1);
    }

    #[test]
    fn test_scan_all_global_order() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 9, 1, "a"));
        log.insert(entry(EntryKind::Tombstone, 2, 2, "b"));
        log.insert(entry(EntryKind::Counter, 5, 3, "c"));

        let etags: Vec<u64> = log.scan_all(0).map(|e| e.etag).collect();
        assert_eq!(etags, vec![1, 2, 3]);
        let etags: Vec<u64> = log.scan_all(1).map(|e| e.etag).collect();
        assert_eq!(etags, vec![2, 3]);
    }

    #[test]
    fn test_scan_all_by_bucket_order() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 9, 1, "a"));
        log.insert(entry(EntryKind::Document, 2, 2, "b"));
        log.insert(entry(EntryKind::Document, 9, 3, "c"));

        let keys: Vec<(u32, u64)> = log
            .scan_all_by_bucket_order(0)
            .map(|e| (e.bucket, e.etag))
            .collect();
        assert_eq!(keys, vec![(2, 2), (9, 1), (9, 3)]);
    }

    #[test]
    fn test_remove() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Document, 1, 1, "a"));
        log.remove(EntryKind::Document, 1, 1);
        assert!(log.is_empty());
        assert_eq!(log.last_etag(), 0);
    }

    #[test]
    fn test_last_etag() {
        let mut log = ChangeLog::new();
        assert_eq!(log.last_etag(), 0);
        log.insert(entry(EntryKind::Document, 1, 7, "a"));
        log.insert(entry(EntryKind::Revision, 1, 3, "b"));
        assert_eq!(log.last_etag(), 7);
    }

    #[test]
    fn test_entries_of_kind() {
        let mut log = ChangeLog::new();
        log.insert(entry(EntryKind::Tombstone, 3, 2, "a"));
        log.insert(entry(EntryKind::Tombstone, 1, 5, "b"));
        log.insert(entry(EntryKind::Document, 1, 1, "c"));

        let tombs = log.entries_of_kind(EntryKind::Tombstone);
        assert_eq!(tombs.len(), 2);
        assert_eq!(tombs[0].etag, 2);
        assert_eq!(tombs[1].etag, 5);
    }
}
