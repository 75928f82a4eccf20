//! Change-vector algebra.
//!
//! A change vector is a per-database vector clock serialized as
//! `dbId:etag[,dbId:etag]*`. Vectors are merged entry-wise by max and
//! compared under the usual vector-clock partial order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Outcome of comparing two change vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOrder {
    /// Both vectors carry identical entries.
    Equal,
    /// Every entry of self is `<=` the other's, at least one strictly.
    Before,
    /// Every entry of self is `>=` the other's, at least one strictly.
    After,
    /// Neither dominates: a concurrent update (conflict).
    Concurrent,
}

/// A parsed change vector: database id → highest observed etag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeVector {
    entries: BTreeMap<String, u64>,
}

impl ChangeVector {
    /// Create an empty change vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if the vector has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The etag recorded for a database id, or 0 if absent.
    pub fn etag_for(&self, db_id: &str) -> u64 {
        self.entries.get(db_id).copied().unwrap_or(0)
    }

    /// Return a copy with `db_id` raised to `etag` (entry-wise max).
    pub fn with(&self, db_id: &str, etag: u64) -> Self {
        let mut out = self.clone();
        let slot = out.entries.entry(db_id.to_string()).or_insert(0);
        *slot = (*slot).max(etag);
        out
    }

    /// Merge another vector into this one, entry-wise max.
    pub fn merge(&mut self, other: &ChangeVector) {
        for (db, &etag) in &other.entries {
            let slot = self.entries.entry(db.clone()).or_insert(0);
            *slot = (*slot).max(etag);
        }
    }

    /// Merged copy of two vectors.
    pub fn merged(&self, other: &ChangeVector) -> Self {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Compare under the vector-clock partial order. Absent entries count
    /// as etag 0.
    pub fn compare(&self, other: &ChangeVector) -> VectorOrder {
        let mut some_less = false;
        let mut some_greater = false;
        for db in self.entries.keys().chain(other.entries.keys()) {
            let a = self.etag_for(db);
            let b = other.etag_for(db);
            if a < b {
                some_less = true;
            } else if a > b {
                some_greater = true;
            }
        }
        match (some_less, some_greater) {
            (false, false) => VectorOrder::Equal,
            (true, false) => VectorOrder::Before,
            (false, true) => VectorOrder::After,
            (true, true) => VectorOrder::Concurrent,
        }
    }

    /// Iterate `(db_id, etag)` pairs in database-id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, &v)| (k.as_str(), v))
    }
}

impl fmt::Display for ChangeVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (db, etag) in &self.entries {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", db, etag)?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for ChangeVector {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        if s.trim().is_empty() {
            return Ok(Self { entries });
        }
        for part in s.split(',') {
            let (db, etag) = part
                .trim()
                .rsplit_once(':')
                .ok_or_else(|| StoreError::MalformedChangeVector { raw: s.to_string() })?;
            if db.is_empty() {
                return Err(StoreError::MalformedChangeVector { raw: s.to_string() });
            }
            let etag: u64 = etag
                .parse()
                .map_err(|_| StoreError::MalformedChangeVector { raw: s.to_string() })?;
            let slot = entries.entry(db.to_string()).or_insert(0);
            *slot = (*slot).max(etag);
        }
        Ok(Self { entries })
    }
}

impl TryFrom<String> for ChangeVector {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ChangeVector> for String {
    fn from(cv: ChangeVector) -> String {
        cv.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cv(s: &str) -> ChangeVector {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display_roundtrip() {
        let v = cv("A:7,B:3");
        assert_eq!(v.etag_for("A"), 7);
        assert_eq!(v.etag_for("B"), 3);
        assert_eq!(v.to_string(), "A:7,B:3");
    }

    #[test]
    fn test_parse_empty() {
        let v = cv("");
        assert!(v.is_empty());
        assert_eq!(v.to_string(), "");
    }

    #[test]
    fn test_parse_malformed() {
        assert!("A".parse::<ChangeVector>().is_err());
        assert!("A:x".parse::<ChangeVector>().is_err());
        assert!(":5".parse::<ChangeVector>().is_err());
    }

    #[test]
    fn test_etag_for_absent_is_zero() {
        assert_eq!(cv("A:7").etag_for("B"), 0);
    }

    #[test]
    fn test_with_raises_only() {
        let v = cv("A:7");
        assert_eq!(v.with("A", 9).etag_for("A"), 9);
        assert_eq!(v.with("A", 3).etag_for("A"), 7);
        assert_eq!(v.with("B", 1).etag_for("B"), 1);
    }

    #[test]
    fn test_merge_entrywise_max() {
        let mut a = cv("A:7,B:1");
        a.merge(&cv("A:3,B:9,C:2"));
        assert_eq!(a, cv("A:7,B:9,C:2"));
    }

    #[test]
    fn test_compare_equal() {
        assert_eq!(cv("A:1,B:2").compare(&cv("A:1,B:2")), VectorOrder::Equal);
        assert_eq!(cv("").compare(&cv("")), VectorOrder::Equal);
    }

    #[test]
    fn test_compare_before_after() {
        assert_eq!(cv("A:1").compare(&cv("A:2")), VectorOrder::Before);
        assert_eq!(cv("A:2").compare(&cv("A:1")), VectorOrder::After);
        // Absent entries count as zero.
        assert_eq!(cv("A:1").compare(&cv("A:1,B:1")), VectorOrder::Before);
        assert_eq!(cv("A:1,B:1").compare(&cv("A:1")), VectorOrder::After);
    }

    #[test]
    fn test_compare_concurrent() {
        assert_eq!(cv("A:2,B:1").compare(&cv("A:1,B:2")), VectorOrder::Concurrent);
        assert_eq!(cv("A:1").compare(&cv("B:1")), VectorOrder::Concurrent);
    }

    #[test]
    fn test_serde_as_string() {
        let v = cv("A:7,B:3");
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, "\"A:7,B:3\"");
        let back: ChangeVector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_parse_duplicate_db_takes_max() {
        assert_eq!(cv("A:3,A:7").etag_for("A"), 7);
    }
}
