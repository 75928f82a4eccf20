//! Deterministic document id → bucket → shard mapping.
//!
//! Every document id hashes into a fixed bucket space of 2^20 buckets.
//! Contiguous bucket ranges are owned by shards; a bucket migration
//! temporarily owns a bucket on both its source and destination shard.
//! The hash MUST be byte-for-byte reproducible on every node.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Number of buckets in the bucket space. Buckets are in `[0, BUCKET_COUNT)`.
pub const BUCKET_COUNT: u32 = 1 << 20;

/// Separator that splits a document id from its routing key.
/// `users/7$tenantA` routes by `tenantA`.
pub const ROUTING_SEPARATOR: char = '$';

/// Compute FNV-1a 64 over a byte slice (offset basis 0xcbf29ce484222325,
/// prime 0x100000001b3). Stable across platforms and languages.
fn fnv1a64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Extract the routing key from a document id: the segment after the last
/// `$` separator, or the full id when no separator is present.
pub fn routing_key(id: &str) -> &str {
    match id.rfind(ROUTING_SEPARATOR) {
        Some(pos) => &id[pos + ROUTING_SEPARATOR.len_utf8()..],
        None => id,
    }
}

/// Map a document id to its bucket. Ids are hashed byte-for-byte with no
/// normalization, so the result is identical on every node.
pub fn bucket_of(id: &str) -> u32 {
    (fnv1a64(routing_key(id).as_bytes()) % BUCKET_COUNT as u64) as u32
}

/// Validate that a bucket id is inside the bucket space.
pub fn validate_bucket(bucket: u32) -> Result<()> {
    if bucket >= BUCKET_COUNT {
        return Err(StoreError::InvalidBucket {
            bucket,
            max: BUCKET_COUNT,
        });
    }
    Ok(())
}

/// A half-open interval `[lo, hi)` of bucket ids owned by one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRange {
    /// First bucket in the range (inclusive).
    pub lo: u32,
    /// First bucket past the range (exclusive).
    pub hi: u32,
    /// The shard owning this range.
    pub shard: u32,
}

impl ShardRange {
    /// Create a new shard range.
    pub fn new(lo: u32, hi: u32, shard: u32) -> Self {
        Self { lo, hi, shard }
    }
}

/// Status machine of a bucket migration. At most one migration per bucket
/// is active at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Data is being copied; the source still owns writes.
    Moving,
    /// The destination owns writes; the source may still serve reads.
    OwnershipTransferred,
    /// Migration complete; the source no longer holds the bucket.
    Finalized,
}

/// An in-flight migration of one bucket between two shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMigration {
    /// The migrating bucket.
    pub bucket: u32,
    /// Shard the bucket is moving from.
    pub source_shard: u32,
    /// Shard the bucket is moving to.
    pub destination_shard: u32,
    /// Current status.
    pub status: MigrationStatus,
}

impl BucketMigration {
    /// Create a new migration in the `Moving` state.
    pub fn new(bucket: u32, source_shard: u32, destination_shard: u32) -> Self {
        Self {
            bucket,
            source_shard,
            destination_shard,
            status: MigrationStatus::Moving,
        }
    }

    /// Advance the status machine one step. `Finalized` is terminal.
    pub fn advance(&mut self) {
        self.status = match self.status {
            MigrationStatus::Moving => MigrationStatus::OwnershipTransferred,
            MigrationStatus::OwnershipTransferred => MigrationStatus::Finalized,
            MigrationStatus::Finalized => MigrationStatus::Finalized,
        };
    }
}

/// Find the range owning a bucket. Ranges must be sorted by `lo`; the bucket
/// is assigned to the range whose `lo` is the greatest value `<= bucket`.
pub fn range_owner(bucket: u32, ranges: &[ShardRange]) -> Result<u32> {
    validate_bucket(bucket)?;
    let idx = match ranges.binary_search_by(|r| r.lo.cmp(&bucket)) {
        Ok(i) => i,
        Err(0) => return Err(StoreError::NoRangeForBucket { bucket }),
        Err(i) => i - 1,
    };
    Ok(ranges[idx].shard)
}

/// Resolve the shard that accepts writes for a bucket. During a migration,
/// writes go to the source until `OwnershipTransferred`, then to the
/// destination.
pub fn shard_for_write(
    bucket: u32,
    ranges: &[ShardRange],
    migrations: &[BucketMigration],
) -> Result<u32> {
    let owner = range_owner(bucket, ranges)?;
    match migrations.iter().find(|m| m.bucket == bucket) {
        Some(m) => Ok(match m.status {
            MigrationStatus::Moving => m.source_shard,
            MigrationStatus::OwnershipTransferred | MigrationStatus::Finalized => {
                m.destination_shard
            }
        }),
        None => Ok(owner),
    }
}

/// Resolve the shards that may serve reads for a bucket. Outside a
/// migration this is the single range owner; during a migration both the
/// source and destination are readable.
pub fn shards_for_read(
    bucket: u32,
    ranges: &[ShardRange],
    migrations: &[BucketMigration],
) -> Result<Vec<u32>> {
    let owner = range_owner(bucket, ranges)?;
    match migrations.iter().find(|m| m.bucket == bucket) {
        Some(m) if m.status != MigrationStatus::Finalized => {
            Ok(vec![m.source_shard, m.destination_shard])
        }
        Some(m) => Ok(vec![m.destination_shard]),
        None => Ok(vec![owner]),
    }
}

/// True if `shard` is the authoritative (write-owning) shard for a bucket
/// given the current migration state.
pub fn is_authoritative(
    shard: u32,
    bucket: u32,
    ranges: &[ShardRange],
    migrations: &[BucketMigration],
) -> Result<bool> {
    Ok(shard_for_write(bucket, ranges, migrations)? == shard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_full_id() {
        assert_eq!(routing_key("users/7"), "users/7");
    }

    #[test]
    fn test_routing_key_with_separator() {
        assert_eq!(routing_key("users/7$tenantA"), "tenantA");
    }

    #[test]
    fn test_routing_key_multiple_separators_uses_last() {
        assert_eq!(routing_key("a$b$c"), "c");
    }

    #[test]
    fn test_routing_key_trailing_separator() {
        assert_eq!(routing_key("users/7$"), "");
    }

    #[test]
    fn test_fnv1a64_fixed_vectors() {
        // Reference values for FNV-1a 64 with the standard offset basis/prime.
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_bucket_of_is_deterministic() {
        let b1 = bucket_of("users/7$tenantA");
        let b2 = bucket_of("users/7$tenantA");
        assert_eq!(b1, b2);
        assert!(b1 < BUCKET_COUNT);
    }

    #[test]
    fn test_bucket_of_routes_by_suffix() {
        // Ids sharing a routing key land in the same bucket.
        assert_eq!(bucket_of("users/1$tenantA"), bucket_of("orders/9$tenantA"));
        assert_eq!(bucket_of("users/1$tenantA"), bucket_of("tenantA"));
    }

    #[test]
    fn test_bucket_of_case_sensitive() {
        assert_ne!(bucket_of("TenantA"), bucket_of("tenanta"));
    }

    #[test]
    fn test_validate_bucket() {
        assert!(validate_bucket(0).is_ok());
        assert!(validate_bucket(BUCKET_COUNT - 1).is_ok());
        assert!(matches!(
            validate_bucket(BUCKET_COUNT),
            Err(StoreError::InvalidBucket { .. })
        ));
    }

    fn three_ranges() -> Vec<ShardRange> {
        vec![
            ShardRange::new(0, 350_000, 0),
            ShardRange::new(350_000, 700_000, 1),
            ShardRange::new(700_000, BUCKET_COUNT, 2),
        ]
    }

    #[test]
    fn test_range_owner_boundaries() {
        let ranges = three_ranges();
        assert_eq!(range_owner(0, &ranges).unwrap(), 0);
        assert_eq!(range_owner(349_999, &ranges).unwrap(), 0);
        assert_eq!(range_owner(350_000, &ranges).unwrap(), 1);
        assert_eq!(range_owner(BUCKET_COUNT - 1, &ranges).unwrap(), 2);
    }

    #[test]
    fn test_range_owner_no_covering_range() {
        let ranges = vec![ShardRange::new(100, 200, 0)];
        assert!(matches!(
            range_owner(50, &ranges),
            Err(StoreError::NoRangeForBucket { bucket: 50 })
        ));
    }

    #[test]
    fn test_range_owner_rejects_invalid_bucket() {
        let ranges = three_ranges();
        assert!(matches!(
            range_owner(BUCKET_COUNT, &ranges),
            Err(StoreError::InvalidBucket { .. })
        ));
    }

    #[test]
    fn test_shard_for_write_no_migration() {
        let ranges = three_ranges();
        assert_eq!(shard_for_write(400_000, &ranges, &[]).unwrap(), 1);
    }

    #[test]
    fn test_shard_for_write_during_migration() {
        let ranges = three_ranges();
        let mut m = BucketMigration::new(400_000, 1, 2);

        assert_eq!(shard_for_write(400_000, &ranges, &[m.clone()]).unwrap(), 1);

        m.advance();
        assert_eq!(m.status, MigrationStatus::OwnershipTransferred);
        assert_eq!(shard_for_write(400_000, &ranges, &[m.clone()]).unwrap(), 2);

        m.advance();
        assert_eq!(m.status, MigrationStatus::Finalized);
        assert_eq!(shard_for_write(400_000, &ranges, &[m]).unwrap(), 2);
    }

    #[test]
    fn test_shards_for_read_during_migration() {
        let ranges = three_ranges();
        let m = BucketMigration::new(400_000, 1, 2);
        assert_eq!(shards_for_read(400_000, &ranges, &[m]).unwrap(), vec![1, 2]);
        assert_eq!(shards_for_read(400_000, &ranges, &[]).unwrap(), vec![1]);
    }

    #[test]
    fn test_migration_advance_is_terminal() {
        let mut m = BucketMigration::new(1, 0, 1);
        m.advance();
        m.advance();
        m.advance();
        assert_eq!(m.status, MigrationStatus::Finalized);
    }

    #[test]
    fn test_is_authoritative() {
        let ranges = three_ranges();
        let m = BucketMigration {
            bucket: 400_000,
            source_shard: 1,
            destination_shard: 2,
            status: MigrationStatus::OwnershipTransferred,
        };
        assert!(!is_authoritative(1, 400_000, &ranges, &[m.clone()]).unwrap());
        assert!(is_authoritative(2, 400_000, &ranges, &[m]).unwrap());
        assert!(is_authoritative(1, 400_000, &ranges, &[]).unwrap());
    }
}
