#![warn(missing_docs)]

//! loamdb document store core: bucket mapping, change-vector algebra, the
//! bucket-addressed change log, and the in-memory document store the
//! replication and subscription engines read from.

pub mod bucket;
pub mod change_vector;
pub mod changelog;
pub mod error;
pub mod store;
pub mod tombstone;

pub use bucket::{bucket_of, routing_key, BucketMigration, MigrationStatus, ShardRange, BUCKET_COUNT};
pub use change_vector::{ChangeVector, VectorOrder};
pub use changelog::{ChangeLogEntry, EntryKind};
pub use error::{Result, StoreError};
pub use store::{Document, DocumentStore, Payload, StoreConfig};
pub use tombstone::{MinimalEtagProvider, TombstoneCleaner};
