//! Error types for the store and change log.

use thiserror::Error;

/// Errors that can occur in the document store and change log.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A bucket id outside the valid bucket space was supplied.
    #[error("invalid bucket {bucket}: must be in [0, {max})")]
    InvalidBucket {
        /// The offending bucket id.
        bucket: u32,
        /// The exclusive upper bound of the bucket space.
        max: u32,
    },

    /// An unknown change-log entry kind was supplied.
    #[error("invalid change log entry kind: {kind}")]
    InvalidKind {
        /// The unrecognized kind string or discriminant.
        kind: String,
    },

    /// A change vector string failed to parse.
    #[error("malformed change vector: {raw}")]
    MalformedChangeVector {
        /// The raw string that failed to parse.
        raw: String,
    },

    /// The requested document does not exist.
    #[error("document not found: {id}")]
    DocumentNotFound {
        /// The missing document id.
        id: String,
    },

    /// The shard range table does not cover the requested bucket.
    #[error("no shard range covers bucket {bucket}")]
    NoRangeForBucket {
        /// The uncovered bucket id.
        bucket: u32,
    },

    /// The database has been deleted; all operations are rejected.
    #[error("Database '{database}' does not exist.")]
    DatabaseDoesNotExist {
        /// The database name.
        database: String,
    },

    /// Payload serialization failed.
    #[error("payload serialization error")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the underlying engine.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
