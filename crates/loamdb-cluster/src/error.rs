//! Error types for cluster state and consensus interaction.

use thiserror::Error;

/// Errors surfaced by the cluster layer.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A command was rejected by the consensus log.
    #[error("consensus rejected command: {msg}")]
    CommandRejected {
        /// Why the command was rejected.
        msg: String,
    },

    /// Waiting for a commit index timed out.
    #[error("timed out waiting for commit index {index} after {timeout_ms}ms")]
    IndexTimeout {
        /// The index that was awaited.
        index: u64,
        /// The timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The database record does not exist in the cluster log.
    #[error("no database record for '{database}'")]
    NoDatabaseRecord {
        /// The database name.
        database: String,
    },

    /// A persisted cluster value failed to decode.
    #[error("malformed cluster value under '{key}'")]
    MalformedValue {
        /// The cluster key of the value.
        key: String,
    },

    /// Blob serialization failed.
    #[error("serialization error")]
    Serialization(#[from] bincode::Error),
}

/// Convenience result alias for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
