//! Error taxonomy for the replication subsystem.
//!
//! Every failure maps to exactly one class, which decides the recovery
//! action: transports reconnect with backoff, protocol violations get one
//! retry, ownership changes re-target, and fatal conditions unwind the
//! database.

use thiserror::Error;

use loamdb_cluster::ClusterError;
use loamdb_store::StoreError;
use loamdb_transport::{CancelReason, TransportError};

/// Errors that can occur in the replication subsystem.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Socket error or unexpected EOF. Recoverable; reconnect with backoff.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Malformed frame, unexpected message type, or version mismatch.
    /// Recoverable once; repeated occurrences surface and stop.
    #[error("protocol violation: {msg}")]
    Protocol {
        /// What the peer did wrong.
        msg: String,
    },

    /// The destination node reports this task is not its own. The worker
    /// re-queries topology and either re-targets or drops itself.
    #[error("destination is not the owner of task '{task}'")]
    NotOwner {
        /// The task in question.
        task: String,
    },

    /// The peer database was deleted or never existed. Fatal for the
    /// specific destination.
    #[error("database '{database}' is gone: {msg}")]
    DatabaseGone {
        /// The missing database.
        database: String,
        /// The peer's own description of the condition.
        msg: String,
    },

    /// A command was rejected by the cluster log. Retry with jitter; if
    /// persistent, surface.
    #[error("consensus error")]
    Consensus(#[from] ClusterError),

    /// Local store failure.
    #[error("store error")]
    Store(#[from] StoreError),

    /// The operation observed cooperative cancellation.
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),

    /// Broken invariant: inconsistent change vector, corrupted frame, or a
    /// programmer error. Shuts the database down.
    #[error("fatal replication error: {msg}")]
    Fatal {
        /// Description of the broken invariant.
        msg: String,
    },
}

impl ReplError {
    /// True for errors the worker recovers from locally by reconnecting.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReplError::Transport(_) | ReplError::Protocol { .. })
    }
}

/// Convenience result alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;
