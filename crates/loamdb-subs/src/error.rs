//! Error types for the subscription engine.
//!
//! User-visible failures always embed the subscription name, node tag, and
//! database name; the message texts here are part of the contract with
//! workers.

use thiserror::Error;

use loamdb_cluster::ClusterError;
use loamdb_store::StoreError;
use loamdb_transport::{CancelReason, TransportError};

/// Errors that can occur while serving or consuming a subscription.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// The database hosting the subscription is gone.
    #[error("Database '{database}' does not exist.")]
    DatabaseDoesNotExist {
        /// The missing database.
        database: String,
    },

    /// The subscription was stopped because its database is being deleted.
    #[error("Stopping subscription '{name}' on node {node_tag}, because database '{database}' is being deleted.")]
    SubscriptionDoesNotExist {
        /// The subscription name.
        name: String,
        /// The node serving it.
        node_tag: String,
        /// The database being deleted.
        database: String,
    },

    /// No subscription with this name is defined.
    #[error("subscription '{name}' is not defined")]
    NotFound {
        /// The unknown subscription name.
        name: String,
    },

    /// Another worker holds the subscription and the strategy does not
    /// queue or take over.
    #[error("subscription '{name}' is in use by another worker")]
    InUse {
        /// The contended subscription name.
        name: String,
    },

    /// The connection was closed by the supervisor.
    #[error("subscription '{name}' connection closed: {reason}")]
    Closed {
        /// The subscription name.
        name: String,
        /// Why it was closed (e.g. "taken over").
        reason: String,
    },

    /// The worker's handler failed and errors are not ignored.
    #[error("subscriber handler failed: {message}")]
    SubscriberError {
        /// The handler's error text.
        message: String,
    },

    /// The worker failed continuously for longer than its maximum
    /// erroneous period.
    #[error("subscription '{name}' exceeded the maximum erroneous period: {message}")]
    ErroneousPeriodExceeded {
        /// The subscription name.
        name: String,
        /// The last error observed.
        message: String,
    },

    /// A terminal server-side failure relayed to the worker verbatim; the
    /// message is the exact text the server composed.
    #[error("{message}")]
    Server {
        /// The server's error text.
        message: String,
    },

    /// A malformed or unexpected frame on the subscription stream.
    #[error("subscription protocol violation: {msg}")]
    Protocol {
        /// What went wrong.
        msg: String,
    },

    /// Cluster log failure while reading or advancing the cursor.
    #[error("consensus error")]
    Consensus(#[from] ClusterError),

    /// Local store failure.
    #[error("store error")]
    Store(#[from] StoreError),

    /// Transport failure. Workers reconnect on these.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection observed cooperative cancellation.
    #[error("cancelled: {0}")]
    Cancelled(CancelReason),
}

impl SubscriptionError {
    /// True for failures a worker recovers from by reconnecting. An
    /// explicit drop or take-over is terminal: the evicted worker's run
    /// future completes instead of fighting for the subscription back.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubscriptionError::Transport(_) | SubscriptionError::SubscriberError { .. }
        )
    }
}

/// Convenience result alias for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
