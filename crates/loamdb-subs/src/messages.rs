//! Worker-facing subscription wire messages.
//!
//! After the connection header, the worker sends its options; the server
//! answers with a status. Accepted connections then carry batch frames
//! from the server and acknowledgements from the worker, with heartbeats
//! while the stream is at the tail.

use serde::{Deserialize, Serialize};

/// How a worker wants to open a contended subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionOpeningStrategy {
    /// Accept only if no worker is active; reject otherwise.
    OpenIfFree,
    /// Park in a FIFO queue; promoted when the active worker leaves.
    WaitForFree,
    /// Evict the active worker and take its place.
    TakeOver,
    /// Share the batch space with other concurrent workers.
    Concurrent,
}

/// Options a worker presents when opening a subscription. Complete
/// enumeration; unknown options are a protocol violation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConnectOptions {
    /// The subscription to open.
    pub subscription_name: String,
    /// Contention strategy.
    pub strategy: SubscriptionOpeningStrategy,
    /// Upper bound on batch size.
    pub max_docs_per_batch: usize,
    /// Advance the cursor even when the handler fails.
    pub ignore_subscriber_errors: bool,
    /// Worker-side delay between reconnection attempts, in milliseconds.
    pub time_to_wait_before_connection_retry_ms: u64,
    /// Give up permanently after continuous failures for this long, in
    /// milliseconds.
    pub max_erroneous_period_ms: u64,
}

impl Default for SubscriptionConnectOptions {
    fn default() -> Self {
        Self {
            subscription_name: String::new(),
            strategy: SubscriptionOpeningStrategy::OpenIfFree,
            max_docs_per_batch: 4096,
            ignore_subscriber_errors: false,
            time_to_wait_before_connection_retry_ms: 5_000,
            max_erroneous_period_ms: 5 * 60 * 1_000,
        }
    }
}

/// The server's verdict on an open request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    /// The worker is now active.
    Accepted,
    /// Another worker is active and the strategy does not queue.
    InUse,
    /// No such subscription.
    NotFound,
    /// The database is gone.
    DatabaseGone,
    /// The request was malformed.
    Invalid,
}

/// Status frame sent once per open request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionStatusMessage {
    /// The verdict.
    pub status: SubscriptionStatus,
    /// Human-readable detail; for terminal statuses this is the exact
    /// error text the worker surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// One document delivered to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem {
    /// Document id.
    pub id: String,
    /// Collection.
    pub collection: String,
    /// Document body.
    pub data: serde_json::Value,
    /// Change vector of the delivered version.
    pub change_vector: String,
}

/// Why the server dropped a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DropCause {
    /// A TakeOver worker evicted this one.
    TakenOver,
    /// An operator or the supervisor closed the connection.
    Dropped,
    /// The database is being deleted.
    DatabaseDeleted,
    /// The subscription definition was removed.
    SubscriptionRemoved,
    /// The worker's handler kept failing and errors are not ignored.
    SubscriberError,
}

/// Frames sent from the server to the worker after acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerFrame {
    /// A batch of documents; acknowledge with `BatchAck`.
    Batch {
        /// The documents, in delivery order.
        items: Vec<BatchItem>,
        /// Cursor value after this batch; echo it in the acknowledgement.
        last_change_vector: String,
    },
    /// Liveness signal while the stream is at the tail.
    Heartbeat,
    /// Terminal frame: the connection is over.
    Dropped {
        /// Machine-readable cause.
        cause: DropCause,
        /// The exact error text the worker surfaces.
        message: String,
    },
}

/// Worker acknowledgement of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAck {
    /// The `last_change_vector` of the acknowledged batch.
    pub change_vector: String,
    /// None on success; the handler's error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchAck {
    /// A successful acknowledgement.
    pub fn ok(change_vector: impl Into<String>) -> Self {
        Self {
            change_vector: change_vector.into(),
            error: None,
        }
    }

    /// A failed acknowledgement with the handler's error.
    pub fn failed(change_vector: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            change_vector: change_vector.into(),
            error: Some(error.into()),
        }
    }

    /// True when the handler processed the batch.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_options_roundtrip() {
        let options = SubscriptionConnectOptions {
            subscription_name: "people".into(),
            strategy: SubscriptionOpeningStrategy::WaitForFree,
            max_docs_per_batch: 1,
            ignore_subscriber_errors: true,
            time_to_wait_before_connection_retry_ms: 5_000,
            max_erroneous_period_ms: 60_000,
        };
        let json = serde_json::to_string(&options).unwrap();
        let back: SubscriptionConnectOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, options);
    }

    #[test]
    fn test_server_frame_tagging() {
        let frame = ServerFrame::Batch {
            items: vec![BatchItem {
                id: "users/1".into(),
                collection: "Users".into(),
                data: json!({"Name": "oren"}),
                change_vector: "A:1".into(),
            }],
            last_change_vector: "A:1".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["kind"], "Batch");

        let hb = serde_json::to_value(ServerFrame::Heartbeat).unwrap();
        assert_eq!(hb["kind"], "Heartbeat");
    }

    #[test]
    fn test_ack_constructors() {
        assert!(BatchAck::ok("A:1").is_ok());
        let failed = BatchAck::failed("A:1", "boom");
        assert!(!failed.is_ok());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
