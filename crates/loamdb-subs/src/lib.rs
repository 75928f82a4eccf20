#![warn(missing_docs)]

//! loamdb subscription delivery engine: long-lived, resumable document
//! streams served to external workers with single-active-worker semantics,
//! acknowledgement-driven checkpoints through consensus, and shard-aware
//! filtering.

pub mod connection;
pub mod criteria;
pub mod error;
pub mod messages;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use connection::SubscriptionConnection;
pub use criteria::{CompareOp, FieldPredicate, SubscriptionCriteria};
pub use error::{Result, SubscriptionError};
pub use messages::{
    BatchAck, BatchItem, DropCause, ServerFrame, SubscriptionConnectOptions,
    SubscriptionOpeningStrategy, SubscriptionStatus, SubscriptionStatusMessage,
};
pub use state::SubscriptionStore;
pub use supervisor::{SubscriptionConfig, SubscriptionSupervisor};
pub use worker::{SubscriptionBatch, SubscriptionTransport, SubscriptionWorker, WorkerOptions};
