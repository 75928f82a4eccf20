#![warn(missing_docs)]

//! loamdb replication subsystem: outbound workers streaming the change log
//! to peers, inbound handlers applying received batches, and the loader
//! that supervises both and interlocks with the tombstone cleaner.

pub mod backoff;
pub mod batch;
pub mod connector;
pub mod destination;
pub mod error;
pub mod incoming;
pub mod loader;
pub mod outgoing;

pub use backoff::ConnectionShutdownInfo;
pub use connector::{Connector, TcpConnector};
pub use destination::{DestinationId, DestinationKind, ReplicationDestination};
pub use error::{ReplError, Result};
pub use incoming::{IncomingReplicationHandler, IncomingStats, SourceInfo};
pub use loader::{ReplicationConfig, ReplicationLoader};
pub use outgoing::{OutgoingReplicationHandler, OutgoingState, OutgoingStats};
