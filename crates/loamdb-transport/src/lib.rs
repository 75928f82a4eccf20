#![warn(missing_docs)]

//! loamdb transport layer: length-prefixed framing, the replication wire
//! messages, protocol version negotiation, cooperative cancellation, and
//! heartbeat liveness tracking.

pub mod cancel;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod message;
pub mod version;

pub use cancel::{cancel_pair, CancelHandle, CancelReason, CancelToken, CancelledError};
pub use error::{Result, TransportError};
pub use frame::{
    read_binary_block, read_json_frame, write_binary_block, write_json_frame, DynStream,
};
pub use heartbeat::{HeartbeatClock, HeartbeatConfig};
pub use message::{
    BatchMessage, MessageType, ReplicationLatestEtagRequest, ReplicationMessageReply, ReplyType,
    TcpConnectionHeader, TcpOperation,
};
pub use version::{ensure_supported, REPLICATION_PROTOCOL_VERSION, SUBSCRIPTION_PROTOCOL_VERSION};
