//! Error types for the transport layer.

use thiserror::Error;

use crate::cancel::CancelReason;

/// Errors that can occur on a transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection to a peer was refused.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// The address that refused.
        addr: String,
    },

    /// The peer closed the connection mid-stream.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// A frame's declared length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A frame could not be understood.
    #[error("invalid frame: {reason}")]
    InvalidFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The peer speaks an unsupported protocol version.
    #[error("protocol version mismatch: ours {ours}, theirs {theirs}")]
    VersionMismatch {
        /// The version this node speaks.
        ours: u32,
        /// The version the peer offered.
        theirs: u32,
    },

    /// JSON encoding or decoding of a control frame failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The operation was cancelled cooperatively.
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// A read or write did not complete within its deadline.
    #[error("transport timeout after {timeout_ms}ms")]
    Timeout {
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// Underlying socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
