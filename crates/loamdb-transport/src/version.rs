//! Protocol version negotiation.
//!
//! The initiator states its version in the connection header; the acceptor
//! rejects anything it does not speak. Versions are plain integers bumped
//! on incompatible wire changes.

use crate::error::{Result, TransportError};

/// Current replication protocol version.
pub const REPLICATION_PROTOCOL_VERSION: u32 = 1;

/// Current subscription protocol version.
pub const SUBSCRIPTION_PROTOCOL_VERSION: u32 = 1;

/// Versions this node can still serve, newest first.
pub const SUPPORTED_VERSIONS: [u32; 1] = [1];

/// Check that a peer's offered version is one this node speaks.
pub fn ensure_supported(ours: u32, theirs: u32) -> Result<()> {
    if SUPPORTED_VERSIONS.contains(&theirs) {
        Ok(())
    } else {
        Err(TransportError::VersionMismatch { ours, theirs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_version_is_supported() {
        assert!(ensure_supported(REPLICATION_PROTOCOL_VERSION, REPLICATION_PROTOCOL_VERSION).is_ok());
        assert!(ensure_supported(SUBSCRIPTION_PROTOCOL_VERSION, SUBSCRIPTION_PROTOCOL_VERSION).is_ok());
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = ensure_supported(1, 999).unwrap_err();
        assert!(matches!(
            err,
            TransportError::VersionMismatch { ours: 1, theirs: 999 }
        ));
    }
}
