//! Error types for the router.

use relay_core::CryptoError;
use relay_types::{ClientId, GroupId, WireError};

use crate::table::EntityId;

/// Main error type for router operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] crate::limits::RateLimitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Frame could not be decoded or encoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Sealed payload could not be opened or sealed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Unexpected message type.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Expected message type.
        expected: &'static str,
        /// Actual message type received.
        actual: &'static str,
    },

    /// Protocol version mismatch.
    #[error("protocol version mismatch: client={client}, router={router}")]
    VersionMismatch {
        /// Client protocol version.
        client: u8,
        /// Router protocol version.
        router: u8,
    },

    /// Sealed frame carried another session's id.
    #[error("sealed frame for a foreign session")]
    ForeignSession,

    /// No handshake within the socket timeout.
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Table inconsistencies found while removing entities.
///
/// These never abort a sweep; they are logged and the pass moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SweepError {
    /// A client record pointed at a group with no member table.
    #[error("client {client} missing from group {group}")]
    MissingGroup {
        /// Client being removed.
        client: ClientId,
        /// Group it claimed to belong to.
        group: GroupId,
    },

    /// A side table held a record for an entity the arena no longer knows.
    #[error("entity {0} has no arena entry")]
    MissingEntity(EntityId),
}

/// Result type alias for router operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for session operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::VersionMismatch {
            client: 2,
            router: 1,
        };
        assert_eq!(
            err.to_string(),
            "protocol version mismatch: client=2, router=1"
        );

        let err = SweepError::MissingEntity(EntityId::from_raw(7));
        assert_eq!(err.to_string(), "entity #7 has no arena entry");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RelayError>();
        assert_send_sync::<ProtocolError>();
        assert_send_sync::<SweepError>();
    }
}
