//! Error types for the wire layer.

use thiserror::Error;

/// Errors produced while encoding, decoding or framing wire messages.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// Peer speaks a protocol version we do not
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Frame length prefix exceeds the maximum
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Announced frame size.
        size: usize,
        /// Maximum accepted frame size.
        max: usize,
    },

    /// Invalid data format
    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WireError::UnsupportedVersion(9);
        assert_eq!(err.to_string(), "unsupported protocol version: 9");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WireError>();
    }
}
