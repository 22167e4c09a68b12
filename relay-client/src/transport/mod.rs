//! Transport abstraction for the relay client.
//!
//! A transport is an opaque framed message channel:
//! - `open()` establishes a connection to an endpoint
//! - `write()` transmits one frame body
//! - `read()` receives one frame body
//! - `close()` terminates
//!
//! Every call is bounded by the transport's timeout, so a caller never
//! waits forever on a silent peer.

mod mock;
mod tcp;

pub use mock::MockTransport;
pub use tcp::{TcpTransport, DEFAULT_SOCKET_TIMEOUT, MAX_SOCKET_TIMEOUT, MIN_SOCKET_TIMEOUT};

use async_trait::async_trait;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// Write failed.
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// Read failed.
    #[error("read failed: {0}")]
    ReadFailed(String),

    /// Call exceeded the transport timeout.
    #[error("operation timed out")]
    Timeout,
}

impl TransportError {
    /// Failures worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::ConnectionFailed(_))
    }
}

/// Framed message channel to a router.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `endpoint` (`host:port` for TCP).
    async fn open(&self, endpoint: &str) -> Result<(), TransportError>;

    /// Send one frame body.
    async fn write(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame body.
    async fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Whether the connection is usable.
    fn is_valid(&self) -> bool;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}
