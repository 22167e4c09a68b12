//! Client error type.

use relay_core::CryptoError;
use relay_types::{ResponseStatus, WireError};
use thiserror::Error;

use crate::transport::TransportError;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Wire encoding error.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Local file error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// No session with the router.
    #[error("not connected")]
    NotConnected,

    /// Router refused the connection.
    #[error("rejected by router: {0}")]
    Rejected(String),

    /// Router answered with something unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A phase handler panicked.
    #[error("phase handler panicked: {0}")]
    Panicked(String),

    /// Router answered with a failure status.
    #[error("{request} failed: {status:?}")]
    Status {
        /// Request kind.
        request: &'static str,
        /// Router status.
        status: ResponseStatus,
    },
}

impl ClientError {
    /// Failures that a later retry may get past.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(e) => e.is_transient(),
            ClientError::NotConnected => true,
            ClientError::Status { status, .. } => matches!(
                status,
                ResponseStatus::Busy | ResponseStatus::TooManyRequests | ResponseStatus::InternalError
            ),
            _ => false,
        }
    }
}
