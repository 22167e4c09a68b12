//! TCP transport with length-prefixed frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use relay_types::{read_frame, write_frame};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{Transport, TransportError};

/// Default per-call timeout.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Shortest accepted per-call timeout.
pub const MIN_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);

/// Longest accepted per-call timeout.
pub const MAX_SOCKET_TIMEOUT: Duration = Duration::from_secs(60);

/// Transport over a TCP stream.
///
/// Reads and writes hold separate locks, so a write is never queued
/// behind a pending read.
#[derive(Debug)]
pub struct TcpTransport {
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: AtomicBool,
    timeout: Duration,
}

impl TcpTransport {
    /// A closed transport with the default timeout.
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SOCKET_TIMEOUT)
    }

    /// A closed transport with `timeout`, clamped to 3-60 seconds.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            connected: AtomicBool::new(false),
            timeout: timeout.clamp(MIN_SOCKET_TIMEOUT, MAX_SOCKET_TIMEOUT),
        }
    }

    /// Per-call timeout in effect.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn disconnected(&self, error: TransportError) -> TransportError {
        if matches!(error, TransportError::ConnectionClosed) {
            self.connected.store(false, Ordering::SeqCst);
        }
        error
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn open(&self, endpoint: &str) -> Result<(), TransportError> {
        let stream = timeout(self.timeout, TcpStream::connect(endpoint))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        tracing::debug!(endpoint, "transport opened");
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = match timeout(self.timeout, write_frame(writer, data)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                Err(TransportError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(TransportError::WriteFailed(e.to_string())),
            Ok(Ok(())) => Ok(()),
        };
        result.map_err(|e| self.disconnected(e))
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::NotConnected)?;

        let result = match timeout(self.timeout, read_frame(reader)).await {
            Err(_) => Err(TransportError::Timeout),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(TransportError::ConnectionClosed)
            }
            Ok(Err(e)) => Err(TransportError::ReadFailed(e.to_string())),
            Ok(Ok(body)) => Ok(body),
        };
        result.map_err(|e| self.disconnected(e))
    }

    fn is_valid(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.lock().await.take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            // Peer may already be gone; closing is best effort.
            let _ = writer.shutdown().await;
        }
        Ok(())
    }
}
