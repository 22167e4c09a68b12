//! Mock transport for testing.
//!
//! Frames written are captured; frames read come from a queue or, when a
//! responder is installed, from a closure that plays the peer.

use super::{Transport, TransportError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Mock transport for testing.
#[derive(Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Default)]
struct MockTransportInner {
    connected: bool,
    endpoint: Option<String>,
    written: Vec<Vec<u8>>,
    read_queue: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    fail_next_open: Option<String>,
    fail_next_write: Option<String>,
    fail_next_read: Option<TransportError>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a frame for the next `read()`.
    pub fn queue_response(&self, data: Vec<u8>) {
        self.inner.lock().read_queue.push_back(data);
    }

    /// Answer every written frame with `responder`'s output, if any.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        self.inner.lock().responder = Some(Box::new(responder));
    }

    /// Every frame written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.inner.lock().written.clone()
    }

    /// Endpoint passed to `open()`.
    pub fn endpoint(&self) -> Option<String> {
        self.inner.lock().endpoint.clone()
    }

    /// Make the next `open()` fail.
    pub fn fail_next_open(&self, error: &str) {
        self.inner.lock().fail_next_open = Some(error.to_string());
    }

    /// Make the next `write()` fail.
    pub fn fail_next_write(&self, error: &str) {
        self.inner.lock().fail_next_write = Some(error.to_string());
    }

    /// Make the next `read()` fail with `error`.
    pub fn fail_next_read(&self, error: TransportError) {
        self.inner.lock().fail_next_read = Some(error);
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MockTransport")
            .field("connected", &inner.connected)
            .field("written", &inner.written.len())
            .field("queued", &inner.read_queue.len())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, endpoint: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if let Some(error) = inner.fail_next_open.take() {
            return Err(TransportError::ConnectionFailed(error));
        }
        inner.connected = true;
        inner.endpoint = Some(endpoint.to_string());
        Ok(())
    }

    async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_write.take() {
            return Err(TransportError::WriteFailed(error));
        }

        inner.written.push(data.to_vec());
        let reply = inner.responder.as_mut().and_then(|respond| respond(data));
        if let Some(reply) = reply {
            inner.read_queue.push_back(reply);
        }
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(TransportError::NotConnected);
        }
        if let Some(error) = inner.fail_next_read.take() {
            return Err(error);
        }
        inner
            .read_queue
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn is_valid(&self) -> bool {
        self.inner.lock().connected
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.read_queue.clear();
        Ok(())
    }
}
