//! One handshaken session with a router.
//!
//! A [`Connection`] owns the transport and the [`SessionChannel`]. Each
//! request is one write followed by one read; a lock makes the pair atomic
//! so concurrent phases (the client machine and its transfer jobs) never
//! read each other's responses.
//!
//! Every request carries a sequence number the router echoes. A reply that
//! shows up after its request timed out is recognised by its number and
//! skipped, so a timeout costs one retry instead of the whole session.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use relay_core::{CipherKind, EphemeralKeyPair, SessionChannel};
use relay_types::{
    Handshake, Message, Request, Response, Sealed, SessionId, WireError, PROTOCOL_VERSION,
};

use crate::error::ClientError;
use crate::transport::{Transport, TransportError};

/// Encrypted request/response session over a [`Transport`].
#[derive(Debug)]
pub struct Connection<T: Transport> {
    transport: T,
    channel: SessionChannel,
    session: Mutex<Option<SessionId>>,
    exchange: tokio::sync::Mutex<()>,
    seq: AtomicU64,
}

impl<T: Transport> Connection<T> {
    /// A closed connection that will negotiate `cipher`.
    pub fn new(transport: T, cipher: CipherKind) -> Self {
        Self {
            transport,
            channel: SessionChannel::new(cipher),
            session: Mutex::new(None),
            exchange: tokio::sync::Mutex::new(()),
            seq: AtomicU64::new(0),
        }
    }

    /// Open the transport if needed and run the key exchange.
    pub async fn open(&self, endpoint: &str) -> Result<SessionId, ClientError> {
        let _turn = self.exchange.lock().await;

        if !self.transport.is_valid() {
            self.transport.open(endpoint).await?;
        }

        let pair = EphemeralKeyPair::generate();
        let hello = Message::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            cipher: self.channel.kind(),
            public_key: pair.public_key(),
        });
        self.transport.write(&hello.to_bytes()?).await?;

        match Message::from_bytes(&self.transport.read().await?)? {
            Message::HandshakeAck(ack) => {
                if ack.version != PROTOCOL_VERSION {
                    return Err(WireError::UnsupportedVersion(ack.version).into());
                }
                let key = pair.agree(ack.public_key)?;
                self.channel.set_key(key.as_ref())?;
                *self.session.lock() = Some(ack.session_id);
                tracing::debug!(session = %ack.session_id, endpoint, "session established");
                Ok(ack.session_id)
            }
            Message::Rejected(rejected) => Err(ClientError::Rejected(rejected.reason)),
            other => Err(ClientError::Protocol(format!(
                "expected handshake ack, got {:?}",
                other
            ))),
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A read timeout leaves the session up; the reply, if it ever comes,
    /// is dropped by the next request. Any other failure tears the session
    /// down.
    pub async fn request(&self, request: &Request) -> Result<Response, ClientError> {
        let _turn = self.exchange.lock().await;
        let session_id = self.session_id().ok_or(ClientError::NotConnected)?;
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;

        if let Err(error) = self.send(session_id, seq, request).await {
            tracing::debug!(request = request.kind(), %error, "dropping session");
            self.reset().await;
            return Err(error);
        }

        match self.receive(session_id, seq, request).await {
            Err(error @ ClientError::Transport(TransportError::Timeout)) => {
                tracing::debug!(request = request.kind(), seq, "no reply in time, keeping session");
                Err(error)
            }
            Err(error) => {
                tracing::debug!(request = request.kind(), %error, "dropping session");
                self.reset().await;
                Err(error)
            }
            Ok(response) => Ok(response),
        }
    }

    async fn send(&self, session_id: SessionId, seq: u64, request: &Request) -> Result<(), ClientError> {
        let payload = self.channel.encrypt(&request.to_bytes()?)?;
        let frame = Message::Sealed(Sealed {
            session_id,
            seq,
            payload,
        })
        .to_bytes()?;
        self.transport.write(&frame).await?;
        Ok(())
    }

    async fn receive(
        &self,
        session_id: SessionId,
        seq: u64,
        request: &Request,
    ) -> Result<Response, ClientError> {
        loop {
            match Message::from_bytes(&self.transport.read().await?)? {
                Message::Sealed(sealed) if sealed.session_id == session_id => {
                    if sealed.seq < seq {
                        tracing::trace!(stale = sealed.seq, seq, "skipping late reply");
                        continue;
                    }
                    if sealed.seq > seq {
                        return Err(ClientError::Protocol(format!(
                            "reply {} ahead of request {}",
                            sealed.seq, seq
                        )));
                    }
                    let plaintext = self.channel.decrypt(&sealed.payload)?;
                    return Ok(Response::from_bytes(&plaintext)?);
                }
                Message::Rejected(rejected) => return Err(ClientError::Rejected(rejected.reason)),
                other => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected reply to {}: {:?}",
                        request.kind(),
                        other
                    )))
                }
            }
        }
    }

    async fn reset(&self) {
        self.channel.clear();
        *self.session.lock() = None;
        // Already failing; the close result adds nothing.
        let _ = self.transport.close().await;
    }

    /// Tear down the session and the transport.
    pub async fn close(&self) -> Result<(), ClientError> {
        let _turn = self.exchange.lock().await;
        self.channel.clear();
        *self.session.lock() = None;
        self.transport.close().await?;
        Ok(())
    }

    /// Session established and transport usable.
    pub fn is_open(&self) -> bool {
        self.transport.is_valid() && self.channel.is_valid() && self.session_id().is_some()
    }

    /// Current session.
    pub fn session_id(&self) -> Option<SessionId> {
        *self.session.lock()
    }

    /// Underlying transport (for testing).
    pub fn transport(&self) -> &T {
        &self.transport
    }
}
