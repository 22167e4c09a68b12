//! Per-connection session.
//!
//! A session reads the client's handshake, agrees on a key, registers itself
//! with the router and then answers sealed requests one at a time until the
//! client quits, the connection drops or the sweep loop evicts it.

use crate::error::{ProtocolError, ProtocolResult, RelayError};
use crate::server::RelayRouter;
use crate::table::EntityId;
use relay_core::{EphemeralKeyPair, SessionChannel};
use relay_types::{
    read_frame, write_frame, HandshakeAck, Message, Rejected, Request, Sealed, SessionId,
    PROTOCOL_VERSION,
};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

fn kind(message: &Message) -> &'static str {
    match message {
        Message::Handshake(_) => "handshake",
        Message::HandshakeAck(_) => "handshake_ack",
        Message::Sealed(_) => "sealed",
        Message::Rejected(_) => "rejected",
    }
}

/// State of a session after a successful handshake.
struct Established {
    channel: SessionChannel,
    entity: EntityId,
    session_id: SessionId,
    closed: Arc<Notify>,
}

/// A per-connection session.
pub struct Session<S> {
    router: Arc<RelayRouter>,
    stream: S,
    peer: SocketAddr,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Create a new session for a connection.
    pub fn new(router: Arc<RelayRouter>, stream: S, peer: SocketAddr) -> Self {
        Self {
            router,
            stream,
            peer,
        }
    }

    /// Run the session until completion.
    pub async fn run(mut self) -> Result<(), RelayError> {
        let established = match self.handshake().await {
            Ok(established) => established,
            Err(e) => {
                RelayRouter::bump(&self.router.metrics().errors_total);
                return Err(e.into());
            }
        };
        tracing::debug!(peer = %self.peer, entity = %established.entity, "session established");

        let result = self.serve(&established).await;
        if let Err(e) = &result {
            RelayRouter::bump(&self.router.metrics().errors_total);
            tracing::debug!(peer = %self.peer, error = %e, "session failed");
        }

        if let Err(e) = self.router.remove_session(established.entity) {
            tracing::error!(
                entity = %established.entity,
                error = %e,
                "inconsistent tables on disconnect"
            );
        }
        result.map_err(RelayError::from)
    }

    async fn handshake(&mut self) -> ProtocolResult<Established> {
        let timeout = self.router.config().socket_timeout();
        let frame = match tokio::time::timeout(timeout, read_frame(&mut self.stream)).await {
            Ok(frame) => frame?,
            Err(_) => {
                tracing::warn!(
                    peer = %self.peer,
                    timeout_secs = timeout.as_secs(),
                    "handshake timeout"
                );
                return Err(ProtocolError::HandshakeTimeout);
            }
        };

        let hello = match Message::from_bytes(&frame)? {
            Message::Handshake(hello) => hello,
            other => {
                return Err(ProtocolError::UnexpectedMessage {
                    expected: "handshake",
                    actual: kind(&other),
                })
            }
        };
        if hello.version != PROTOCOL_VERSION {
            self.reject("unsupported protocol version").await;
            return Err(ProtocolError::VersionMismatch {
                client: hello.version,
                router: PROTOCOL_VERSION,
            });
        }

        let pair = EphemeralKeyPair::generate();
        let public_key = pair.public_key();
        let key = pair.agree(hello.public_key)?;
        let channel = SessionChannel::with_key(hello.cipher, &key[..])?;

        let (entity, session_id, closed) = self.router.open_session(self.peer);
        let ack = Message::HandshakeAck(HandshakeAck {
            version: PROTOCOL_VERSION,
            session_id,
            public_key,
        });
        if let Err(e) = self.send(&ack).await {
            let _ = self.router.remove_session(entity);
            return Err(e);
        }

        Ok(Established {
            channel,
            entity,
            session_id,
            closed,
        })
    }

    async fn serve(&mut self, established: &Established) -> ProtocolResult<()> {
        let Established {
            channel,
            entity,
            session_id,
            closed,
        } = established;

        loop {
            let frame = tokio::select! {
                frame = read_frame(&mut self.stream) => match frame {
                    Ok(frame) => frame,
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                        tracing::debug!(peer = %self.peer, "peer closed connection");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                },
                _ = closed.notified() => {
                    tracing::debug!(peer = %self.peer, "session evicted");
                    return Ok(());
                }
            };

            let sealed = match Message::from_bytes(&frame)? {
                Message::Sealed(sealed) => sealed,
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        expected: "sealed",
                        actual: kind(&other),
                    })
                }
            };
            if sealed.session_id != *session_id {
                return Err(ProtocolError::ForeignSession);
            }

            let request = Request::from_bytes(&channel.decrypt(&sealed.payload)?)?;
            let quit = matches!(request, Request::Quit);
            let response = self.router.dispatch(*entity, request);

            let payload = channel.encrypt(&response.to_bytes()?)?;
            self.send(&Message::Sealed(Sealed {
                session_id: *session_id,
                seq: sealed.seq,
                payload,
            }))
            .await?;

            if quit {
                return Ok(());
            }
        }
    }

    async fn send(&mut self, message: &Message) -> ProtocolResult<()> {
        write_frame(&mut self.stream, &message.to_bytes()?).await?;
        Ok(())
    }

    /// Best effort: tell the peer why before hanging up.
    async fn reject(&mut self, reason: &str) {
        let message = Message::Rejected(Rejected {
            reason: reason.to_string(),
        });
        if let Err(e) = self.send(&message).await {
            tracing::debug!(peer = %self.peer, error = %e, "could not send rejection");
        }
    }
}

/// Refuse a connection before any session state exists.
pub async fn reject<S>(mut stream: S, reason: &str)
where
    S: AsyncWrite + Unpin,
{
    let message = Message::Rejected(Rejected {
        reason: reason.to_string(),
    });
    if let Ok(bytes) = message.to_bytes() {
        let _ = write_frame(&mut stream, &bytes).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use relay_core::CipherKind;
    use relay_types::{GroupId, Handshake, Join, Response, ResponseBody, ResponseStatus};
    use tokio::io::DuplexStream;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    struct Peer {
        stream: DuplexStream,
        channel: SessionChannel,
        session_id: SessionId,
        seq: u64,
    }

    impl Peer {
        async fn connect(stream: DuplexStream) -> Self {
            let mut stream = stream;
            let pair = EphemeralKeyPair::generate();
            let hello = Message::Handshake(Handshake {
                version: PROTOCOL_VERSION,
                cipher: CipherKind::ChaCha20Poly1305,
                public_key: pair.public_key(),
            });
            write_frame(&mut stream, &hello.to_bytes().unwrap()).await.unwrap();

            let frame = read_frame(&mut stream).await.unwrap();
            let ack = match Message::from_bytes(&frame).unwrap() {
                Message::HandshakeAck(ack) => ack,
                other => panic!("expected ack, got {other:?}"),
            };
            let key = pair.agree(ack.public_key).unwrap();
            Self {
                stream,
                channel: SessionChannel::with_key(CipherKind::ChaCha20Poly1305, &key[..]).unwrap(),
                session_id: ack.session_id,
                seq: 0,
            }
        }

        async fn request(&mut self, request: &Request) -> Response {
            self.seq += 1;
            let payload = self.channel.encrypt(&request.to_bytes().unwrap()).unwrap();
            let message = Message::Sealed(Sealed {
                session_id: self.session_id,
                seq: self.seq,
                payload,
            });
            write_frame(&mut self.stream, &message.to_bytes().unwrap())
                .await
                .unwrap();

            let frame = read_frame(&mut self.stream).await.unwrap();
            match Message::from_bytes(&frame).unwrap() {
                Message::Sealed(sealed) => {
                    assert_eq!(sealed.seq, self.seq, "reply echoes the request number");
                    Response::from_bytes(&self.channel.decrypt(&sealed.payload).unwrap()).unwrap()
                }
                other => panic!("expected sealed, got {other:?}"),
            }
        }
    }

    type Task = tokio::task::JoinHandle<Result<(), RelayError>>;

    fn start() -> (Arc<RelayRouter>, DuplexStream, Task) {
        let router = Arc::new(RelayRouter::new(Config::default().validated()));
        let (client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(Session::new(router.clone(), server, peer()).run());
        (router, client, task)
    }

    #[tokio::test]
    async fn handshake_then_join_then_quit() {
        let (router, client, task) = start();
        let mut peer = Peer::connect(client).await;
        assert_eq!(router.session_count(), 1);

        let response = peer
            .request(&Request::Join(Join {
                name: "alice".into(),
                group_id: GroupId::from_secret(b"g"),
            }))
            .await;
        assert!(matches!(response.body, ResponseBody::Joined(_)));
        assert_eq!(router.client_count(), 1);

        let response = peer.request(&Request::Quit).await;
        assert_eq!(response.status, ResponseStatus::Ok);

        task.await.unwrap().unwrap();
        assert_eq!(router.session_count(), 0);
        assert_eq!(router.client_count(), 0);
    }

    #[tokio::test]
    async fn dropped_connection_removes_session() {
        let (router, client, task) = start();
        let peer = Peer::connect(client).await;
        assert_eq!(router.session_count(), 1);

        drop(peer);
        task.await.unwrap().unwrap();
        assert_eq!(router.session_count(), 0);
    }

    #[tokio::test]
    async fn eviction_hangs_up() {
        let (router, client, task) = start();
        let _peer = Peer::connect(client).await;
        let entity = router.sessions.keys()[0];

        router.remove_session(entity).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("session ends after eviction")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wrong_version_is_rejected() {
        let (router, mut client, task) = start();
        let hello = Message::Handshake(Handshake {
            version: PROTOCOL_VERSION + 1,
            cipher: CipherKind::Aes256Gcm,
            public_key: EphemeralKeyPair::generate().public_key(),
        });
        write_frame(&mut client, &hello.to_bytes().unwrap()).await.unwrap();

        let frame = read_frame(&mut client).await.unwrap();
        assert!(matches!(
            Message::from_bytes(&frame).unwrap(),
            Message::Rejected(_)
        ));
        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Protocol(ProtocolError::VersionMismatch { .. }))
        ));
        assert_eq!(router.session_count(), 0);
    }

    #[tokio::test]
    async fn sealed_before_handshake_is_a_protocol_error() {
        let (_router, mut client, task) = start();
        let message = Message::Sealed(Sealed {
            session_id: SessionId::new(),
            seq: 1,
            payload: vec![1, 2, 3],
        });
        write_frame(&mut client, &message.to_bytes().unwrap()).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Protocol(ProtocolError::UnexpectedMessage {
                expected: "handshake",
                actual: "sealed"
            }))
        ));
    }

    #[tokio::test]
    async fn foreign_session_id_ends_session() {
        let (router, client, task) = start();
        let mut peer = Peer::connect(client).await;
        peer.session_id = SessionId::new();

        let payload = peer.channel.encrypt(&Request::Info.to_bytes().unwrap()).unwrap();
        let message = Message::Sealed(Sealed {
            session_id: peer.session_id,
            seq: 1,
            payload,
        });
        write_frame(&mut peer.stream, &message.to_bytes().unwrap())
            .await
            .unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(RelayError::Protocol(ProtocolError::ForeignSession))
        ));
        assert_eq!(router.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let (router, _client, task) = start();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(RelayError::Protocol(ProtocolError::HandshakeTimeout))
        ));
        let errors = router.metrics().errors_total.load(std::sync::atomic::Ordering::Relaxed);
        assert_eq!(errors, 1);
    }
}
