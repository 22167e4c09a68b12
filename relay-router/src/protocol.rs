//! Accept loop for relay connections.

use crate::server::RelayRouter;
use crate::session::{reject, Session};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};

/// Accept connections on `listener` until it fails.
///
/// Each accepted connection runs as its own [`Session`] task.
pub async fn serve(router: Arc<RelayRouter>, listener: TcpListener) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "accepting relay connections");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => accept(&router, stream, peer),
            Err(e) => {
                // Out of descriptors and the like; keep serving the others.
                tracing::error!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

fn accept(router: &Arc<RelayRouter>, stream: TcpStream, peer: SocketAddr) {
    // Rate limit check: prevent connection flooding from a single address
    if let Err(e) = router.rate_limits().check_connection(&peer.ip()) {
        tracing::warn!(%peer, error = %e, "connection rate limited");
        router.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move { reject(stream, "rate limited").await });
        return;
    }

    let max_sessions = router.config().server.max_sessions;
    if router.session_count() >= max_sessions {
        tracing::warn!(
            %peer,
            sessions = router.session_count(),
            max_sessions,
            "session limit reached"
        );
        tokio::spawn(async move { reject(stream, "too many sessions").await });
        return;
    }

    router.metrics().connections_total.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(%peer, error = %e, "could not set TCP_NODELAY");
    }

    let session = Session::new(router.clone(), stream, peer);
    tokio::spawn(async move {
        if let Err(e) = session.run().await {
            tracing::warn!(%peer, error = %e, "session error");
        }
    });
}
