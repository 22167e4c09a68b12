//! Health check endpoint.

use crate::server::RelayRouter;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Router version.
    pub version: String,
    /// Live sessions, joined or not.
    pub sessions: usize,
    /// Joined clients.
    pub clients: usize,
    /// Groups with at least one member.
    pub groups: usize,
    /// Live transfers.
    pub transfers: usize,
    /// Clients currently marked as spamming.
    pub spam: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(router): Extension<Arc<RelayRouter>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        sessions: router.session_count(),
        clients: router.client_count(),
        groups: router.group_count(),
        transfers: router.transfer_count(),
        spam: router.spam_count(),
        uptime_seconds: uptime,
    })
}
