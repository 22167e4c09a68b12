//! Prometheus metrics endpoint.

use crate::server::RelayRouter;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges are read from the live tables, counters are monotonic since
/// startup.
pub async fn metrics_handler(Extension(router): Extension<Arc<RelayRouter>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&router),
    )
}

fn render(router: &RelayRouter) -> String {
    let m = router.metrics();

    let sessions = router.session_count();
    let clients = router.client_count();
    let groups = router.group_count();
    let transfers = router.transfer_count();
    let spam = router.spam_count();

    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let requests = m.requests_total.load(Ordering::Relaxed);
    let chats_relayed = m.chats_relayed.load(Ordering::Relaxed);
    let chats_dropped = m.chats_dropped.load(Ordering::Relaxed);
    let transfers_total = m.transfers_total.load(Ordering::Relaxed);
    let bytes_rx = m.bytes_received.load(Ordering::Relaxed);
    let bytes_tx = m.bytes_sent.load(Ordering::Relaxed);
    let clients_evicted = m.clients_evicted.load(Ordering::Relaxed);
    let transfers_evicted = m.transfers_evicted.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    format!(
        r#"# HELP shroud_router_sessions_active Number of live sessions
# TYPE shroud_router_sessions_active gauge
shroud_router_sessions_active {sessions}

# HELP shroud_router_clients_active Number of joined clients
# TYPE shroud_router_clients_active gauge
shroud_router_clients_active {clients}

# HELP shroud_router_groups_active Number of groups with members
# TYPE shroud_router_groups_active gauge
shroud_router_groups_active {groups}

# HELP shroud_router_transfers_active Number of relayed transfers in flight
# TYPE shroud_router_transfers_active gauge
shroud_router_transfers_active {transfers}

# HELP shroud_router_spam_active Number of clients marked as spamming
# TYPE shroud_router_spam_active gauge
shroud_router_spam_active {spam}

# HELP shroud_router_info Router information
# TYPE shroud_router_info gauge
shroud_router_info{{version="{version}"}} 1

# HELP shroud_router_connections_total Total connections accepted
# TYPE shroud_router_connections_total counter
shroud_router_connections_total {conns_total}

# HELP shroud_router_requests_total Total sealed requests dispatched
# TYPE shroud_router_requests_total counter
shroud_router_requests_total {requests}

# HELP shroud_router_chats_relayed_total Chat messages relayed
# TYPE shroud_router_chats_relayed_total counter
shroud_router_chats_relayed_total {chats_relayed}

# HELP shroud_router_chats_dropped_total Chat messages dropped as spam
# TYPE shroud_router_chats_dropped_total counter
shroud_router_chats_dropped_total {chats_dropped}

# HELP shroud_router_transfers_total Transfers opened
# TYPE shroud_router_transfers_total counter
shroud_router_transfers_total {transfers_total}

# HELP shroud_router_bytes_received_total Chunk bytes accepted from uploaders
# TYPE shroud_router_bytes_received_total counter
shroud_router_bytes_received_total {bytes_rx}

# HELP shroud_router_bytes_sent_total Chunk bytes handed to downloaders
# TYPE shroud_router_bytes_sent_total counter
shroud_router_bytes_sent_total {bytes_tx}

# HELP shroud_router_clients_evicted_total Idle clients evicted by the sweep
# TYPE shroud_router_clients_evicted_total counter
shroud_router_clients_evicted_total {clients_evicted}

# HELP shroud_router_transfers_evicted_total Stalled transfers evicted by the sweep
# TYPE shroud_router_transfers_evicted_total counter
shroud_router_transfers_evicted_total {transfers_evicted}

# HELP shroud_router_rate_limit_hits_total Total rate limit rejections
# TYPE shroud_router_rate_limit_hits_total counter
shroud_router_rate_limit_hits_total {rate_limits}

# HELP shroud_router_errors_total Total protocol errors
# TYPE shroud_router_errors_total counter
shroud_router_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    )
}
