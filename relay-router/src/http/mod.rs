//! HTTP endpoints for the router.
//!
//! Provides health checks and Prometheus metrics.

pub mod health;
mod metrics;

use crate::server::RelayRouter;
use axum::{routing::get, Extension, Router};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(router: Arc<RelayRouter>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/metrics", get(metrics::metrics_handler))
        .layer(Extension(router))
}
