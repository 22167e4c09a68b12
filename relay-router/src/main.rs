//! shroud-router binary entry point.
//!
//! Usage:
//! ```bash
//! shroud-router --config router.toml
//! RUST_LOG=debug shroud-router
//! ```

use anyhow::Context;
use shroud_relay_router::http::{build_router, health::init_start_time};
use shroud_relay_router::{serve, spawn_sweep_task, Config, RelayRouter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = get_config_path();
    let config = Config::load_or_default(&path)
        .with_context(|| format!("loading {}", path.display()))?
        .validated();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = %path.display(), "starting shroud-router");

    init_start_time();

    let listener = TcpListener::bind(&config.server.bind_address)
        .await
        .with_context(|| format!("binding {}", config.server.bind_address))?;

    let sweep_interval = config.sweep_interval();
    let http = config.http.clone();
    let router = Arc::new(RelayRouter::new(config));

    let _sweep = spawn_sweep_task(router.clone(), sweep_interval);

    if http.enabled {
        let http_listener = TcpListener::bind(&http.bind_address)
            .await
            .with_context(|| format!("binding HTTP {}", http.bind_address))?;
        tracing::info!(addr = %http.bind_address, "HTTP endpoints enabled");
        let app = build_router(router.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(http_listener, app).await {
                tracing::error!(error = %e, "HTTP server stopped");
            }
        });
    }

    serve(router, listener).await.context("relay listener failed")?;
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("router.toml"))
}
