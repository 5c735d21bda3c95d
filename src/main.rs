//! epc-service — entry point
//!
//! Starts the HTTP server for the admission and execution subsystem: request
//! expansion, single-flight result caching, a bounded worker pool, a
//! load-adaptive circuit breaker, identity/auth, and usage metering. Built
//! with Axum for async HTTP handling.

use anyhow::Result;
use epc_service::config::Config;
use epc_service::{build_state, create_router};
use std::net::SocketAddr;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    info!("Starting epc-service...");
    info!("Bind address: {}", config.bind_address);

    let addr: SocketAddr = config.bind_address.parse().expect("invalid bind address format");
    let state = build_state(config);
    let app = create_router(state);

    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("Received Ctrl+C, shutting down..."); },
        _ = terminate => { info!("Received SIGTERM, shutting down..."); },
    }
}
