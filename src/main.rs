use std::net::SocketAddr;
use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use otpgate::{AppState, Config, build_router, metrics, utils};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("Starting otpgate v{}", env!("CARGO_PKG_VERSION"));

    match run().await {
        Ok(()) => ExitCode::from(exitcode::OK as u8),
        Err(exit_code) => ExitCode::from(exit_code as u8),
    }
}

/// Run the gateway, returning an exit code on error.
async fn run() -> Result<(), exitcode::ExitCode> {
    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {e}");
        exitcode::CONFIG
    })?;
    info!(
        host = %config.host,
        port = %config.port,
        upstream = %config.upstream_authority(),
        secret_file = %config.secret_file_path.display(),
        "Configuration loaded"
    );

    // Optional Prometheus exporter
    if let Some(metrics_addr) = config.metrics_addr() {
        metrics::try_init_metrics(metrics_addr);
    }

    // Build application state and router
    let state = AppState::new(config.clone()).map_err(|e| {
        error!("Failed to build application state: {e}");
        exitcode::CONFIG
    })?;
    let app = build_router(state.clone());

    // Start server
    let addr: SocketAddr = config.server_addr().parse().map_err(|e| {
        error!("Invalid listen address: {e}");
        exitcode::CONFIG
    })?;
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to {addr}: {e}");
        exitcode::UNAVAILABLE
    })?;

    info!("Gateway listening on http://{addr}");
    info!("Proxying authorized traffic to http://{}", config.upstream_authority());
    info!("Auth surface:");
    info!("  GET  /healthz      - Liveness probe (no auth)");
    info!("  GET  /auth/setup   - One-time TOTP enrollment");
    info!("  POST /auth/setup   - Verify enrollment code");
    info!("  GET  /auth/login   - Login form");
    info!("  POST /auth/login   - Verify login code");
    info!("  GET  /auth/logout  - Destroy session");

    // Serve with graceful shutdown: stop accepting, drain in-flight requests
    axum::serve(listener, app)
        .with_graceful_shutdown(utils::shutdown_signal())
        .await
        .map_err(|e| {
            error!("Server error: {e}");
            exitcode::SOFTWARE
        })?;

    // Let live WebSocket relays finish before exiting
    info!("HTTP server stopped, draining WebSocket relays...");
    state.shutdown().await;

    info!("Gateway shutdown complete");
    Ok(())
}
