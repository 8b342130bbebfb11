//! Prometheus metrics for gateway observability.
//!
//! Metrics are exposed via a dedicated HTTP listener on `METRICS_PORT`
//! (disabled by default - the auth surface and the metrics surface should
//! not share a port).
//!
//! # Available Metrics
//!
//! ## Counters
//! - `otpgate_login_attempts_total` - Login/setup verifications (label: outcome)
//! - `otpgate_login_throttled_total` - Attempts rejected by the rate limiter
//! - `otpgate_proxy_requests_total` - HTTP requests forwarded upstream
//! - `otpgate_proxy_errors_total` - Upstream failures (label: kind)
//! - `otpgate_ws_upgrades_total` - WebSocket upgrade handshakes (label: outcome)

use std::net::SocketAddr;

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const LOGIN_ATTEMPTS_TOTAL: &str = "otpgate_login_attempts_total";
    pub const LOGIN_THROTTLED_TOTAL: &str = "otpgate_login_throttled_total";
    pub const PROXY_REQUESTS_TOTAL: &str = "otpgate_proxy_requests_total";
    pub const PROXY_ERRORS_TOTAL: &str = "otpgate_proxy_errors_total";
    pub const WS_UPGRADES_TOTAL: &str = "otpgate_ws_upgrades_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// # Errors
///
/// Returns an error message if the exporter cannot be installed
/// (e.g., the metrics port is already taken).
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::LOGIN_ATTEMPTS_TOTAL,
        "Total TOTP verifications, by outcome (success/failure)"
    );
    describe_counter!(
        names::LOGIN_THROTTLED_TOTAL,
        "Total login attempts rejected by the fixed-window rate limiter"
    );
    describe_counter!(
        names::PROXY_REQUESTS_TOTAL,
        "Total authorized HTTP requests forwarded to the upstream"
    );
    describe_counter!(
        names::PROXY_ERRORS_TOTAL,
        "Total upstream failures, by kind (unavailable/error)"
    );
    describe_counter!(
        names::WS_UPGRADES_TOTAL,
        "Total WebSocket upgrade handshakes, by outcome (forwarded/rejected/failed)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
///
/// The gateway keeps serving without metrics rather than refusing to start.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Counter Recording Functions
// =============================================================================

/// Record a TOTP verification attempt and its outcome.
pub fn record_login_attempt(outcome: &'static str) {
    counter!(names::LOGIN_ATTEMPTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a login attempt rejected by the rate limiter.
pub fn record_login_throttled() {
    counter!(names::LOGIN_THROTTLED_TOTAL).increment(1);
}

/// Record an HTTP request forwarded to the upstream.
pub fn record_proxy_request() {
    counter!(names::PROXY_REQUESTS_TOTAL).increment(1);
}

/// Record an upstream failure.
pub fn record_proxy_error(kind: &'static str) {
    counter!(names::PROXY_ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record a WebSocket upgrade handshake outcome.
pub fn record_ws_upgrade(outcome: &'static str) {
    counter!(names::WS_UPGRADES_TOTAL, "outcome" => outcome).increment(1);
}
