//! Application routing configuration with middleware stack.
//!
//! # Route Groups
//!
//! ```text
//! GET  /healthz       liveness probe, no auth
//! GET  /auth/setup    render enrollment page
//! POST /auth/setup    verify setup code
//! GET  /auth/login    render login form
//! POST /auth/login    verify login code
//! GET  /auth/logout   destroy session
//! *    (fallback)     Access Gate → Proxy Dispatcher
//! ```
//!
//! The access gate wraps *only* the fallback: auth routes must stay reachable
//! for clients that have no session yet, and the health probe bypasses
//! authentication entirely.
//!
//! # Middleware Stack
//!
//! Request IDs are minted at the outermost layer, the trace layer logs each
//! request with that ID, and the propagate layer reflects it back to the
//! client for correlation.

use axum::Router;
use axum::routing::get;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware::AccessGate;
use crate::proxy;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
pub fn build_router(state: AppState) -> Router {
    // Everything the auth surface does not claim is gated, then proxied.
    let gate = AccessGate::new(state.store.clone(), state.sessions.clone());
    let proxied = Router::new()
        .fallback(proxy::dispatch)
        .layer(gate)
        .with_state(state.clone());

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/auth/setup",
            get(handlers::setup_page).post(handlers::setup_verify),
        )
        .route(
            "/auth/login",
            get(handlers::login_page).post(handlers::login_verify),
        )
        .route("/auth/logout", get(handlers::logout))
        .fallback_service(proxied)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
