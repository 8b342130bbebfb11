//! Liveness endpoint.
//!
//! `GET /healthz` answers 200 unconditionally and sits outside the access
//! gate: orchestrators and load balancers must be able to probe the gateway
//! without holding a session, and the probe must not leak whether enrollment
//! has happened.

use axum::Json;
use serde_json::{Value, json};

/// Health check endpoint. Always 200.
pub async fn healthz() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
