//! # otpgate
//!
//! A second-factor authentication gateway that sits in front of a single
//! upstream HTTP/WebSocket service. Nothing reaches the upstream - not even
//! a persistent WebSocket upgrade - until the client has completed one-time
//! TOTP enrollment and holds a session proving possession of the secret.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  /healthz   /auth/setup   /auth/login   /auth/logout        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Access Gate (everything else: session check, return-to)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Proxy Dispatcher (HTTP forward │ WS handshake replay)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Upstream service (e.g. a browser IDE on localhost)         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! WebSocket upgrades never see the routed cookie pipeline, so the proxy
//! dispatcher authenticates them directly against the raw `Cookie` header
//! using the same signed-token codec as everything else.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use otpgate::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     // Serve the router...
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Pin the session signing key so sessions survive restarts:
//! ```bash
//! SESSION_SECRET=some-long-random-string cargo run
//! ```
//!
//! Point the gateway at the service it protects:
//! ```bash
//! UPSTREAM_HOST=127.0.0.1 UPSTREAM_PORT=8081 cargo run
//! ```

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod pages;
pub mod proxy;
pub mod rate_limit;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod totp;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
