//! Shared application state for Axum handlers.
//!
//! All components live behind `Arc`s or their own interior mutability, so the
//! state clones cheaply into every handler and middleware layer. The same
//! clone is reachable from two directions: the routed HTTP pipeline and the
//! WebSocket upgrade path inside the proxy dispatcher.
//!
//! # Relay Task Lifecycle
//!
//! Every spliced WebSocket connection runs as a background relay task. Tasks
//! are registered on a `tokio_util::task::TaskTracker` so graceful shutdown
//! can let in-flight connections drain instead of severing them.

use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::info;

use crate::config::Config;
use crate::error::AppResult;
use crate::proxy::UpstreamClient;
use crate::rate_limit::LoginRateLimiter;
use crate::session::SessionCodec;
use crate::store::SecretStore;

/// Shared application state for Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Persisted TOTP enrollment record
    pub store: SecretStore,
    /// Signed session token codec
    pub sessions: SessionCodec,
    /// Global fixed-window login throttle
    pub limiter: LoginRateLimiter,
    /// Connection plumbing to the protected upstream
    pub upstream: UpstreamClient,
    /// Tracks live WebSocket relay tasks for graceful drain
    relay_tracker: TaskTracker,
}

impl AppState {
    /// Assemble the state from configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the session signing key is rejected.
    pub fn new(config: Config) -> AppResult<Self> {
        let store = SecretStore::from_config(&config);
        let sessions = SessionCodec::from_config(&config)?;
        let limiter =
            LoginRateLimiter::new(config.rate_limit_max_attempts, config.rate_limit_window);
        let upstream = UpstreamClient::from_config(&config);

        Ok(Self {
            config: Arc::new(config),
            store,
            sessions,
            limiter,
            upstream,
            relay_tracker: TaskTracker::new(),
        })
    }

    /// Spawn a WebSocket relay task tracked for graceful shutdown.
    pub fn spawn_relay<F>(&self, relay: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.relay_tracker.spawn(relay);
    }

    /// Drain in-flight WebSocket relays after the HTTP listener has stopped.
    ///
    /// New relays can no longer be spawned once this is called.
    pub async fn shutdown(&self) {
        let live = self.relay_tracker.len();
        if live > 0 {
            info!(relays = live, "waiting for WebSocket relays to drain");
        }
        self.relay_tracker.close();
        self.relay_tracker.wait().await;
        info!("all WebSocket relays have completed");
    }
}
