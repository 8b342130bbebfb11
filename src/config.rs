//! Application configuration loaded from environment variables.
//!
//! # Configuration Hierarchy
//!
//! All configuration is loaded from environment variables with sensible defaults
//! for development. In production, configure via environment variables or a `.env` file.
//!
//! # Security Configuration
//!
//! - `SESSION_SECRET`: Signing key for session cookies. When unset, a random
//!   key is generated at startup and all sessions are invalidated on restart.
//! - `SECRET_FILE_PATH`: Location of the persisted TOTP enrollment record
//!   (created with owner-only permissions).
//!
//! # Login Throttling
//!
//! - `RATE_LIMIT_MAX_ATTEMPTS`: Login attempts per window (default: 5)
//! - `RATE_LIMIT_WINDOW_SECS`: Fixed window duration (default: 60)

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AppError, AppResult};

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Gateway will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Listen host address (default: "0.0.0.0")
    pub host: String,

    /// Listen port (default: 8080)
    pub port: u16,

    // =========================================================================
    // Upstream Configuration
    // =========================================================================
    /// Host of the protected upstream service (default: "127.0.0.1")
    pub upstream_host: String,

    /// Port of the protected upstream service (default: 8081)
    pub upstream_port: u16,

    // =========================================================================
    // Session Configuration
    // =========================================================================
    /// Signing key for session cookies.
    ///
    /// `None` means no `SESSION_SECRET` was provided; the codec generates a
    /// random key at startup, which invalidates outstanding sessions whenever
    /// the process restarts.
    pub session_secret: Option<String>,

    /// Session lifetime from issuance (default: 30 days)
    pub session_max_age: Duration,

    /// Name of the session cookie. Must stay consistent between the HTTP
    /// pipeline and the raw cookie parsing done for WebSocket upgrades.
    pub session_cookie_name: String,

    // =========================================================================
    // Enrollment Configuration
    // =========================================================================
    /// Path of the persisted TOTP enrollment record
    /// (default: `$HOME/.config/otpgate/secret.json`)
    pub secret_file_path: PathBuf,

    /// Display name shown on rendered pages and used as the provisioning
    /// URI issuer (default: "Protected Service")
    pub app_name: String,

    /// Account label embedded in the provisioning URI (default: "admin")
    pub account_name: String,

    // =========================================================================
    // Login Throttling Configuration
    // =========================================================================
    /// Maximum login attempts per fixed window (default: 5)
    pub rate_limit_max_attempts: u32,

    /// Fixed window duration for login throttling (default: 60 seconds)
    pub rate_limit_window: Duration,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Port for Prometheus metrics endpoint (0 = disabled, the default:
    /// an auth gateway should not open extra ports unless asked to)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if any value fails to parse
    /// (e.g., non-numeric `PORT`) or fails validation.
    pub fn from_env() -> AppResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 8080)?,

            // Upstream
            upstream_host: env::var("UPSTREAM_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            upstream_port: Self::parse_env("UPSTREAM_PORT", 8081)?,

            // Session
            session_secret: env::var("SESSION_SECRET").ok().filter(|s| !s.is_empty()),
            session_max_age: Duration::from_secs(Self::parse_env(
                "SESSION_MAX_AGE_SECS",
                30 * 24 * 60 * 60,
            )?),
            session_cookie_name: env::var("SESSION_COOKIE_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "otpgate_session".to_string()),

            // Enrollment
            secret_file_path: Self::parse_secret_file_path(),
            app_name: env::var("APP_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "Protected Service".to_string()),
            account_name: env::var("ACCOUNT_NAME")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "admin".to_string()),

            // Login throttling
            rate_limit_max_attempts: Self::parse_env("RATE_LIMIT_MAX_ATTEMPTS", 5)?,
            rate_limit_window: Duration::from_secs(Self::parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            metrics_port: Self::parse_env("METRICS_PORT", 0)?,
        };

        // Validate configuration before returning
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if validation fails.
    pub(crate) fn validate(&self) -> AppResult<()> {
        if self.port == 0 {
            return Err(AppError::Config("PORT must be greater than 0".to_string()));
        }

        if self.upstream_port == 0 {
            return Err(AppError::Config(
                "UPSTREAM_PORT must be greater than 0".to_string(),
            ));
        }

        // A gateway proxying to itself would loop on every request.
        if self.upstream_port == self.port
            && (self.upstream_host == self.host
                || self.upstream_host == "127.0.0.1"
                || self.upstream_host == "localhost")
        {
            return Err(AppError::Config(format!(
                "UPSTREAM_HOST:UPSTREAM_PORT ({}:{}) must not be the gateway's own listen address",
                self.upstream_host, self.upstream_port
            )));
        }

        if self.rate_limit_max_attempts == 0 {
            return Err(AppError::Config(
                "RATE_LIMIT_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        if self.rate_limit_window.is_zero() {
            return Err(AppError::Config(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0".to_string(),
            ));
        }

        if self.session_max_age.is_zero() {
            return Err(AppError::Config(
                "SESSION_MAX_AGE_SECS must be greater than 0".to_string(),
            ));
        }

        if self.app_name.trim().is_empty() {
            return Err(AppError::Config("APP_NAME must not be blank".to_string()));
        }

        Ok(())
    }

    /// Get the full listen address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get the upstream authority (`host:port`) used for connecting and for
    /// rewriting the `Host` header on forwarded requests.
    pub fn upstream_authority(&self) -> String {
        format!("{}:{}", self.upstream_host, self.upstream_port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address.
    ///
    /// Returns `None` if metrics are disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        if self.metrics_enabled() {
            Some(std::net::SocketAddr::from((
                [0, 0, 0, 0],
                self.metrics_port,
            )))
        } else {
            None
        }
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: std::str::FromStr + ToString,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .parse()
                .map_err(|e| AppError::Config(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Resolve the secret-file path from `SECRET_FILE_PATH`, falling back to
    /// `$HOME/.config/otpgate/secret.json` (or a relative path if `HOME` is
    /// unset, e.g. in containers).
    fn parse_secret_file_path() -> PathBuf {
        if let Some(path) = env::var_os("SECRET_FILE_PATH").filter(|p| !p.is_empty()) {
            return PathBuf::from(path);
        }

        let home = env::var_os("HOME").map(PathBuf::from).unwrap_or_default();
        home.join(".config").join("otpgate").join("secret.json")
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Server
            host: "0.0.0.0".to_string(),
            port: 8080,
            // Upstream
            upstream_host: "127.0.0.1".to_string(),
            upstream_port: 8081,
            // Session
            session_secret: None,
            session_max_age: Duration::from_secs(30 * 24 * 60 * 60),
            session_cookie_name: "otpgate_session".to_string(),
            // Enrollment
            secret_file_path: PathBuf::from(".config/otpgate/secret.json"),
            app_name: "Protected Service".to_string(),
            account_name: "admin".to_string(),
            // Login throttling
            rate_limit_max_attempts: 5,
            rate_limit_window: Duration::from_secs(60),
            // Observability
            log_level: "info".to_string(),
            metrics_port: 0,
        }
    }
}
