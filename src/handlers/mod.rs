//! Request handlers for the auth surface and health probe.

pub mod auth;
pub mod health;

pub use auth::{login_page, login_verify, logout, setup_page, setup_verify};
pub use health::healthz;
