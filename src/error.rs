use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use thiserror::Error;

use crate::pages;

/// Application-wide error types with appropriate HTTP status codes.
///
/// Only faults that must abort a request end up here. Wrong codes, throttled
/// logins, and missing/invalid sessions are ordinary control flow: they are
/// recovered into a re-rendered form or a redirect at the call site and never
/// become an `AppError`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to persist enrollment state: {0}")]
    PersistWrite(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOTP provisioning failed: {0}")]
    Provisioning(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the full error details server-side for debugging
        // but only expose sanitized messages to clients
        tracing::error!(error = %self, "Request failed");

        let (status, message) = match &self {
            // Enrollment must not proceed without durable state; surface the
            // write failure instead of silently authenticating the session.
            AppError::PersistWrite(_) | AppError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not save enrollment state. Please try again.",
            ),
            AppError::Provisioning(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate enrollment material. Please try again.",
            ),
            AppError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Service configuration error. Please contact the operator.",
            ),
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "An internal error occurred. Please try again.",
            ),
        };

        (status, Html(pages::render_error_page(status, message))).into_response()
    }
}

/// Convenience type alias for Results with AppError.
pub type AppResult<T> = Result<T, AppError>;
