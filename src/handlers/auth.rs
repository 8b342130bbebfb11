//! Enrollment and login flows.
//!
//! # State Machine
//!
//! The gateway is always in one of three derived states - nothing beyond the
//! enrollment record and the session cookie is stored:
//!
//! - `NOT_ENROLLED`: no confirmed record in the secret store
//! - `ENROLLED_LOGGED_OUT`: confirmed record, session not authenticated
//! - `ENROLLED_LOGGED_IN`: confirmed record, session authenticated
//!
//! Setup routes bounce to login once enrolled; login routes bounce to setup
//! until enrolled; both bounce to the protected root once logged in. Wrong
//! codes re-render the originating form with an inline error and mutate
//! nothing but the rate limiter's counter.

use axum::Form;
use axum::extract::State;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::error::AppResult;
use crate::metrics;
use crate::pages;
use crate::session::Session;
use crate::state::AppState;
use crate::totp;

/// Form body for both verification endpoints.
#[derive(Debug, Deserialize)]
pub struct TokenForm {
    #[serde(default)]
    pub token: String,
}

// =============================================================================
// Setup (one-time enrollment)
// =============================================================================

/// `GET /auth/setup` - render the enrollment page.
///
/// Idempotent with respect to the pending secret: revisiting the page before
/// verification shows the same QR code and manual-entry secret, never a
/// regenerated one.
#[instrument(skip_all)]
pub async fn setup_page(State(state): State<AppState>) -> AppResult<Response> {
    if state.store.is_enrolled() {
        return Ok(Redirect::to("/auth/login").into_response());
    }

    let record = state.store.ensure_pending()?;
    let qr = totp::qr_data_url(
        &record.secret,
        &state.config.app_name,
        &state.config.account_name,
    )?;

    Ok(Html(pages::render_setup_page(
        &state.config.app_name,
        &qr,
        &record.secret,
        None,
    ))
    .into_response())
}

/// `POST /auth/setup` - verify the first code and confirm enrollment.
///
/// The record is persisted as enrolled *before* the session is issued; if
/// persistence fails the client gets an error page and stays logged out
/// rather than holding a session backed by no durable state.
#[instrument(skip_all)]
pub async fn setup_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<TokenForm>,
) -> AppResult<Response> {
    if state.store.is_enrolled() {
        return Ok(Redirect::to("/auth/login").into_response());
    }

    let Some(record) = state.store.load().filter(|r| !r.secret.is_empty()) else {
        // Nothing pending (e.g. the secret file vanished); restart setup.
        return Ok(Redirect::to("/auth/setup").into_response());
    };

    if !totp::verify(&form.token, &record.secret) {
        metrics::record_login_attempt("failure");
        warn!("setup verification failed");
        let qr = totp::qr_data_url(
            &record.secret,
            &state.config.app_name,
            &state.config.account_name,
        )?;
        return Ok(Html(pages::render_setup_page(
            &state.config.app_name,
            &qr,
            &record.secret,
            Some("Invalid code. Please try again."),
        ))
        .into_response());
    }

    state.store.mark_enrolled()?;
    metrics::record_login_attempt("success");
    info!("2FA enrollment complete");

    let jar = jar.add(state.sessions.cookie(&Session::authenticated()));
    Ok((jar, Redirect::to("/")).into_response())
}

// =============================================================================
// Login
// =============================================================================

/// `GET /auth/login` - render the login form.
#[instrument(skip_all)]
pub async fn login_page(State(state): State<AppState>, jar: CookieJar) -> Response {
    if !state.store.is_enrolled() {
        return Redirect::to("/auth/setup").into_response();
    }

    let already_in = state
        .sessions
        .session_from_jar(&jar)
        .is_some_and(|session| session.authenticated);
    if already_in {
        return Redirect::to("/").into_response();
    }

    Html(pages::render_login_page(&state.config.app_name, None)).into_response()
}

/// `POST /auth/login` - verify a code and open a session.
///
/// The rate limiter is consulted before any verification runs; a denied
/// attempt performs no TOTP work and changes no state. A successful login
/// resets the limiter, consumes the recorded `return_to`, and redirects
/// there (root by default).
#[instrument(skip_all)]
pub async fn login_verify(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(form): Form<TokenForm>,
) -> Response {
    if !state.store.is_enrolled() {
        return Redirect::to("/auth/setup").into_response();
    }

    if !state.limiter.attempt() {
        metrics::record_login_throttled();
        warn!("login attempt rejected by rate limiter");
        let message = format!(
            "Too many attempts. Please wait {} seconds.",
            state.config.rate_limit_window.as_secs()
        );
        return Html(pages::render_login_page(
            &state.config.app_name,
            Some(&message),
        ))
        .into_response();
    }

    let verified = state
        .store
        .load()
        .filter(|record| record.enrolled)
        .is_some_and(|record| totp::verify(&form.token, &record.secret));

    if !verified {
        metrics::record_login_attempt("failure");
        warn!("login verification failed");
        return Html(pages::render_login_page(
            &state.config.app_name,
            Some("Invalid code. Please try again."),
        ))
        .into_response();
    }

    state.limiter.reset();
    metrics::record_login_attempt("success");
    info!("2FA login successful");

    // Consume the recorded destination; it is cleared by virtue of the new
    // session cookie not carrying it.
    let destination = state
        .sessions
        .session_from_jar(&jar)
        .and_then(|session| session.return_to)
        .filter(|path| is_safe_redirect(path))
        .unwrap_or_else(|| "/".to_string());

    let jar = jar.add(state.sessions.cookie(&Session::authenticated()));
    (jar, Redirect::to(&destination)).into_response()
}

/// `GET /auth/logout` - destroy the session.
#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> Response {
    let jar = jar.add(state.sessions.removal_cookie());
    info!("session destroyed");
    (jar, Redirect::to("/auth/login")).into_response()
}

/// Only same-origin absolute paths are followed after login.
///
/// `//host` would be a protocol-relative external redirect; anything not
/// starting with `/` would be relative or an absolute URL.
fn is_safe_redirect(path: &str) -> bool {
    path.starts_with('/') && !path.starts_with("//")
}
