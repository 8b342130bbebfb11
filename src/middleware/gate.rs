//! Access gate applied to every proxied (non-auth) request.
//!
//! # Decision Table
//!
//! | State                          | Outcome                                  |
//! |--------------------------------|------------------------------------------|
//! | No enrolled secret             | Redirect to `/auth/setup`                |
//! | Authenticated session          | Pass through to the proxy dispatcher     |
//! | WebSocket upgrade handshake    | Pass through (dispatcher authenticates)  |
//! | Anything else                  | Record `return_to`, redirect to login    |
//!
//! The recorded `return_to` rides in an unauthenticated session cookie, so a
//! successful login can send the client back to the exact path it asked for.

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::{LOCATION, SET_COOKIE};
use axum::http::{HeaderValue, Request, Response, StatusCode};
use axum_extra::extract::cookie::CookieJar;
use tower::{Layer, Service};
use tracing::debug;

use crate::proxy::is_upgrade_request;
use crate::session::{Session, SessionCodec};
use crate::store::SecretStore;

/// Access gate layer.
///
/// Holds its own handles to the secret store and session codec rather than
/// reaching into request state, so it can sit anywhere in a tower stack.
#[derive(Clone)]
pub struct AccessGate {
    store: SecretStore,
    sessions: SessionCodec,
}

impl AccessGate {
    /// Create a new access gate.
    pub fn new(store: SecretStore, sessions: SessionCodec) -> Self {
        Self { store, sessions }
    }
}

impl<S> Layer<S> for AccessGate {
    type Service = AccessGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AccessGateService {
            inner,
            store: self.store.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

/// Access gate service wrapper.
#[derive(Clone)]
pub struct AccessGateService<S> {
    inner: S,
    store: SecretStore,
    sessions: SessionCodec,
}

impl<S> Service<Request<Body>> for AccessGateService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Upgrade handshakes are authenticated by the proxy dispatcher
            // against the raw Cookie header; a browser redirect has no
            // meaning mid-handshake.
            if is_upgrade_request(&req) {
                return inner.call(req).await;
            }

            if !store.is_enrolled() {
                debug!(path = %req.uri().path(), "no enrollment, redirecting to setup");
                return Ok(redirect(StatusCode::SEE_OTHER, "/auth/setup", None));
            }

            let jar = CookieJar::from_headers(req.headers());
            match sessions.session_from_jar(&jar) {
                Some(session) if session.authenticated => inner.call(req).await,
                _ => {
                    // Remember where the client was headed so login can
                    // bounce it straight back.
                    let original = req
                        .uri()
                        .path_and_query()
                        .map_or("/", |pq| pq.as_str())
                        .to_string();
                    debug!(path = %original, "unauthenticated, redirecting to login");

                    let pending = sessions.cookie(&Session::pending(original));
                    Ok(redirect(
                        StatusCode::SEE_OTHER,
                        "/auth/login",
                        Some(pending.to_string()),
                    ))
                }
            }
        })
    }
}

/// Build a redirect response, optionally setting a session cookie.
fn redirect(status: StatusCode, location: &str, cookie: Option<String>) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(LOCATION, value);
    }
    if let Some(cookie) = cookie
        && let Ok(value) = HeaderValue::from_str(&cookie)
    {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}
