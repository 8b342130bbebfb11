//! Proxy dispatcher: forwards authorized traffic to the upstream service.
//!
//! Two entry points share [`dispatch`]:
//!
//! - **Plain HTTP** - already admitted by the access gate; forwarded through
//!   a pooled `hyper-util` client with the `Host` header rewritten to the
//!   upstream authority, the response relayed unchanged.
//! - **WebSocket upgrades** - the access gate waves these through, so the
//!   session is re-derived *here*, synchronously, from the raw `Cookie`
//!   header of the handshake before any connection to the upstream is made.
//!   The session codec's decode is pure with respect to the token string,
//!   which is what makes this direct invocation possible.
//!
//! # Rejected Upgrades
//!
//! A handshake that fails authentication is answered with `401` and
//! `Connection: close` before the protocol switch: the WebSocket never
//! comes up, the connection is torn down, and not one byte reaches the
//! upstream. Once rejected, no proxying is attempted for that request.
//!
//! # Upstream Failures
//!
//! A refused connection renders the transient "starting up" page (HTTP) or
//! fails the handshake (WS). Any other upstream error maps to a generic 502.

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CONNECTION, COOKIE, HOST, UPGRADE};
use axum::http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri};
use axum::response::{Html, IntoResponse};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::upgrade::OnUpgrade;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::metrics;
use crate::pages;
use crate::state::AppState;

/// Hop-by-hop headers that must not be forwarded (RFC 9110 §7.6.1).
///
/// `connection` and `upgrade` are deliberately kept on upgrade handshakes -
/// they carry the protocol switch itself.
const HOP_BY_HOP_HEADERS: [&str; 7] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "te",
    "trailer",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Pooled connection plumbing to the protected upstream.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct UpstreamClient {
    authority: std::sync::Arc<str>,
    client: HyperClient<HttpConnector, Body>,
}

impl UpstreamClient {
    /// Build the client from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            authority: std::sync::Arc::from(config.upstream_authority().as_str()),
            client: HyperClient::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// The upstream `host:port` authority.
    pub fn authority(&self) -> &str {
        &self.authority
    }
}

/// Fallback handler for everything the auth routes do not claim.
///
/// Plain requests arrive here only after the access gate admitted them;
/// upgrade handshakes arrive unauthenticated and are validated inline.
pub async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response<Body> {
    if is_upgrade_request(&req) {
        forward_upgrade(state, req).await
    } else {
        forward_http(state, req).await
    }
}

/// Detect a connection-upgrade handshake (e.g. WebSocket).
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    if req.headers().get(UPGRADE).is_none() {
        return false;
    }
    req.headers()
        .get(CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
}

// =============================================================================
// Plain HTTP Forwarding
// =============================================================================

async fn forward_http(state: AppState, mut req: Request<Body>) -> Response<Body> {
    let authority = state.upstream.authority();

    let uri = match upstream_uri(authority, req.uri()) {
        Ok(uri) => uri,
        Err(e) => {
            error!(error = %e, "failed to build upstream URI");
            return gateway_error_response(&state);
        }
    };
    *req.uri_mut() = uri;

    strip_hop_by_hop(req.headers_mut());
    rewrite_host(req.headers_mut(), authority);

    metrics::record_proxy_request();
    match state.upstream.client.request(req).await {
        Ok(response) => response.map(Body::new),
        Err(e) if is_connection_refused(&e) => {
            metrics::record_proxy_error("unavailable");
            debug!("upstream refused connection, rendering starting page");
            unavailable_response(&state)
        }
        Err(e) => {
            metrics::record_proxy_error("error");
            error!(error = %e, "upstream request failed");
            gateway_error_response(&state)
        }
    }
}

/// Rebase a request URI onto the upstream authority, preserving path and query.
fn upstream_uri(authority: &str, original: &Uri) -> Result<Uri, axum::http::uri::InvalidUri> {
    let path_and_query = original
        .path_and_query()
        .map_or("/", |pq| pq.as_str());
    format!("http://{authority}{path_and_query}").parse()
}

/// Drop hop-by-hop headers before forwarding.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Point the `Host` header at the upstream authority.
fn rewrite_host(headers: &mut HeaderMap, authority: &str) {
    if let Ok(value) = HeaderValue::from_str(authority) {
        headers.insert(HOST, value);
    }
}

/// Walk an error's source chain looking for a refused TCP connection.
fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<std::io::Error>()
            && io.kind() == std::io::ErrorKind::ConnectionRefused
        {
            return true;
        }
        source = current.source();
    }
    false
}

/// 503 with the auto-refreshing "starting up" page.
fn unavailable_response(state: &AppState) -> Response<Body> {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [("Retry-After", "3")],
        Html(pages::render_starting_page(&state.config.app_name)),
    )
        .into_response()
}

/// 502 with a generic gateway-error page.
fn gateway_error_response(state: &AppState) -> Response<Body> {
    (
        StatusCode::BAD_GATEWAY,
        Html(pages::render_error_page(
            StatusCode::BAD_GATEWAY,
            &format!("{} hit an upstream error. Please retry.", state.config.app_name),
        )),
    )
        .into_response()
}

// =============================================================================
// WebSocket Upgrade Forwarding
// =============================================================================

async fn forward_upgrade(state: AppState, mut req: Request<Body>) -> Response<Body> {
    // Authenticate first, synchronously, from the raw Cookie header. The
    // handshake never saw the cookie-parsing pipeline, and no proxying
    // decision is made before this check.
    let raw_cookies = req
        .headers()
        .get(COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let authenticated = state
        .sessions
        .session_from_cookie_header(raw_cookies)
        .is_some_and(|session| session.authenticated);

    if !authenticated {
        metrics::record_ws_upgrade("rejected");
        warn!(path = %req.uri().path(), "rejecting unauthenticated WebSocket upgrade");
        return close_handshake(StatusCode::UNAUTHORIZED);
    }

    // The server-side upgrade handle. Taking it out of the extensions means
    // nothing else can complete the client upgrade behind our back.
    let Some(client_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        metrics::record_ws_upgrade("failed");
        warn!("upgrade request without an upgrade handle, dropping");
        return close_handshake(StatusCode::BAD_REQUEST);
    };

    let authority = state.upstream.authority().to_string();
    let stream = match TcpStream::connect(&authority).await {
        Ok(stream) => stream,
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            metrics::record_proxy_error("unavailable");
            metrics::record_ws_upgrade("failed");
            debug!("upstream refused WebSocket connection");
            return close_handshake(StatusCode::SERVICE_UNAVAILABLE);
        }
        Err(e) => {
            metrics::record_proxy_error("error");
            metrics::record_ws_upgrade("failed");
            error!(error = %e, "failed to reach upstream for WebSocket upgrade");
            return close_handshake(StatusCode::BAD_GATEWAY);
        }
    };

    let (mut sender, connection) =
        match hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream)).await
        {
            Ok(pair) => pair,
            Err(e) => {
                metrics::record_proxy_error("error");
                metrics::record_ws_upgrade("failed");
                error!(error = %e, "upstream HTTP handshake failed");
                return close_handshake(StatusCode::BAD_GATEWAY);
            }
        };

    // Drive the upstream connection; with_upgrades() hands the raw IO back
    // once the 101 goes through.
    tokio::spawn(async move {
        if let Err(e) = connection.with_upgrades().await {
            debug!(error = %e, "upstream WebSocket connection ended with error");
        }
    });

    let upstream_req = match replay_handshake(&req, &authority) {
        Ok(upstream_req) => upstream_req,
        Err(e) => {
            metrics::record_ws_upgrade("failed");
            error!(error = %e, "failed to rebuild upgrade handshake");
            return close_handshake(StatusCode::BAD_GATEWAY);
        }
    };

    let mut upstream_resp = match sender.send_request(upstream_req).await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_proxy_error("error");
            metrics::record_ws_upgrade("failed");
            error!(error = %e, "upstream rejected upgrade handshake transport");
            return close_handshake(StatusCode::BAD_GATEWAY);
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // The upstream declined the upgrade; relay its answer as-is.
        metrics::record_ws_upgrade("failed");
        warn!(status = %upstream_resp.status(), "upstream declined WebSocket upgrade");
        return upstream_resp.map(Body::new);
    }

    // Splice the two raw sockets once both sides finish switching protocols.
    let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
    state.spawn_relay(async move {
        let mut client_io = match client_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                debug!(error = %e, "client side never completed the upgrade");
                return;
            }
        };
        let mut upstream_io = match upstream_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                debug!(error = %e, "upstream side never completed the upgrade");
                return;
            }
        };

        match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
            Ok((to_upstream, to_client)) => {
                debug!(to_upstream, to_client, "WebSocket relay closed");
            }
            Err(e) => {
                debug!(error = %e, "WebSocket relay ended with error");
            }
        }
    });

    metrics::record_ws_upgrade("forwarded");
    info!(path = %req.uri().path(), "forwarding authenticated WebSocket upgrade");

    // Relay the upstream's 101 so the client completes its side of the
    // switch; the body slot is necessarily empty before the protocol change.
    let (parts, _) = upstream_resp.into_parts();
    Response::from_parts(parts, Body::empty())
}

/// Rebuild the client's handshake request for replay against the upstream.
///
/// All headers are preserved (including `Connection`/`Upgrade` and the
/// `Sec-WebSocket-*` family) except `Host`, which is rewritten.
fn replay_handshake(
    req: &Request<Body>,
    authority: &str,
) -> Result<Request<Empty<Bytes>>, axum::http::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map_or("/", |pq| pq.as_str());

    let mut builder = Request::builder().method(req.method()).uri(path_and_query);
    for (name, value) in req.headers() {
        if name != HOST {
            builder = builder.header(name, value);
        }
    }
    builder = builder.header(HOST, authority);

    builder.body(Empty::new())
}

/// Answer a handshake with a terminal status and close the connection.
///
/// Sent before any `101`, this fails the WebSocket handshake outright: the
/// client never gets a socket, and the upstream is never contacted.
fn close_handshake(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}
