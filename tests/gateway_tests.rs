//! End-to-end tests for the gateway.
//!
//! Each test boots a real gateway over an in-process upstream on ephemeral
//! ports and drives it with a cookie-keeping HTTP client. No containers, no
//! external processes: the upstream is either a tiny axum app (plain HTTP
//! paths) or a raw TCP server speaking just enough HTTP/1.1 to accept a
//! WebSocket handshake and echo bytes (upgrade paths).
//!
//! Run with: `cargo test --test gateway_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::Router;
use axum::extract::Request;
use reqwest::{Client, StatusCode};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use totp_rs::{Algorithm, Secret, TOTP};

use otpgate::{AppState, Config, build_router};

// =============================================================================
// Fixtures
// =============================================================================

/// A plain HTTP upstream that answers every request and counts hits.
async fn spawn_http_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    let app = Router::new().fallback(move |req: Request| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            format!("upstream:{}", req.uri().path())
        }
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hits)
}

/// A raw TCP upstream that accepts a WebSocket handshake with `101` and then
/// echoes every byte. Counts accepted connections.
async fn spawn_ws_echo_upstream() -> (SocketAddr, Arc<AtomicUsize>) {
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);

            tokio::spawn(async move {
                // Consume the handshake request up to the blank line.
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                loop {
                    let Ok(n) = socket.read(&mut chunk).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                    if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }

                let accept = b"HTTP/1.1 101 Switching Protocols\r\n\
                               Upgrade: websocket\r\n\
                               Connection: Upgrade\r\n\r\n";
                if socket.write_all(accept).await.is_err() {
                    return;
                }

                // Echo until either side hangs up.
                loop {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    (addr, connections)
}

/// A running gateway plus everything a test needs to drive it.
struct Gateway {
    base_url: String,
    addr: SocketAddr,
    client: Client,
    secret_file: PathBuf,
    cookie_name: String,
    _dir: TempDir,
}

impl Gateway {
    /// Start a gateway proxying to `upstream`, with an isolated secret file
    /// and a pinned signing key.
    async fn start(upstream: SocketAddr) -> Self {
        Self::start_with(upstream, |config| config).await
    }

    async fn start_with(
        upstream: SocketAddr,
        tweak: impl FnOnce(Config) -> Config,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let secret_file = dir.path().join("secret.json");

        let config = tweak(Config {
            host: "127.0.0.1".to_string(),
            upstream_host: upstream.ip().to_string(),
            upstream_port: upstream.port(),
            secret_file_path: secret_file.clone(),
            session_secret: Some("integration-test-signing-key".to_string()),
            app_name: "Test Gateway".to_string(),
            ..Config::default()
        });
        let cookie_name = config.session_cookie_name.clone();

        let state = AppState::new(config).unwrap();
        let app = build_router(state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client = Client::builder()
            .cookie_store(true)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();

        Self {
            base_url: format!("http://{addr}"),
            addr,
            client,
            secret_file,
            cookie_name,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// The pending/enrolled secret as persisted by the gateway.
    fn stored_secret(&self) -> String {
        let raw = std::fs::read_to_string(&self.secret_file).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["secret"].as_str().unwrap().to_string()
    }

    fn stored_record(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(&self.secret_file).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    /// Complete enrollment and return the session cookie's `name=value` pair.
    async fn enroll(&self) -> String {
        let setup = self.client.get(self.url("/auth/setup")).send().await.unwrap();
        assert_eq!(setup.status(), StatusCode::OK);

        let code = current_code(&self.stored_secret());
        let verify = self
            .client
            .post(self.url("/auth/setup"))
            .form(&[("token", code)])
            .send()
            .await
            .unwrap();
        assert_eq!(verify.status(), StatusCode::SEE_OTHER);
        assert_eq!(verify.headers()["location"], "/");

        let set_cookie = verify.headers()["set-cookie"].to_str().unwrap();
        set_cookie
            .split(';')
            .next()
            .unwrap()
            .trim()
            .to_string()
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn totp_for(secret_base32: &str) -> TOTP {
    let secret = Secret::Encoded(secret_base32.to_string()).to_bytes().unwrap();
    TOTP::new(Algorithm::SHA1, 6, 1, 30, secret, None, "admin".to_string()).unwrap()
}

/// A code the gateway must accept right now.
fn current_code(secret_base32: &str) -> String {
    totp_for(secret_base32).generate(unix_now())
}

/// A code from far outside the accepted skew window.
fn stale_code(secret_base32: &str) -> String {
    totp_for(secret_base32).generate(unix_now() - 600)
}

// =============================================================================
// Enrollment
// =============================================================================

#[tokio::test]
async fn fresh_deployment_enrollment_flow() {
    let (upstream, hits) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;

    // Fresh deployment: guarded paths bounce to setup.
    let guarded = gw.client.get(gw.url("/anything")).send().await.unwrap();
    assert_eq!(guarded.status(), StatusCode::SEE_OTHER);
    assert_eq!(guarded.headers()["location"], "/auth/setup");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "nothing may reach upstream");

    // Setup page carries a QR data URL and the manual-entry secret.
    let setup = gw.client.get(gw.url("/auth/setup")).send().await.unwrap();
    assert_eq!(setup.status(), StatusCode::OK);
    let body = setup.text().await.unwrap();
    assert!(body.contains("data:image/png;base64,"));
    let secret = gw.stored_secret();
    assert!(body.contains(&secret));

    // Verifying a current code enrolls, authenticates, and redirects to root.
    let verify = gw
        .client
        .post(gw.url("/auth/setup"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert_eq!(verify.status(), StatusCode::SEE_OTHER);
    assert_eq!(verify.headers()["location"], "/");

    let record = gw.stored_record();
    assert_eq!(record["enrolled"], serde_json::Value::Bool(true));
    assert!(record["enrolledAt"].is_string());

    // The session from enrollment opens the proxy.
    let proxied = gw.client.get(gw.url("/workspace")).send().await.unwrap();
    assert_eq!(proxied.status(), StatusCode::OK);
    assert_eq!(proxied.text().await.unwrap(), "upstream:/workspace");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn setup_is_idempotent_before_verification() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;

    gw.client.get(gw.url("/auth/setup")).send().await.unwrap();
    let first = gw.stored_secret();

    let second_page = gw.client.get(gw.url("/auth/setup")).send().await.unwrap();
    let body = second_page.text().await.unwrap();

    assert_eq!(gw.stored_secret(), first, "pending secret must not churn");
    assert!(body.contains(&first), "page must render the same secret");
}

#[tokio::test]
async fn wrong_setup_code_keeps_pending_secret() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;

    gw.client.get(gw.url("/auth/setup")).send().await.unwrap();
    let secret = gw.stored_secret();

    let verify = gw
        .client
        .post(gw.url("/auth/setup"))
        .form(&[("token", stale_code(&secret))])
        .send()
        .await
        .unwrap();

    // Re-rendered with an error, same pending secret, still not enrolled.
    assert_eq!(verify.status(), StatusCode::OK);
    let body = verify.text().await.unwrap();
    assert!(body.contains("Invalid code"));
    assert!(body.contains(&secret));
    assert_eq!(gw.stored_secret(), secret);
    assert_eq!(gw.stored_record()["enrolled"], serde_json::Value::Bool(false));
}

#[tokio::test]
async fn enrolled_gateway_redirects_setup_to_login() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;

    let setup = gw.client.get(gw.url("/auth/setup")).send().await.unwrap();
    assert_eq!(setup.status(), StatusCode::SEE_OTHER);
    assert_eq!(setup.headers()["location"], "/auth/login");
}

// =============================================================================
// Login, return-to, logout
// =============================================================================

#[tokio::test]
async fn login_redirects_back_to_original_path_then_defaults_to_root() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;

    // A second browser context hits a deep path unauthenticated.
    let visitor = Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    let guarded = visitor.get(gw.url("/deep/path?x=1")).send().await.unwrap();
    assert_eq!(guarded.status(), StatusCode::SEE_OTHER);
    assert_eq!(guarded.headers()["location"], "/auth/login");

    // Login returns to the exact original path.
    let login = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&gw.stored_secret()))])
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::SEE_OTHER);
    assert_eq!(login.headers()["location"], "/deep/path?x=1");

    // Logging out and back in without a new guarded request: return-to was
    // consumed, so the default destination is root.
    let logout = visitor.get(gw.url("/auth/logout")).send().await.unwrap();
    assert_eq!(logout.status(), StatusCode::SEE_OTHER);
    assert_eq!(logout.headers()["location"], "/auth/login");

    let second_login = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&gw.stored_secret()))])
        .send()
        .await
        .unwrap();
    assert_eq!(second_login.status(), StatusCode::SEE_OTHER);
    assert_eq!(second_login.headers()["location"], "/");
}

#[tokio::test]
async fn logout_closes_the_proxy() {
    let (upstream, hits) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;

    assert_eq!(
        gw.client.get(gw.url("/app")).send().await.unwrap().status(),
        StatusCode::OK
    );
    let hits_before = hits.load(Ordering::SeqCst);

    gw.client.get(gw.url("/auth/logout")).send().await.unwrap();

    let after = gw.client.get(gw.url("/app")).send().await.unwrap();
    assert_eq!(after.status(), StatusCode::SEE_OTHER);
    assert_eq!(after.headers()["location"], "/auth/login");
    assert_eq!(hits.load(Ordering::SeqCst), hits_before);
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test]
async fn sixth_attempt_is_throttled_even_with_the_correct_code() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;
    let secret = gw.stored_secret();

    let visitor = Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    for _ in 0..5 {
        let attempt = visitor
            .post(gw.url("/auth/login"))
            .form(&[("token", stale_code(&secret))])
            .send()
            .await
            .unwrap();
        assert_eq!(attempt.status(), StatusCode::OK);
        assert!(attempt.text().await.unwrap().contains("Invalid code"));
    }

    // The 6th attempt falls in the same window: throttled without
    // verification, even though the code is correct.
    let sixth = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert_eq!(sixth.status(), StatusCode::OK);
    assert!(sixth.text().await.unwrap().contains("Too many attempts"));
}

#[tokio::test]
async fn successful_login_resets_the_limiter() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;
    let secret = gw.stored_secret();

    let visitor = Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    // Burn 3 of 5 attempts, then log in successfully.
    for _ in 0..3 {
        visitor
            .post(gw.url("/auth/login"))
            .form(&[("token", stale_code(&secret))])
            .send()
            .await
            .unwrap();
    }
    let login = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert_eq!(login.status(), StatusCode::SEE_OTHER);

    // The reset restored the full budget: 4 fresh failures plus a correct
    // 5th all fit in the window.
    for _ in 0..4 {
        let attempt = visitor
            .post(gw.url("/auth/login"))
            .form(&[("token", stale_code(&secret))])
            .send()
            .await
            .unwrap();
        assert!(attempt.text().await.unwrap().contains("Invalid code"));
    }
    let fifth = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert_eq!(fifth.status(), StatusCode::SEE_OTHER);
}

#[tokio::test]
async fn lockout_expires_with_the_window() {
    let (upstream, _) = spawn_http_upstream().await;
    let gw = Gateway::start_with(upstream, |config| Config {
        rate_limit_window: Duration::from_millis(300),
        ..config
    })
    .await;
    gw.enroll().await;
    let secret = gw.stored_secret();

    let visitor = Client::builder()
        .cookie_store(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    for _ in 0..5 {
        visitor
            .post(gw.url("/auth/login"))
            .form(&[("token", stale_code(&secret))])
            .send()
            .await
            .unwrap();
    }
    let locked = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert!(locked.text().await.unwrap().contains("Too many attempts"));

    tokio::time::sleep(Duration::from_millis(400)).await;

    let unlocked = visitor
        .post(gw.url("/auth/login"))
        .form(&[("token", current_code(&secret))])
        .send()
        .await
        .unwrap();
    assert_eq!(unlocked.status(), StatusCode::SEE_OTHER);
}

// =============================================================================
// WebSocket upgrades
// =============================================================================

/// Open a raw connection to the gateway and send a WebSocket handshake.
/// Returns the socket and the full HTTP response head.
async fn send_ws_handshake(addr: SocketAddr, cookie: Option<&str>) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    let cookie_line = cookie.map_or(String::new(), |c| format!("Cookie: {c}\r\n"));
    let handshake = format!(
        "GET /socket HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\
         {cookie_line}\r\n"
    );
    stream.write_all(handshake.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    (stream, String::from_utf8_lossy(&head).to_string())
}

#[tokio::test]
async fn ws_upgrade_without_cookie_is_rejected_before_upstream() {
    let (upstream, connections) = spawn_ws_echo_upstream().await;
    let gw = Gateway::start(upstream).await;
    gw.enroll().await;

    let (_stream, head) = send_ws_handshake(gw.addr, None).await;

    assert!(head.starts_with("HTTP/1.1 401"), "got: {head}");
    assert_eq!(
        connections.load(Ordering::SeqCst),
        0,
        "no bytes may reach the upstream for a rejected upgrade"
    );
}

#[tokio::test]
async fn ws_upgrade_with_tampered_cookie_is_rejected() {
    let (upstream, connections) = spawn_ws_echo_upstream().await;
    let gw = Gateway::start(upstream).await;
    let session_cookie = gw.enroll().await;

    // Corrupt the tail of the signature.
    let mut tampered = session_cookie.clone();
    let flipped = if tampered.ends_with('A') { 'B' } else { 'A' };
    tampered.pop();
    tampered.push(flipped);

    let (_stream, head) = send_ws_handshake(gw.addr, Some(&tampered)).await;

    assert!(head.starts_with("HTTP/1.1 401"), "got: {head}");
    assert_eq!(connections.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn ws_upgrade_with_valid_session_is_spliced_end_to_end() {
    let (upstream, connections) = spawn_ws_echo_upstream().await;
    let gw = Gateway::start(upstream).await;
    let session_cookie = gw.enroll().await;

    let (mut stream, head) = send_ws_handshake(gw.addr, Some(&session_cookie)).await;

    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    // Bytes flow through the spliced sockets in both directions.
    stream.write_all(b"ping-through-gateway").await.unwrap();
    let mut echoed = [0u8; b"ping-through-gateway".len()];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping-through-gateway");
}

// =============================================================================
// Upstream failures and health
// =============================================================================

/// Reserve a port with no listener behind it.
fn dead_upstream() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn refused_upstream_renders_starting_page() {
    let gw = Gateway::start(dead_upstream()).await;
    gw.enroll().await;

    let response = gw.client.get(gw.url("/app")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()["retry-after"], "3");

    let body = response.text().await.unwrap();
    assert!(body.contains("starting up"));
    assert!(body.contains("Test Gateway"));
}

#[tokio::test]
async fn refused_upstream_fails_ws_handshake() {
    let gw = Gateway::start(dead_upstream()).await;
    let session_cookie = gw.enroll().await;

    let (_stream, head) = send_ws_handshake(gw.addr, Some(&session_cookie)).await;
    assert!(head.starts_with("HTTP/1.1 503"), "got: {head}");
}

#[tokio::test]
async fn healthz_answers_without_a_session() {
    let (upstream, hits) = spawn_http_upstream().await;
    let gw = Gateway::start(upstream).await;

    let fresh = Client::new();
    let response = fresh.get(gw.url("/healthz")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 0, "healthz is not proxied");
}

#[tokio::test]
async fn session_cookie_name_is_configurable_and_ws_parser_agrees() {
    let (upstream, _) = spawn_ws_echo_upstream().await;
    let gw = Gateway::start_with(upstream, |config| Config {
        session_cookie_name: "renamed_session".to_string(),
        ..config
    })
    .await;

    let session_cookie = gw.enroll().await;
    assert!(session_cookie.starts_with("renamed_session="));
    assert_eq!(gw.cookie_name, "renamed_session");

    // The raw-header parser on the upgrade path honors the same name.
    let (_stream, head) = send_ws_handshake(gw.addr, Some(&session_cookie)).await;
    assert!(head.starts_with("HTTP/1.1 101"), "got: {head}");
}
