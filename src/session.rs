//! Signed session tokens carried in a cookie.
//!
//! # Token Format
//!
//! ```text
//! base64url(json payload) "." base64url(hmac-sha256(json payload))
//! ```
//!
//! The payload is only trusted after the MAC verifies (constant-time
//! comparison). Any malformation - missing separator, bad base64, bad JSON,
//! MAC mismatch, expired issuance timestamp - yields the same outcome: no
//! session.
//!
//! # Two Call Sites, One Decoder
//!
//! [`SessionCodec::decode`] is pure with respect to the token string: no
//! framework request object, no side effects. This matters because the codec
//! runs twice per deployment: once through the normal cookie-jar pipeline for
//! plain HTTP requests, and once against the raw `Cookie` header of a
//! WebSocket upgrade handshake, which never passes through that pipeline.
//! Both paths must agree on every token, so both go through the same
//! function.

use std::sync::Arc;
use std::time::Duration;

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::Config;
use crate::error::{AppError, AppResult};

/// Length of a generated signing key when `SESSION_SECRET` is unset.
const GENERATED_KEY_BYTES: usize = 32;

/// One browser/client context's authentication state.
///
/// Created empty on first contact, populated on successful setup-verification
/// or login, destroyed on logout or on expiry of its issuance timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Whether this client has proven possession of the TOTP secret.
    pub authenticated: bool,

    /// Original request path recorded when an unauthenticated request was
    /// intercepted; consumed and cleared by the next successful login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub return_to: Option<String>,

    /// Unix timestamp of issuance; expiry is enforced at decode time.
    issued_at: i64,
}

impl Session {
    /// A session proving a completed TOTP verification.
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
            return_to: None,
            issued_at: Utc::now().timestamp(),
        }
    }

    /// An unauthenticated session remembering where the client was headed.
    pub fn pending(return_to: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            return_to: Some(return_to.into()),
            issued_at: Utc::now().timestamp(),
        }
    }
}

/// Encodes and decodes signed session tokens.
///
/// Cheap to clone; clones share the signing key.
#[derive(Clone)]
pub struct SessionCodec {
    /// Pre-keyed MAC, cloned per operation.
    mac: Hmac<Sha256>,
    cookie_name: Arc<str>,
    max_age: Duration,
}

impl SessionCodec {
    /// Build a codec from configuration.
    ///
    /// When no `SESSION_SECRET` is configured a random key is generated, so
    /// every outstanding session dies with the process. That is tolerable for
    /// a single-operator gateway but worth warning about.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the signing key is rejected.
    pub fn from_config(config: &Config) -> AppResult<Self> {
        let key = match &config.session_secret {
            Some(secret) => secret.as_bytes().to_vec(),
            None => {
                warn!(
                    "SESSION_SECRET is not set; generated a random signing key \
                     (sessions will not survive a restart)"
                );
                let mut key = vec![0u8; GENERATED_KEY_BYTES];
                rand::RngCore::fill_bytes(&mut rand::rng(), &mut key);
                key
            }
        };

        let mac = <Hmac<Sha256> as Mac>::new_from_slice(&key)
            .map_err(|e| AppError::Config(format!("session signing key rejected: {e}")))?;

        Ok(Self {
            mac,
            cookie_name: Arc::from(config.session_cookie_name.as_str()),
            max_age: config.session_max_age,
        })
    }

    /// Name of the session cookie.
    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Serialize and sign a session into an opaque token.
    pub fn encode(&self, session: &Session) -> String {
        // Session serialization cannot fail: every field is a plain scalar.
        let payload = serde_json::to_vec(session).unwrap_or_default();
        let tag = self.sign(&payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(tag)
        )
    }

    /// Verify and deserialize a token.
    ///
    /// The MAC is checked (constant time) before any payload field is
    /// trusted; expiry is enforced against the signed issuance timestamp.
    /// Every failure mode collapses to `None` - there is no partially
    /// trusted session.
    pub fn decode(&self, token: &str) -> Option<Session> {
        let (payload_b64, tag_b64) = token.split_once('.')?;
        let payload = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let tag = URL_SAFE_NO_PAD.decode(tag_b64).ok()?;

        let expected = self.sign(&payload);
        if !bool::from(tag.as_slice().ct_eq(expected.as_slice())) {
            return None;
        }

        let session: Session = serde_json::from_slice(&payload).ok()?;

        let now = Utc::now().timestamp();
        let age = now.saturating_sub(session.issued_at);
        if session.issued_at > now || age as u64 > self.max_age.as_secs() {
            return None;
        }

        Some(session)
    }

    /// Decode the session from a parsed cookie jar (plain HTTP pipeline).
    pub fn session_from_jar(&self, jar: &CookieJar) -> Option<Session> {
        self.decode(jar.get(&self.cookie_name)?.value())
    }

    /// Decode the session from a raw `Cookie` header value.
    ///
    /// This is the WebSocket-upgrade entry point: the handshake bypasses the
    /// request pipeline, so the header is parsed here and fed through the
    /// same [`decode`](Self::decode) as the jar path.
    pub fn session_from_cookie_header(&self, header: &str) -> Option<Session> {
        self.decode(cookie_value(header, &self.cookie_name)?)
    }

    /// Build the session cookie: `HttpOnly`, `SameSite=Lax`, fixed max-age.
    pub fn cookie(&self, session: &Session) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.cookie_name.to_string(), self.encode(session));
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_path("/");
        cookie.set_max_age(time::Duration::seconds(self.max_age.as_secs() as i64));
        cookie
    }

    /// Build a removal cookie that destroys the session client-side.
    pub fn removal_cookie(&self) -> Cookie<'static> {
        let mut cookie = Cookie::new(self.cookie_name.to_string(), "");
        cookie.set_http_only(true);
        cookie.set_same_site(SameSite::Lax);
        cookie.set_path("/");
        cookie.set_max_age(time::Duration::ZERO);
        cookie
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

/// Extract a cookie's value from a raw `Cookie` header.
///
/// Session tokens are base64url plus `.`, so no percent-decoding is needed.
fn cookie_value<'a>(header: &'a str, name: &str) -> Option<&'a str> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}
