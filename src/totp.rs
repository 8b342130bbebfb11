//! TOTP code verification and enrollment material.
//!
//! Codes are standard RFC 6238: SHA-1, 6 digits, 30-second steps. Verification
//! accepts the current step plus one step either side (a ±30s clock-skew
//! window). A malformed token (wrong length, non-numeric) simply fails to
//! match the generated code, so callers see one outcome for "wrong code" and
//! "garbage input" alike.

use totp_rs::{Algorithm, Secret, TOTP};
use tracing::warn;

use crate::error::{AppError, AppResult};

/// Time-step length in seconds.
const STEP_SECONDS: u64 = 30;

/// Accepted clock skew, in steps either side of the current one.
const SKEW_STEPS: u8 = 1;

/// Number of code digits.
const DIGITS: usize = 6;

/// Generate a fresh random TOTP secret, base32-encoded (160 bits).
pub fn generate_secret_base32() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

/// Build the `otpauth://` provisioning URI binding issuer, account label,
/// and secret.
///
/// # Errors
///
/// Returns `AppError::Provisioning` if the secret fails to decode or the
/// issuer/account labels are not representable in a provisioning URI.
pub fn provisioning_uri(secret_base32: &str, issuer: &str, account_name: &str) -> AppResult<String> {
    Ok(build_totp(secret_base32, issuer, account_name)?.get_url())
}

/// Render the provisioning URI as a QR code, returned as a
/// `data:image/png;base64,...` URL suitable for an `<img>` tag.
///
/// # Errors
///
/// Returns `AppError::Provisioning` if the secret fails to decode or QR
/// encoding fails.
pub fn qr_data_url(secret_base32: &str, issuer: &str, account_name: &str) -> AppResult<String> {
    let totp = build_totp(secret_base32, issuer, account_name)?;
    let png = totp
        .get_qr_base64()
        .map_err(|e| AppError::Provisioning(format!("QR encoding failed: {e}")))?;
    Ok(format!("data:image/png;base64,{png}"))
}

/// Check a submitted code against the enrolled secret at the current time.
///
/// Accepts the code for the current 30-second step and one adjacent step in
/// either direction. Returns `false` for wrong codes, malformed input, and
/// undecodable secrets alike - verification failure is a single outcome.
pub fn verify(token: &str, secret_base32: &str) -> bool {
    let totp = match build_totp(secret_base32, "", "") {
        Ok(totp) => totp,
        Err(e) => {
            warn!(error = %e, "stored TOTP secret is undecodable, rejecting code");
            return false;
        }
    };

    match totp.check_current(token.trim()) {
        Ok(valid) => valid,
        Err(e) => {
            warn!(error = %e, "system clock unavailable, rejecting code");
            false
        }
    }
}

/// Check a code at an explicit Unix timestamp. Used by tests to pin the
/// skew window deterministically.
pub fn verify_at(token: &str, secret_base32: &str, timestamp: u64) -> bool {
    match build_totp(secret_base32, "", "") {
        Ok(totp) => totp.check(token.trim(), timestamp),
        Err(_) => false,
    }
}

/// Construct the RFC 6238 code generator for a stored base32 secret.
fn build_totp(secret_base32: &str, issuer: &str, account_name: &str) -> AppResult<TOTP> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| AppError::Provisioning(format!("secret decode failed: {e:?}")))?;

    let issuer = if issuer.is_empty() {
        None
    } else {
        Some(issuer.to_string())
    };

    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW_STEPS,
        STEP_SECONDS,
        secret_bytes,
        issuer,
        account_name.to_string(),
    )
    .map_err(|e| AppError::Provisioning(format!("TOTP init failed: {e}")))
}
