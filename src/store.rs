//! Persistence for the TOTP enrollment record.
//!
//! One record per deployment, stored as a small JSON file with owner-only
//! permissions. The file is the source of truth; nothing is cached in memory,
//! so a record observed as enrolled stays enrolled for every later reader.
//!
//! # Fail-Safe Reads
//!
//! A missing, unreadable, or malformed file all load as "no record", which
//! the state machine treats as NOT_ENROLLED. Corruption therefore reopens
//! the setup flow rather than granting access. The two cases log differently
//! (a parse failure on an existing file is an ERROR, a missing file is not)
//! so an operator can tell first boot from a damaged record.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::totp;

/// The persisted enrollment state: the shared TOTP seed plus the flag that
/// marks it as confirmed.
///
/// Invariant: `enrolled == true` implies `secret` is non-empty, and the
/// secret is never rewritten afterwards (there is no un-enroll path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentRecord {
    /// Base32-encoded TOTP seed.
    pub secret: String,

    /// `otpauth://` URI binding issuer, account label, and secret.
    #[serde(rename = "provisioningURI")]
    pub provisioning_uri: String,

    /// Monotonic false -> true; set on first successful setup verification.
    pub enrolled: bool,

    /// Issuer label shown in authenticator apps.
    pub issuer: String,

    /// Account label shown in authenticator apps.
    pub account_name: String,

    /// Stamped exactly once, when enrollment is confirmed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
}

/// Owns the enrollment record file.
///
/// Cheap to clone; clones share the generation lock, so concurrent setup
/// requests can never mint two distinct pending secrets.
#[derive(Clone)]
pub struct SecretStore {
    path: Arc<PathBuf>,
    issuer: String,
    account_name: String,
    /// Serializes the load-check-generate-save sequence in
    /// [`ensure_pending`](Self::ensure_pending) and
    /// [`mark_enrolled`](Self::mark_enrolled).
    write_lock: Arc<Mutex<()>>,
}

impl SecretStore {
    /// Build a store from configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: Arc::new(config.secret_file_path.clone()),
            issuer: config.app_name.clone(),
            account_name: config.account_name.clone(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Read the persisted record.
    ///
    /// Missing file, unreadable file, and malformed content all yield `None`
    /// - the store never fails toward "enrolled".
    pub fn load(&self) -> Option<EnrollmentRecord> {
        let bytes = match fs::read(self.path.as_path()) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no enrollment record yet");
                return None;
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "failed to read enrollment record");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                // An existing-but-unparseable file means either tampering or
                // corruption; it reopens setup, so make sure it is loud.
                error!(
                    path = %self.path.display(),
                    error = %e,
                    "enrollment record exists but is malformed; treating as not enrolled"
                );
                None
            }
        }
    }

    /// Whether a confirmed enrollment exists.
    pub fn is_enrolled(&self) -> bool {
        self.load().is_some_and(|record| record.enrolled)
    }

    /// Write the record atomically with owner-only permissions.
    ///
    /// # Errors
    ///
    /// Returns `AppError::PersistWrite` / `AppError::Serialization` if the
    /// record cannot be made durable. Callers must not treat the session as
    /// authenticated when this fails.
    pub fn save(&self, record: &EnrollmentRecord) -> AppResult<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            create_private_dir(dir)?;
        }

        let json = serde_json::to_vec_pretty(record)?;

        // Write-then-rename so readers never observe a half-written record.
        let tmp = self.path.with_extension("json.tmp");
        write_private_file(&tmp, &json)?;
        fs::rename(&tmp, self.path.as_path())?;

        Ok(())
    }

    /// Return the pending (or enrolled) record, generating one if absent.
    ///
    /// Idempotent: repeat calls before enrollment return the same pending
    /// secret; an already-generated secret is never regenerated. The check
    /// happens inside the lock, before generation, so two concurrent setup
    /// requests agree on one secret.
    ///
    /// # Errors
    ///
    /// Returns an error if generation or persistence fails.
    pub fn ensure_pending(&self) -> AppResult<EnrollmentRecord> {
        let _guard = self.lock();

        if let Some(record) = self.load().filter(|r| !r.secret.is_empty()) {
            return Ok(record);
        }

        let secret = totp::generate_secret_base32();
        let provisioning_uri = totp::provisioning_uri(&secret, &self.issuer, &self.account_name)?;

        let record = EnrollmentRecord {
            secret,
            provisioning_uri,
            enrolled: false,
            issuer: self.issuer.clone(),
            account_name: self.account_name.clone(),
            enrolled_at: None,
        };
        self.save(&record)?;
        info!(path = %self.path.display(), "generated pending enrollment secret");

        Ok(record)
    }

    /// Confirm the pending enrollment: set the flag, stamp `enrolled_at`
    /// exactly once, persist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Internal` if no pending record exists, or a
    /// persistence error if the confirmed record cannot be written.
    pub fn mark_enrolled(&self) -> AppResult<EnrollmentRecord> {
        let _guard = self.lock();

        let mut record = self
            .load()
            .filter(|r| !r.secret.is_empty())
            .ok_or_else(|| AppError::Internal("no pending enrollment to confirm".to_string()))?;

        if record.enrolled {
            return Ok(record);
        }

        record.enrolled = true;
        if record.enrolled_at.is_none() {
            record.enrolled_at = Some(Utc::now());
        }
        self.save(&record)?;
        info!("TOTP enrollment confirmed and persisted");

        Ok(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        match self.write_lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("secret store lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Create `dir` (and parents) with owner-only access.
#[cfg(unix)]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)
}

/// Write `bytes` to `path` with owner-only read/write permissions.
#[cfg(unix)]
fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}
