//! On-disk OAuth credential file.
//!
//! The file is a JSON object shared with the interactive login tool. The
//! proxy only owns the `claudeAiOauth` section; every other top-level key
//! is preserved verbatim across writes.
//!
//! Reads take no lock. Writes take an advisory exclusive lock on a sibling
//! `.lock` file, re-read the current document under that lock, replace the
//! OAuth section and atomically rename a `0600` temporary file over the
//! target.

use crate::error::{ProxyError, Result};
use crate::headers::redact;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level key of the OAuth section.
pub const OAUTH_SECTION: &str = "claudeAiOauth";

/// A token is refreshed once it is within this many milliseconds of expiry.
pub const EXPIRY_BUFFER_MS: i64 = 300_000;

/// The `claudeAiOauth` record.
///
/// `expiresAt` is kept as raw JSON because older writers stored it as a
/// numeric string.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Value>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_tier: Option<Value>,
}

impl OAuthRecord {
    /// Expiry in epoch milliseconds, if present and numeric.
    #[must_use]
    pub fn expires_at_ms(&self) -> Option<i64> {
        match self.expires_at.as_ref()? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
            }
            _ => None,
        }
    }

    /// Whether the access token is within [`EXPIRY_BUFFER_MS`] of expiring.
    ///
    /// A record without a parsable expiry is never considered expiring.
    #[must_use]
    pub fn is_expiring(&self, now_ms: i64) -> bool {
        match self.expires_at_ms() {
            Some(exp) => now_ms.saturating_add(EXPIRY_BUFFER_MS) > exp,
            None => false,
        }
    }

    /// The access token, if present and non-empty.
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.access_token.as_deref().filter(|t| !t.is_empty())
    }

    /// The refresh token, if present and non-empty.
    #[must_use]
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref().filter(|t| !t.is_empty())
    }
}

impl fmt::Debug for OAuthRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthRecord")
            .field("access_token", &self.access_token.as_deref().map(redact))
            .field("refresh_token", &self.refresh_token.as_deref().map(redact))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("subscription_type", &self.subscription_type)
            .field("rate_limit_tier", &self.rate_limit_tier)
            .finish()
    }
}

/// A parsed credential file.
#[derive(Debug, Clone)]
pub struct CredentialDocument {
    /// The whole top-level object.
    pub root: Map<String, Value>,
    /// The OAuth section, or an empty record when the section is absent.
    pub oauth: OAuthRecord,
}

/// Reader and writer for one credential file.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling lock file used to serialize writers.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Read and parse the credential file without locking.
    pub fn read(&self) -> Result<CredentialDocument> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProxyError::CredentialsNotFound(format!(
                    "No credentials found. Set ANTHROPIC_API_KEY or run 'claude' on the host to create {}",
                    self.path.display()
                )))
            }
            Err(e) => {
                return Err(ProxyError::CredentialsCorrupt(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let root = match serde_json::from_str::<Value>(&contents) {
            Ok(Value::Object(root)) => root,
            Ok(_) => {
                return Err(ProxyError::CredentialsCorrupt(format!(
                    "{}: top-level value is not an object",
                    self.path.display()
                )))
            }
            Err(e) => {
                return Err(ProxyError::CredentialsCorrupt(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        let oauth = match root.get(OAUTH_SECTION) {
            None | Some(Value::Null) => OAuthRecord::default(),
            Some(section @ Value::Object(_)) => serde_json::from_value(section.clone())
                .map_err(|e| {
                    ProxyError::CredentialsCorrupt(format!(
                        "{}: invalid {} section: {}",
                        self.path.display(),
                        OAUTH_SECTION,
                        e
                    ))
                })?,
            Some(_) => {
                return Err(ProxyError::CredentialsCorrupt(format!(
                    "{}: {} is not an object",
                    self.path.display(),
                    OAUTH_SECTION
                )))
            }
        };

        Ok(CredentialDocument { root, oauth })
    }

    /// Replace the OAuth section, preserving every other top-level key.
    ///
    /// Blocks on the advisory lock; call from a blocking context.
    pub fn write(&self, oauth: &OAuthRecord) -> Result<()> {
        let lock = self.open_lock_file()?;
        fs2::FileExt::lock_exclusive(&lock)?;

        // Another writer may have changed the file since our last read.
        let mut root = match std::fs::read_to_string(&self.path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(root)) => root,
                _ => Map::new(),
            },
            Err(_) => Map::new(),
        };
        root.insert(OAUTH_SECTION.to_string(), serde_json::to_value(oauth)?);
        let json = serde_json::to_vec_pretty(&Value::Object(root))?;

        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        // Dropping the temp file on an early return removes it.
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| ProxyError::Io(e.error))?;

        fs2::FileExt::unlock(&lock)?;
        debug!("wrote credentials to {}", self.path.display());
        Ok(())
    }

    fn open_lock_file(&self) -> Result<File> {
        let mut options = OpenOptions::new();
        options.create(true).truncate(false).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        Ok(options.open(self.lock_path())?)
    }
}
