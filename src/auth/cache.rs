//! On-disk token cache for the interactive flow
//!
//! Persisting the device-code token avoids re-prompting the user on every
//! process start. The cache is purely a convenience: a missing or corrupt
//! file falls through to a fresh flow.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::AccessToken;
use crate::Result;

/// Cached token material written to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    /// The access token for API requests
    pub access_token: String,

    /// The refresh token for obtaining new access tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (usually "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// When the access token expires
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl CachedToken {
    /// Create cache material from a token endpoint response.
    pub fn new(
        access_token: String,
        refresh_token: Option<String>,
        expires_in_secs: Option<i64>,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: default_token_type(),
            expires_at: expires_in_secs.map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        }
    }

    /// Whether the cached access token is still usable.
    pub fn is_expired(&self) -> bool {
        self.as_access_token().is_expired()
    }

    /// Whether a silent refresh is possible.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some()
    }

    pub fn as_access_token(&self) -> AccessToken {
        AccessToken {
            token: self.access_token.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// Load the cached token, tolerating absence and corruption.
pub fn load_cached_token(path: &Path) -> Option<CachedToken> {
    if !path.exists() {
        return None;
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(cached) => Some(cached),
            Err(e) => {
                tracing::warn!("ignoring corrupt token cache at {:?}: {}", path, e);
                None
            }
        },
        Err(e) => {
            tracing::warn!("cannot read token cache at {:?}: {}", path, e);
            None
        }
    }
}

/// Save the token cache, restricting permissions on Unix.
pub fn save_cached_token(path: &Path, cached: &CachedToken) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let content = serde_json::to_string_pretty(cached)?;
    std::fs::write(path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }

    Ok(())
}

/// Delete the cached token if present.
pub fn delete_cached_token(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}
