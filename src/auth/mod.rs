//! Authentication module for credential acquisition and caching
//!
//! This module provides:
//! - [`AccessToken`] with early-expiry handling
//! - [`TokenProvider`] trait implemented by every auth mode
//! - On-disk token cache for the interactive flow
//! - Provider dispatch from a [`Config`]

mod cache;
mod client_secret;
mod default_chain;
mod device_code;
mod directline;

pub use cache::{delete_cached_token, load_cached_token, save_cached_token, CachedToken};
pub use client_secret::ClientSecretProvider;
pub use default_chain::DefaultChainProvider;
pub use device_code::{BannerPrompt, DeviceCodeProvider, DevicePrompt};
pub use directline::DirectLineProvider;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::config::{AuthMode, Config};
use crate::error::Error;
use crate::Result;

/// OAuth2 scope for the Power Platform API.
pub const POWER_PLATFORM_SCOPE: &str = "https://api.powerplatform.com/.default";

/// Entra ID login endpoint base.
pub const LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";

/// A bearer token with an optional expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Create a token expiring `expires_in_secs` from now.
    pub fn new(token: impl Into<String>, expires_in_secs: Option<i64>) -> Self {
        Self {
            token: token.into(),
            expires_at: expires_in_secs.map(|secs| Utc::now() + Duration::seconds(secs)),
        }
    }

    /// Sentinel token for unauthenticated agents.
    pub fn sentinel() -> Self {
        Self {
            token: String::new(),
            expires_at: None,
        }
    }

    /// Check if the token is expired or about to expire.
    ///
    /// Returns true if the token expires within the next 5 minutes so a
    /// refresh happens before the remote side starts rejecting it.
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires) => Utc::now() + Duration::minutes(5) >= expires,
            None => false,
        }
    }
}

/// Capability to produce a bearer token on demand.
///
/// Implementations perform their own flow (device code, client secret,
/// ambient chain, secret exchange); callers cache the result and only
/// call again near expiry.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Acquire a fresh token. May block on user interaction for the
    /// interactive mode.
    async fn acquire_token(&self) -> Result<AccessToken>;

    /// The auth mode this provider implements.
    fn mode(&self) -> AuthMode;
}

/// Provider for agents that require no authentication.
pub struct NoAuthProvider;

#[async_trait]
impl TokenProvider for NoAuthProvider {
    async fn acquire_token(&self) -> Result<AccessToken> {
        Ok(AccessToken::sentinel())
    }

    fn mode(&self) -> AuthMode {
        AuthMode::None
    }
}

/// Create the provider matching the configured auth mode.
///
/// Assumes the configuration already passed [`Config::validate`]; a
/// mode-required field that is still missing surfaces as [`Error::Auth`].
pub fn provider_for(config: &Config) -> Result<Box<dyn TokenProvider>> {
    match config.auth_mode {
        AuthMode::None => Ok(Box::new(NoAuthProvider)),
        AuthMode::Interactive => {
            let client_id = required(config.client_id.as_deref(), "client_id")?;
            Ok(Box::new(DeviceCodeProvider::new(
                &config.tenant_id,
                client_id,
                config.token_cache_path.clone(),
            )))
        }
        AuthMode::ClientCredentials => {
            let client_id = required(config.client_id.as_deref(), "client_id")?;
            let client_secret = required(config.client_secret.as_deref(), "client_secret")?;
            Ok(Box::new(ClientSecretProvider::new(
                &config.tenant_id,
                client_id,
                client_secret,
            )))
        }
        AuthMode::Default => Ok(Box::new(DefaultChainProvider::new(&config.tenant_id))),
        AuthMode::DirectLine => {
            let secret = required(config.directline_secret.as_deref(), "directline_secret")?;
            Ok(Box::new(DirectLineProvider::new(secret)))
        }
    }
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::Auth(format!("{} is required for the configured auth mode", field)))
}
