//! Interactive device-code flow
//!
//! The flow blocks the calling task: it requests a device code, shows the
//! user a verification URL and code through a pluggable prompt, then polls
//! the token endpoint until the user completes sign-in in a browser or the
//! code expires. Successful tokens persist to the on-disk cache so later
//! runs can skip the prompt entirely.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use super::cache::{load_cached_token, save_cached_token, CachedToken};
use super::{AccessToken, TokenProvider, LOGIN_BASE_URL, POWER_PLATFORM_SCOPE};
use crate::config::AuthMode;
use crate::error::Error;
use crate::Result;

/// Token endpoint response (shared with the refresh grant)
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Device authorization response
#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    #[serde(default = "default_interval")]
    interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Error body returned while the user has not finished signing in
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Out-of-band confirmation step of the device flow.
///
/// The default implementation prints instructions and opens a browser;
/// tests swap in a recording double.
pub trait DevicePrompt: Send + Sync {
    fn show(&self, verification_uri: &str, user_code: &str, expires_in_secs: u64);
}

/// Default prompt: banner on stderr plus a best-effort browser launch.
pub struct BannerPrompt;

impl DevicePrompt for BannerPrompt {
    fn show(&self, verification_uri: &str, user_code: &str, expires_in_secs: u64) {
        eprintln!("\n============================================================");
        eprintln!("DEVICE CODE AUTHENTICATION");
        eprintln!("============================================================");
        eprintln!("\nTo sign in, use a web browser to open the page:");
        eprintln!("\n  {}", verification_uri);
        eprintln!("\nAnd enter the code:");
        eprintln!("\n  {}", user_code);
        eprintln!("\nThis code expires in {} minutes.", expires_in_secs / 60);
        eprintln!("============================================================\n");

        if let Err(e) = open::that(verification_uri) {
            tracing::warn!("failed to open browser: {}", e);
        }
    }
}

/// Device-code token provider with persistent caching.
pub struct DeviceCodeProvider {
    tenant_id: String,
    client_id: String,
    cache_path: PathBuf,
    prompt: Box<dyn DevicePrompt>,
    login_base: String,
    http_client: Client,
}

impl DeviceCodeProvider {
    pub fn new(tenant_id: &str, client_id: &str, cache_path: PathBuf) -> Self {
        Self::with_prompt(tenant_id, client_id, cache_path, Box::new(BannerPrompt))
    }

    /// Create with an explicit prompt implementation.
    pub fn with_prompt(
        tenant_id: &str,
        client_id: &str,
        cache_path: PathBuf,
        prompt: Box<dyn DevicePrompt>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            cache_path,
            prompt,
            login_base: LOGIN_BASE_URL.to_string(),
            http_client: Client::new(),
        }
    }

    fn device_code_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/devicecode",
            self.login_base, self.tenant_id
        )
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.login_base, self.tenant_id)
    }

    /// Run the full device authorization grant.
    async fn authorize(&self) -> Result<CachedToken> {
        let response = self
            .http_client
            .post(self.device_code_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", POWER_PLATFORM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("device code request failed: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("device code request rejected: {}", body)));
        }

        let device: DeviceCodeResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("bad device code response: {}", e)))?;

        self.prompt
            .show(&device.verification_uri, &device.user_code, device.expires_in);

        self.poll_for_token(&device).await
    }

    /// Poll the token endpoint until the user completes sign-in.
    async fn poll_for_token(&self, device: &DeviceCodeResponse) -> Result<CachedToken> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = device.interval.max(1);

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Auth(
                    "device code expired before sign-in completed".to_string(),
                ));
            }

            tokio::time::sleep(Duration::from_secs(interval)).await;

            let response = self
                .http_client
                .post(self.token_url())
                .form(&[
                    ("grant_type", "urn:ietf:params:oauth:grant-type:device_code"),
                    ("client_id", self.client_id.as_str()),
                    ("device_code", device.device_code.as_str()),
                ])
                .send()
                .await
                .map_err(|e| Error::Auth(format!("token poll failed: {}", e)))?;

            if response.status().is_success() {
                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Auth(format!("bad token response: {}", e)))?;
                return Ok(CachedToken::new(
                    token.access_token,
                    token.refresh_token,
                    token.expires_in,
                ));
            }

            let err: TokenErrorResponse = response
                .json()
                .await
                .map_err(|e| Error::Auth(format!("bad token error response: {}", e)))?;

            match err.error.as_str() {
                "authorization_pending" => continue,
                "slow_down" => {
                    interval += 5;
                    tracing::debug!("token endpoint asked to slow down, interval now {}s", interval);
                }
                _ => {
                    return Err(Error::Auth(format!(
                        "device code flow failed: {}",
                        err.error_description.unwrap_or(err.error)
                    )));
                }
            }
        }
    }

    /// Exchange a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<CachedToken> {
        let response = self
            .http_client
            .post(self.token_url())
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
                ("scope", POWER_PLATFORM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token refresh failed: {}", e)))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!("token refresh rejected: {}", body)));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("bad refresh response: {}", e)))?;

        // Preserve the refresh token if the endpoint did not rotate it
        let refresh = token
            .refresh_token
            .or_else(|| Some(refresh_token.to_string()));

        Ok(CachedToken::new(token.access_token, refresh, token.expires_in))
    }
}

#[async_trait]
impl TokenProvider for DeviceCodeProvider {
    async fn acquire_token(&self) -> Result<AccessToken> {
        // Cached token still valid: no prompt, no network
        if let Some(cached) = load_cached_token(&self.cache_path) {
            if !cached.is_expired() {
                tracing::debug!("using cached access token");
                return Ok(cached.as_access_token());
            }

            if cached.can_refresh() {
                tracing::info!("access token expired, refreshing");
                match self.refresh(cached.refresh_token.as_ref().unwrap()).await {
                    Ok(new_cached) => {
                        save_cached_token(&self.cache_path, &new_cached)?;
                        return Ok(new_cached.as_access_token());
                    }
                    Err(e) => {
                        tracing::warn!("token refresh failed: {}, re-authenticating", e);
                    }
                }
            }
        }

        tracing::info!("no valid token found, starting device code flow");
        let cached = self.authorize().await?;
        save_cached_token(&self.cache_path, &cached)?;
        Ok(cached.as_access_token())
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Interactive
    }
}
