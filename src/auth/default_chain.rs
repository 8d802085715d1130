//! Ambient credential chain
//!
//! Tries an ordered list of credential sources and uses the first that
//! succeeds: environment variables, the managed identity endpoint, then a
//! local `az` CLI session. Every source's failure reason is kept so the
//! final error names what was tried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::client_secret::ClientSecretProvider;
use super::{AccessToken, TokenProvider};
use crate::config::AuthMode;
use crate::error::Error;
use crate::Result;

/// Azure instance metadata service token endpoint.
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

/// Resource the chain requests tokens for (scope without `/.default`).
const POWER_PLATFORM_RESOURCE: &str = "https://api.powerplatform.com";

#[derive(Debug, Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    /// Epoch seconds as a string, per the IMDS contract
    expires_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AzCliTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    /// Epoch seconds. az also emits a local-time `expiresOn` string,
    /// which is ignored in favor of the unambiguous field
    #[serde(default, rename = "expires_on")]
    expires_on: Option<String>,
}

/// Ambient credential chain provider.
pub struct DefaultChainProvider {
    tenant_id: String,
    http_client: Client,
}

impl DefaultChainProvider {
    pub fn new(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            http_client: Client::new(),
        }
    }

    /// Environment source: a complete service-principal triple.
    async fn try_environment(&self) -> Result<AccessToken> {
        let client_id = std::env::var("AZURE_CLIENT_ID")
            .map_err(|_| Error::Auth("AZURE_CLIENT_ID not set".to_string()))?;
        let client_secret = std::env::var("AZURE_CLIENT_SECRET")
            .map_err(|_| Error::Auth("AZURE_CLIENT_SECRET not set".to_string()))?;
        let tenant_id =
            std::env::var("AZURE_TENANT_ID").unwrap_or_else(|_| self.tenant_id.clone());

        ClientSecretProvider::new(&tenant_id, &client_id, &client_secret)
            .acquire_token()
            .await
    }

    /// Managed identity source via the instance metadata endpoint.
    async fn try_managed_identity(&self) -> Result<AccessToken> {
        let response = self
            .http_client
            .get(IMDS_TOKEN_URL)
            .header("Metadata", "true")
            .query(&[
                ("api-version", "2018-02-01"),
                ("resource", POWER_PLATFORM_RESOURCE),
            ])
            // IMDS is link-local; anything slower than this means we are
            // not running inside Azure
            .timeout(Duration::from_secs(2))
            .send()
            .await
            .map_err(|e| Error::Auth(format!("managed identity endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Auth(format!(
                "managed identity endpoint returned {}",
                response.status()
            )));
        }

        let token: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("bad managed identity response: {}", e)))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_at: token.expires_on.and_then(parse_epoch_seconds),
        })
    }

    /// Local CLI source: shells out to `az account get-access-token`.
    async fn try_az_cli(&self) -> Result<AccessToken> {
        let output = tokio::process::Command::new("az")
            .args([
                "account",
                "get-access-token",
                "--resource",
                POWER_PLATFORM_RESOURCE,
                "--output",
                "json",
            ])
            .output()
            .await
            .map_err(|e| Error::Auth(format!("az CLI not available: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Auth(format!(
                "az CLI token request failed: {}",
                stderr.trim()
            )));
        }

        let token: AzCliTokenResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Auth(format!("bad az CLI output: {}", e)))?;

        Ok(AccessToken {
            token: token.access_token,
            expires_at: token.expires_on.and_then(parse_epoch_seconds),
        })
    }
}

fn parse_epoch_seconds(raw: String) -> Option<DateTime<Utc>> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
}

#[async_trait]
impl TokenProvider for DefaultChainProvider {
    async fn acquire_token(&self) -> Result<AccessToken> {
        let mut failures = Vec::new();

        match self.try_environment().await {
            Ok(token) => {
                tracing::info!("default chain: using environment credentials");
                return Ok(token);
            }
            Err(e) => failures.push(format!("environment: {}", e)),
        }

        match self.try_managed_identity().await {
            Ok(token) => {
                tracing::info!("default chain: using managed identity");
                return Ok(token);
            }
            Err(e) => failures.push(format!("managed identity: {}", e)),
        }

        match self.try_az_cli().await {
            Ok(token) => {
                tracing::info!("default chain: using az CLI session");
                return Ok(token);
            }
            Err(e) => failures.push(format!("az CLI: {}", e)),
        }

        Err(Error::Auth(format!(
            "no ambient credential source succeeded ({})",
            failures.join("; ")
        )))
    }

    fn mode(&self) -> AuthMode {
        AuthMode::Default
    }
}
