//! Client-credentials (service principal) flow
//!
//! Non-interactive: exchanges client_id + client_secret for a token at the
//! tenant token endpoint. Invalid credentials surface as an auth error
//! without any retry.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{AccessToken, TokenProvider, LOGIN_BASE_URL, POWER_PLATFORM_SCOPE};
use crate::config::AuthMode;
use crate::error::Error;
use crate::Result;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Service principal token provider.
pub struct ClientSecretProvider {
    tenant_id: String,
    client_id: String,
    client_secret: String,
    http_client: Client,
}

impl ClientSecretProvider {
    pub fn new(tenant_id: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            http_client: Client::new(),
        }
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", LOGIN_BASE_URL, self.tenant_id)
    }
}

#[async_trait]
impl TokenProvider for ClientSecretProvider {
    async fn acquire_token(&self) -> Result<AccessToken> {
        tracing::debug!("acquiring token via client credentials");

        let response = self
            .http_client
            .post(self.token_url())
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", POWER_PLATFORM_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| Error::Auth(format!("token request failed: {}", e)))?;

        if !response.status().is_success() {
            let err = response
                .json::<TokenErrorResponse>()
                .await
                .unwrap_or(TokenErrorResponse {
                    error: "unknown".to_string(),
                    error_description: None,
                });
            return Err(Error::Auth(format!(
                "client credentials authentication failed: {}",
                err.error_description.unwrap_or(err.error)
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("bad token response: {}", e)))?;

        Ok(AccessToken::new(token.access_token, token.expires_in))
    }

    fn mode(&self) -> AuthMode {
        AuthMode::ClientCredentials
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_url_targets_tenant() {
        let provider = ClientSecretProvider::new("my-tenant", "cid", "secret");
        assert_eq!(
            provider.token_url(),
            "https://login.microsoftonline.com/my-tenant/oauth2/v2.0/token"
        );
    }

    #[test]
    fn test_mode() {
        let provider = ClientSecretProvider::new("t", "c", "s");
        assert_eq!(provider.mode(), AuthMode::ClientCredentials);
    }
}
