//! DirectLine secret exchange
//!
//! Web-channel agents authenticate by exchanging the channel security key
//! for a short-lived DirectLine token at the Bot Framework endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{AccessToken, TokenProvider};
use crate::config::AuthMode;
use crate::error::Error;
use crate::Result;

const DIRECTLINE_TOKEN_URL: &str =
    "https://directline.botframework.com/v3/directline/tokens/generate";

#[derive(Debug, Deserialize)]
struct DirectLineTokenResponse {
    token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    1800
}

/// DirectLine token provider.
pub struct DirectLineProvider {
    secret: String,
    http_client: Client,
}

impl DirectLineProvider {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.to_string(),
            http_client: Client::new(),
        }
    }
}

#[async_trait]
impl TokenProvider for DirectLineProvider {
    async fn acquire_token(&self) -> Result<AccessToken> {
        tracing::debug!("generating DirectLine token from secret");

        let response = self
            .http_client
            .post(DIRECTLINE_TOKEN_URL)
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| Error::Auth(format!("DirectLine token request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth(format!(
                "failed to generate DirectLine token: {} - {}",
                status, body
            )));
        }

        let token: DirectLineTokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("bad DirectLine token response: {}", e)))?;

        tracing::debug!("DirectLine token generated (expires in {}s)", token.expires_in);
        Ok(AccessToken::new(token.token, Some(token.expires_in)))
    }

    fn mode(&self) -> AuthMode {
        AuthMode::DirectLine
    }
}
