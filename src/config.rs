//! Configuration management
//!
//! Configuration is read from the environment (primary) with an optional
//! JSON file supplying defaults. Validation collects every problem it
//! finds instead of stopping at the first one.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::Error;
use crate::Result;

/// Environment variable names understood by [`Config::load`].
pub const ENV_ENVIRONMENT_ID: &str = "COPILOT_STUDIO_AGENT_ENVIRONMENT_ID";
pub const ENV_TENANT_ID: &str = "COPILOT_STUDIO_AGENT_TENANT_ID";
pub const ENV_TENANT_ID_FALLBACK: &str = "AZURE_TENANT_ID";
pub const ENV_APP_ID: &str = "COPILOT_STUDIO_AGENT_APP_ID";
pub const ENV_SCHEMA_NAME: &str = "COPILOT_STUDIO_AGENT_AGENT_IDENTIFIER";
pub const ENV_AGENT_NAME: &str = "COPILOT_STUDIO_AGENT_NAME";
pub const ENV_AUTH_MODE: &str = "COPILOT_STUDIO_AGENT_AUTH_MODE";
pub const ENV_CLIENT_ID: &str = "COPILOT_STUDIO_AGENT_APP_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "AZURE_CLIENT_SECRET";
pub const ENV_DIRECTLINE_SECRET: &str = "COPILOT_STUDIO_WEB_CHANNEL_SECURITY_KEY";
pub const ENV_BASE_URL: &str = "COPILOT_STUDIO_API_BASE_URL";
pub const ENV_TIMEOUT: &str = "COPILOT_STUDIO_API_TIMEOUT";
pub const ENV_MAX_RETRIES: &str = "COPILOT_STUDIO_API_MAX_RETRIES";
pub const ENV_RESET_CONVERSATION: &str = "COPILOT_STUDIO_AGENT_RESET_CONVERSATION";
pub const ENV_TOKEN_CACHE: &str = "COPILOT_STUDIO_AGENT_TOKEN_CACHE";

/// Placeholder used wherever a secret would otherwise be rendered.
const SECRET_MASK: &str = "********";

/// Authentication strategy for reaching the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No authentication; the agent is publicly reachable.
    None,
    /// Device-code flow requiring a user to confirm in a browser.
    Interactive,
    /// Service-principal flow using a client secret.
    ClientCredentials,
    /// Ambient credential chain (environment, managed identity, az CLI).
    Default,
    /// DirectLine web-channel secret exchange.
    DirectLine,
}

impl AuthMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMode::None => "none",
            AuthMode::Interactive => "interactive",
            AuthMode::ClientCredentials => "client_credentials",
            AuthMode::Default => "default",
            AuthMode::DirectLine => "directline",
        }
    }

    /// All accepted mode names, for error messages.
    pub fn all() -> &'static [&'static str] {
        &[
            "none",
            "interactive",
            "client_credentials",
            "default",
            "directline",
        ]
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(AuthMode::None),
            "interactive" => Ok(AuthMode::Interactive),
            "client_credentials" => Ok(AuthMode::ClientCredentials),
            "default" => Ok(AuthMode::Default),
            "directline" => Ok(AuthMode::DirectLine),
            other => Err(Error::config(format!(
                "invalid auth mode '{}'; must be one of: {}",
                other,
                AuthMode::all().join(", ")
            ))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Power Platform environment hosting the agent
    pub environment_id: String,

    /// Entra tenant the agent lives in
    pub tenant_id: String,

    /// Application (bot) id of the agent
    pub app_id: String,

    /// Schema name identifying the published agent
    pub schema_name: String,

    /// Display name used in CLI output
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    /// Authentication strategy
    #[serde(default = "default_auth_mode")]
    pub auth_mode: AuthMode,

    /// Client id of the app registration used to sign in
    #[serde(default)]
    pub client_id: Option<String>,

    /// Client secret for the client_credentials mode
    #[serde(default)]
    pub client_secret: Option<String>,

    /// Web-channel security key for the directline mode
    #[serde(default)]
    pub directline_secret: Option<String>,

    /// Base URL of the agent API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Maximum transport-level retries per send
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Whether reset_context also discards the remote conversation id
    #[serde(default = "default_reset_conversation")]
    pub reset_discards_conversation: bool,

    /// Where the interactive flow persists its token cache
    #[serde(default = "default_token_cache_path")]
    pub token_cache_path: PathBuf,
}

fn default_agent_name() -> String {
    "Copilot Agent".to_string()
}

fn default_auth_mode() -> AuthMode {
    AuthMode::Interactive
}

fn default_base_url() -> String {
    "https://api.copilotstudio.microsoft.com".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_reset_conversation() -> bool {
    true
}

fn default_token_cache_path() -> PathBuf {
    PathBuf::from(".token_cache.json")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment_id: String::new(),
            tenant_id: String::new(),
            app_id: String::new(),
            schema_name: String::new(),
            agent_name: default_agent_name(),
            auth_mode: default_auth_mode(),
            client_id: None,
            client_secret: None,
            directline_secret: None,
            base_url: default_base_url(),
            timeout_seconds: default_timeout(),
            max_retries: default_max_retries(),
            reset_discards_conversation: default_reset_conversation(),
            token_cache_path: default_token_cache_path(),
        }
    }
}

/// Optional file-based defaults; every field may be omitted and the
/// environment always wins.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    environment_id: Option<String>,
    tenant_id: Option<String>,
    app_id: Option<String>,
    schema_name: Option<String>,
    agent_name: Option<String>,
    auth_mode: Option<String>,
    client_id: Option<String>,
    base_url: Option<String>,
    timeout_seconds: Option<u64>,
    max_retries: Option<u32>,
    reset_discards_conversation: Option<bool>,
    token_cache_path: Option<PathBuf>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl Config {
    /// Load configuration from the environment only.
    pub fn load() -> Result<Self> {
        Self::load_with_file(None)
    }

    /// Load configuration, optionally seeding defaults from a JSON file.
    ///
    /// Fails with a [`Error::Config`] listing every missing or invalid
    /// field for the selected auth mode.
    pub fn load_with_file(path: Option<&Path>) -> Result<Self> {
        let mut issues = Vec::new();

        let file = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    Error::config(format!("cannot read config file {:?}: {}", p, e))
                })?;
                serde_json::from_str::<FileConfig>(&content).map_err(|e| {
                    Error::config(format!("cannot parse config file {:?}: {}", p, e))
                })?
            }
            None => FileConfig::default(),
        };

        let auth_mode_raw = env_var(ENV_AUTH_MODE)
            .or(file.auth_mode)
            .unwrap_or_else(|| default_auth_mode().as_str().to_string());
        let auth_mode = match auth_mode_raw.parse::<AuthMode>() {
            Ok(mode) => mode,
            Err(_) => {
                issues.push(format!(
                    "invalid auth mode '{}'; must be one of: {}",
                    auth_mode_raw,
                    AuthMode::all().join(", ")
                ));
                default_auth_mode()
            }
        };

        let timeout_seconds = match env_var(ENV_TIMEOUT) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(v) => v,
                Err(_) => {
                    issues.push(format!("{} must be a positive integer, got '{}'", ENV_TIMEOUT, raw));
                    default_timeout()
                }
            },
            None => file.timeout_seconds.unwrap_or_else(default_timeout),
        };

        let max_retries = match env_var(ENV_MAX_RETRIES) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(v) => v,
                Err(_) => {
                    issues.push(format!(
                        "{} must be a non-negative integer, got '{}'",
                        ENV_MAX_RETRIES, raw
                    ));
                    default_max_retries()
                }
            },
            None => file.max_retries.unwrap_or_else(default_max_retries),
        };

        let reset_discards_conversation = match env_var(ENV_RESET_CONVERSATION) {
            Some(raw) => match raw.to_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                other => {
                    issues.push(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_RESET_CONVERSATION, other
                    ));
                    default_reset_conversation()
                }
            },
            None => file
                .reset_discards_conversation
                .unwrap_or_else(default_reset_conversation),
        };

        let config = Config {
            environment_id: env_var(ENV_ENVIRONMENT_ID)
                .or(file.environment_id)
                .unwrap_or_default(),
            tenant_id: env_var(ENV_TENANT_ID)
                .or_else(|| env_var(ENV_TENANT_ID_FALLBACK))
                .or(file.tenant_id)
                .unwrap_or_default(),
            app_id: env_var(ENV_APP_ID).or(file.app_id).unwrap_or_default(),
            schema_name: env_var(ENV_SCHEMA_NAME)
                .or(file.schema_name)
                .unwrap_or_default(),
            agent_name: env_var(ENV_AGENT_NAME)
                .or(file.agent_name)
                .unwrap_or_else(default_agent_name),
            auth_mode,
            client_id: env_var(ENV_CLIENT_ID).or(file.client_id),
            client_secret: env_var(ENV_CLIENT_SECRET),
            directline_secret: env_var(ENV_DIRECTLINE_SECRET),
            base_url: env_var(ENV_BASE_URL)
                .or(file.base_url)
                .unwrap_or_else(default_base_url),
            timeout_seconds,
            max_retries,
            reset_discards_conversation,
            token_cache_path: env_var(ENV_TOKEN_CACHE)
                .map(PathBuf::from)
                .or(file.token_cache_path)
                .unwrap_or_else(default_token_cache_path),
        };

        config.collect_issues(&mut issues);

        if issues.is_empty() {
            Ok(config)
        } else {
            Err(Error::Config(issues))
        }
    }

    /// Validate presence and consistency of every field required by the
    /// selected auth mode. Collects all problems before failing.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        self.collect_issues(&mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(issues))
        }
    }

    fn collect_issues(&self, issues: &mut Vec<String>) {
        if self.environment_id.is_empty() {
            issues.push(format!("missing environment_id (set {})", ENV_ENVIRONMENT_ID));
        }
        if self.tenant_id.is_empty() {
            issues.push(format!("missing tenant_id (set {})", ENV_TENANT_ID));
        }
        if self.app_id.is_empty() {
            issues.push(format!("missing app_id (set {})", ENV_APP_ID));
        }
        if self.schema_name.is_empty() {
            issues.push(format!("missing schema_name (set {})", ENV_SCHEMA_NAME));
        }

        match self.auth_mode {
            AuthMode::Interactive | AuthMode::ClientCredentials => {
                if self.client_id.is_none() {
                    issues.push(format!(
                        "missing client_id for auth mode '{}' (set {})",
                        self.auth_mode, ENV_CLIENT_ID
                    ));
                }
            }
            AuthMode::None | AuthMode::Default | AuthMode::DirectLine => {}
        }

        if self.auth_mode == AuthMode::ClientCredentials && self.client_secret.is_none() {
            issues.push(format!(
                "missing client_secret for auth mode 'client_credentials' (set {})",
                ENV_CLIENT_SECRET
            ));
        }

        if self.auth_mode == AuthMode::DirectLine && self.directline_secret.is_none() {
            issues.push(format!(
                "missing directline_secret for auth mode 'directline' (set {})",
                ENV_DIRECTLINE_SECRET
            ));
        }

        if self.timeout_seconds == 0 {
            issues.push("timeout_seconds must be positive".to_string());
        }

        if let Err(e) = url::Url::parse(&self.base_url) {
            issues.push(format!("invalid base_url '{}': {}", self.base_url, e));
        }
    }

    /// Masked JSON snapshot: secrets are replaced by a fixed placeholder,
    /// everything else is rendered verbatim.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "environment_id": self.environment_id,
            "tenant_id": self.tenant_id,
            "app_id": self.app_id,
            "schema_name": self.schema_name,
            "agent_name": self.agent_name,
            "auth_mode": self.auth_mode.as_str(),
            "client_id": self.client_id,
            "client_secret": self.client_secret.as_ref().map(|_| SECRET_MASK),
            "directline_secret": self.directline_secret.as_ref().map(|_| SECRET_MASK),
            "base_url": self.base_url,
            "timeout_seconds": self.timeout_seconds,
            "max_retries": self.max_retries,
            "reset_discards_conversation": self.reset_discards_conversation,
        })
    }

    /// Human-readable masked rendering for the CLI `--config` flag.
    pub fn display(&self) -> String {
        let secret = |v: &Option<String>| match v {
            Some(_) => SECRET_MASK.to_string(),
            None => "not set".to_string(),
        };
        format!(
            "Copilot Agent Configuration\n\
             Agent:\n\
             \x20 Environment ID: {}\n\
             \x20 Tenant ID: {}\n\
             \x20 App ID: {}\n\
             \x20 Schema Name: {}\n\
             \x20 Name: {}\n\
             Authentication:\n\
             \x20 Mode: {}\n\
             \x20 Client ID: {}\n\
             \x20 Client Secret: {}\n\
             \x20 DirectLine Secret: {}\n\
             API:\n\
             \x20 Base URL: {}\n\
             \x20 Timeout: {}s\n\
             \x20 Max Retries: {}",
            self.environment_id,
            self.tenant_id,
            self.app_id,
            self.schema_name,
            self.agent_name,
            self.auth_mode,
            self.client_id.as_deref().unwrap_or("not set"),
            secret(&self.client_secret),
            secret(&self.directline_secret),
            self.base_url,
            self.timeout_seconds,
            self.max_retries,
        )
    }
}

#[cfg(test)]
pub(crate) fn test_config(auth_mode: AuthMode) -> Config {
    Config {
        environment_id: "env-123".to_string(),
        tenant_id: "tenant-456".to_string(),
        app_id: "app-789".to_string(),
        schema_name: "cr000_agent".to_string(),
        auth_mode,
        client_id: Some("client-abc".to_string()),
        client_secret: Some("s3cr3t-value".to_string()),
        directline_secret: Some("dl-s3cr3t".to_string()),
        ..Config::default()
    }
}
