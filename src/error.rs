//! Error types for copilot-agent

use thiserror::Error;

/// Result type alias for copilot-agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in copilot-agent
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid configuration. Carries every issue found, not
    /// just the first one.
    #[error("configuration error: {}", .0.join("; "))]
    Config(Vec<String>),

    /// Credential rejected or an auth flow failed. Never retried.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Network or vendor-side failure. Eligible for bounded retry;
    /// `attempts` records how many calls were made before surfacing.
    #[error("transport error after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// Response shape the normalizer does not recognize. Never retried.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Build a single-issue configuration error.
    pub fn config(issue: impl Into<String>) -> Self {
        Error::Config(vec![issue.into()])
    }

    /// Build a transport error for a single failed call.
    pub fn transport(message: impl Into<String>) -> Self {
        Error::Transport {
            message: message.into(),
            attempts: 1,
        }
    }

    /// Stable kind tag used by the CLI exit-code mapping and the REST
    /// error envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Auth(_) => "auth",
            Error::Transport { .. } => "transport",
            Error::Protocol(_) => "protocol",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Other(_) => "other",
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::transport(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
