//! copilot-agent - lightweight client for Microsoft Copilot Studio agents
//!
//! This library wraps a Copilot Studio agent endpoint behind a small
//! session API: configuration loading, credential acquisition, a
//! conversation context log, and response normalization.

pub mod agent;
pub mod auth;
pub mod blocking;
pub mod config;
pub mod error;
pub mod server;

pub use agent::{AgentSession, ConversationTurn, Role, SessionInfo, SessionState};
pub use config::{AuthMode, Config};
pub use error::{Error, Result};
