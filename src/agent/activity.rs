//! Vendor activity decoding and response normalization
//!
//! The remote service answers a turn with a list of activities whose
//! shapes vary: plain text messages, rich cards carrying a text fallback,
//! and multi-part messages. Decoding is a closed set of variants; anything
//! unrecognized that leaves no usable text is a protocol error, since
//! retrying cannot change the shape.

use serde::Deserialize;

use crate::error::Error;
use crate::Result;

/// Activity type tag, closed over the values the normalizer handles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityKind {
    Message,
    Typing,
    Trace,
    Event,
    Other(String),
}

impl ActivityKind {
    fn from_tag(tag: &str) -> Self {
        match tag {
            "message" => ActivityKind::Message,
            "typing" => ActivityKind::Typing,
            "trace" => ActivityKind::Trace,
            "event" => ActivityKind::Event,
            other => ActivityKind::Other(other.to_string()),
        }
    }
}

/// Sender info attached to an activity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelAccount {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Card attachment with an optional text fallback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default, rename = "contentType")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub content: Option<AttachmentContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttachmentContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub fallback: Option<String>,
}

/// One part of a multi-part message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessagePart {
    #[serde(default)]
    pub text: Option<String>,
}

/// A single activity from the remote agent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Activity {
    #[serde(default, rename = "type")]
    pub activity_type: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub from: Option<ChannelAccount>,
}

impl Activity {
    pub fn kind(&self) -> ActivityKind {
        ActivityKind::from_tag(&self.activity_type)
    }

    /// Whether the activity came from the user side of the channel.
    pub fn is_from_user(&self) -> bool {
        match &self.from {
            Some(account) => {
                account.role.as_deref() == Some("user")
                    || account.id.as_deref() == Some("user")
            }
            None => false,
        }
    }

    /// Extract usable text from the closed set of message shapes:
    /// plain text, card fallback, then multi-part.
    fn content(&self) -> Option<String> {
        if let Some(text) = non_empty(self.text.as_deref()) {
            return Some(text);
        }

        for attachment in &self.attachments {
            if let Some(content) = &attachment.content {
                if let Some(text) = non_empty(content.text.as_deref()) {
                    return Some(text);
                }
                if let Some(text) = non_empty(content.fallback.as_deref()) {
                    return Some(text);
                }
            }
        }

        if !self.parts.is_empty() {
            let joined = self
                .parts
                .iter()
                .filter_map(|p| non_empty(p.text.as_deref()))
                .collect::<Vec<_>>()
                .join(" ");
            if !joined.is_empty() {
                return Some(joined);
            }
        }

        None
    }
}

fn non_empty(text: Option<&str>) -> Option<String> {
    text.map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Extract the first non-empty text payload from a turn's activities.
///
/// Typing indicators, traces and user-echoed activities are skipped.
/// Fails with a protocol error if nothing usable remains.
pub fn extract_text(activities: &[Activity]) -> Result<String> {
    for activity in activities {
        match activity.kind() {
            ActivityKind::Typing | ActivityKind::Trace => continue,
            ActivityKind::Message | ActivityKind::Event | ActivityKind::Other(_) => {
                if activity.is_from_user() {
                    continue;
                }
                if let Some(text) = activity.content() {
                    return Ok(text);
                }
            }
        }
    }

    Err(Error::Protocol(
        "no text content in agent response".to_string(),
    ))
}
