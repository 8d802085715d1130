//! Transport abstraction over the vendor wire protocol
//!
//! [`Transport`] is the seam between the session and the remote service:
//! start a conversation, exchange one turn. The HTTP implementation talks
//! the DirectLine-style REST surface; tests swap in a scripted fake.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::activity::Activity;
use crate::config::Config;
use crate::error::Error;
use crate::Result;

/// Interval between polls while waiting for the agent's reply.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Channel to a remote agent.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new conversation, returning its id.
    async fn start_conversation(&self, token: &str) -> Result<String>;

    /// Send one user message and return the activities of the reply.
    async fn send_activity(
        &self,
        token: &str,
        conversation_id: &str,
        text: &str,
    ) -> Result<Vec<Activity>>;
}

#[derive(Debug, Deserialize)]
struct StartConversationResponse {
    #[serde(rename = "conversationId")]
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct ActivitySet {
    #[serde(default)]
    activities: Vec<Activity>,
    #[serde(default)]
    watermark: Option<String>,
}

/// DirectLine-style HTTP transport.
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    http_client: Client,
}

impl HttpTransport {
    pub fn new(config: &Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout,
            http_client,
        })
    }

    fn conversations_url(&self) -> String {
        format!("{}/v3/directline/conversations", self.base_url)
    }

    fn activities_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/v3/directline/conversations/{}/activities",
            self.base_url, conversation_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder, token: &str) -> reqwest::RequestBuilder {
        if token.is_empty() {
            request
        } else {
            request.bearer_auth(token)
        }
    }

    /// Poll for reply activities until something other than our own echo
    /// shows up or the timeout window closes.
    async fn wait_for_reply(&self, token: &str, conversation_id: &str) -> Result<Vec<Activity>> {
        let deadline = tokio::time::Instant::now() + self.timeout;
        let mut watermark: Option<String> = None;

        loop {
            let mut request = self.http_client.get(self.activities_url(conversation_id));
            if let Some(mark) = &watermark {
                request = request.query(&[("watermark", mark.as_str())]);
            }

            let response = self.authorize(request, token).send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::transport(format!(
                    "activity poll returned {}: {}",
                    status, body
                )));
            }

            let set: ActivitySet = response
                .json()
                .await
                .map_err(|e| Error::transport(format!("bad activity set: {}", e)))?;
            watermark = set.watermark.or(watermark);

            let replies: Vec<Activity> = set
                .activities
                .into_iter()
                .filter(|a| !a.is_from_user())
                .collect();

            if !replies.is_empty() {
                return Ok(replies);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::transport(
                    "timed out waiting for agent response".to_string(),
                ));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start_conversation(&self, token: &str) -> Result<String> {
        tracing::debug!("starting conversation");

        let request = self.http_client.post(self.conversations_url());
        let response = self.authorize(request, token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "conversation start returned {}: {}",
                status, body
            )));
        }

        let started: StartConversationResponse = response
            .json()
            .await
            .map_err(|e| Error::transport(format!("bad conversation response: {}", e)))?;

        tracing::info!("conversation started: {}", started.conversation_id);
        Ok(started.conversation_id)
    }

    async fn send_activity(
        &self,
        token: &str,
        conversation_id: &str,
        text: &str,
    ) -> Result<Vec<Activity>> {
        tracing::debug!("sending message to conversation {}", conversation_id);

        let body = json!({
            "type": "message",
            "from": {"id": "user"},
            "text": text,
        });

        let request = self
            .http_client
            .post(self.activities_url(conversation_id))
            .json(&body);
        let response = self.authorize(request, token).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(format!(
                "activity post returned {}: {}",
                status, body
            )));
        }

        self.wait_for_reply(token, conversation_id).await
    }
}

/// Scripted transport for tests, following the fake-client pattern.
#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Clone)]
    pub(crate) enum FakeOutcome {
        Reply(String),
        Activities(serde_json::Value),
        TransportFail(String),
    }

    pub(crate) struct FakeTransport {
        script: Mutex<VecDeque<FakeOutcome>>,
        fallback: FakeOutcome,
        start_calls: AtomicUsize,
        send_calls: AtomicUsize,
    }

    impl FakeTransport {
        /// Always answer with the same reply text.
        pub(crate) fn replying(text: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: FakeOutcome::Reply(text.to_string()),
                start_calls: AtomicUsize::new(0),
                send_calls: AtomicUsize::new(0),
            }
        }

        /// Consume scripted outcomes in order, then fall back to a reply.
        pub(crate) fn scripted(outcomes: Vec<FakeOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                fallback: FakeOutcome::Reply("fallback".to_string()),
                start_calls: AtomicUsize::new(0),
                send_calls: AtomicUsize::new(0),
            }
        }

        /// Always fail sends with a transport error.
        pub(crate) fn failing(message: &str) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: FakeOutcome::TransportFail(message.to_string()),
                start_calls: AtomicUsize::new(0),
                send_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn start_calls(&self) -> usize {
            self.start_calls.load(Ordering::SeqCst)
        }

        pub(crate) fn send_calls(&self) -> usize {
            self.send_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn start_conversation(&self, _token: &str) -> Result<String> {
            let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("conv-{}", n))
        }

        async fn send_activity(
            &self,
            _token: &str,
            _conversation_id: &str,
            text: &str,
        ) -> Result<Vec<Activity>> {
            self.send_calls.fetch_add(1, Ordering::SeqCst);

            let outcome = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| self.fallback.clone());

            match outcome {
                FakeOutcome::Reply(reply) => {
                    let reply = reply.replace("{msg}", text);
                    Ok(vec![serde_json::from_value(json!({
                        "type": "message",
                        "text": reply,
                        "from": {"role": "bot"}
                    }))
                    .unwrap()])
                }
                FakeOutcome::Activities(value) => {
                    Ok(serde_json::from_value(value).unwrap())
                }
                FakeOutcome::TransportFail(message) => Err(Error::transport(message)),
            }
        }
    }
}
