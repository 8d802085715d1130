//! Agent session - authenticated client lifecycle and conversation state
//!
//! An [`AgentSession`] owns one transport handle, one cached credential,
//! and the ordered log of exchanged turns. Construction does no network
//! work; the first send acquires a token, builds the transport and starts
//! a remote conversation. All methods take `&self` - interior locks make
//! concurrent use from multiple tasks defined: transport creation happens
//! at most once, token refresh is coalesced, and context mutation is
//! serialized.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use super::activity::extract_text;
use super::transport::{HttpTransport, Transport};
use super::turn::{ConversationTurn, Role};
use crate::auth::{self, AccessToken, TokenProvider};
use crate::config::Config;
use crate::error::Error;
use crate::Result;

const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Lifecycle state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, no network activity yet.
    Uninitialized,
    /// A token acquisition or refresh is in flight.
    Authenticating,
    /// Holding a usable credential.
    Active,
    /// Unrecoverable auth failure; every send fails with the stored cause.
    Failed(String),
    /// Explicitly disposed.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Authenticating => "authenticating",
            SessionState::Active => "active",
            SessionState::Failed(_) => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(tag)
    }
}

/// Masked, read-only snapshot of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub config: serde_json::Value,
    pub auth_mode: String,
    pub credential_cached: bool,
    pub turn_count: usize,
    pub state: String,
}

/// Session manager for one remote agent.
pub struct AgentSession {
    config: Arc<Config>,
    provider: Box<dyn TokenProvider>,
    /// Coalescing lock: at most one token acquisition in flight.
    token: tokio::sync::Mutex<Option<AccessToken>>,
    /// Vendor client handle, created at most once per session.
    transport: OnceCell<Box<dyn Transport>>,
    conversation: tokio::sync::Mutex<Option<String>>,
    turns: std::sync::Mutex<Vec<ConversationTurn>>,
    state: std::sync::Mutex<SessionState>,
}

impl AgentSession {
    /// Create a session from configuration. Validates the configuration
    /// and resolves the credential provider; performs no network calls.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let provider = auth::provider_for(&config)?;
        Ok(Self::assemble(config, provider, OnceCell::new()))
    }

    /// Create a session with an explicit credential provider.
    pub fn with_provider(config: Config, provider: Box<dyn TokenProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(config, provider, OnceCell::new()))
    }

    /// Create a session with explicit provider and transport. The main
    /// seam for exercising the session against a stubbed service.
    pub fn with_transport(
        config: Config,
        provider: Box<dyn TokenProvider>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(
            config,
            provider,
            OnceCell::new_with(Some(transport)),
        ))
    }

    fn assemble(
        config: Config,
        provider: Box<dyn TokenProvider>,
        transport: OnceCell<Box<dyn Transport>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            provider,
            token: tokio::sync::Mutex::new(None),
            transport,
            conversation: tokio::sync::Mutex::new(None),
            turns: std::sync::Mutex::new(Vec::new()),
            state: std::sync::Mutex::new(SessionState::Uninitialized),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state.lock().unwrap().clone()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    /// Reject sends on a terminally failed or closed session without
    /// touching the network.
    fn ensure_open(&self) -> Result<()> {
        match &*self.state.lock().unwrap() {
            SessionState::Failed(cause) => Err(Error::Auth(cause.clone())),
            SessionState::Closed => Err(Error::Auth("session is closed".to_string())),
            _ => Ok(()),
        }
    }

    /// Get a usable bearer token, acquiring or refreshing as needed.
    ///
    /// The token lock is held for the whole acquisition so concurrent
    /// callers of an expired credential coalesce onto a single refresh;
    /// a cancelled caller drops the guard and the next one retries.
    async fn bearer_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;

        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.token.clone());
            }
        }

        self.set_state(SessionState::Authenticating);
        tracing::debug!("acquiring token via {} provider", self.provider.mode());

        match self.provider.acquire_token().await {
            Ok(token) => {
                let bearer = token.token.clone();
                *guard = Some(token);
                self.set_state(SessionState::Active);
                Ok(bearer)
            }
            Err(err) => {
                if let Error::Auth(cause) = &err {
                    // Credential rejected: latch the failure and tear
                    // down whatever was cached
                    *guard = None;
                    self.set_state(SessionState::Failed(cause.clone()));
                } else if guard.is_some() {
                    self.set_state(SessionState::Active);
                } else {
                    self.set_state(SessionState::Uninitialized);
                }
                Err(err)
            }
        }
    }

    async fn transport(&self) -> Result<&dyn Transport> {
        let transport = self
            .transport
            .get_or_try_init(|| async {
                tracing::debug!("creating agent transport for {}", self.config.base_url);
                let transport = HttpTransport::new(&self.config)?;
                Ok::<Box<dyn Transport>, Error>(Box::new(transport))
            })
            .await?;
        Ok(transport.as_ref())
    }

    /// Send one message and return the normalized agent reply, appending
    /// a user and an agent turn to the context log.
    pub async fn send_message(&self, text: &str) -> Result<String> {
        self.send_message_with(text, true).await
    }

    /// Send one message, bypassing the context log when
    /// `maintain_context` is false. The normalized reply is returned
    /// either way.
    pub async fn send_message_with(&self, text: &str, maintain_context: bool) -> Result<String> {
        self.ensure_open()?;

        let token = self.bearer_token().await?;
        let transport = self.transport().await?;

        let sent_at = chrono::Utc::now();

        let mut conversation = self.conversation.lock().await;
        let conversation_id = match conversation.clone() {
            Some(id) => id,
            None => {
                let id = self
                    .with_retry(|| transport.start_conversation(&token))
                    .await?;
                tracing::info!("conversation started: {}", id);
                *conversation = Some(id.clone());
                id
            }
        };

        let activities = self
            .with_retry(|| transport.send_activity(&token, &conversation_id, text))
            .await?;
        drop(conversation);

        let reply = extract_text(&activities)?;

        if maintain_context {
            let mut turns = self.turns.lock().unwrap();
            turns.push(ConversationTurn {
                role: Role::User,
                text: text.to_string(),
                timestamp: sent_at,
            });
            turns.push(ConversationTurn::agent(reply.clone()));
        }

        Ok(reply)
    }

    /// Send several messages sequentially, preserving order in both the
    /// requests and the returned replies. Context accumulates across the
    /// whole batch. Callers wanting independent batch items should use
    /// one session per item instead of fanning out over a shared one.
    pub async fn send_messages(&self, messages: &[String]) -> Result<Vec<String>> {
        self.send_messages_with(messages, true).await
    }

    /// Sequential batch send with explicit context behavior.
    pub async fn send_messages_with(
        &self,
        messages: &[String],
        maintain_context: bool,
    ) -> Result<Vec<String>> {
        let mut replies = Vec::with_capacity(messages.len());
        for message in messages {
            replies.push(self.send_message_with(message, maintain_context).await?);
        }
        Ok(replies)
    }

    /// Clear the context log. Never fails and is safe before any send.
    /// When `reset_discards_conversation` is set the remote conversation
    /// id is dropped too, so the next send starts a fresh conversation.
    pub async fn reset_context(&self) {
        self.turns.lock().unwrap().clear();
        if self.config.reset_discards_conversation {
            *self.conversation.lock().await = None;
        }
        tracing::debug!("conversation context cleared");
    }

    /// Snapshot of the context log.
    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.turns.lock().unwrap().clone()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().unwrap().len()
    }

    /// Masked configuration snapshot plus derived runtime facts.
    pub async fn info(&self) -> SessionInfo {
        SessionInfo {
            config: self.config.snapshot(),
            auth_mode: self.config.auth_mode.to_string(),
            credential_cached: self.token.lock().await.is_some(),
            turn_count: self.turn_count(),
            state: self.state().to_string(),
        }
    }

    /// Dispose the session. Subsequent sends fail without network I/O.
    pub fn close(&self) {
        self.set_state(SessionState::Closed);
    }

    /// Line-oriented chat loop over arbitrary reader/writer pairs.
    ///
    /// `exit`, `quit` and `bye` (case-insensitive) terminate the loop;
    /// `reset` clears the context; everything else is forwarded to
    /// [`AgentSession::send_message`]. Send errors are written to the
    /// sink and the loop continues.
    pub async fn chat_loop_async<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

        let banner = format!(
            "Chat with {} ('exit' to leave, 'reset' to clear context)\n",
            self.config.agent_name
        );
        writer.write_all(banner.as_bytes()).await?;

        let mut lines = reader.lines();
        loop {
            writer.write_all(b"You: ").await?;
            writer.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let input = line.trim();

            if input.is_empty() {
                continue;
            }

            if ["exit", "quit", "bye"]
                .iter()
                .any(|sentinel| input.eq_ignore_ascii_case(sentinel))
            {
                writer.write_all(b"Goodbye!\n").await?;
                break;
            }

            if input.eq_ignore_ascii_case("reset") {
                self.reset_context().await;
                writer.write_all(b"(context cleared)\n").await?;
                continue;
            }

            match self.send_message(input).await {
                Ok(reply) => {
                    let line = format!("{}: {}\n", self.config.agent_name, reply);
                    writer.write_all(line.as_bytes()).await?;
                }
                Err(e) => {
                    let line = format!("Error: {}\n", e);
                    writer.write_all(line.as_bytes()).await?;
                }
            }
        }

        writer.flush().await?;
        Ok(())
    }

    /// Retry transport failures with exponential backoff, up to the
    /// configured bound. Auth and protocol errors pass through untouched.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(Error::Transport { message, .. }) => {
                    if attempt > self.config.max_retries {
                        return Err(Error::Transport {
                            message,
                            attempts: attempt,
                        });
                    }
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        "transport failure on attempt {}: {}; retrying in {:?}",
                        attempt,
                        message,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn seed_token(&self, token: AccessToken) {
        *self.token.lock().await = Some(token);
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(5);
    (BACKOFF_BASE * factor).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::transport::fake::{FakeOutcome, FakeTransport};
    use crate::auth::NoAuthProvider;
    use crate::config::{test_config, AuthMode};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeProvider {
        calls: Arc<AtomicUsize>,
        fail: bool,
        delay: Option<Duration>,
    }

    impl FakeProvider {
        fn ok(calls: Arc<AtomicUsize>) -> Self {
            Self {
                calls,
                fail: false,
                delay: None,
            }
        }

        fn failing(calls: Arc<AtomicUsize>) -> Self {
            Self {
                calls,
                fail: true,
                delay: None,
            }
        }
    }

    #[async_trait::async_trait]
    impl TokenProvider for FakeProvider {
        async fn acquire_token(&self) -> Result<AccessToken> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                Err(Error::Auth("invalid client secret".to_string()))
            } else {
                Ok(AccessToken::new("fresh-token", Some(3600)))
            }
        }

        fn mode(&self) -> AuthMode {
            AuthMode::ClientCredentials
        }
    }

    fn session_with(transport: FakeTransport) -> (AgentSession, Arc<FakeTransport>) {
        let transport = Arc::new(transport);
        let boxed: Box<dyn Transport> = Box::new(SharedTransport(transport.clone()));
        let session = AgentSession::with_transport(
            test_config(AuthMode::None),
            Box::new(NoAuthProvider),
            boxed,
        )
        .unwrap();
        (session, transport)
    }

    /// Lets tests keep a handle on the fake while the session owns it.
    struct SharedTransport(Arc<FakeTransport>);

    #[async_trait::async_trait]
    impl Transport for SharedTransport {
        async fn start_conversation(&self, token: &str) -> Result<String> {
            self.0.start_conversation(token).await
        }

        async fn send_activity(
            &self,
            token: &str,
            conversation_id: &str,
            text: &str,
        ) -> Result<Vec<crate::agent::Activity>> {
            self.0.send_activity(token, conversation_id, text).await
        }
    }

    #[tokio::test]
    async fn test_send_message_returns_normalized_text_and_two_turns() {
        let (session, _) = session_with(FakeTransport::replying("Hi there"));

        let reply = session.send_message("Hello!").await.unwrap();
        assert_eq!(reply, "Hi there");

        let turns = session.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].text, "Hello!");
        assert_eq!(turns[1].role, Role::Agent);
        assert_eq!(turns[1].text, "Hi there");
    }

    #[tokio::test]
    async fn test_n_sends_append_2n_turns_in_call_order() {
        let (session, _) = session_with(FakeTransport::replying("re: {msg}"));

        for msg in ["one", "two", "three"] {
            session.send_message(msg).await.unwrap();
        }

        let turns = session.turns();
        assert_eq!(turns.len(), 6);
        let texts: Vec<&str> = turns.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["one", "re: one", "two", "re: two", "three", "re: three"]
        );
        for (i, turn) in turns.iter().enumerate() {
            let expected = if i % 2 == 0 { Role::User } else { Role::Agent };
            assert_eq!(turn.role, expected);
        }
    }

    #[tokio::test]
    async fn test_no_context_send_leaves_log_untouched() {
        let (session, _) = session_with(FakeTransport::replying("ok"));

        session.send_message("kept").await.unwrap();
        assert_eq!(session.turn_count(), 2);

        let reply = session.send_message_with("bypassed", false).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(session.turn_count(), 2);
    }

    #[tokio::test]
    async fn test_reset_clears_turns_and_discards_conversation() {
        let (session, transport) = session_with(FakeTransport::replying("ok"));

        session.send_message("a").await.unwrap();
        assert_eq!(transport.start_calls(), 1);

        session.reset_context().await;
        assert_eq!(session.turn_count(), 0);
        assert_eq!(session.info().await.turn_count, 0);

        session.send_message("b").await.unwrap();
        assert_eq!(transport.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_reset_can_keep_remote_conversation() {
        let transport = Arc::new(FakeTransport::replying("ok"));
        let mut config = test_config(AuthMode::None);
        config.reset_discards_conversation = false;
        let session = AgentSession::with_transport(
            config,
            Box::new(NoAuthProvider),
            Box::new(SharedTransport(transport.clone())),
        )
        .unwrap();

        session.send_message("a").await.unwrap();
        session.reset_context().await;
        session.send_message("b").await.unwrap();

        assert_eq!(session.turn_count(), 2);
        assert_eq!(transport.start_calls(), 1);
    }

    #[tokio::test]
    async fn test_reset_before_any_send_is_safe() {
        let (session, _) = session_with(FakeTransport::replying("ok"));
        session.reset_context().await;
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_batch_send_preserves_order_and_accumulates_context() {
        let (session, _) = session_with(FakeTransport::replying("re: {msg}"));

        let replies = session
            .send_messages(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();

        assert_eq!(replies, vec!["re: a", "re: b"]);
        assert_eq!(session.turn_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_retried_up_to_bound() {
        let transport = Arc::new(FakeTransport::failing("connection reset"));
        let mut config = test_config(AuthMode::None);
        config.max_retries = 2;
        let session = AgentSession::with_transport(
            config,
            Box::new(NoAuthProvider),
            Box::new(SharedTransport(transport.clone())),
        )
        .unwrap();

        let err = session.send_message("x").await.unwrap_err();
        match err {
            Error::Transport { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected transport error, got {:?}", other),
        }
        assert_eq!(transport.send_calls(), 3);
    }

    #[tokio::test]
    async fn test_zero_max_retries_means_single_attempt() {
        let transport = Arc::new(FakeTransport::failing("boom"));
        let mut config = test_config(AuthMode::None);
        config.max_retries = 0;
        let session = AgentSession::with_transport(
            config,
            Box::new(NoAuthProvider),
            Box::new(SharedTransport(transport.clone())),
        )
        .unwrap();

        let err = session.send_message("x").await.unwrap_err();
        assert_eq!(err.kind(), "transport");
        assert_eq!(transport.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_protocol_error_never_retried() {
        let transport = Arc::new(FakeTransport::scripted(vec![FakeOutcome::Activities(
            json!([{"type": "typing"}]),
        )]));
        let mut config = test_config(AuthMode::None);
        config.max_retries = 5;
        let session = AgentSession::with_transport(
            config,
            Box::new(NoAuthProvider),
            Box::new(SharedTransport(transport.clone())),
        )
        .unwrap();

        let err = session.send_message("x").await.unwrap_err();
        assert_eq!(err.kind(), "protocol");
        assert_eq!(transport.send_calls(), 1);
        // A failed exchange appends nothing
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_latches_failed_state_with_zero_transport_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let transport = Arc::new(FakeTransport::replying("unreachable"));
        let session = AgentSession::with_transport(
            test_config(AuthMode::ClientCredentials),
            Box::new(FakeProvider::failing(calls.clone())),
            Box::new(SharedTransport(transport.clone())),
        )
        .unwrap();

        let err = session.send_message("x").await.unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert_eq!(transport.send_calls(), 0);
        assert!(matches!(session.state(), SessionState::Failed(_)));

        // Subsequent sends fail immediately without another flow
        let err = session.send_message("y").await.unwrap_err();
        assert_eq!(err.kind(), "auth");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sends_coalesce_token_refresh() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = FakeProvider {
            calls: calls.clone(),
            fail: false,
            delay: Some(Duration::from_millis(50)),
        };
        let session = Arc::new(
            AgentSession::with_transport(
                test_config(AuthMode::ClientCredentials),
                Box::new(provider),
                Box::new(FakeTransport::replying("pong")),
            )
            .unwrap(),
        );

        // Expired cached token: every caller sees it and must refresh
        session
            .seed_token(AccessToken::new("stale", Some(-60)))
            .await;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = session.clone();
            handles.push(tokio::spawn(
                async move { session.send_message("ping").await },
            ));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "pong");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_machine_progression() {
        let (session, _) = session_with(FakeTransport::replying("ok"));
        assert_eq!(session.state(), SessionState::Uninitialized);

        session.send_message("x").await.unwrap();
        assert_eq!(session.state(), SessionState::Active);

        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        let err = session.send_message("y").await.unwrap_err();
        assert_eq!(err.kind(), "auth");
    }

    #[tokio::test]
    async fn test_info_reports_masked_config_and_runtime_facts() {
        let (session, _) = session_with(FakeTransport::replying("ok"));

        let info = session.info().await;
        assert!(!info.credential_cached);
        assert_eq!(info.turn_count, 0);
        assert_eq!(info.auth_mode, "none");
        assert_eq!(info.state, "uninitialized");

        session.send_message("x").await.unwrap();
        let info = session.info().await;
        assert!(info.credential_cached);
        assert_eq!(info.turn_count, 2);
        assert_eq!(info.state, "active");

        let rendered = serde_json::to_string(&info).unwrap();
        assert!(!rendered.contains("s3cr3t-value"));
    }

    #[tokio::test]
    async fn test_chat_loop_sentinels_and_forwarding() {
        let (session, _) = session_with(FakeTransport::replying("re: {msg}"));

        let input = &b"hello\n\nreset\nBYE\n"[..];
        let mut output = Vec::new();
        session
            .chat_loop_async(tokio::io::BufReader::new(input), &mut output)
            .await
            .unwrap();

        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.contains("re: hello"));
        assert!(rendered.contains("(context cleared)"));
        assert!(rendered.contains("Goodbye!"));
        assert_eq!(session.turn_count(), 0);
    }

    #[tokio::test]
    async fn test_chat_loop_reports_errors_and_continues() {
        let transport = FakeTransport::scripted(vec![
            FakeOutcome::TransportFail("down".to_string()),
            FakeOutcome::Reply("back up".to_string()),
        ]);
        let mut config = test_config(AuthMode::None);
        config.max_retries = 0;
        let session =
            AgentSession::with_transport(config, Box::new(NoAuthProvider), Box::new(transport))
                .unwrap();

        let input = &b"first\nsecond\nexit\n"[..];
        let mut output = Vec::new();
        session
            .chat_loop_async(tokio::io::BufReader::new(input), &mut output)
            .await
            .unwrap();

        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.contains("Error:"));
        assert!(rendered.contains("back up"));
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(250));
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_secs(1));
        assert_eq!(backoff_delay(6), Duration::from_secs(8));
        assert_eq!(backoff_delay(30), Duration::from_secs(8));
    }
}
