//! Blocking wrappers around the async session
//!
//! Owns a current-thread tokio runtime and drives the async API to
//! completion, so callers without a runtime get the same contract with
//! plain blocking calls. Must not be used from inside an async context.

use std::io::{BufRead, Write};

use crate::agent::{self, ConversationTurn, SessionInfo, SessionState, Transport};
use crate::auth::TokenProvider;
use crate::config::Config;
use crate::Result;

/// Blocking session manager. Wraps [`agent::AgentSession`].
pub struct AgentSession {
    inner: agent::AgentSession,
    runtime: tokio::runtime::Runtime,
}

impl AgentSession {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            inner: agent::AgentSession::new(config)?,
            runtime: build_runtime()?,
        })
    }

    pub fn with_provider(config: Config, provider: Box<dyn TokenProvider>) -> Result<Self> {
        Ok(Self {
            inner: agent::AgentSession::with_provider(config, provider)?,
            runtime: build_runtime()?,
        })
    }

    pub fn with_transport(
        config: Config,
        provider: Box<dyn TokenProvider>,
        transport: Box<dyn Transport>,
    ) -> Result<Self> {
        Ok(Self {
            inner: agent::AgentSession::with_transport(config, provider, transport)?,
            runtime: build_runtime()?,
        })
    }

    pub fn config(&self) -> &Config {
        self.inner.config()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Blocking variant of [`agent::AgentSession::send_message`].
    pub fn send_message(&self, text: &str) -> Result<String> {
        self.runtime.block_on(self.inner.send_message(text))
    }

    pub fn send_message_with(&self, text: &str, maintain_context: bool) -> Result<String> {
        self.runtime
            .block_on(self.inner.send_message_with(text, maintain_context))
    }

    pub fn send_messages(&self, messages: &[String]) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.send_messages(messages))
    }

    pub fn send_messages_with(
        &self,
        messages: &[String],
        maintain_context: bool,
    ) -> Result<Vec<String>> {
        self.runtime
            .block_on(self.inner.send_messages_with(messages, maintain_context))
    }

    pub fn reset_context(&self) {
        self.runtime.block_on(self.inner.reset_context())
    }

    pub fn turns(&self) -> Vec<ConversationTurn> {
        self.inner.turns()
    }

    pub fn turn_count(&self) -> usize {
        self.inner.turn_count()
    }

    pub fn info(&self) -> SessionInfo {
        self.runtime.block_on(self.inner.info())
    }

    pub fn close(&self) {
        self.inner.close()
    }

    /// Blocking chat loop over arbitrary reader/writer pairs; same
    /// sentinel handling as the async variant.
    pub fn chat_loop<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> Result<()> {
        writeln!(
            writer,
            "Chat with {} ('exit' to leave, 'reset' to clear context)",
            self.config().agent_name
        )?;

        for line in reader.lines() {
            let line = line?;
            let input = line.trim();

            if input.is_empty() {
                continue;
            }

            if ["exit", "quit", "bye"]
                .iter()
                .any(|sentinel| input.eq_ignore_ascii_case(sentinel))
            {
                writeln!(writer, "Goodbye!")?;
                break;
            }

            if input.eq_ignore_ascii_case("reset") {
                self.reset_context();
                writeln!(writer, "(context cleared)")?;
                continue;
            }

            match self.send_message(input) {
                Ok(reply) => writeln!(writer, "{}: {}", self.config().agent_name, reply)?,
                Err(e) => writeln!(writer, "Error: {}", e)?,
            }
            writer.flush()?;
        }

        writer.flush()?;
        Ok(())
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::FakeTransport;
    use crate::auth::NoAuthProvider;
    use crate::config::{test_config, AuthMode};

    fn blocking_session(reply: &str) -> AgentSession {
        AgentSession::with_transport(
            test_config(AuthMode::None),
            Box::new(NoAuthProvider),
            Box::new(FakeTransport::replying(reply)),
        )
        .unwrap()
    }

    #[test]
    fn test_blocking_send_appends_turns() {
        let session = blocking_session("Hi there");
        let reply = session.send_message("Hello!").unwrap();
        assert_eq!(reply, "Hi there");
        assert_eq!(session.turn_count(), 2);
    }

    #[test]
    fn test_blocking_batch_preserves_order() {
        let session = blocking_session("re: {msg}");
        let replies = session
            .send_messages(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(replies, vec!["re: a", "re: b"]);
        assert_eq!(session.turn_count(), 4);
    }

    #[test]
    fn test_blocking_chat_loop() {
        let session = blocking_session("re: {msg}");

        let input = std::io::Cursor::new(b"hi\nreset\nquit\n".to_vec());
        let mut output = Vec::new();
        session.chat_loop(input, &mut output).unwrap();

        let rendered = String::from_utf8(output).unwrap();
        assert!(rendered.contains("re: hi"));
        assert!(rendered.contains("(context cleared)"));
        assert!(rendered.contains("Goodbye!"));
        assert_eq!(session.turn_count(), 0);
    }
}
