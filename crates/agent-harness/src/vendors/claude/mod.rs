//! Claude Code backend.
//!
//! Talks to the `claude` CLI in `stream-json` mode. Token-level deltas come
//! through [`mapper`], which keeps the tool-input accumulators between events.

mod config;
pub mod mapper;
mod transport;

pub use config::ClaudeCliConfig;
pub use mapper::{ClaudeMapState, map_event};
pub use transport::{ClaudeCliTransport, ClaudeQuery, ClaudeTransport};

use std::sync::Arc;

use futures::StreamExt as _;
use tracing::{debug, warn};

use crate::backend::{AgentBackend, AgentSession};
use crate::config::{AgentConfig, PromptOptions, SessionOptions};
use crate::errors::{AgentError, HarnessError};
use crate::session::SessionCore;
use crate::stream::{AgentStream, StreamContext, StreamDriver};

/// Backend name used in events and errors.
pub const CLAUDE_BACKEND: &str = "claude";

/// Claude Code backend.
pub struct ClaudeBackend {
    config: AgentConfig,
    transport: Arc<dyn ClaudeTransport>,
}

impl ClaudeBackend {
    /// Builds a CLI-backed backend. `provider_options` may carry a [`ClaudeCliConfig`].
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let cli: ClaudeCliConfig = config.provider_options_as(CLAUDE_BACKEND)?;
        Ok(Self::with_transport(config, Arc::new(ClaudeCliTransport::new(cli))))
    }

    /// Builds a backend over a custom transport.
    pub fn with_transport(config: AgentConfig, transport: Arc<dyn ClaudeTransport>) -> Self {
        Self { config, transport }
    }

    fn open(&self, options: &SessionOptions, id: Option<String>) -> Box<dyn AgentSession> {
        Box::new(ClaudeSession {
            core: SessionCore::new(CLAUDE_BACKEND, self.config.with_session(options), id),
            transport: self.transport.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        CLAUDE_BACKEND
    }

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        Ok(self.open(&options, None))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        if session_id.trim().is_empty() {
            return Err(HarnessError::usage("session id must not be empty"));
        }
        // The CLI validates the id on the first resumed turn.
        Ok(self.open(&options, Some(session_id.to_string())))
    }
}

/// Conversation with Claude. The id is assigned by the CLI on the first turn.
pub struct ClaudeSession {
    core: SessionCore,
    transport: Arc<dyn ClaudeTransport>,
}

#[async_trait::async_trait]
impl AgentSession for ClaudeSession {
    fn backend(&self) -> &str {
        self.core.backend()
    }

    fn id(&self) -> Option<String> {
        self.core.id()
    }

    fn stream(&self, message: &str, options: PromptOptions) -> Result<AgentStream, HarnessError> {
        self.core.ensure_open()?;
        options.validate(message)?;
        let query = ClaudeQuery {
            prompt: message.to_string(),
            resume: self.core.id(),
            settings: self.core.config().resolve(&options),
            config: self.core.config().clone(),
        };
        let driver = ClaudeDriver {
            transport: self.transport.clone(),
            query,
            session: self.core.clone(),
        };
        let stream = AgentStream::new(CLAUDE_BACKEND, Box::new(driver), &options);
        self.core.track(&stream);
        Ok(stream)
    }

    fn abort(&self) {
        self.core.abort();
    }

    async fn close(&self) {
        self.core.close();
    }
}

struct ClaudeDriver {
    transport: Arc<dyn ClaudeTransport>,
    query: ClaudeQuery,
    session: SessionCore,
}

#[async_trait::async_trait]
impl StreamDriver for ClaudeDriver {
    async fn drive(self: Box<Self>, ctx: &mut StreamContext) {
        let ClaudeDriver {
            transport,
            query,
            session,
        } = *self;
        let abort = ctx.abort_token().clone();

        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            started = transport.query(query) => started,
        };
        let mut source = match started {
            Ok(source) => source,
            Err(error) => {
                ctx.fail(error).await;
                return;
            }
        };

        let mut state = ClaudeMapState::default();
        loop {
            let next = tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    debug!(backend = CLAUDE_BACKEND, "turn aborted");
                    if let Err(e) = transport.interrupt(state.session_id()).await {
                        warn!(backend = CLAUDE_BACKEND, error = %e, "interrupt failed");
                    }
                    break;
                }
                next = source.next() => next,
            };
            match next {
                None => break,
                Some(Err(error)) => {
                    if !ctx.has_error() {
                        ctx.fail(error).await;
                    }
                    break;
                }
                Some(Ok(raw)) => {
                    let events = map_event(&raw, &mut state);
                    debug!(
                        backend = CLAUDE_BACKEND,
                        session_id = ?state.session_id(),
                        raw_type = raw.get("type").and_then(serde_json::Value::as_str).unwrap_or("?"),
                        mapped = events.len(),
                        "mapped provider event"
                    );
                    if let Some(id) = state.session_id() {
                        session.set_id(id);
                        ctx.set_session_id(id);
                    }
                    if !ctx.emit_all(events).await {
                        break;
                    }
                }
            }
        }

        if let Some(result) = state.result().cloned() {
            if let Some(output) = result.get("structured_output").filter(|v| !v.is_null()) {
                ctx.set_structured_output(output.clone());
            }
            ctx.set_is_error(
                result
                    .get("is_error")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            );
            ctx.set_raw(result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::event::AgentEvent;
    use crate::process::JsonLineStream;
    use futures::stream;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct Scripted {
        events: Vec<Value>,
        fail_start: bool,
        hang: bool,
        queries: Mutex<Vec<ClaudeQuery>>,
    }

    impl Scripted {
        fn new(events: Vec<Value>) -> Arc<Self> {
            Arc::new(Self {
                events,
                fail_start: false,
                hang: false,
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ClaudeTransport for Scripted {
        async fn query(&self, query: ClaudeQuery) -> Result<JsonLineStream, AgentError> {
            self.queries.lock().expect("lock").push(query);
            if self.fail_start {
                return Err(AgentError::configuration(CLAUDE_BACKEND, "claude not installed"));
            }
            let items = stream::iter(self.events.clone().into_iter().map(Ok));
            if self.hang {
                Ok(Box::pin(items.chain(stream::pending())))
            } else {
                Ok(Box::pin(items))
            }
        }
    }

    fn hello_turn() -> Vec<Value> {
        vec![
            json!({"type": "system", "subtype": "init", "session_id": "sess-42"}),
            json!({"type": "stream_event", "event": {"type": "message_start", "message": {"id": "msg_1", "role": "assistant"}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_start", "index": 0, "content_block": {"type": "text", "text": ""}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "HEL"}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "LO"}}}),
            json!({"type": "stream_event", "event": {"type": "content_block_stop", "index": 0}}),
            json!({"type": "assistant", "message": {"id": "msg_1", "role": "assistant", "content": [{"type": "text", "text": "HELLO"}]}}),
            json!({"type": "result", "subtype": "success", "is_error": false, "result": "HELLO",
                   "session_id": "sess-42", "total_cost_usd": 0.001, "num_turns": 1,
                   "usage": {"input_tokens": 12, "output_tokens": 3}}),
        ]
    }

    async fn session(transport: Arc<Scripted>) -> Box<dyn AgentSession> {
        ClaudeBackend::with_transport(AgentConfig::default(), transport)
            .create_session(SessionOptions::default())
            .await
            .expect("session")
    }

    #[tokio::test]
    async fn reply_hello_end_to_end() {
        let session = session(Scripted::new(hello_turn())).await;
        let result = session
            .prompt("Reply with exactly: HELLO", PromptOptions::default())
            .await
            .expect("result");
        assert!(!result.is_error);
        assert!(!result.messages.is_empty());
        assert_eq!(result.text, "HELLO");
        assert_eq!(result.session_id.as_deref(), Some("sess-42"));
        assert_eq!(result.usage.input_tokens, 12);
        assert_eq!(result.usage.num_turns, Some(1));
        assert_eq!(session.id().as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn second_prompt_resumes_reported_session() {
        let transport = Scripted::new(hello_turn());
        let session = session(transport.clone()).await;
        session.prompt("one", PromptOptions::default()).await.expect("first");
        session.prompt("two", PromptOptions::default()).await.expect("second");
        let queries = transport.queries.lock().expect("lock");
        assert_eq!(queries[0].resume, None);
        assert_eq!(queries[1].resume.as_deref(), Some("sess-42"));
    }

    #[tokio::test]
    async fn event_order_starts_with_turn_start_and_ends_with_turn_end() {
        let session = session(Scripted::new(hello_turn())).await;
        let mut stream = session.stream("hi", PromptOptions::default()).expect("stream");
        let mut events = Vec::new();
        let mut iter = stream.events().expect("iterate");
        while let Some(event) = iter.next().await {
            events.push(event);
        }
        assert_eq!(events.first(), Some(&AgentEvent::TurnStart));
        assert!(matches!(events.last(), Some(AgentEvent::TurnEnd { usage: Some(_) })));
        let deltas: String = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, "HELLO");
    }

    #[tokio::test]
    async fn start_failure_is_reported_in_band() {
        let transport = Arc::new(Scripted {
            events: vec![],
            fail_start: true,
            hang: false,
            queries: Mutex::new(Vec::new()),
        });
        let session = session(transport).await;
        let mut stream = session.stream("hi", PromptOptions::default()).expect("stream");
        let mut iter = stream.events().expect("iterate");
        assert_eq!(iter.next().await, Some(AgentEvent::TurnStart));
        assert!(matches!(
            iter.next().await,
            Some(AgentEvent::Error { error }) if error.kind == ErrorKind::Configuration
        ));
        assert_eq!(iter.next().await, None);
        let err = stream.result().await.expect_err("error");
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn session_abort_stops_a_hanging_turn() {
        let transport = Arc::new(Scripted {
            events: hello_turn().into_iter().take(4).collect(),
            fail_start: false,
            hang: true,
            queries: Mutex::new(Vec::new()),
        });
        let session = session(transport).await;
        let mut stream = session.stream("hi", PromptOptions::default()).expect("stream");
        {
            let mut iter = stream.events().expect("iterate");
            assert_eq!(iter.next().await, Some(AgentEvent::TurnStart));
            session.abort();
            session.abort();
            assert_eq!(iter.next().await, None);
        }
        assert!(stream.result().await.expect_err("aborted").is_abort());
    }

    #[tokio::test]
    async fn closed_session_rejects_prompts() {
        let session = session(Scripted::new(hello_turn())).await;
        session.close().await;
        assert!(matches!(
            session.stream("hi", PromptOptions::default()),
            Err(HarnessError::Usage(_))
        ));
    }

    #[test]
    fn cli_options_come_from_provider_options() {
        let config = AgentConfig::default().provider_options(json!({"binary": "/opt/claude"}));
        assert!(ClaudeBackend::new(config).is_ok());
        let bad = AgentConfig::default().provider_options(json!({"binary": 5}));
        assert!(matches!(
            ClaudeBackend::new(bad),
            Err(error) if error.kind == ErrorKind::Configuration
        ));
    }

    #[tokio::test]
    async fn env_gated_smoke_hello_if_cli_enabled() {
        if std::env::var("AGENT_HARNESS_LIVE_CLAUDE")
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            eprintln!("skipping Claude smoke test (AGENT_HARNESS_LIVE_CLAUDE unset)");
            return;
        }

        let backend = ClaudeBackend::new(AgentConfig::default().max_turns(1)).expect("backend");
        let session = backend
            .create_session(SessionOptions::default())
            .await
            .expect("session");
        let result = session
            .prompt("Reply with exactly: HELLO", PromptOptions::default())
            .await
            .expect("Claude smoke prompt");
        assert!(!result.is_error);
        assert!(!result.messages.is_empty());
        assert!(!result.text.is_empty());
    }
}
