//! OpenCode backend.
//!
//! Drives an `opencode serve` instance over HTTP. Replies are not returned by
//! the prompt call: they arrive on the server's global event feed, shared by
//! every session, so each turn subscribes first, fires the prompt, and keeps
//! only the events of its own session until the session goes idle.

mod config;
pub mod mapper;
mod sse;
mod transport;

pub use config::OpencodeClientConfig;
pub use mapper::{OpencodeMapState, event_session_id, is_terminal, map_event};
pub use transport::{EventFeed, ModelRef, OpencodeHttpTransport, OpencodePrompt, OpencodeTransport};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::backend::{AgentBackend, AgentSession};
use crate::config::{AgentConfig, PermissionMode, PromptOptions, SessionOptions};
use crate::errors::{AgentError, HarnessError};
use crate::session::SessionCore;
use crate::stream::{AgentStream, StreamContext, StreamDriver};

/// Backend name used in events and errors.
pub const OPENCODE_BACKEND: &str = "opencode";

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct OpencodeOptions {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

/// OpenCode backend.
pub struct OpencodeBackend {
    config: AgentConfig,
    transport: Arc<dyn OpencodeTransport>,
}

impl OpencodeBackend {
    /// Builds an HTTP-backed backend.
    ///
    /// The server URL comes from `provider_options.base_url`, then
    /// `OPENCODE_BASE_URL`, then the local default. `cwd` scopes requests to
    /// that project directory.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let options: OpencodeOptions = config.provider_options_as(OPENCODE_BACKEND)?;
        let mut client = OpencodeClientConfig::from_env()?;
        if let Some(base_url) = options.base_url {
            client = client.base_url(base_url);
        }
        if let Some(timeout_ms) = options.timeout_ms {
            client = client.timeout(Duration::from_millis(timeout_ms));
        }
        let mut transport = OpencodeHttpTransport::new(client)?;
        if let Some(cwd) = &config.cwd {
            transport = transport.directory(cwd.clone());
        }
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: AgentConfig, transport: Arc<dyn OpencodeTransport>) -> Self {
        Self { config, transport }
    }

    fn open(&self, options: &SessionOptions, session_id: String) -> Box<dyn AgentSession> {
        if options.cwd.is_some() {
            debug!(backend = OPENCODE_BACKEND, "per-session cwd is ignored; the server directory is fixed per backend");
        }
        Box::new(OpencodeSession {
            core: SessionCore::new(
                OPENCODE_BACKEND,
                self.config.with_session(options),
                Some(session_id),
            ),
            transport: self.transport.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AgentBackend for OpencodeBackend {
    fn name(&self) -> &str {
        OPENCODE_BACKEND
    }

    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        let session_id = self.transport.create_session().await?;
        debug!(backend = OPENCODE_BACKEND, session_id = %session_id, "session created");
        Ok(self.open(&options, session_id))
    }

    async fn resume_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        if session_id.trim().is_empty() {
            return Err(HarnessError::usage("session id must not be empty"));
        }
        self.transport.get_session(session_id).await?;
        Ok(self.open(&options, session_id.to_string()))
    }
}

/// Conversation bound to one server-side session.
pub struct OpencodeSession {
    core: SessionCore,
    transport: Arc<dyn OpencodeTransport>,
}

impl OpencodeSession {
    fn build_prompt(&self, message: &str, options: &PromptOptions) -> Result<OpencodePrompt, AgentError> {
        let config = self.core.config();
        let settings = config.resolve(options);
        if settings.max_turns.is_some()
            || settings.max_budget_usd.is_some()
            || config.permission_mode != PermissionMode::Default
        {
            debug!(backend = OPENCODE_BACKEND, "turn, budget and permission settings are managed by the server");
        }
        let mut tools = BTreeMap::new();
        for tool in &config.allowed_tools {
            tools.insert(tool.clone(), true);
        }
        for tool in &config.disallowed_tools {
            tools.insert(tool.clone(), false);
        }
        Ok(OpencodePrompt {
            text: message.to_string(),
            model: settings.model.as_deref().map(ModelRef::parse).transpose()?,
            system: settings.system_prompt,
            tools,
        })
    }
}

#[async_trait::async_trait]
impl AgentSession for OpencodeSession {
    fn backend(&self) -> &str {
        self.core.backend()
    }

    fn id(&self) -> Option<String> {
        self.core.id()
    }

    fn stream(&self, message: &str, options: PromptOptions) -> Result<AgentStream, HarnessError> {
        self.core.ensure_open()?;
        options.validate(message)?;
        let session_id = self
            .core
            .id()
            .ok_or_else(|| HarnessError::usage("OpenCode session has no id"))?;
        let driver = OpencodeDriver {
            transport: self.transport.clone(),
            session_id,
            prompt: self.build_prompt(message, &options)?,
        };
        let stream = AgentStream::new(OPENCODE_BACKEND, Box::new(driver), &options);
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

struct OpencodeDriver {
    transport: Arc<dyn OpencodeTransport>,
    session_id: String,
    prompt: OpencodePrompt,
}

#[async_trait::async_trait]
impl StreamDriver for OpencodeDriver {
    async fn drive(self: Box<Self>, ctx: &mut StreamContext) {
        let OpencodeDriver {
            transport,
            session_id,
            prompt,
        } = *self;
        let abort = ctx.abort_token().clone();
        ctx.set_session_id(session_id.clone());

        // Subscribe before prompting so no early event is missed.
        let subscribed = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            subscribed = transport.subscribe() => subscribed,
        };
        let mut feed = match subscribed {
            Ok(feed) => feed,
            Err(error) => {
                ctx.fail(error).await;
                return;
            }
        };

        let (sent_tx, mut sent_rx) = oneshot::channel();
        {
            let transport = transport.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move {
                let _ = sent_tx.send(transport.prompt_async(&session_id, prompt).await);
            });
        }
        let mut awaiting_send = true;

        let mut state = OpencodeMapState::default();
        loop {
            tokio::select! {
                biased;
                _ = abort.cancelled() => {
                    debug!(backend = OPENCODE_BACKEND, session_id = %session_id, "turn aborted");
                    if let Err(e) = transport.abort(&session_id).await {
                        warn!(backend = OPENCODE_BACKEND, error = %e, "server abort failed");
                    }
                    break;
                }
                sent = &mut sent_rx, if awaiting_send => {
                    awaiting_send = false;
                    let failure = match sent {
                        Ok(Ok(())) => None,
                        Ok(Err(error)) => Some(error),
                        Err(_) => Some(AgentError::provider(OPENCODE_BACKEND, "prompt task ended without a reply")),
                    };
                    if let Some(error) = failure {
                        ctx.fail(error).await;
                        break;
                    }
                }
                next = feed.next() => match next {
                    None => {
                        if !ctx.has_error() {
                            ctx.fail(AgentError::network(
                                OPENCODE_BACKEND,
                                "event feed closed before the session went idle",
                            ))
                            .await;
                        }
                        break;
                    }
                    Some(Err(error)) => {
                        ctx.fail(error).await;
                        break;
                    }
                    Some(Ok(raw)) => {
                        if event_session_id(&raw) != Some(session_id.as_str()) {
                            continue;
                        }
                        let terminal = is_terminal(&raw, &session_id);
                        let events = map_event(&raw, &mut state);
                        debug!(
                            backend = OPENCODE_BACKEND,
                            session_id = %session_id,
                            raw_type = raw.get("type").and_then(serde_json::Value::as_str).unwrap_or("?"),
                            mapped = events.len(),
                            "mapped provider event"
                        );
                        if !ctx.emit_all(events).await || terminal {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::event::AgentEvent;
    use futures::stream;
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Scripted server. Records whether the feed was opened before the prompt.
    struct FakeServer {
        feed: Mutex<Option<Vec<Value>>>,
        hang: bool,
        prompt_error: Option<AgentError>,
        subscribed: AtomicBool,
        subscribed_before_prompt: AtomicBool,
        prompts: Mutex<Vec<OpencodePrompt>>,
        aborts: AtomicUsize,
    }

    impl FakeServer {
        fn new(feed: Vec<Value>) -> Self {
            Self {
                feed: Mutex::new(Some(feed)),
                hang: false,
                prompt_error: None,
                subscribed: AtomicBool::new(false),
                subscribed_before_prompt: AtomicBool::new(false),
                prompts: Mutex::new(Vec::new()),
                aborts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl OpencodeTransport for FakeServer {
        async fn create_session(&self) -> Result<String, AgentError> {
            Ok("ses_1".into())
        }

        async fn get_session(&self, session_id: &str) -> Result<Value, AgentError> {
            if session_id == "ses_1" {
                Ok(json!({"id": "ses_1"}))
            } else {
                Err(AgentError::session_not_found(OPENCODE_BACKEND, session_id))
            }
        }

        async fn subscribe(&self) -> Result<EventFeed, AgentError> {
            self.subscribed.store(true, Ordering::SeqCst);
            let events = self.feed.lock().expect("lock").take().unwrap_or_default();
            let items = stream::iter(events.into_iter().map(Ok));
            if self.hang {
                Ok(Box::pin(items.chain(stream::pending())))
            } else {
                Ok(Box::pin(items))
            }
        }

        async fn prompt_async(&self, _session_id: &str, prompt: OpencodePrompt) -> Result<(), AgentError> {
            self.subscribed_before_prompt
                .store(self.subscribed.load(Ordering::SeqCst), Ordering::SeqCst);
            self.prompts.lock().expect("lock").push(prompt);
            match &self.prompt_error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }

        async fn abort(&self, _session_id: &str) -> Result<(), AgentError> {
            self.aborts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn hello_feed() -> Vec<Value> {
        vec![
            json!({"type": "server.connected", "properties": {}}),
            json!({"type": "message.updated", "properties": {"info": {"id": "msg_u", "sessionID": "ses_1", "role": "user", "time": {"created": 1}}}}),
            json!({"type": "message.part.updated", "properties": {"part": {"id": "prt_u", "messageID": "msg_u", "sessionID": "ses_1", "type": "text", "text": "Reply with exactly: HELLO"}}}),
            json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "busy"}}}),
            json!({"type": "message.updated", "properties": {"info": {"id": "msg_other", "sessionID": "ses_9", "role": "assistant", "time": {"created": 1}}}}),
            json!({"type": "message.part.updated", "properties": {"part": {"id": "prt_o", "messageID": "msg_other", "sessionID": "ses_9", "type": "text", "text": "WRONG"}}}),
            json!({"type": "message.updated", "properties": {"info": {"id": "msg_a", "sessionID": "ses_1", "role": "assistant", "time": {"created": 2}}}}),
            json!({"type": "message.part.updated", "properties": {"part": {"id": "prt_a", "messageID": "msg_a", "sessionID": "ses_1", "type": "text", "text": "HEL"}}}),
            json!({"type": "message.part.updated", "properties": {"part": {"id": "prt_a", "messageID": "msg_a", "sessionID": "ses_1", "type": "text", "text": "HELLO"}}}),
            json!({"type": "message.updated", "properties": {"info": {"id": "msg_a", "sessionID": "ses_1", "role": "assistant",
                "time": {"created": 2, "completed": 3}, "cost": 0.0, "tokens": {"input": 9, "output": 1, "reasoning": 0, "cache": {"read": 0, "write": 0}}}}}),
            json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
            json!({"type": "message.updated", "properties": {"info": {"id": "msg_late", "sessionID": "ses_1", "role": "assistant", "time": {"created": 4}}}}),
        ]
    }

    async fn session(server: Arc<FakeServer>) -> Box<dyn AgentSession> {
        OpencodeBackend::with_transport(AgentConfig::default(), server)
            .create_session(SessionOptions::default())
            .await
            .expect("session")
    }

    #[tokio::test]
    async fn reply_hello_end_to_end() {
        let server = Arc::new(FakeServer::new(hello_feed()));
        let session = session(server.clone()).await;
        assert_eq!(session.id().as_deref(), Some("ses_1"));
        let mut stream = session
            .stream("Reply with exactly: HELLO", PromptOptions::default())
            .expect("stream");
        let mut events = Vec::new();
        {
            let mut iter = stream.events().expect("iterate");
            while let Some(event) = iter.next().await {
                events.push(event);
            }
        }
        let result = stream.result().await.expect("result");
        assert!(!result.is_error);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.text, "HELLO");
        assert_eq!(result.session_id.as_deref(), Some("ses_1"));
        assert_eq!(result.usage.input_tokens, 9);

        assert_eq!(events.first(), Some(&AgentEvent::TurnStart));
        assert!(matches!(events.last(), Some(AgentEvent::TurnEnd { usage: Some(_) })));
        let starts = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::MessageStart { .. }))
            .count();
        assert_eq!(starts, 1);
        assert!(server.subscribed_before_prompt.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_prompt_call_is_reported_in_band() {
        let mut server = FakeServer::new(vec![]);
        server.hang = true;
        server.prompt_error = Some(AgentError::new(ErrorKind::Configuration, OPENCODE_BACKEND, "bad model"));
        let session = session(Arc::new(server)).await;
        let mut stream = session.stream("hi", PromptOptions::default()).expect("stream");
        let mut events = Vec::new();
        {
            let mut iter = stream.events().expect("iterate");
            while let Some(event) = iter.next().await {
                events.push(event);
            }
        }
        assert!(matches!(events.last(), Some(AgentEvent::Error { error }) if error.kind == ErrorKind::Configuration));
        assert_eq!(stream.result().await.expect_err("error").kind(), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn abort_calls_server_abort() {
        let mut server = FakeServer::new(hello_feed().into_iter().take(4).collect());
        server.hang = true;
        let server = Arc::new(server);
        let session = session(server.clone()).await;
        let mut stream = session.stream("hi", PromptOptions::default()).expect("stream");
        {
            let mut iter = stream.events().expect("iterate");
            assert_eq!(iter.next().await, Some(AgentEvent::TurnStart));
            session.abort();
            assert_eq!(iter.next().await, None);
        }
        assert!(stream.result().await.expect_err("aborted").is_abort());
        for _ in 0..50 {
            if server.aborts.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(server.aborts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resume_unknown_session_is_session_not_found() {
        let backend = OpencodeBackend::with_transport(AgentConfig::default(), Arc::new(FakeServer::new(vec![])));
        let err = match backend.resume_session("ses_missing", SessionOptions::default()).await {
            Ok(_) => panic!("resume should fail"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), Some(ErrorKind::SessionNotFound));
        assert!(backend.resume_session("ses_1", SessionOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn model_must_name_provider() {
        let backend = OpencodeBackend::with_transport(
            AgentConfig::default().model("gpt-5").disallow_tool("bash"),
            Arc::new(FakeServer::new(vec![])),
        );
        let session = backend.create_session(SessionOptions::default()).await.expect("session");
        assert!(matches!(
            session.stream("hi", PromptOptions::default()),
            Err(HarnessError::Agent(error)) if error.kind == ErrorKind::Configuration
        ));
        let server = Arc::new(FakeServer::new(hello_feed()));
        let backend = OpencodeBackend::with_transport(
            AgentConfig::default().model("openai/gpt-5").disallow_tool("bash"),
            server.clone(),
        );
        let session = backend.create_session(SessionOptions::default()).await.expect("session");
        session.prompt("hi", PromptOptions::default()).await.expect("result");
        let prompts = server.prompts.lock().expect("lock");
        assert_eq!(prompts[0].model.as_ref().map(|m| m.model_id.as_str()), Some("gpt-5"));
        assert_eq!(prompts[0].tools.get("bash"), Some(&false));
    }

    #[tokio::test]
    async fn env_gated_smoke_hello_if_server_configured() {
        if std::env::var("OPENCODE_BASE_URL")
            .unwrap_or_default()
            .trim()
            .is_empty()
        {
            eprintln!("skipping OpenCode smoke test (OPENCODE_BASE_URL missing)");
            return;
        }

        let backend = OpencodeBackend::new(AgentConfig::default()).expect("backend");
        let session = backend
            .create_session(SessionOptions::default())
            .await
            .expect("session");
        let mut stream = session
            .stream("Reply with exactly: HELLO", PromptOptions::default())
            .expect("stream");
        let mut events = stream.events().expect("events");
        let mut kinds = Vec::new();
        while let Some(event) = events.next().await {
            kinds.push(event);
        }
        assert!(matches!(kinds.first(), Some(AgentEvent::TurnStart)));
        assert!(kinds.last().is_some_and(AgentEvent::is_terminal));
        let result = stream.result().await.expect("OpenCode smoke prompt");
        assert!(!result.text.is_empty());
        session.close().await;
    }
}
