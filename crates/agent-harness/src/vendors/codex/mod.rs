//! Codex backend.
//!
//! Runs `codex exec --json` per turn. The thread id reported by the first turn
//! becomes the session id and is passed to `exec resume` afterwards.

mod config;
pub mod mapper;
mod transport;

pub use config::CodexCliConfig;
pub use mapper::{CodexMapState, map_event};
pub use transport::{CodexCliTransport, CodexTransport, CodexTurn};

use std::sync::Arc;

use futures::StreamExt as _;
use tracing::debug;

use crate::backend::{AgentBackend, AgentSession};
use crate::config::{AgentConfig, PromptOptions, SessionOptions};
use crate::errors::{AgentError, HarnessError};
use crate::event::AgentEvent;
use crate::session::SessionCore;
use crate::stream::{AgentStream, StreamContext, StreamDriver};

/// Backend name used in events and errors.
pub const CODEX_BACKEND: &str = "codex";

/// Codex backend.
pub struct CodexBackend {
    config: AgentConfig,
    transport: Arc<dyn CodexTransport>,
}

impl CodexBackend {
    /// Builds a CLI-backed backend. `provider_options` may carry a [`CodexCliConfig`].
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let cli: CodexCliConfig = config.provider_options_as(CODEX_BACKEND)?;
        Ok(Self::with_transport(config, Arc::new(CodexCliTransport::new(cli))))
    }

    pub fn with_transport(config: AgentConfig, transport: Arc<dyn CodexTransport>) -> Self {
        Self { config, transport }
    }

    fn open(&self, options: &SessionOptions, thread_id: Option<String>) -> Box<dyn AgentSession> {
        Box::new(CodexSession {
            core: SessionCore::new(CODEX_BACKEND, self.config.with_session(options), thread_id),
            transport: self.transport.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AgentBackend for CodexBackend {
    fn name(&self) -> &str {
        CODEX_BACKEND
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
            return Err(HarnessError::usage("thread id must not be empty"));
        }
        Ok(self.open(&options, Some(session_id.to_string())))
    }
}

/// Conversation backed by one Codex thread.
pub struct CodexSession {
    core: SessionCore,
    transport: Arc<dyn CodexTransport>,
}

#[async_trait::async_trait]
impl AgentSession for CodexSession {
    fn backend(&self) -> &str {
        self.core.backend()
    }

    fn id(&self) -> Option<String> {
        self.core.id()
    }

    fn stream(&self, message: &str, options: PromptOptions) -> Result<AgentStream, HarnessError> {
        self.core.ensure_open()?;
        options.validate(message)?;
        let turn = CodexTurn {
            prompt: message.to_string(),
            thread_id: self.core.id(),
            settings: self.core.config().resolve(&options),
            config: self.core.config().clone(),
        };
        let driver = CodexDriver {
            transport: self.transport.clone(),
            turn,
            session: self.core.clone(),
        };
        let stream = AgentStream::new(CODEX_BACKEND, Box::new(driver), &options);
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

struct CodexDriver {
    transport: Arc<dyn CodexTransport>,
    turn: CodexTurn,
    session: SessionCore,
}

#[async_trait::async_trait]
impl StreamDriver for CodexDriver {
    async fn drive(self: Box<Self>, ctx: &mut StreamContext) {
        let CodexDriver {
            transport,
            turn,
            session,
        } = *self;
        let abort = ctx.abort_token().clone();
        if let Some(thread_id) = &turn.thread_id {
            ctx.set_session_id(thread_id.clone());
        }

        let started = tokio::select! {
            biased;
            _ = abort.cancelled() => return,
            started = transport.run(turn) => started,
        };
        let mut source = match started {
            Ok(source) => source,
            Err(error) => {
                ctx.fail(error).await;
                return;
            }
        };

        let mut state = CodexMapState::default();
        loop {
            let next = tokio::select! {
                biased;
                // Dropping the source kills the codex process.
                _ = abort.cancelled() => {
                    debug!(backend = CODEX_BACKEND, "turn aborted");
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
                        backend = CODEX_BACKEND,
                        session_id = ?state.thread_id(),
                        raw_type = raw.get("type").and_then(serde_json::Value::as_str).unwrap_or("?"),
                        mapped = events.len(),
                        "mapped provider event"
                    );
                    if let Some(thread_id) = state.thread_id() {
                        session.set_id(thread_id);
                        ctx.set_session_id(thread_id);
                    }
                    let terminal = events.iter().any(|e| matches!(e, AgentEvent::TurnEnd { .. }));
                    if !ctx.emit_all(events).await {
                        break;
                    }
                    if terminal {
                        ctx.set_raw(raw);
                    }
                }
            }
        }
    }
}
