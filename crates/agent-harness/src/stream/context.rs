use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::errors::AgentError;
use crate::event::AgentEvent;
use crate::message::{AgentMessage, PromptResult, Usage};
use crate::observability;

/// Engine-side half of a stream.
///
/// A [`StreamDriver`](super::StreamDriver) pushes canonical events through
/// `emit`; the context forwards them to the consumer and accumulates the
/// state needed for the terminal [`PromptResult`].
pub struct StreamContext {
    backend: String,
    tx: mpsc::Sender<AgentEvent>,
    abort: CancellationToken,
    closed: bool,
    last_was_terminal: bool,
    messages: Vec<AgentMessage>,
    usage: Option<Usage>,
    error: Option<AgentError>,
    session_id: Option<String>,
    structured_output: Option<serde_json::Value>,
    raw: Option<serde_json::Value>,
    is_error: bool,
}

impl StreamContext {
    pub(crate) fn new(
        backend: String,
        tx: mpsc::Sender<AgentEvent>,
        abort: CancellationToken,
    ) -> Self {
        Self {
            backend,
            tx,
            abort,
            closed: false,
            last_was_terminal: false,
            messages: Vec::new(),
            usage: None,
            error: None,
            session_id: None,
            structured_output: None,
            raw: None,
            is_error: false,
        }
    }

    /// Name of the backend driving this stream.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Token cancelled when the stream is aborted.
    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Returns true once the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true once an error event has been emitted.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Records and forwards one event.
    ///
    /// Returns `false` when the consumer dropped the stream; drivers should
    /// stop reading from the provider at that point.
    pub async fn emit(&mut self, event: AgentEvent) -> bool {
        match &event {
            AgentEvent::MessageEnd { message } => self.messages.push(message.clone()),
            AgentEvent::TurnEnd { usage: Some(usage) } => self.usage = Some(usage.clone()),
            AgentEvent::Error { error } if self.error.is_none() => {
                self.error = Some(error.clone());
            }
            _ => {}
        }
        self.last_was_terminal = event.is_terminal();
        if self.closed {
            return false;
        }
        trace!(backend = %self.backend, ?event, "emit canonical event");
        if self.tx.send(event).await.is_err() {
            self.closed = true;
        }
        !self.closed
    }

    /// Emits each event in order, stopping early if the consumer is gone.
    pub async fn emit_all(&mut self, events: Vec<AgentEvent>) -> bool {
        for event in events {
            if !self.emit(event).await {
                return false;
            }
        }
        true
    }

    /// Emits an error event.
    pub async fn fail(&mut self, error: AgentError) -> bool {
        self.emit(AgentEvent::Error { error }).await
    }

    /// Records the backend session id reported during the prompt.
    pub fn set_session_id(&mut self, session_id: impl Into<String>) {
        let session_id = session_id.into();
        if self.session_id.as_deref() != Some(session_id.as_str()) {
            observability::record_session_id(&session_id);
        }
        self.session_id = Some(session_id);
    }

    /// Records usage seen outside a `TurnEnd` event.
    pub fn record_usage(&mut self, usage: Usage) {
        self.usage = Some(usage);
    }

    pub fn set_structured_output(&mut self, value: serde_json::Value) {
        self.structured_output = Some(value);
    }

    /// Records the backend's terminal payload.
    pub fn set_raw(&mut self, raw: serde_json::Value) {
        self.raw = Some(raw);
    }

    pub fn set_is_error(&mut self, is_error: bool) {
        self.is_error = is_error;
    }

    /// Closes the turn and produces the terminal outcome.
    ///
    /// The first recorded error wins over anything emitted after it.
    pub(crate) async fn finish(mut self) -> Result<PromptResult, AgentError> {
        if self.is_aborted() {
            return Err(AgentError::abort(self.backend));
        }
        if let Some(error) = self.error.take() {
            return Err(error);
        }
        if !self.last_was_terminal {
            let usage = self.usage.clone();
            self.emit(AgentEvent::TurnEnd { usage }).await;
        }
        if self.is_aborted() {
            return Err(AgentError::abort(self.backend));
        }
        let mut result = PromptResult::from_messages(self.messages);
        result.session_id = self.session_id;
        result.is_error = self.is_error;
        result.structured_output = self.structured_output;
        result.usage = self.usage.unwrap_or_default();
        result.raw = self.raw;
        Ok(result)
    }
}
