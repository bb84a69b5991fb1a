use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream::{self, BoxStream};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::errors::{AgentError, ErrorKind};

use super::sse::SseDecoder;
use super::{OPENCODE_BACKEND, OpencodeClientConfig};

/// Raw events from the server's global feed.
pub type EventFeed = BoxStream<'static, Result<Value, AgentError>>;

/// Model reference in OpenCode's `provider/model` form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    /// Splits `anthropic/claude-sonnet-4` at the first slash.
    pub fn parse(model: &str) -> Result<Self, AgentError> {
        match model.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Ok(Self {
                provider_id: provider.to_string(),
                model_id: model.to_string(),
            }),
            _ => Err(AgentError::configuration(
                OPENCODE_BACKEND,
                format!("model {model:?} must look like provider/model"),
            )),
        }
    }
}

/// Body of one fire-and-forget prompt.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpencodePrompt {
    pub text: String,
    pub model: Option<ModelRef>,
    pub system: Option<String>,
    /// Per-tool enable flags.
    pub tools: BTreeMap<String, bool>,
}

impl OpencodePrompt {
    pub(crate) fn body(&self) -> Value {
        let mut body = json!({ "parts": [{ "type": "text", "text": self.text }] });
        if let Some(model) = &self.model {
            body["model"] = json!({ "providerID": model.provider_id, "modelID": model.model_id });
        }
        if let Some(system) = &self.system {
            body["system"] = json!(system);
        }
        if !self.tools.is_empty() {
            body["tools"] = json!(self.tools);
        }
        body
    }
}

/// Boundary to an OpenCode server.
#[async_trait::async_trait]
pub trait OpencodeTransport: Send + Sync {
    /// Creates a session and returns its id.
    async fn create_session(&self) -> Result<String, AgentError>;

    /// Fetches session metadata. Unknown ids fail with `SessionNotFound`.
    async fn get_session(&self, session_id: &str) -> Result<Value, AgentError>;

    /// Opens the global event feed.
    async fn subscribe(&self) -> Result<EventFeed, AgentError>;

    /// Queues a prompt without waiting for the reply.
    async fn prompt_async(&self, session_id: &str, prompt: OpencodePrompt) -> Result<(), AgentError>;

    /// Asks the server to stop the running turn.
    async fn abort(&self, session_id: &str) -> Result<(), AgentError>;
}

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// `reqwest` client for the OpenCode HTTP API.
pub struct OpencodeHttpTransport {
    client: reqwest::Client,
    config: OpencodeClientConfig,
    directory: Option<PathBuf>,
}

impl OpencodeHttpTransport {
    pub fn new(config: OpencodeClientConfig) -> Result<Self, AgentError> {
        config.validate()?;
        // No client-wide timeout: it would also cut the long-lived event feed.
        let client = reqwest::Client::builder().build().map_err(|e| {
            AgentError::configuration(OPENCODE_BACKEND, format!("failed to build HTTP client: {e}"))
                .with_cause(e)
        })?;
        Ok(Self {
            client,
            config,
            directory: None,
        })
    }

    /// Scopes every request to a project directory.
    pub fn directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, self.config.url(path));
        if let Some(directory) = &self.directory {
            request = request.query(&[("directory", directory.to_string_lossy())]);
        }
        request
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response, AgentError> {
        let response = request
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| transport_error(what, e))?;
        check_status(response, what).await
    }
}

fn transport_error(what: &str, e: reqwest::Error) -> AgentError {
    AgentError::network(OPENCODE_BACKEND, format!("OpenCode {what} failed: {e}")).with_cause(e)
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    let kind = match status.as_u16() {
        404 => ErrorKind::SessionNotFound,
        401 | 403 => ErrorKind::PermissionDenied,
        400 | 422 => ErrorKind::Configuration,
        _ => ErrorKind::Provider,
    };
    Err(AgentError::new(
        kind,
        OPENCODE_BACKEND,
        format!("OpenCode {what} failed with status {status}: {body}"),
    ))
}

#[async_trait::async_trait]
impl OpencodeTransport for OpencodeHttpTransport {
    async fn create_session(&self) -> Result<String, AgentError> {
        let request = self.request(reqwest::Method::POST, "/session").json(&json!({}));
        let session: Value = self
            .send(request, "session create")
            .await?
            .json()
            .await
            .map_err(|e| transport_error("session create", e))?;
        session
            .get("id")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                AgentError::provider(OPENCODE_BACKEND, "session create response has no id")
                    .with_raw(session.clone())
            })
    }

    async fn get_session(&self, session_id: &str) -> Result<Value, AgentError> {
        let request = self.request(reqwest::Method::GET, &format!("/session/{session_id}"));
        self.send(request, "session lookup")
            .await
            .map_err(|e| match e.kind {
                ErrorKind::SessionNotFound => {
                    AgentError::session_not_found(OPENCODE_BACKEND, session_id)
                }
                _ => e,
            })?
            .json()
            .await
            .map_err(|e| transport_error("session lookup", e))
    }

    async fn subscribe(&self) -> Result<EventFeed, AgentError> {
        let response = self
            .request(reqwest::Method::GET, "/event")
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| transport_error("event subscribe", e))?;
        let response = check_status(response, "event subscribe").await?;
        debug!(backend = OPENCODE_BACKEND, "subscribed to event feed");
        Ok(event_feed(Box::pin(response.bytes_stream())))
    }

    async fn prompt_async(&self, session_id: &str, prompt: OpencodePrompt) -> Result<(), AgentError> {
        let request = self
            .request(reqwest::Method::POST, &format!("/session/{session_id}/prompt_async"))
            .json(&prompt.body());
        self.send(request, "prompt").await?;
        Ok(())
    }

    async fn abort(&self, session_id: &str) -> Result<(), AgentError> {
        let request = self.request(reqwest::Method::POST, &format!("/session/{session_id}/abort"));
        self.send(request, "abort").await?;
        Ok(())
    }
}

fn event_feed(bytes: ByteStream) -> EventFeed {
    struct State {
        bytes: ByteStream,
        decoder: SseDecoder,
        pending: VecDeque<Value>,
        done: bool,
    }

    let state = State {
        bytes,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        done: false,
    };
    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.decoder.push_chunk(&chunk) {
                        if frame.data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Value>(&frame.data) {
                            Ok(event) => state.pending.push_back(event),
                            Err(e) => warn!(backend = OPENCODE_BACKEND, error = %e, "skipping invalid SSE frame"),
                        }
                    }
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(transport_error("event feed", e)), state));
                }
                None => {
                    state.done = true;
                }
            }
        }
    }))
}
