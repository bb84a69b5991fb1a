use crate::config::{PromptOptions, SessionOptions};
use crate::errors::HarnessError;
use crate::message::PromptResult;
use crate::stream::AgentStream;

/// A coding-agent backend that can open sessions.
///
/// Implementations live under `vendors::*`; the registry only depends on this
/// contract.
#[async_trait::async_trait]
pub trait AgentBackend: Send + Sync {
    /// Stable backend name (for example `claude`).
    fn name(&self) -> &str;

    /// Opens a new conversation.
    async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError>;

    /// Reopens a conversation by its backend-assigned id.
    async fn resume_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError>;

    /// Releases backend resources. Calling it twice is harmless.
    async fn dispose(&self) -> Result<(), HarnessError> {
        Ok(())
    }
}

/// Handle for one conversation with a backend.
#[async_trait::async_trait]
pub trait AgentSession: Send + Sync {
    /// Backend that owns this session.
    fn backend(&self) -> &str;

    /// Backend-assigned session id, once known.
    ///
    /// Some backends only report the id after the first prompt has started.
    fn id(&self) -> Option<String>;

    /// Builds a lazy event stream for one prompt.
    ///
    /// Nothing is sent to the backend until the stream is consumed.
    fn stream(&self, message: &str, options: PromptOptions) -> Result<AgentStream, HarnessError>;

    /// Runs a prompt to completion and returns its terminal result.
    async fn prompt(
        &self,
        message: &str,
        options: PromptOptions,
    ) -> Result<PromptResult, HarnessError> {
        let mut stream = self.stream(message, options)?;
        stream.result().await
    }

    /// Aborts the most recently started stream.
    fn abort(&self);

    /// Aborts any live stream and rejects further prompts.
    async fn close(&self);
}
