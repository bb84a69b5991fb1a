//! Common imports for application code driving agents.
pub use crate::{
    AbortHandle, AgentBackend, AgentConfig, AgentError, AgentEvent, AgentMessage, AgentRegistry,
    AgentSession, AgentStream, ContentBlock, ErrorKind, HarnessError, PermissionMode,
    PromptOptions, PromptResult, Role, SessionOptions, Usage,
};
