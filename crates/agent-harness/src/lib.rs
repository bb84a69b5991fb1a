//! One canonical event stream and result type over several coding-agent
//! backends.
//!
//! Each backend under `vendors::*` turns its provider's native output into
//! [`AgentEvent`]s: Claude Code token deltas, Codex item lifecycles, and
//! OpenCode's session-filtered server events. An [`AgentStream`] can be
//! iterated once or awaited for its [`PromptResult`], and can be aborted at
//! any time. The [`AgentRegistry`] picks a default backend by name and can
//! fall back across backends on transient failures.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_harness::prelude::*;
//! use agent_harness::vendors::claude::ClaudeBackend;
//! use agent_harness::vendors::codex::CodexBackend;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), HarnessError> {
//! let config = AgentConfig::default().permission_mode(PermissionMode::AcceptEdits);
//! let mut registry = AgentRegistry::new();
//! registry.register("claude", Arc::new(ClaudeBackend::new(config.clone())?))?;
//! registry.register("codex", Arc::new(CodexBackend::new(config)?))?;
//!
//! let session = registry.create_session(SessionOptions::default()).await?;
//! let mut stream = session.stream("List the files in this repo", PromptOptions::default())?;
//! let mut events = stream.events()?;
//! while let Some(event) = events.next().await {
//!     if let AgentEvent::TextDelta { text } = event {
//!         print!("{text}");
//!     }
//! }
//! let result = stream.result().await?;
//! println!("\nsession {:?}", result.session_id);
//! registry.dispose().await;
//! # Ok(())
//! # }
//! ```

/// Backend and session contracts.
pub mod backend;
/// Backend, session and per-prompt configuration.
pub mod config;
/// Error kinds and error types.
pub mod errors;
/// Canonical stream events.
pub mod event;
/// Canonical messages, usage and prompt results.
pub mod message;
/// Tracing subscriber setup and per-prompt spans.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Child-process JSON-lines plumbing shared by CLI backends.
pub mod process;
/// Named backend registry with fallback.
pub mod registry;
mod session;
/// Single-consumption, abortable event streams.
pub mod stream;
/// Vendor integrations.
pub mod vendors;

pub use backend::{AgentBackend, AgentSession};
pub use config::{AgentConfig, McpServerConfig, PermissionMode, PromptOptions, PromptSettings, SessionOptions};
pub use errors::{AgentError, ErrorKind, FallbackAttempt, HarnessError};
pub use event::AgentEvent;
pub use message::{AgentMessage, ContentBlock, FileOperation, PromptResult, Role, Usage};
pub use observability::{LogOutput, LogSettings, init_observability, init_with};
pub use registry::{AgentRegistry, RetryPredicate, retry_transient};
pub use stream::{AbortHandle, AgentStream, EventIter, StreamContext, StreamDriver};
