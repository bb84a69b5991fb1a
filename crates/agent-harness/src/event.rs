use crate::errors::AgentError;
use crate::message::{AgentMessage, Role, Usage};

/// Canonical events produced by every backend stream.
///
/// `TurnStart` is always first. A stream that is not aborted ends with either
/// `TurnEnd` or `Error`. Each `ToolStart` is followed by exactly one `ToolEnd`
/// with the same `id`.
#[derive(Clone, Debug, PartialEq)]
pub enum AgentEvent {
    /// Synthetic opening marker, emitted before any provider I/O.
    TurnStart,
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A tool call began.
    ToolStart {
        id: String,
        name: String,
        input: Option<serde_json::Value>,
    },
    /// A tool call finished.
    ToolEnd {
        id: String,
        output: serde_json::Value,
        is_error: bool,
    },
    /// A message began.
    MessageStart { role: Role },
    /// A message is complete; carries the assembled message, not a delta.
    MessageEnd { message: AgentMessage },
    /// The turn completed.
    TurnEnd { usage: Option<Usage> },
    /// The backend reported a failure.
    Error { error: AgentError },
}

impl AgentEvent {
    /// Returns true for the events that may close a stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnEnd { .. } | Self::Error { .. })
    }
}
