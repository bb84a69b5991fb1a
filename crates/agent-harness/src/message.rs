use chrono::{DateTime, Utc};

/// Author of a canonical message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Kind of filesystem change reported by a backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    Create,
    Edit,
    Delete,
}

/// One block of message content.
///
/// Blocks keep the order in which the backend emitted them. A `ToolUse` block
/// and the `ToolResult` that answers it share the same `id`.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ContentBlock {
    /// Plain assistant or user text.
    Text { text: String },
    /// A tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The output of a tool invocation.
    ToolResult {
        id: String,
        output: serde_json::Value,
        is_error: bool,
    },
    /// Model reasoning text.
    Reasoning { text: String },
    /// A file created, edited or deleted by the agent.
    FileChange {
        path: String,
        operation: FileOperation,
        diff: Option<String>,
    },
}

/// A fully assembled message.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub role: Role,
    pub content: Vec<ContentBlock>,
    pub created_at: DateTime<Utc>,
    /// Provider payload the message was built from.
    pub raw: Option<serde_json::Value>,
}

impl AgentMessage {
    /// Creates a message stamped with the current time.
    pub fn new(id: impl Into<String>, role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            id: id.into(),
            role,
            content,
            created_at: Utc::now(),
            raw: None,
        }
    }

    pub(crate) fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Concatenates the text blocks of this message in order.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// Token, cost and timing counters for a prompt.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
    pub total_cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
}

impl Usage {
    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Terminal summary of one prompt.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PromptResult {
    /// Backend session id the prompt ran in, once known.
    pub session_id: Option<String>,
    /// Messages in the order their `MessageEnd` events were emitted.
    pub messages: Vec<AgentMessage>,
    /// All text blocks of all messages joined in emission order.
    pub text: String,
    pub is_error: bool,
    pub structured_output: Option<serde_json::Value>,
    pub usage: Usage,
    /// Backend terminal payload (for example Claude's `result` message).
    pub raw: Option<serde_json::Value>,
}

impl PromptResult {
    pub(crate) fn from_messages(messages: Vec<AgentMessage>) -> Self {
        let text = concat_text(&messages);
        Self {
            session_id: None,
            messages,
            text,
            is_error: false,
            structured_output: None,
            usage: Usage::default(),
            raw: None,
        }
    }
}

fn concat_text(messages: &[AgentMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.text());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_text_joins_text_blocks_across_messages() {
        let first = AgentMessage::new(
            "m1",
            Role::Assistant,
            vec![
                ContentBlock::Text {
                    text: "hello".into(),
                },
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "Read".into(),
                    input: serde_json::json!({"path": "a"}),
                },
            ],
        );
        let second = AgentMessage::new(
            "m2",
            Role::Assistant,
            vec![
                ContentBlock::Reasoning {
                    text: "ignored".into(),
                },
                ContentBlock::Text {
                    text: " world".into(),
                },
            ],
        );
        let result = PromptResult::from_messages(vec![first, second]);
        assert_eq!(result.text, "hello world");
        assert_eq!(result.messages.len(), 2);
    }

    #[test]
    fn content_blocks_serialize_with_type_tag() {
        let block = ContentBlock::FileChange {
            path: "src/lib.rs".into(),
            operation: FileOperation::Edit,
            diff: None,
        };
        let value = serde_json::to_value(&block).expect("serialize");
        assert_eq!(value["type"], "file_change");
        assert_eq!(value["operation"], "edit");
    }
}
