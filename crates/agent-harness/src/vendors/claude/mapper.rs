//! Claude Code `stream-json` events to canonical events.
//!
//! With partial messages enabled, Claude wraps raw Messages API stream events
//! (`message_start`, `content_block_*`) in `stream_event` envelopes and also
//! emits each finished content block as a complete `assistant` message. Tool
//! input arrives as JSON fragments keyed by block index and is only usable once
//! the block closes.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::errors::{AgentError, ErrorKind};
use crate::event::AgentEvent;
use crate::message::{AgentMessage, ContentBlock, Role, Usage};
use crate::vendors::{classify_message, first_str, first_u64};

use super::CLAUDE_BACKEND;

#[derive(Debug, Clone)]
struct ToolBlock {
    id: String,
    name: String,
    json: String,
}

/// Mutable state carried between calls to [`map_event`].
#[derive(Debug, Default)]
pub struct ClaudeMapState {
    tool_blocks: HashMap<u64, ToolBlock>,
    started_tools: HashSet<String>,
    open_tools: HashSet<String>,
    announced_messages: HashSet<String>,
    streamed_messages: HashSet<String>,
    session_id: Option<String>,
    result: Option<Value>,
}

impl ClaudeMapState {
    /// Session id reported by Claude, once seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// The `result` message closing the turn, once seen.
    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Number of tool blocks whose input is still streaming.
    pub fn open_tool_blocks(&self) -> usize {
        self.tool_blocks.len()
    }
}

/// Maps one raw Claude event. Unknown shapes yield no events.
pub fn map_event(raw: &Value, state: &mut ClaudeMapState) -> Vec<AgentEvent> {
    if let Some(session_id) = first_str(raw, &["session_id", "sessionId"]) {
        state.session_id = Some(session_id.to_string());
    }
    match raw.get("type").and_then(Value::as_str).unwrap_or("") {
        "stream_event" => match raw.get("event") {
            Some(event) => map_stream_event(event, state),
            None => Vec::new(),
        },
        "message_start" | "content_block_start" | "content_block_delta" | "content_block_stop" => {
            map_stream_event(raw, state)
        }
        "assistant" => map_assistant(raw, state),
        "user" => map_user(raw, state),
        "result" => map_result(raw, state),
        _ => Vec::new(),
    }
}

fn map_stream_event(event: &Value, state: &mut ClaudeMapState) -> Vec<AgentEvent> {
    let index = event.get("index").and_then(Value::as_u64);
    match event.get("type").and_then(Value::as_str).unwrap_or("") {
        "message_start" => {
            let message = event.get("message").unwrap_or(&Value::Null);
            let role = parse_role(message).unwrap_or(Role::Assistant);
            if let Some(id) = message.get("id").and_then(Value::as_str) {
                state.streamed_messages.insert(id.to_string());
                if !state.announced_messages.insert(id.to_string()) {
                    return Vec::new();
                }
            }
            vec![AgentEvent::MessageStart { role }]
        }
        "content_block_start" => {
            let block = event.get("content_block").unwrap_or(&Value::Null);
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") | Some("server_tool_use") => {
                    let (Some(index), Some(id), Some(name)) =
                        (index, first_str(block, &["id"]), first_str(block, &["name"]))
                    else {
                        return Vec::new();
                    };
                    state.tool_blocks.insert(
                        index,
                        ToolBlock {
                            id: id.to_string(),
                            name: name.to_string(),
                            json: String::new(),
                        },
                    );
                    start_tool(state, id, name, None).into_iter().collect()
                }
                Some("text") => match block.get("text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => vec![AgentEvent::TextDelta {
                        text: text.to_string(),
                    }],
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let delta = event.get("delta").unwrap_or(&Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => match delta.get("text").and_then(Value::as_str) {
                    Some(text) if !text.is_empty() => vec![AgentEvent::TextDelta {
                        text: text.to_string(),
                    }],
                    _ => Vec::new(),
                },
                Some("input_json_delta") => {
                    if let (Some(index), Some(fragment)) =
                        (index, delta.get("partial_json").and_then(Value::as_str))
                        && let Some(block) = state.tool_blocks.get_mut(&index)
                    {
                        block.json.push_str(fragment);
                    }
                    Vec::new()
                }
                _ => Vec::new(),
            }
        }
        "content_block_stop" => {
            let Some(block) = index.and_then(|i| state.tool_blocks.remove(&i)) else {
                return Vec::new();
            };
            let output = serde_json::from_str::<Value>(&block.json)
                .unwrap_or_else(|_| Value::String(block.json.clone()));
            end_tool(state, &block.id, output, false).into_iter().collect()
        }
        _ => Vec::new(),
    }
}

fn map_assistant(raw: &Value, state: &mut ClaudeMapState) -> Vec<AgentEvent> {
    let Some(message) = raw.get("message") else {
        return Vec::new();
    };
    let id = message
        .get("id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let streamed = state.streamed_messages.contains(&id);
    let mut events = Vec::new();
    if state.announced_messages.insert(id.clone()) {
        events.push(AgentEvent::MessageStart {
            role: Role::Assistant,
        });
    }

    let content = parse_content(message.get("content"));
    for block in &content {
        match block {
            ContentBlock::Text { text } if !streamed && !text.is_empty() => {
                events.push(AgentEvent::TextDelta { text: text.clone() });
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.extend(start_tool(state, id, name, Some(input.clone())));
            }
            _ => {}
        }
    }

    let message = AgentMessage::new(id, Role::Assistant, content).with_raw(raw.clone());
    events.push(AgentEvent::MessageEnd { message });
    events
}

fn map_user(raw: &Value, state: &mut ClaudeMapState) -> Vec<AgentEvent> {
    let Some(message) = raw.get("message") else {
        return Vec::new();
    };
    let content = parse_content(message.get("content"));
    let mut events = Vec::new();
    for block in &content {
        if let ContentBlock::ToolResult {
            id,
            output,
            is_error,
        } = block
        {
            events.extend(end_tool(state, id, output.clone(), *is_error));
        }
    }
    let id = first_str(raw, &["uuid"])
        .or_else(|| first_str(message, &["id"]))
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let message = AgentMessage::new(id, Role::User, content).with_raw(raw.clone());
    events.push(AgentEvent::MessageEnd { message });
    events
}

fn map_result(raw: &Value, state: &mut ClaudeMapState) -> Vec<AgentEvent> {
    state.result = Some(raw.clone());
    let subtype = raw.get("subtype").and_then(Value::as_str).unwrap_or("success");
    let is_error = raw.get("is_error").and_then(Value::as_bool).unwrap_or(false);
    if subtype == "success" && !is_error {
        return vec![AgentEvent::TurnEnd {
            usage: Some(parse_usage(raw)),
        }];
    }

    let detail = result_error_text(raw);
    let kind = match subtype {
        "error_max_turns" => ErrorKind::TurnLimit,
        "error_max_budget_usd" => ErrorKind::BudgetExceeded,
        _ => classify_message(&detail),
    };
    let message = if detail.is_empty() {
        format!("Claude turn failed ({subtype})")
    } else {
        detail
    };
    vec![AgentEvent::Error {
        error: AgentError::new(kind, CLAUDE_BACKEND, message).with_raw(raw.clone()),
    }]
}

fn result_error_text(raw: &Value) -> String {
    if let Some(errors) = raw.get("errors").and_then(Value::as_array) {
        let joined = errors
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("; ");
        if !joined.is_empty() {
            return joined;
        }
    }
    first_str(raw, &["result", "error"]).unwrap_or_default().to_string()
}

/// Extracts usage, cost and timing from a `result` message.
pub(crate) fn parse_usage(raw: &Value) -> Usage {
    let usage = raw.get("usage").unwrap_or(&Value::Null);
    Usage {
        input_tokens: first_u64(usage, &["input_tokens"]).unwrap_or(0),
        output_tokens: first_u64(usage, &["output_tokens"]).unwrap_or(0),
        cache_read_tokens: first_u64(usage, &["cache_read_input_tokens"]),
        cache_write_tokens: first_u64(usage, &["cache_creation_input_tokens"]),
        total_cost_usd: raw
            .get("total_cost_usd")
            .or_else(|| raw.get("cost_usd"))
            .and_then(Value::as_f64),
        duration_ms: first_u64(raw, &["duration_ms"]),
        num_turns: first_u64(raw, &["num_turns"]).and_then(|n| u32::try_from(n).ok()),
    }
}

fn start_tool(
    state: &mut ClaudeMapState,
    id: &str,
    name: &str,
    input: Option<Value>,
) -> Option<AgentEvent> {
    if !state.started_tools.insert(id.to_string()) {
        return None;
    }
    state.open_tools.insert(id.to_string());
    Some(AgentEvent::ToolStart {
        id: id.to_string(),
        name: name.to_string(),
        input,
    })
}

fn end_tool(state: &mut ClaudeMapState, id: &str, output: Value, is_error: bool) -> Option<AgentEvent> {
    if !state.open_tools.remove(id) {
        return None;
    }
    Some(AgentEvent::ToolEnd {
        id: id.to_string(),
        output,
        is_error,
    })
}

fn parse_role(message: &Value) -> Option<Role> {
    match message.get("role").and_then(Value::as_str)? {
        "user" => Some(Role::User),
        "assistant" => Some(Role::Assistant),
        "system" => Some(Role::System),
        _ => None,
    }
}

fn parse_content(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(blocks)) => blocks.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type").and_then(Value::as_str)? {
        "text" => Some(ContentBlock::Text {
            text: first_str(block, &["text"])?.to_string(),
        }),
        "thinking" => Some(ContentBlock::Reasoning {
            text: first_str(block, &["thinking", "text"])?.to_string(),
        }),
        "tool_use" | "server_tool_use" => Some(ContentBlock::ToolUse {
            id: first_str(block, &["id"])?.to_string(),
            name: first_str(block, &["name"])?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            id: first_str(block, &["tool_use_id", "tool_call_id"])?.to_string(),
            output: tool_result_output(block.get("content")),
            is_error: block.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        }),
        _ => None,
    }
}

fn tool_result_output(content: Option<&Value>) -> Value {
    match content {
        Some(Value::Array(parts)) => {
            let texts = parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>();
            if texts.len() == parts.len() {
                Value::String(texts.join("\n"))
            } else {
                Value::Array(parts.clone())
            }
        }
        Some(other) => other.clone(),
        None => Value::Null,
    }
}
