//! Codex `exec --json` events to canonical events.
//!
//! Codex reports whole items (`item.started` / `item.completed`) instead of
//! token deltas. Event and item type names show up both as `snake_case` and
//! `camelCase` depending on the Codex build, so both are normalized before
//! matching, and every field is looked up under both spellings.

use std::collections::{HashSet, VecDeque};

use serde_json::{Value, json};

use crate::errors::AgentError;
use crate::event::AgentEvent;
use crate::message::{AgentMessage, ContentBlock, FileOperation, Role, Usage};
use crate::vendors::{classify_message, first_field, first_str, first_u64};

use super::CODEX_BACKEND;

/// Mutable state carried between calls to [`map_event`].
#[derive(Debug, Default)]
pub struct CodexMapState {
    thread_id: Option<String>,
    announced_messages: HashSet<String>,
    started_tools: HashSet<String>,
    ended_tools: HashSet<String>,
    anonymous_seq: u64,
    /// Items started without an id, oldest first, awaiting their completion.
    anonymous_open: VecDeque<(ItemKind, String)>,
}

impl CodexMapState {
    /// Thread id reported by `thread.started`, once seen.
    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    AgentMessage,
    Reasoning,
    Command,
    FileChange,
    McpToolCall,
    WebSearch,
}

/// Lowercases and strips separators so `item.completed`, `item/completed`,
/// `agent_message` and `agentMessage` compare equal to their compact forms.
fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '.' | '/' | '_' | '-'))
        .flat_map(char::to_lowercase)
        .collect()
}

fn item_kind(item: &Value) -> Option<ItemKind> {
    let kind = normalize(first_str(item, &["type", "item_type", "itemType"])?);
    match kind.as_str() {
        "agentmessage" => Some(ItemKind::AgentMessage),
        "reasoning" => Some(ItemKind::Reasoning),
        "commandexecution" => Some(ItemKind::Command),
        "filechange" => Some(ItemKind::FileChange),
        "mcptoolcall" => Some(ItemKind::McpToolCall),
        "websearch" => Some(ItemKind::WebSearch),
        _ => None,
    }
}

/// Maps one raw Codex event. Unknown shapes yield no events.
pub fn map_event(raw: &Value, state: &mut CodexMapState) -> Vec<AgentEvent> {
    let Some(kind) = first_str(raw, &["type"]).map(normalize) else {
        return Vec::new();
    };
    match kind.as_str() {
        "threadstarted" => {
            if let Some(id) = first_str(raw, &["thread_id", "threadId"]) {
                state.thread_id = Some(id.to_string());
            }
            Vec::new()
        }
        "itemstarted" => match raw.get("item") {
            Some(item) => item_started(item, state),
            None => Vec::new(),
        },
        "itemcompleted" => match raw.get("item") {
            Some(item) => item_completed(raw, item, state),
            None => Vec::new(),
        },
        "turncompleted" => vec![AgentEvent::TurnEnd {
            usage: Some(parse_usage(raw.get("usage").unwrap_or(&Value::Null))),
        }],
        "turnfailed" => {
            let message = raw
                .get("error")
                .and_then(|e| first_str(e, &["message"]).or_else(|| e.as_str()))
                .unwrap_or("Codex turn failed");
            vec![error_event(message, raw)]
        }
        "error" => {
            let message = first_str(raw, &["message"]).unwrap_or("Codex reported an error");
            vec![error_event(message, raw)]
        }
        _ => Vec::new(),
    }
}

fn error_event(message: &str, raw: &Value) -> AgentEvent {
    AgentEvent::Error {
        error: AgentError::new(classify_message(message), CODEX_BACKEND, message)
            .with_raw(raw.clone()),
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Started,
    Completed,
}

/// Item id, or a generated `anon-{n}` for items that carry none.
///
/// A completed item without an id closes the oldest open anonymous item of
/// the same kind.
fn item_id(item: &Value, kind: ItemKind, phase: Phase, state: &mut CodexMapState) -> String {
    if let Some(id) = first_str(item, &["id", "item_id", "itemId"]) {
        return id.to_string();
    }
    if phase == Phase::Completed
        && let Some(index) = state.anonymous_open.iter().position(|(k, _)| *k == kind)
        && let Some((_, id)) = state.anonymous_open.remove(index)
    {
        return id;
    }
    state.anonymous_seq += 1;
    let id = format!("anon-{}", state.anonymous_seq);
    if phase == Phase::Started {
        state.anonymous_open.push_back((kind, id.clone()));
    }
    id
}

/// Explicit call id when present, otherwise a composite of backend and item id.
fn tool_id(item: &Value, item_id: &str) -> String {
    match first_str(item, &["call_id", "callId"]) {
        Some(id) => id.to_string(),
        None => format!("{CODEX_BACKEND}:{item_id}"),
    }
}

fn item_started(item: &Value, state: &mut CodexMapState) -> Vec<AgentEvent> {
    let Some(kind) = item_kind(item) else {
        return Vec::new();
    };
    match kind {
        ItemKind::AgentMessage => {
            let id = item_id(item, kind, Phase::Started, state);
            if state.announced_messages.insert(id) {
                vec![AgentEvent::MessageStart {
                    role: Role::Assistant,
                }]
            } else {
                Vec::new()
            }
        }
        ItemKind::Command | ItemKind::FileChange | ItemKind::McpToolCall | ItemKind::WebSearch => {
            let id = item_id(item, kind, Phase::Started, state);
            start_tool(item, kind, &id, state).into_iter().collect()
        }
        ItemKind::Reasoning => Vec::new(),
    }
}

fn item_completed(raw: &Value, item: &Value, state: &mut CodexMapState) -> Vec<AgentEvent> {
    let Some(kind) = item_kind(item) else {
        return Vec::new();
    };
    let id = item_id(item, kind, Phase::Completed, state);
    match kind {
        ItemKind::AgentMessage => {
            let text = first_str(item, &["text", "message"]).unwrap_or_default().to_string();
            let mut events = Vec::new();
            if state.announced_messages.insert(id.clone()) {
                events.push(AgentEvent::MessageStart {
                    role: Role::Assistant,
                });
            }
            if !text.is_empty() {
                events.push(AgentEvent::TextDelta { text: text.clone() });
            }
            let message = AgentMessage::new(id, Role::Assistant, vec![ContentBlock::Text { text }])
                .with_raw(raw.clone());
            events.push(AgentEvent::MessageEnd { message });
            events
        }
        ItemKind::Reasoning => {
            let text = first_str(item, &["text", "summary"]).unwrap_or_default().to_string();
            let message = AgentMessage::new(id, Role::Assistant, vec![ContentBlock::Reasoning { text }])
                .with_raw(raw.clone());
            vec![AgentEvent::MessageEnd { message }]
        }
        ItemKind::Command | ItemKind::FileChange | ItemKind::McpToolCall | ItemKind::WebSearch => {
            let call_id = tool_id(item, &id);
            let mut events: Vec<AgentEvent> = start_tool(item, kind, &id, state).into_iter().collect();
            let output = tool_output(item, kind);
            let is_error = tool_failed(item);
            if state.ended_tools.insert(call_id.clone()) {
                events.push(AgentEvent::ToolEnd {
                    id: call_id.clone(),
                    output: output.clone(),
                    is_error,
                });
            }
            let mut content = vec![
                ContentBlock::ToolUse {
                    id: call_id.clone(),
                    name: tool_name(item, kind),
                    input: tool_input(item, kind),
                },
                ContentBlock::ToolResult {
                    id: call_id,
                    output,
                    is_error,
                },
            ];
            if kind == ItemKind::FileChange {
                content.extend(file_changes(item));
            }
            let message = AgentMessage::new(id, Role::Assistant, content).with_raw(raw.clone());
            events.push(AgentEvent::MessageEnd { message });
            events
        }
    }
}

fn start_tool(item: &Value, kind: ItemKind, item_id: &str, state: &mut CodexMapState) -> Option<AgentEvent> {
    let id = tool_id(item, item_id);
    if !state.started_tools.insert(id.clone()) {
        return None;
    }
    Some(AgentEvent::ToolStart {
        id,
        name: tool_name(item, kind),
        input: Some(tool_input(item, kind)),
    })
}

fn tool_name(item: &Value, kind: ItemKind) -> String {
    match kind {
        ItemKind::Command => "command_execution".to_string(),
        ItemKind::FileChange => "file_change".to_string(),
        ItemKind::WebSearch => "web_search".to_string(),
        ItemKind::McpToolCall => match (first_str(item, &["server"]), first_str(item, &["tool"])) {
            (Some(server), Some(tool)) => format!("{server}.{tool}"),
            (None, Some(tool)) => tool.to_string(),
            _ => "mcp_tool_call".to_string(),
        },
        ItemKind::AgentMessage | ItemKind::Reasoning => String::new(),
    }
}

fn tool_input(item: &Value, kind: ItemKind) -> Value {
    match kind {
        ItemKind::Command => json!({ "command": first_field(item, &["command"]).cloned().unwrap_or(Value::Null) }),
        ItemKind::FileChange => json!({ "changes": first_field(item, &["changes"]).cloned().unwrap_or_else(|| json!([])) }),
        ItemKind::WebSearch => json!({ "query": first_str(item, &["query"]).unwrap_or_default() }),
        ItemKind::McpToolCall => first_field(item, &["arguments", "args"])
            .cloned()
            .unwrap_or_else(|| json!({})),
        ItemKind::AgentMessage | ItemKind::Reasoning => Value::Null,
    }
}

fn tool_output(item: &Value, kind: ItemKind) -> Value {
    match kind {
        ItemKind::Command => Value::String(
            first_str(item, &["aggregated_output", "aggregatedOutput", "output"])
                .unwrap_or_default()
                .to_string(),
        ),
        ItemKind::FileChange => first_field(item, &["changes"]).cloned().unwrap_or_else(|| json!([])),
        ItemKind::McpToolCall => first_field(item, &["result", "error"]).cloned().unwrap_or(Value::Null),
        ItemKind::WebSearch => first_field(item, &["results", "result"]).cloned().unwrap_or(Value::Null),
        ItemKind::AgentMessage | ItemKind::Reasoning => Value::Null,
    }
}

fn tool_failed(item: &Value) -> bool {
    let exit_code = first_field(item, &["exit_code", "exitCode"]).and_then(Value::as_i64);
    let status = first_str(item, &["status"]).map(normalize);
    exit_code.is_some_and(|code| code != 0)
        || matches!(status.as_deref(), Some("failed" | "error" | "declined"))
        || first_field(item, &["error"]).is_some()
}

fn file_changes(item: &Value) -> Vec<ContentBlock> {
    let Some(changes) = item.get("changes").and_then(Value::as_array) else {
        return Vec::new();
    };
    changes
        .iter()
        .filter_map(|change| {
            let path = first_str(change, &["path"])?.to_string();
            let operation = match first_str(change, &["kind", "type"]).map(normalize).as_deref() {
                Some("add" | "create") => FileOperation::Create,
                Some("delete" | "remove") => FileOperation::Delete,
                _ => FileOperation::Edit,
            };
            let diff = first_str(change, &["diff", "unified_diff", "unifiedDiff"]).map(ToOwned::to_owned);
            Some(ContentBlock::FileChange { path, operation, diff })
        })
        .collect()
}

fn parse_usage(usage: &Value) -> Usage {
    Usage {
        input_tokens: first_u64(usage, &["input_tokens", "inputTokens"]).unwrap_or(0),
        output_tokens: first_u64(usage, &["output_tokens", "outputTokens"]).unwrap_or(0),
        cache_read_tokens: first_u64(usage, &["cached_input_tokens", "cachedInputTokens"]),
        ..Usage::default()
    }
}
