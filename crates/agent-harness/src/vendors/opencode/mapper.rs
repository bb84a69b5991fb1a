//! OpenCode server events to canonical events.
//!
//! The server publishes one global event feed for every session. Callers must
//! drop events for other sessions (see [`event_session_id`]) before mapping,
//! and use [`is_terminal`] to decide when a turn is over.
//!
//! Parts can arrive before the `message.updated` event that reveals their
//! message's role. Such events are parked until the role is known so user
//! prompts are never echoed back as assistant output.

use std::collections::{HashMap, HashSet};

use serde_json::Value;
use tracing::warn;

use crate::errors::{AgentError, ErrorKind};
use crate::event::AgentEvent;
use crate::message::{AgentMessage, ContentBlock, FileOperation, Role, Usage};
use crate::vendors::{classify_message, first_field, first_str, first_u64};

use super::OPENCODE_BACKEND;

/// Upper bound on events held back for messages whose role is unknown.
const MAX_PARKED_EVENTS: usize = 512;

/// Mutable state carried between calls to [`map_event`].
#[derive(Debug, Default)]
pub struct OpencodeMapState {
    roles: HashMap<String, Role>,
    parked: HashMap<String, Vec<Value>>,
    parked_count: usize,
    drafts: HashMap<String, Vec<(String, ContentBlock)>>,
    part_kinds: HashMap<String, String>,
    seen_text: HashMap<String, usize>,
    announced: Vec<String>,
    ended: HashSet<String>,
    tools_started: HashSet<String>,
    tools_ended: HashSet<String>,
    usage: HashMap<String, Usage>,
    turn_closed: bool,
}

impl OpencodeMapState {
    /// Usage summed over the assistant messages seen so far.
    pub fn usage(&self) -> Option<Usage> {
        if self.usage.is_empty() {
            return None;
        }
        Some(self.usage.values().fold(Usage::default(), |mut total, usage| {
            total.input_tokens += usage.input_tokens;
            total.output_tokens += usage.output_tokens;
            total.cache_read_tokens = add_opt(total.cache_read_tokens, usage.cache_read_tokens);
            total.cache_write_tokens = add_opt(total.cache_write_tokens, usage.cache_write_tokens);
            total.total_cost_usd = match (total.total_cost_usd, usage.total_cost_usd) {
                (Some(a), Some(b)) => Some(a + b),
                (a, b) => a.or(b),
            };
            total
        }))
    }
}

fn add_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, b) => a.or(b),
    }
}

/// Session an event belongs to, if it names one.
pub fn event_session_id(raw: &Value) -> Option<&str> {
    let props = raw.get("properties")?;
    first_str(props, &["sessionID"])
        .or_else(|| props.get("info").and_then(|info| first_str(info, &["sessionID"])))
        .or_else(|| props.get("part").and_then(|part| first_str(part, &["sessionID"])))
}

/// Returns true when `raw` ends the running turn of `session_id`.
pub fn is_terminal(raw: &Value, session_id: &str) -> bool {
    if event_session_id(raw) != Some(session_id) {
        return false;
    }
    match raw.get("type").and_then(Value::as_str) {
        Some("session.idle" | "session.error") => true,
        Some("session.status") => is_idle_status(raw),
        _ => false,
    }
}

fn is_idle_status(raw: &Value) -> bool {
    let status = raw.pointer("/properties/status");
    let kind = status.and_then(|s| first_str(s, &["type"]).or_else(|| s.as_str()));
    kind == Some("idle")
}

/// Maps one raw OpenCode event. Unknown shapes yield no events.
pub fn map_event(raw: &Value, state: &mut OpencodeMapState) -> Vec<AgentEvent> {
    let props = raw.get("properties").unwrap_or(&Value::Null);
    match raw.get("type").and_then(Value::as_str).unwrap_or("") {
        "message.updated" => match props.get("info") {
            Some(info) => message_updated(raw, info, state),
            None => Vec::new(),
        },
        "message.part.updated" => match props.get("part") {
            Some(part) => part_updated(raw, part, first_str(props, &["delta"]), state),
            None => Vec::new(),
        },
        "message.part.delta" => part_delta(raw, props, state),
        "session.idle" => close_turn(state),
        "session.status" if is_idle_status(raw) => close_turn(state),
        "session.error" => vec![AgentEvent::Error {
            error: session_error(raw, props),
        }],
        _ => Vec::new(),
    }
}

/// Parks `raw` when its message role is still unknown. Returns true if the
/// event belongs to an assistant message and should be mapped now.
fn assistant_or_park(raw: &Value, message_id: &str, state: &mut OpencodeMapState) -> bool {
    match state.roles.get(message_id) {
        Some(Role::Assistant) => true,
        Some(_) => false,
        None => {
            if state.parked_count >= MAX_PARKED_EVENTS {
                warn!(
                    backend = OPENCODE_BACKEND,
                    message_id, "dropping event for message with unknown role"
                );
                return false;
            }
            state.parked_count += 1;
            state
                .parked
                .entry(message_id.to_string())
                .or_default()
                .push(raw.clone());
            false
        }
    }
}

fn announce(message_id: &str, state: &mut OpencodeMapState) -> Option<AgentEvent> {
    if state.announced.iter().any(|id| id == message_id) {
        return None;
    }
    state.announced.push(message_id.to_string());
    Some(AgentEvent::MessageStart {
        role: Role::Assistant,
    })
}

fn message_updated(raw: &Value, info: &Value, state: &mut OpencodeMapState) -> Vec<AgentEvent> {
    let Some(id) = first_str(info, &["id"]) else {
        return Vec::new();
    };
    let role = match first_str(info, &["role"]) {
        Some("assistant") => Role::Assistant,
        Some("user") => Role::User,
        Some("system") => Role::System,
        _ => return Vec::new(),
    };
    let newly_known = state.roles.insert(id.to_string(), role).is_none();
    let mut events = Vec::new();
    if role == Role::Assistant {
        events.extend(announce(id, state));
    }
    if newly_known {
        let parked = state.parked.remove(id).unwrap_or_default();
        state.parked_count = state.parked_count.saturating_sub(parked.len());
        for parked in parked {
            events.extend(map_event(&parked, state));
        }
    }
    if role != Role::Assistant {
        return events;
    }

    if let Some(usage) = message_usage(info) {
        state.usage.insert(id.to_string(), usage);
    }
    let completed = info.pointer("/time/completed").is_some_and(|v| !v.is_null());
    if completed && state.ended.insert(id.to_string()) {
        events.push(end_message(id, Some(raw), state));
    }
    events
}

fn end_message(id: &str, raw: Option<&Value>, state: &mut OpencodeMapState) -> AgentEvent {
    let content = state
        .drafts
        .remove(id)
        .unwrap_or_default()
        .into_iter()
        .map(|(_, block)| block)
        .collect();
    let mut message = AgentMessage::new(id, Role::Assistant, content);
    if let Some(raw) = raw {
        message = message.with_raw(raw.clone());
    }
    AgentEvent::MessageEnd { message }
}

fn message_usage(info: &Value) -> Option<Usage> {
    let tokens = info.get("tokens")?;
    let cache = tokens.get("cache").unwrap_or(&Value::Null);
    Some(Usage {
        input_tokens: first_u64(tokens, &["input"]).unwrap_or(0),
        output_tokens: first_u64(tokens, &["output"]).unwrap_or(0)
            + first_u64(tokens, &["reasoning"]).unwrap_or(0),
        cache_read_tokens: first_u64(cache, &["read"]),
        cache_write_tokens: first_u64(cache, &["write"]),
        total_cost_usd: info.get("cost").and_then(Value::as_f64),
        ..Usage::default()
    })
}

fn upsert(state: &mut OpencodeMapState, message_id: &str, key: String, block: ContentBlock) {
    let draft = state.drafts.entry(message_id.to_string()).or_default();
    match draft.iter_mut().find(|(k, _)| *k == key) {
        Some(slot) => slot.1 = block,
        None => draft.push((key, block)),
    }
}

fn draft_text(state: &OpencodeMapState, message_id: &str, key: &str) -> String {
    state
        .drafts
        .get(message_id)
        .and_then(|draft| draft.iter().find(|(k, _)| k == key))
        .map(|(_, block)| match block {
            ContentBlock::Text { text } | ContentBlock::Reasoning { text } => text.clone(),
            _ => String::new(),
        })
        .unwrap_or_default()
}

fn part_updated(
    raw: &Value,
    part: &Value,
    delta: Option<&str>,
    state: &mut OpencodeMapState,
) -> Vec<AgentEvent> {
    let (Some(part_id), Some(message_id), Some(kind)) = (
        first_str(part, &["id"]),
        first_str(part, &["messageID"]),
        first_str(part, &["type"]),
    ) else {
        return Vec::new();
    };
    if !assistant_or_park(raw, message_id, state) {
        return Vec::new();
    }
    state.part_kinds.insert(part_id.to_string(), kind.to_string());

    let mut events: Vec<AgentEvent> = announce(message_id, state).into_iter().collect();
    match kind {
        "text" => {
            let text = first_str(part, &["text"]).unwrap_or_default();
            let seen = state.seen_text.get(part_id).copied().unwrap_or(0);
            let (fresh, full) = match delta {
                Some(delta) if text.is_empty() => {
                    let mut full = draft_text(state, message_id, part_id);
                    full.push_str(delta);
                    (delta.to_string(), full)
                }
                Some(delta) => (delta.to_string(), text.to_string()),
                None if text.len() > seen && text.is_char_boundary(seen) => {
                    (text[seen..].to_string(), text.to_string())
                }
                None => (String::new(), text.to_string()),
            };
            state.seen_text.insert(part_id.to_string(), full.len().max(seen));
            upsert(state, message_id, part_id.to_string(), ContentBlock::Text { text: full });
            if !fresh.is_empty() {
                events.push(AgentEvent::TextDelta { text: fresh });
            }
        }
        "reasoning" => {
            let text = first_str(part, &["text"]).unwrap_or_default().to_string();
            upsert(state, message_id, part_id.to_string(), ContentBlock::Reasoning { text });
        }
        "tool" => events.extend(tool_part(part, part_id, message_id, state)),
        "patch" => {
            let files = part.get("files").and_then(Value::as_array).cloned().unwrap_or_default();
            for path in files.iter().filter_map(Value::as_str) {
                upsert(
                    state,
                    message_id,
                    format!("{part_id}:{path}"),
                    ContentBlock::FileChange {
                        path: path.to_string(),
                        operation: FileOperation::Edit,
                        diff: None,
                    },
                );
            }
        }
        _ => {}
    }
    events
}

fn part_delta(raw: &Value, props: &Value, state: &mut OpencodeMapState) -> Vec<AgentEvent> {
    let (Some(message_id), Some(part_id), Some(delta)) = (
        first_str(props, &["messageID"]),
        first_str(props, &["partID"]),
        first_str(props, &["delta"]),
    ) else {
        return Vec::new();
    };
    if !assistant_or_park(raw, message_id, state) {
        return Vec::new();
    }
    // Deltas for parts not announced yet are recovered by diffing the next
    // `message.part.updated` snapshot.
    let kind = state.part_kinds.get(part_id).cloned();
    let field = first_str(props, &["field"]).unwrap_or("text");
    let mut events: Vec<AgentEvent> = Vec::new();
    match (kind.as_deref(), field) {
        (Some("text"), "text") => {
            events.extend(announce(message_id, state));
            let mut text = draft_text(state, message_id, part_id);
            text.push_str(delta);
            state.seen_text.insert(part_id.to_string(), text.len());
            upsert(state, message_id, part_id.to_string(), ContentBlock::Text { text });
            events.push(AgentEvent::TextDelta {
                text: delta.to_string(),
            });
        }
        (Some("reasoning"), "text") => {
            let mut text = draft_text(state, message_id, part_id);
            text.push_str(delta);
            upsert(state, message_id, part_id.to_string(), ContentBlock::Reasoning { text });
        }
        _ => {}
    }
    events
}

fn tool_part(
    part: &Value,
    part_id: &str,
    message_id: &str,
    state: &mut OpencodeMapState,
) -> Vec<AgentEvent> {
    let call_id = first_str(part, &["callID"])
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| format!("{OPENCODE_BACKEND}:{part_id}"));
    let name = first_str(part, &["tool"]).unwrap_or("tool").to_string();
    let tool_state = part.get("state").unwrap_or(&Value::Null);
    let status = first_str(tool_state, &["status"]).unwrap_or("pending");
    let input = first_field(tool_state, &["input"]).cloned();

    let mut events = Vec::new();
    if state.tools_started.insert(call_id.clone()) {
        events.push(AgentEvent::ToolStart {
            id: call_id.clone(),
            name: name.clone(),
            input: input.clone(),
        });
    }
    upsert(
        state,
        message_id,
        part_id.to_string(),
        ContentBlock::ToolUse {
            id: call_id.clone(),
            name,
            input: input.unwrap_or(Value::Null),
        },
    );

    let is_error = status == "error";
    if (status == "completed" || is_error) && state.tools_ended.insert(call_id.clone()) {
        let output = if is_error {
            first_field(tool_state, &["error"]).cloned().unwrap_or(Value::Null)
        } else {
            first_field(tool_state, &["output"]).cloned().unwrap_or(Value::Null)
        };
        events.push(AgentEvent::ToolEnd {
            id: call_id.clone(),
            output: output.clone(),
            is_error,
        });
        upsert(
            state,
            message_id,
            format!("{part_id}:result"),
            ContentBlock::ToolResult {
                id: call_id,
                output,
                is_error,
            },
        );
    }
    events
}

fn close_turn(state: &mut OpencodeMapState) -> Vec<AgentEvent> {
    if state.turn_closed {
        return Vec::new();
    }
    state.turn_closed = true;
    let open: Vec<String> = state
        .announced
        .iter()
        .filter(|id| !state.ended.contains(*id))
        .cloned()
        .collect();
    let mut events = Vec::new();
    for id in open {
        state.ended.insert(id.clone());
        events.push(end_message(&id, None, state));
    }
    events.push(AgentEvent::TurnEnd {
        usage: state.usage(),
    });
    // Per-part bookkeeping is dead once the session is idle.
    state.parked.clear();
    state.parked_count = 0;
    state.drafts.clear();
    state.part_kinds.clear();
    state.seen_text.clear();
    events
}

fn session_error(raw: &Value, props: &Value) -> AgentError {
    let error = props.get("error").unwrap_or(&Value::Null);
    let name = first_str(error, &["name"]).unwrap_or("UnknownError");
    let message = error
        .get("data")
        .and_then(|data| first_str(data, &["message"]))
        .or_else(|| first_str(error, &["message"]))
        .unwrap_or(name)
        .to_string();
    let kind = match name {
        "MessageAbortedError" => ErrorKind::Abort,
        "ProviderAuthError" => ErrorKind::Provider,
        _ => classify_message(&message),
    };
    AgentError::new(kind, OPENCODE_BACKEND, message).with_raw(raw.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(id: &str, role: &str) -> Value {
        json!({"type": "message.updated", "properties": {"info": {
            "id": id, "sessionID": "ses_1", "role": role, "time": {"created": 1}
        }}})
    }

    fn completed(id: &str) -> Value {
        json!({"type": "message.updated", "properties": {"info": {
            "id": id, "sessionID": "ses_1", "role": "assistant",
            "time": {"created": 1, "completed": 2},
            "cost": 0.01,
            "tokens": {"input": 40, "output": 4, "reasoning": 1, "cache": {"read": 8, "write": 0}}
        }}})
    }

    fn part(message_id: &str, part: Value) -> Value {
        let mut part = part;
        part["messageID"] = json!(message_id);
        part["sessionID"] = json!("ses_1");
        json!({"type": "message.part.updated", "properties": {"part": part}})
    }

    fn run(events: &[Value], state: &mut OpencodeMapState) -> Vec<AgentEvent> {
        events.iter().flat_map(|e| map_event(e, state)).collect()
    }

    fn deltas(events: &[AgentEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::TextDelta { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn unknown_event_type_yields_nothing() {
        let mut state = OpencodeMapState::default();
        assert!(map_event(&json!({"type": "server.connected", "properties": {}}), &mut state).is_empty());
        assert!(map_event(&json!({"type": "lsp.updated"}), &mut state).is_empty());
        assert!(map_event(&json!({}), &mut state).is_empty());
    }

    #[test]
    fn session_filter_and_terminal_predicate() {
        let idle = json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}});
        assert_eq!(event_session_id(&idle), Some("ses_1"));
        assert!(is_terminal(&idle, "ses_1"));
        assert!(!is_terminal(&idle, "ses_2"));

        let busy = json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "busy"}}});
        let settled = json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "idle"}}});
        assert!(!is_terminal(&busy, "ses_1"));
        assert!(is_terminal(&settled, "ses_1"));

        assert_eq!(event_session_id(&message("msg_1", "user")), Some("ses_1"));
        assert_eq!(
            event_session_id(&part("msg_1", json!({"id": "prt_1", "type": "text"}))),
            Some("ses_1")
        );
        assert_eq!(event_session_id(&json!({"type": "server.connected"})), None);
    }

    #[test]
    fn user_parts_are_never_echoed() {
        let mut state = OpencodeMapState::default();
        let events = run(
            &[
                part("msg_u", json!({"id": "prt_u", "type": "text", "text": "Reply with exactly: HELLO"})),
                message("msg_u", "user"),
                part("msg_u", json!({"id": "prt_u", "type": "text", "text": "Reply with exactly: HELLO"})),
            ],
            &mut state,
        );
        assert!(events.is_empty());
    }

    #[test]
    fn parked_assistant_parts_replay_after_role_is_known() {
        let mut state = OpencodeMapState::default();
        let events = run(
            &[
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": "HEL"})),
                message("msg_a", "assistant"),
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": "HELLO"})),
                completed("msg_a"),
            ],
            &mut state,
        );
        assert!(matches!(events[0], AgentEvent::MessageStart { role: Role::Assistant }));
        assert_eq!(deltas(&events), "HELLO");
        let AgentEvent::MessageEnd { message } = events.last().expect("events") else {
            panic!("expected message end, got {events:?}");
        };
        assert_eq!(message.text(), "HELLO");
        let usage = state.usage().expect("usage");
        assert_eq!((usage.input_tokens, usage.output_tokens), (40, 5));
        assert_eq!(usage.cache_read_tokens, Some(8));
    }

    #[test]
    fn idle_drops_parts_whose_role_never_arrived() {
        let mut state = OpencodeMapState::default();
        run(
            &[
                message("msg_a", "assistant"),
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": "hi"})),
                part("msg_ghost", json!({"id": "prt_g", "type": "text", "text": "lost"})),
                json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
            ],
            &mut state,
        );
        assert!(state.parked.is_empty());
        assert_eq!(state.parked_count, 0);
        assert!(state.seen_text.is_empty());
        assert!(state.part_kinds.is_empty());
        assert!(state.drafts.is_empty());
    }

    #[test]
    fn parked_events_are_capped() {
        let mut state = OpencodeMapState::default();
        let flood: Vec<Value> = (0..MAX_PARKED_EVENTS + 10)
            .map(|n| part(&format!("msg_{n}"), json!({"id": format!("prt_{n}"), "type": "text", "text": "x"})))
            .collect();
        assert!(run(&flood, &mut state).is_empty());
        assert_eq!(state.parked_count, MAX_PARKED_EVENTS);
        assert_eq!(state.parked.values().map(Vec::len).sum::<usize>(), MAX_PARKED_EVENTS);
        assert!(state.part_kinds.is_empty());
    }

    #[test]
    fn explicit_deltas_are_used_verbatim() {
        let mut state = OpencodeMapState::default();
        let events = run(
            &[
                message("msg_a", "assistant"),
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": ""})),
                json!({"type": "message.part.delta", "properties": {
                    "sessionID": "ses_1", "messageID": "msg_a", "partID": "prt_1", "field": "text", "delta": "HI"
                }}),
                json!({"type": "message.part.updated", "properties": {
                    "part": {"id": "prt_1", "messageID": "msg_a", "sessionID": "ses_1", "type": "text", "text": "HI!"},
                    "delta": "!"
                }}),
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": "HI!"})),
            ],
            &mut state,
        );
        assert_eq!(deltas(&events), "HI!");
    }

    #[test]
    fn tool_part_lifecycle_and_patch() {
        let mut state = OpencodeMapState::default();
        let events = run(
            &[
                message("msg_a", "assistant"),
                part("msg_a", json!({"id": "prt_t", "type": "tool", "callID": "call_1", "tool": "bash",
                    "state": {"status": "pending", "input": {}}})),
                part("msg_a", json!({"id": "prt_t", "type": "tool", "callID": "call_1", "tool": "bash",
                    "state": {"status": "running", "input": {"command": "ls"}}})),
                part("msg_a", json!({"id": "prt_t", "type": "tool", "callID": "call_1", "tool": "bash",
                    "state": {"status": "completed", "input": {"command": "ls"}, "output": "a.txt"}})),
                part("msg_a", json!({"id": "prt_p", "type": "patch", "hash": "abc", "files": ["/w/a.txt"]})),
                part("msg_a", json!({"id": "prt_x", "type": "tool", "tool": "read",
                    "state": {"status": "error", "input": {"path": "nope"}, "error": "not found"}})),
                completed("msg_a"),
            ],
            &mut state,
        );
        let tool_events: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::ToolStart { .. } | AgentEvent::ToolEnd { .. }))
            .collect();
        assert_eq!(tool_events.len(), 4);
        assert_eq!(
            tool_events[1],
            &AgentEvent::ToolEnd {
                id: "call_1".into(),
                output: json!("a.txt"),
                is_error: false,
            }
        );
        assert_eq!(
            tool_events[3],
            &AgentEvent::ToolEnd {
                id: "opencode:prt_x".into(),
                output: json!("not found"),
                is_error: true,
            }
        );
        let AgentEvent::MessageEnd { message } = events.last().expect("events") else {
            panic!("expected message end");
        };
        assert!(message.content.contains(&ContentBlock::FileChange {
            path: "/w/a.txt".into(),
            operation: FileOperation::Edit,
            diff: None,
        }));
        assert!(matches!(&message.content[0], ContentBlock::ToolUse { input, .. } if input == &json!({"command": "ls"})));
    }

    #[test]
    fn idle_flushes_open_messages_and_closes_turn_once() {
        let mut state = OpencodeMapState::default();
        let events = run(
            &[
                message("msg_a", "assistant"),
                part("msg_a", json!({"id": "prt_1", "type": "text", "text": "partial"})),
                json!({"type": "session.idle", "properties": {"sessionID": "ses_1"}}),
                json!({"type": "session.status", "properties": {"sessionID": "ses_1", "status": {"type": "idle"}}}),
            ],
            &mut state,
        );
        let ends = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::TurnEnd { .. }))
            .count();
        assert_eq!(ends, 1);
        assert!(matches!(&events[events.len() - 2], AgentEvent::MessageEnd { message } if message.text() == "partial"));
    }

    #[test]
    fn session_errors_map_to_kinds() {
        let mut state = OpencodeMapState::default();
        let aborted = map_event(
            &json!({"type": "session.error", "properties": {"sessionID": "ses_1",
                "error": {"name": "MessageAbortedError", "data": {"message": "Aborted"}}}}),
            &mut state,
        );
        assert!(matches!(&aborted[0], AgentEvent::Error { error } if error.kind == ErrorKind::Abort));
        let auth = map_event(
            &json!({"type": "session.error", "properties": {"sessionID": "ses_1",
                "error": {"name": "ProviderAuthError", "data": {"providerID": "x", "message": "bad key"}}}}),
            &mut state,
        );
        assert!(matches!(&auth[0], AgentEvent::Error { error } if error.kind == ErrorKind::Provider && error.message == "bad key"));
    }
}
