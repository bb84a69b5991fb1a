//! Vendor integrations.
//!
//! Each vendor module has the same shape: a `mapper` translating raw provider
//! events into canonical events, a transport trait at the external SDK/CLI
//! boundary with one real implementation, and a backend/session/engine trio
//! wiring them into the canonical stream contract.

pub mod claude;
pub mod codex;
pub mod opencode;

use serde_json::Value;

use crate::errors::ErrorKind;

/// Returns the first present field among `keys`.
pub(crate) fn first_field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .find_map(|key| value.get(*key).filter(|v| !v.is_null()))
}

/// Returns the first string field among `keys`.
pub(crate) fn first_str<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
}

/// Returns the first unsigned integer field among `keys`.
pub(crate) fn first_u64(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_u64))
}

/// Best-effort classification of free-form provider failure text.
pub(crate) fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no conversation found") || lower.contains("session not found") {
        ErrorKind::SessionNotFound
    } else if lower.contains("permission") && lower.contains("denied") {
        ErrorKind::PermissionDenied
    } else if lower.contains("max turns") || lower.contains("maximum number of turns") {
        ErrorKind::TurnLimit
    } else if lower.contains("budget") {
        ErrorKind::BudgetExceeded
    } else if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("timed out")
        || lower.contains("econnrefused")
        || lower.contains("stream disconnected")
    {
        ErrorKind::Network
    } else {
        ErrorKind::Provider
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_str_skips_missing_keys() {
        let value = serde_json::json!({"sessionId": "s1"});
        assert_eq!(first_str(&value, &["session_id", "sessionId"]), Some("s1"));
        assert_eq!(first_str(&value, &["missing"]), None);
    }

    #[test]
    fn classifies_common_failure_text() {
        assert_eq!(
            classify_message("No conversation found with session ID: x"),
            ErrorKind::SessionNotFound
        );
        assert_eq!(
            classify_message("stream disconnected before completion"),
            ErrorKind::Network
        );
        assert_eq!(classify_message("model overloaded"), ErrorKind::Provider);
    }
}
