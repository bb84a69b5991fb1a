//! Tracing setup and the span every prompt engine runs in.
//!
//! The library only emits events. Binaries call [`init_observability`] (or
//! [`init_with`]) to see them. Each prompt engine runs inside an
//! `agent_prompt` span carrying `backend` and, once the backend reports it,
//! `session_id`, so JSON output can be grouped per conversation.

use std::path::PathBuf;

use once_cell::sync::OnceCell;
use tracing::Span;
use tracing::field::Empty;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<bool> = OnceCell::new();

const DEFAULT_FILTER: &str = "info";
const DEFAULT_LOG_FILE: &str = "agent-harness.logs.jsonl";

/// Where log lines go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogOutput {
    /// Compact human-readable lines on stdout.
    Console,
    /// One JSON object per line, appended to this file.
    JsonFile(PathBuf),
}

/// Subscriber settings, usually read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// `EnvFilter` directive, for example `agent_harness=debug`.
    pub filter: String,
    pub output: LogOutput,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_FILTER.to_string(),
            output: LogOutput::Console,
        }
    }
}

impl LogSettings {
    /// Reads the settings from the process environment.
    ///
    /// - `AGENT_HARNESS_OBSERVABILITY_ENABLED` / `AGENT_HARNESS_OBSERVABILITY`: `0`, `false`, `off` disable logging.
    /// - `AGENT_HARNESS_LOG_LEVEL`: filter directive, wins over `RUST_LOG` when it parses.
    /// - `AGENT_HARNESS_JSON_LOG_PATH`: switch to JSON lines in this file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = ["AGENT_HARNESS_OBSERVABILITY_ENABLED", "AGENT_HARNESS_OBSERVABILITY"]
            .into_iter()
            .find_map(&lookup)
            .map(|value| parse_flag(&value).unwrap_or(true))
            .unwrap_or(true);
        let filter = ["AGENT_HARNESS_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&lookup)
            .map(|value| value.trim().to_string())
            .find(|value| !value.is_empty() && EnvFilter::try_new(value).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let output = match lookup("AGENT_HARNESS_JSON_LOG_PATH") {
            Some(path) if !path.trim().is_empty() => LogOutput::JsonFile(PathBuf::from(path.trim())),
            _ => LogOutput::Console,
        };
        Self {
            enabled,
            filter,
            output,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

/// Installs a global subscriber from [`LogSettings::from_env`], once per process.
pub fn init_observability() {
    init_with(LogSettings::from_env());
}

/// Installs a global subscriber from explicit settings.
///
/// Only the first call in a process has an effect. Returns whether a
/// subscriber from this crate is installed.
pub fn init_with(settings: LogSettings) -> bool {
    *INIT.get_or_init(|| install(&settings))
}

fn install(settings: &LogSettings) -> bool {
    if !settings.enabled {
        return false;
    }
    let filter = EnvFilter::try_new(&settings.filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    match &settings.output {
        LogOutput::JsonFile(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."));
            if let Err(e) = std::fs::create_dir_all(&dir) {
                eprintln!("agent-harness: cannot create log directory {}: {e}", dir.display());
                return false;
            }
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_LOG_FILE)
                .to_string();
            let writer = tracing_appender::rolling::never(dir, file_name);
            tracing_subscriber::registry()
                .with(filter)
                .with(json_layer(writer))
                .try_init()
                .is_ok()
        }
        LogOutput::Console => {
            let console = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stdout);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .try_init()
                .is_ok()
        }
    }
}

/// JSON-lines layer that nests the current prompt span under `span`.
fn json_layer<S, W>(writer: W) -> impl tracing_subscriber::Layer<S> + Send + Sync
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_target(true)
        .with_writer(writer)
}

/// Span a prompt engine runs in. `session_id` is filled in by
/// [`record_session_id`] once known.
pub(crate) fn prompt_span(backend: &str) -> Span {
    tracing::info_span!("agent_prompt", backend = %backend, session_id = Empty)
}

/// Records the session id on the current prompt span, if there is one.
pub(crate) fn record_session_id(session_id: &str) {
    Span::current().record("session_id", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PromptOptions;
    use crate::event::AgentEvent;
    use crate::stream::{AgentStream, StreamContext, StreamDriver};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    fn settings(vars: &[(&str, &str)]) -> LogSettings {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        LogSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_to_console_at_info() {
        assert_eq!(settings(&[]), LogSettings::default());
    }

    #[test]
    fn harness_level_wins_over_rust_log_unless_invalid() {
        let chosen = settings(&[("AGENT_HARNESS_LOG_LEVEL", "agent_harness=debug"), ("RUST_LOG", "warn")]);
        assert_eq!(chosen.filter, "agent_harness=debug");
        let fallback = settings(&[("AGENT_HARNESS_LOG_LEVEL", "agent_harness=loud"), ("RUST_LOG", "warn")]);
        assert_eq!(fallback.filter, "warn");
    }

    #[test]
    fn json_path_switches_output_and_flag_disables() {
        let json = settings(&[("AGENT_HARNESS_JSON_LOG_PATH", " logs/run.jsonl ")]);
        assert_eq!(json.output, LogOutput::JsonFile(PathBuf::from("logs/run.jsonl")));
        assert!(!settings(&[("AGENT_HARNESS_OBSERVABILITY", "Off")]).enabled);
        assert!(settings(&[("AGENT_HARNESS_OBSERVABILITY_ENABLED", "maybe")]).enabled);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ReportsSession;

    #[async_trait::async_trait]
    impl StreamDriver for ReportsSession {
        async fn drive(self: Box<Self>, ctx: &mut StreamContext) {
            ctx.set_session_id("sess-1");
            ctx.emit(AgentEvent::TextDelta { text: "x".into() }).await;
        }
    }

    #[tokio::test]
    async fn engine_logs_carry_backend_and_session_in_json() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::registry().with(json_layer(move || writer.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut stream = AgentStream::new("fake", Box::new(ReportsSession), &PromptOptions::default());
        stream.result().await.expect("result");

        let output = String::from_utf8(captured.0.lock().expect("lock").clone()).expect("utf8");
        let line = output
            .lines()
            .find(|line| line.contains("stream engine finished"))
            .expect("engine log line");
        let json: Value = serde_json::from_str(line).expect("json line");
        assert_eq!(json["span"]["name"], "agent_prompt");
        assert_eq!(json["span"]["backend"], "fake");
        assert_eq!(json["span"]["session_id"], "sess-1");
    }
}
