//! JSON-lines subprocess transport shared by the CLI-backed vendors.

use std::collections::VecDeque;
use std::process::Stdio;

use futures::stream::{self, BoxStream};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{AgentError, ErrorKind};

const STDERR_TAIL_LINES: usize = 20;

/// Raw provider events read from a child process, one JSON value per line.
pub type JsonLineStream = BoxStream<'static, Result<Value, AgentError>>;

/// Spawns `command` and streams its stdout as JSON values.
///
/// Lines that are not valid JSON are logged and skipped. A non-zero exit is
/// reported as a final `Err` item carrying the tail of stderr. Dropping the
/// stream kills the child.
pub fn spawn_json_lines(backend: &str, mut command: Command) -> Result<JsonLineStream, AgentError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    debug!(backend, ?command, "spawning agent process");

    let mut child = command.spawn().map_err(|e| {
        let kind = if e.kind() == std::io::ErrorKind::NotFound {
            ErrorKind::Configuration
        } else {
            ErrorKind::Provider
        };
        AgentError::new(kind, backend, format!("failed to spawn agent process: {e}")).with_cause(e)
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::provider(backend, "agent process stdout was not captured"))?;
    let stderr_task = child.stderr.take().map(|stderr| {
        let backend = backend.to_string();
        tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                warn!(backend = %backend, stderr = %line, "agent process stderr");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        })
    });

    struct State {
        backend: String,
        lines: Lines<BufReader<ChildStdout>>,
        child: Child,
        stderr_task: Option<JoinHandle<String>>,
        done: bool,
    }

    let state = State {
        backend: backend.to_string(),
        lines: BufReader::new(stdout).lines(),
        child,
        stderr_task,
        done: false,
    };

    let stream = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        loop {
            match state.lines.next_line().await {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(value) => return Some((Ok(value), state)),
                        Err(e) => {
                            warn!(backend = %state.backend, error = %e, "skipping non-JSON output line");
                        }
                    }
                }
                Ok(None) => {
                    state.done = true;
                    return exit_status_item(&mut state.child, &mut state.stderr_task, &state.backend)
                        .await
                        .map(|err| (Err(err), state));
                }
                Err(e) => {
                    state.done = true;
                    let err = AgentError::network(
                        state.backend.clone(),
                        format!("failed to read agent output: {e}"),
                    )
                    .with_cause(e);
                    return Some((Err(err), state));
                }
            }
        }
    });
    Ok(Box::pin(stream))
}

async fn exit_status_item(
    child: &mut Child,
    stderr_task: &mut Option<JoinHandle<String>>,
    backend: &str,
) -> Option<AgentError> {
    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            return Some(
                AgentError::provider(backend, format!("failed to wait for agent process: {e}"))
                    .with_cause(e),
            );
        }
    };
    let stderr = match stderr_task.take() {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    if status.success() {
        return None;
    }
    let detail = if stderr.is_empty() {
        "no stderr captured".to_string()
    } else {
        stderr
    };
    Some(AgentError::provider(
        backend,
        format!("agent process exited with {status}: {detail}"),
    ))
}
