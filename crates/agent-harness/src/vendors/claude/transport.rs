use tokio::process::Command;

use crate::config::{AgentConfig, PermissionMode, PromptSettings};
use crate::errors::AgentError;
use crate::process::{JsonLineStream, spawn_json_lines};

use super::{CLAUDE_BACKEND, ClaudeCliConfig};

/// One Claude turn request.
#[derive(Clone, Debug)]
pub struct ClaudeQuery {
    pub prompt: String,
    /// Session to continue, when known.
    pub resume: Option<String>,
    pub settings: PromptSettings,
    pub config: AgentConfig,
}

/// Boundary to the Claude Code runtime.
#[async_trait::async_trait]
pub trait ClaudeTransport: Send + Sync {
    /// Starts a turn and returns its raw `stream-json` events.
    async fn query(&self, query: ClaudeQuery) -> Result<JsonLineStream, AgentError>;

    /// Best-effort interruption of the running turn.
    async fn interrupt(&self, _session_id: Option<&str>) -> Result<(), AgentError> {
        Ok(())
    }
}

/// Runs `claude -p` as a subprocess per turn.
///
/// Interrupting is handled by dropping the event stream, which kills the child.
#[derive(Clone, Debug, Default)]
pub struct ClaudeCliTransport {
    cli: ClaudeCliConfig,
}

impl ClaudeCliTransport {
    pub fn new(cli: ClaudeCliConfig) -> Self {
        Self { cli }
    }
}

#[async_trait::async_trait]
impl ClaudeTransport for ClaudeCliTransport {
    async fn query(&self, query: ClaudeQuery) -> Result<JsonLineStream, AgentError> {
        let mut command = Command::new(&self.cli.binary);
        command.args(cli_args(&self.cli, &query)?);
        if let Some(cwd) = &query.config.cwd {
            command.current_dir(cwd);
        }
        command.envs(&query.config.env);
        spawn_json_lines(CLAUDE_BACKEND, command)
    }
}

fn permission_flag(mode: PermissionMode) -> Option<&'static str> {
    match mode {
        PermissionMode::Default => None,
        PermissionMode::AcceptEdits => Some("acceptEdits"),
        PermissionMode::BypassPermissions => Some("bypassPermissions"),
        PermissionMode::Plan => Some("plan"),
    }
}

/// Builds the CLI argument list for one turn.
pub(crate) fn cli_args(cli: &ClaudeCliConfig, query: &ClaudeQuery) -> Result<Vec<String>, AgentError> {
    let mut args: Vec<String> = vec![
        "-p".into(),
        "--output-format".into(),
        "stream-json".into(),
        "--verbose".into(),
    ];
    if cli.include_partial_messages {
        args.push("--include-partial-messages".into());
    }
    if let Some(model) = &query.settings.model {
        args.extend(["--model".into(), model.clone()]);
    }
    if let Some(session_id) = &query.resume {
        args.extend(["--resume".into(), session_id.clone()]);
    }
    if let Some(prompt) = &query.settings.system_prompt {
        args.extend(["--append-system-prompt".into(), prompt.clone()]);
    }
    if let Some(turns) = query.settings.max_turns {
        args.extend(["--max-turns".into(), turns.to_string()]);
    }
    if let Some(budget) = query.settings.max_budget_usd {
        args.extend(["--max-budget-usd".into(), budget.to_string()]);
    }
    if let Some(mode) = permission_flag(query.config.permission_mode) {
        args.extend(["--permission-mode".into(), mode.into()]);
    }
    if !query.config.allowed_tools.is_empty() {
        args.extend(["--allowedTools".into(), query.config.allowed_tools.join(",")]);
    }
    if !query.config.disallowed_tools.is_empty() {
        args.extend([
            "--disallowedTools".into(),
            query.config.disallowed_tools.join(","),
        ]);
    }
    if !query.config.mcp_servers.is_empty() {
        let servers = serde_json::json!({ "mcpServers": query.config.mcp_servers });
        let encoded = serde_json::to_string(&servers).map_err(|e| {
            AgentError::configuration(CLAUDE_BACKEND, format!("invalid MCP server config: {e}"))
                .with_cause(e)
        })?;
        args.extend(["--mcp-config".into(), encoded]);
    }
    args.extend(cli.extra_args.iter().cloned());
    args.push("--".into());
    args.push(query.prompt.clone());
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;

    fn query(config: AgentConfig, settings: PromptSettings) -> ClaudeQuery {
        ClaudeQuery {
            prompt: "hello".into(),
            resume: None,
            settings,
            config,
        }
    }

    #[test]
    fn minimal_args_stream_json_and_end_with_prompt() {
        let args = cli_args(
            &ClaudeCliConfig::default(),
            &query(AgentConfig::default(), PromptSettings::default()),
        )
        .expect("args");
        assert_eq!(
            args,
            vec![
                "-p",
                "--output-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--",
                "hello"
            ]
        );
    }

    #[test]
    fn settings_and_config_become_flags() {
        let config = AgentConfig::default()
            .permission_mode(PermissionMode::AcceptEdits)
            .allow_tool("Read")
            .allow_tool("Edit")
            .mcp_server(
                "files",
                McpServerConfig::Stdio {
                    command: "mcp-files".into(),
                    args: vec![],
                    env: Default::default(),
                },
            );
        let mut query = query(
            config,
            PromptSettings {
                model: Some("sonnet".into()),
                system_prompt: Some("be brief".into()),
                max_budget_usd: None,
                max_turns: Some(3),
            },
        );
        query.resume = Some("sess-1".into());
        let args = cli_args(&ClaudeCliConfig::default().extra_arg("--debug"), &query).expect("args");
        let joined = args.join(" ");
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--resume sess-1"));
        assert!(joined.contains("--append-system-prompt be brief"));
        assert!(joined.contains("--max-turns 3"));
        assert!(joined.contains("--permission-mode acceptEdits"));
        assert!(joined.contains("--allowedTools Read,Edit"));
        assert!(joined.contains(r#""mcpServers":{"files":{"type":"stdio""#));
        assert!(joined.ends_with("--debug -- hello"));
    }
}
