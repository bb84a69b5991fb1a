use tokio::process::Command;
use tracing::debug;

use crate::config::{AgentConfig, McpServerConfig, PermissionMode, PromptSettings};
use crate::errors::AgentError;
use crate::process::{JsonLineStream, spawn_json_lines};

use super::{CODEX_BACKEND, CodexCliConfig};

/// One Codex turn request.
#[derive(Clone, Debug)]
pub struct CodexTurn {
    pub prompt: String,
    /// Thread to continue, when known.
    pub thread_id: Option<String>,
    pub settings: PromptSettings,
    pub config: AgentConfig,
}

/// Boundary to the Codex runtime.
#[async_trait::async_trait]
pub trait CodexTransport: Send + Sync {
    /// Runs one turn and returns its raw JSONL events.
    async fn run(&self, turn: CodexTurn) -> Result<JsonLineStream, AgentError>;
}

/// Runs `codex exec --json` as a subprocess per turn.
#[derive(Clone, Debug, Default)]
pub struct CodexCliTransport {
    cli: CodexCliConfig,
}

impl CodexCliTransport {
    pub fn new(cli: CodexCliConfig) -> Self {
        Self { cli }
    }
}

#[async_trait::async_trait]
impl CodexTransport for CodexCliTransport {
    async fn run(&self, turn: CodexTurn) -> Result<JsonLineStream, AgentError> {
        let mut command = Command::new(&self.cli.binary);
        command.args(cli_args(&self.cli, &turn));
        if let Some(cwd) = &turn.config.cwd {
            command.current_dir(cwd);
        }
        command.envs(&turn.config.env);
        spawn_json_lines(CODEX_BACKEND, command)
    }
}

/// Quotes a value as a TOML basic string for `-c key=value` overrides.
fn toml_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

fn mcp_overrides(config: &AgentConfig) -> Vec<String> {
    let mut overrides = Vec::new();
    for (name, server) in &config.mcp_servers {
        match server {
            McpServerConfig::Stdio { command, args, env } => {
                overrides.push(format!("mcp_servers.{name}.command={}", toml_string(command)));
                if !args.is_empty() {
                    let list = args.iter().map(|a| toml_string(a)).collect::<Vec<_>>().join(",");
                    overrides.push(format!("mcp_servers.{name}.args=[{list}]"));
                }
                if !env.is_empty() {
                    let mut pairs = env
                        .iter()
                        .map(|(k, v)| format!("{}={}", toml_string(k), toml_string(v)))
                        .collect::<Vec<_>>();
                    pairs.sort();
                    overrides.push(format!("mcp_servers.{name}.env={{{}}}", pairs.join(",")));
                }
            }
            McpServerConfig::Http { url, .. } => {
                overrides.push(format!("mcp_servers.{name}.url={}", toml_string(url)));
            }
        }
    }
    overrides
}

/// Builds the CLI argument list for one turn.
pub(crate) fn cli_args(cli: &CodexCliConfig, turn: &CodexTurn) -> Vec<String> {
    let mut args: Vec<String> = vec!["exec".into(), "--json".into()];
    if let Some(model) = &turn.settings.model {
        args.extend(["--model".into(), model.clone()]);
    }
    match turn.config.permission_mode {
        PermissionMode::Default => {}
        PermissionMode::AcceptEdits => args.push("--full-auto".into()),
        PermissionMode::BypassPermissions => {
            args.push("--dangerously-bypass-approvals-and-sandbox".into())
        }
        PermissionMode::Plan => args.extend(["--sandbox".into(), "read-only".into()]),
    }
    if cli.skip_git_repo_check {
        args.push("--skip-git-repo-check".into());
    }
    if let Some(prompt) = &turn.settings.system_prompt {
        args.extend([
            "-c".into(),
            format!("developer_instructions={}", toml_string(prompt)),
        ]);
    }
    for item in mcp_overrides(&turn.config) {
        args.extend(["-c".into(), item]);
    }
    if turn.settings.max_turns.is_some() || turn.settings.max_budget_usd.is_some() {
        debug!(backend = CODEX_BACKEND, "turn and budget limits are not enforced by codex exec");
    }
    if !turn.config.allowed_tools.is_empty() || !turn.config.disallowed_tools.is_empty() {
        debug!(backend = CODEX_BACKEND, "tool allow/deny lists are not supported by codex exec");
    }
    args.extend(cli.extra_args.iter().cloned());
    if let Some(thread_id) = &turn.thread_id {
        args.extend(["resume".into(), thread_id.clone()]);
    }
    args.push("--".into());
    args.push(turn.prompt.clone());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(config: AgentConfig) -> CodexTurn {
        CodexTurn {
            prompt: "fix it".into(),
            thread_id: None,
            settings: PromptSettings::default(),
            config,
        }
    }

    #[test]
    fn fresh_turn_args() {
        let args = cli_args(&CodexCliConfig::default(), &turn(AgentConfig::default()));
        assert_eq!(args, vec!["exec", "--json", "--skip-git-repo-check", "--", "fix it"]);
    }

    #[test]
    fn resume_and_overrides() {
        let config = AgentConfig::default()
            .permission_mode(PermissionMode::Plan)
            .mcp_server(
                "docs",
                McpServerConfig::Stdio {
                    command: "docs-mcp".into(),
                    args: vec!["--port".into(), "0".into()],
                    env: Default::default(),
                },
            );
        let mut turn = turn(config);
        turn.thread_id = Some("th_1".into());
        turn.settings.model = Some("gpt-5-codex".into());
        turn.settings.system_prompt = Some("say \"hi\"".into());
        let args = cli_args(&CodexCliConfig::default().skip_git_repo_check(false), &turn);
        let joined = args.join(" ");
        assert!(joined.starts_with("exec --json --model gpt-5-codex --sandbox read-only"));
        assert!(joined.contains(r#"-c developer_instructions="say \"hi\"""#));
        assert!(joined.contains(r#"-c mcp_servers.docs.command="docs-mcp""#));
        assert!(joined.contains(r#"mcp_servers.docs.args=["--port","0"]"#));
        assert!(joined.ends_with("resume th_1 -- fix it"));
        assert!(!joined.contains("--skip-git-repo-check"));
    }
}
