use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::errors::{AgentError, HarnessError};

/// How the backend should treat tool permission prompts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    /// Backend default behavior.
    #[default]
    Default,
    /// File edits are approved automatically.
    AcceptEdits,
    /// Every tool call is approved automatically.
    BypassPermissions,
    /// Read-only planning.
    Plan,
}

/// External tool server (MCP) definition.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpServerConfig {
    /// Local server spawned by the backend.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Remote server reached over HTTP.
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

/// Backend configuration shared by every vendor integration.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub permission_mode: PermissionMode,
    pub cwd: Option<PathBuf>,
    pub system_prompt: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
    pub env: HashMap<String, String>,
    /// Opaque backend-specific settings, read only by the owning backend.
    pub provider_options: serde_json::Value,
}

impl AgentConfig {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.max_budget_usd = Some(budget);
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn allow_tool(mut self, tool: impl Into<String>) -> Self {
        self.allowed_tools.push(tool.into());
        self
    }

    pub fn disallow_tool(mut self, tool: impl Into<String>) -> Self {
        self.disallowed_tools.push(tool.into());
        self
    }

    pub fn mcp_server(mut self, name: impl Into<String>, server: McpServerConfig) -> Self {
        self.mcp_servers.insert(name.into(), server);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn provider_options(mut self, options: serde_json::Value) -> Self {
        self.provider_options = options;
        self
    }

    /// Applies session-level overrides on top of this config.
    pub fn with_session(&self, session: &SessionOptions) -> Self {
        let mut merged = self.clone();
        if let Some(model) = &session.model {
            merged.model = Some(model.clone());
        }
        if let Some(prompt) = &session.system_prompt {
            merged.system_prompt = Some(prompt.clone());
        }
        if let Some(cwd) = &session.cwd {
            merged.cwd = Some(cwd.clone());
        }
        merged
    }

    /// Resolves the effective settings for one prompt.
    pub fn resolve(&self, prompt: &PromptOptions) -> PromptSettings {
        PromptSettings {
            model: prompt.model.clone().or_else(|| self.model.clone()),
            system_prompt: prompt
                .system_prompt
                .clone()
                .or_else(|| self.system_prompt.clone())
                .filter(|s| !s.trim().is_empty()),
            max_budget_usd: prompt.max_budget_usd.or(self.max_budget_usd),
            max_turns: prompt.max_turns.or(self.max_turns),
        }
    }

    /// Deserializes the backend-specific `provider_options` block.
    pub(crate) fn provider_options_as<T>(&self, backend: &str) -> Result<T, AgentError>
    where
        T: serde::de::DeserializeOwned + Default,
    {
        if self.provider_options.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.provider_options.clone()).map_err(|e| {
            AgentError::configuration(backend, format!("invalid provider options: {e}"))
                .with_cause(e)
        })
    }
}

/// Overrides applied when a session is created or resumed.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub cwd: Option<PathBuf>,
}

/// Per-call overrides for one prompt.
#[derive(Clone, Debug)]
pub struct PromptOptions {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
    /// Cancelling this token has the same effect as `AgentStream::abort`.
    pub cancellation: Option<CancellationToken>,
    /// Bounded event buffer between the engine task and the consumer.
    pub stream_buffer_capacity: usize,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            model: None,
            system_prompt: None,
            max_budget_usd: None,
            max_turns: None,
            cancellation: None,
            stream_buffer_capacity: 128,
        }
    }
}

impl PromptOptions {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_budget_usd(mut self, budget: f64) -> Self {
        self.max_budget_usd = Some(budget);
        self
    }

    pub fn max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    pub(crate) fn validate(&self, message: &str) -> Result<(), HarnessError> {
        if message.trim().is_empty() {
            return Err(HarnessError::usage("prompt message must not be empty"));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(HarnessError::usage(
                "stream_buffer_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Effective settings for one prompt after merging all override layers.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PromptSettings {
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub max_budget_usd: Option<f64>,
    pub max_turns: Option<u32>,
}
