/// Settings for the Claude Code CLI transport.
///
/// Read from `AgentConfig::provider_options` when a backend is built with
/// [`ClaudeBackend::new`](super::ClaudeBackend::new).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ClaudeCliConfig {
    /// Executable name or path.
    pub binary: String,
    /// Arguments appended after the generated flags.
    pub extra_args: Vec<String>,
    /// Ask the CLI for token-level stream events.
    pub include_partial_messages: bool,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            extra_args: Vec::new(),
            include_partial_messages: true,
        }
    }
}

impl ClaudeCliConfig {
    /// Builds a config honoring `CLAUDE_CODE_BIN` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(binary) = std::env::var("CLAUDE_CODE_BIN")
            && !binary.trim().is_empty()
        {
            config.binary = binary;
        }
        config
    }

    pub fn binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn extra_arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn include_partial_messages(mut self, enabled: bool) -> Self {
        self.include_partial_messages = enabled;
        self
    }
}
