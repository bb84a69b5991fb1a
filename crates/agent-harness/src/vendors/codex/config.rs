/// Settings for the Codex CLI transport.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CodexCliConfig {
    /// Executable name or path.
    pub binary: String,
    /// Arguments inserted before the prompt.
    pub extra_args: Vec<String>,
    /// Pass `--skip-git-repo-check` so Codex runs outside git checkouts.
    pub skip_git_repo_check: bool,
}

impl Default for CodexCliConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            extra_args: Vec::new(),
            skip_git_repo_check: true,
        }
    }
}

impl CodexCliConfig {
    /// Builds a config honoring `CODEX_BIN` when set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(binary) = std::env::var("CODEX_BIN")
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

    pub fn skip_git_repo_check(mut self, skip: bool) -> Self {
        self.skip_git_repo_check = skip;
        self
    }
}
