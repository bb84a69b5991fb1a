use std::time::Duration;

use crate::errors::AgentError;

use super::OPENCODE_BACKEND;

/// Connection settings for a running `opencode serve` instance.
#[derive(Clone, Debug, PartialEq)]
pub struct OpencodeClientConfig {
    /// Server root, for example `http://127.0.0.1:4096`.
    pub base_url: String,
    /// Timeout for request/response calls. The event feed is never timed out.
    pub timeout: Duration,
}

impl Default for OpencodeClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

impl OpencodeClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Builds a config from `OPENCODE_BASE_URL`, falling back to the local default.
    pub fn from_env() -> Result<Self, AgentError> {
        let config = match std::env::var("OPENCODE_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), AgentError> {
        reqwest::Url::parse(&self.base_url).map_err(|e| {
            AgentError::configuration(
                OPENCODE_BACKEND,
                format!("invalid OpenCode base URL {:?}: {e}", self.base_url),
            )
            .with_cause(e)
        })?;
        Ok(())
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}
