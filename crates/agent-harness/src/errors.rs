use std::fmt;
use std::sync::Arc;

/// Canonical failure classes shared by every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The prompt was cancelled by the caller.
    Abort,
    /// The configured spend limit was reached.
    BudgetExceeded,
    /// The configured turn limit was reached.
    TurnLimit,
    /// A tool or operation was refused by the permission policy.
    PermissionDenied,
    /// A resumed session id is unknown to the backend.
    SessionNotFound,
    /// The backend reported an application-level failure.
    Provider,
    /// Invalid local configuration or registry state.
    Configuration,
    /// Transport or connection failure.
    Network,
    /// Anything the backend did not classify.
    Unknown,
}

impl ErrorKind {
    /// Returns the stable snake_case name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::BudgetExceeded => "budget_exceeded",
            Self::TurnLimit => "turn_limit",
            Self::PermissionDenied => "permission_denied",
            Self::SessionNotFound => "session_not_found",
            Self::Provider => "provider",
            Self::Configuration => "configuration",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared underlying cause attached to an [`AgentError`].
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Canonical error carried by `AgentEvent::Error` and returned from prompts.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} error ({backend}): {message}")]
pub struct AgentError {
    /// Canonical failure class.
    pub kind: ErrorKind,
    /// Name of the backend that produced the failure.
    pub backend: String,
    /// Human-readable message.
    pub message: String,
    /// Raw provider payload the failure was derived from, if any.
    pub raw: Option<serde_json::Value>,
    /// Underlying error, if any.
    #[source]
    pub cause: Option<ErrorCause>,
}

impl PartialEq for AgentError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.backend == other.backend
            && self.message == other.message
            && self.raw == other.raw
    }
}

impl AgentError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorKind, backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            backend: backend.into(),
            message: message.into(),
            raw: None,
            cause: None,
        }
    }

    /// Creates an abort error.
    pub fn abort(backend: impl Into<String>) -> Self {
        Self::new(ErrorKind::Abort, backend, "prompt aborted")
    }

    /// Creates a provider error.
    pub fn provider(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Provider, backend, message)
    }

    /// Creates a network error.
    pub fn network(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, backend, message)
    }

    /// Creates a configuration error.
    pub fn configuration(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, backend, message)
    }

    /// Creates a session-not-found error.
    pub fn session_not_found(backend: impl Into<String>, session_id: &str) -> Self {
        Self::new(
            ErrorKind::SessionNotFound,
            backend,
            format!("session not found: {session_id}"),
        )
    }

    /// Attaches the raw provider payload.
    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }

    /// Attaches an underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }
}

/// One failed backend attempt recorded by `AgentRegistry::run_with_fallback`.
#[derive(Debug, Clone)]
pub struct FallbackAttempt {
    /// Registry name of the backend that was tried.
    pub backend: String,
    /// The failure it returned.
    pub error: HarnessError,
}

/// Top-level error type for the public harness API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HarnessError {
    /// Canonical backend or stream failure.
    #[error(transparent)]
    Agent(#[from] AgentError),
    /// Requested backend is not registered.
    #[error("backend not found: {name}")]
    BackendNotFound { name: String },
    /// API misuse, such as iterating a stream twice or prompting a closed session.
    #[error("usage error: {0}")]
    Usage(String),
    /// Every backend tried under fallback failed with a retriable error.
    #[error("all backends failed: {}", summarize_attempts(attempts))]
    AllBackendsFailed { attempts: Vec<FallbackAttempt> },
}

impl HarnessError {
    /// Returns the canonical kind of this error when it has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Agent(err) => Some(err.kind),
            Self::BackendNotFound { .. } => Some(ErrorKind::Configuration),
            Self::Usage(_) | Self::AllBackendsFailed { .. } => None,
        }
    }

    /// Returns true when the error means the prompt was cancelled.
    pub fn is_abort(&self) -> bool {
        self.kind() == Some(ErrorKind::Abort)
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }
}

fn summarize_attempts(attempts: &[FallbackAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| format!("{}: {}", attempt.backend, attempt.error))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_error_display_names_kind_and_backend() {
        let err = AgentError::provider("claude", "overloaded");
        assert_eq!(err.to_string(), "provider error (claude): overloaded");
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::other("pipe closed");
        let err = AgentError::network("codex", "read failed").with_cause(io);
        let source = std::error::Error::source(&err).expect("source");
        assert!(source.to_string().contains("pipe closed"));
    }

    #[test]
    fn aggregate_error_lists_attempts_in_order() {
        let err = HarnessError::AllBackendsFailed {
            attempts: vec![
                FallbackAttempt {
                    backend: "primary".into(),
                    error: AgentError::network("primary", "refused").into(),
                },
                FallbackAttempt {
                    backend: "backup".into(),
                    error: AgentError::provider("backup", "500").into(),
                },
            ],
        };
        let text = err.to_string();
        let primary = text.find("primary:").expect("primary listed");
        let backup = text.find("backup:").expect("backup listed");
        assert!(primary < backup);
        assert_eq!(err.kind(), None);
    }

    #[test]
    fn backend_not_found_is_configuration_kind() {
        let err = HarnessError::BackendNotFound {
            name: "missing".into(),
        };
        assert_eq!(err.kind(), Some(ErrorKind::Configuration));
        assert!(!err.is_abort());
    }
}
