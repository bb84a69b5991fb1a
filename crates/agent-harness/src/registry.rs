//! Named backend registry with default selection and ordered fallback.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{AgentBackend, AgentSession};
use crate::config::{PromptOptions, SessionOptions};
use crate::errors::{AgentError, ErrorKind, FallbackAttempt, HarnessError};
use crate::message::PromptResult;
use crate::stream::AgentStream;

const REGISTRY: &str = "registry";

/// Decides whether a failed attempt may move on to the next backend.
pub type RetryPredicate = Arc<dyn Fn(&HarnessError) -> bool + Send + Sync>;

/// Default retry policy: only provider and network failures are retried.
pub fn retry_transient(error: &HarnessError) -> bool {
    matches!(error.kind(), Some(ErrorKind::Provider | ErrorKind::Network))
}

/// Ordered collection of named backends.
///
/// The first registered name becomes the default. Removing the default hands
/// it to the earliest remaining entry, or clears it when the registry empties.
pub struct AgentRegistry {
    entries: Vec<(String, Arc<dyn AgentBackend>)>,
    default: Option<String>,
    retry: RetryPredicate,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            default: None,
            retry: Arc::new(retry_transient),
        }
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the retry predicate used by [`AgentRegistry::run_with_fallback`].
    pub fn with_retry_predicate(
        mut self,
        predicate: impl Fn(&HarnessError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry = Arc::new(predicate);
        self
    }

    /// Adds a backend under `name`. Names must be unique.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        backend: Arc<dyn AgentBackend>,
    ) -> Result<(), HarnessError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(AgentError::configuration(REGISTRY, "backend name must not be empty").into());
        }
        if self.contains(&name) {
            return Err(AgentError::configuration(
                REGISTRY,
                format!("duplicate backend registration: {name}"),
            )
            .into());
        }
        debug!(backend = %name, "registering backend");
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.entries.push((name, backend));
        Ok(())
    }

    /// Removes and returns a backend. The backend is not disposed.
    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn AgentBackend>> {
        let index = self.entries.iter().position(|(n, _)| n == name)?;
        let (_, backend) = self.entries.remove(index);
        if self.default.as_deref() == Some(name) {
            self.default = self.entries.first().map(|(n, _)| n.clone());
            debug!(removed = %name, default = ?self.default, "default backend reassigned");
        }
        Some(backend)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Looks up a backend, failing with `BackendNotFound`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn AgentBackend>, HarnessError> {
        self.try_get(name).ok_or_else(|| HarnessError::BackendNotFound {
            name: name.to_string(),
        })
    }

    pub fn try_get(&self, name: &str) -> Option<Arc<dyn AgentBackend>> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, backend)| backend.clone())
    }

    /// Registered names in insertion order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(n, _)| n.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Makes a registered backend the default.
    pub fn set_default(&mut self, name: &str) -> Result<(), HarnessError> {
        if !self.contains(name) {
            return Err(HarnessError::BackendNotFound {
                name: name.to_string(),
            });
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    fn default_backend(&self) -> Result<Arc<dyn AgentBackend>, HarnessError> {
        let name = self.default.as_deref().ok_or_else(|| {
            HarnessError::from(AgentError::configuration(REGISTRY, "no default backend registered"))
        })?;
        self.get(name)
    }

    /// Opens a session on the default backend.
    pub async fn create_session(
        &self,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        self.default_backend()?.create_session(options).await
    }

    /// Resumes a session on the default backend. Never falls back.
    pub async fn resume_session(
        &self,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        self.default_backend()?
            .resume_session(session_id, options)
            .await
    }

    /// One-shot prompt on a fresh session of the default backend.
    pub async fn prompt(
        &self,
        message: &str,
        options: PromptOptions,
    ) -> Result<PromptResult, HarnessError> {
        one_shot(self.default_backend()?, message, options).await
    }

    /// Event stream on a fresh session of the default backend.
    pub async fn stream(
        &self,
        message: &str,
        options: PromptOptions,
    ) -> Result<AgentStream, HarnessError> {
        self.default_backend()?
            .create_session(SessionOptions::default())
            .await?
            .stream(message, options)
    }

    pub async fn create_session_on(
        &self,
        name: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        self.get(name)?.create_session(options).await
    }

    /// Resumes a session on the named backend. Session ids belong to exactly
    /// one backend, so this never falls back.
    pub async fn resume_session_on(
        &self,
        name: &str,
        session_id: &str,
        options: SessionOptions,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        self.get(name)?.resume_session(session_id, options).await
    }

    pub async fn prompt_on(
        &self,
        name: &str,
        message: &str,
        options: PromptOptions,
    ) -> Result<PromptResult, HarnessError> {
        one_shot(self.get(name)?, message, options).await
    }

    pub async fn stream_on(
        &self,
        name: &str,
        message: &str,
        options: PromptOptions,
    ) -> Result<AgentStream, HarnessError> {
        self.get(name)?
            .create_session(SessionOptions::default())
            .await?
            .stream(message, options)
    }

    /// Runs `op` against each backend in `order` until one succeeds.
    ///
    /// `order` defaults to insertion order. Unknown names are skipped. A
    /// failure the retry predicate rejects is returned immediately; if every
    /// attempt fails retriably the result is `AllBackendsFailed` listing each
    /// attempt in order.
    pub async fn run_with_fallback<T, F, Fut>(
        &self,
        order: Option<&[&str]>,
        mut op: F,
    ) -> Result<T, HarnessError>
    where
        F: FnMut(Arc<dyn AgentBackend>) -> Fut,
        Fut: Future<Output = Result<T, HarnessError>>,
    {
        let names: Vec<String> = match order {
            Some(order) => order.iter().map(|n| n.to_string()).collect(),
            None => self.names(),
        };
        let mut attempts = Vec::new();
        for name in names {
            let Some(backend) = self.try_get(&name) else {
                debug!(backend = %name, "skipping unregistered fallback backend");
                continue;
            };
            match op(backend).await {
                Ok(value) => return Ok(value),
                Err(error) if (self.retry)(&error) => {
                    info!(backend = %name, error = %error, "backend failed, trying next");
                    attempts.push(FallbackAttempt {
                        backend: name,
                        error,
                    });
                }
                Err(error) => return Err(error),
            }
        }
        if attempts.is_empty() {
            return Err(AgentError::configuration(REGISTRY, "no registered backend to run").into());
        }
        Err(HarnessError::AllBackendsFailed { attempts })
    }

    /// One-shot prompt that falls back across backends in `order`.
    pub async fn prompt_with_fallback(
        &self,
        message: &str,
        options: PromptOptions,
        order: Option<&[&str]>,
    ) -> Result<PromptResult, HarnessError> {
        self.run_with_fallback(order, |backend| {
            let options = options.clone();
            async move { one_shot(backend, message, options).await }
        })
        .await
    }

    /// Opens a session on the first backend in `order` that accepts it.
    pub async fn create_session_with_fallback(
        &self,
        options: SessionOptions,
        order: Option<&[&str]>,
    ) -> Result<Box<dyn AgentSession>, HarnessError> {
        self.run_with_fallback(order, |backend| {
            let options = options.clone();
            async move { backend.create_session(options).await }
        })
        .await
    }

    /// Disposes every backend concurrently and empties the registry.
    ///
    /// Individual failures are logged and do not stop the others.
    pub async fn dispose(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        self.default = None;
        let results = futures::future::join_all(entries.iter().map(|(name, backend)| async move {
            (name, backend.dispose().await)
        }))
        .await;
        for (name, result) in results {
            if let Err(error) = result {
                warn!(backend = %name, error = %error, "backend dispose failed");
            }
        }
    }
}

async fn one_shot(
    backend: Arc<dyn AgentBackend>,
    message: &str,
    options: PromptOptions,
) -> Result<PromptResult, HarnessError> {
    let session = backend.create_session(SessionOptions::default()).await?;
    let result = session.prompt(message, options).await;
    session.close().await;
    result
}
