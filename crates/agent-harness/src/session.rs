use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::AgentConfig;
use crate::errors::HarnessError;
use crate::stream::{AbortHandle, AgentStream};

struct SessionInner {
    backend: String,
    config: AgentConfig,
    id: Mutex<Option<String>>,
    closed: AtomicBool,
    current: Mutex<Option<AbortHandle>>,
}

/// Bookkeeping shared by every vendor session: id, closed flag, and the abort
/// handle of the most recent stream.
///
/// Cloned into stream drivers so an id reported mid-prompt reaches the session.
#[derive(Clone)]
pub(crate) struct SessionCore {
    inner: Arc<SessionInner>,
}

impl SessionCore {
    pub(crate) fn new(backend: &str, config: AgentConfig, id: Option<String>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                backend: backend.to_string(),
                config,
                id: Mutex::new(id),
                closed: AtomicBool::new(false),
                current: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub(crate) fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub(crate) fn id(&self) -> Option<String> {
        lock(&self.inner.id).clone()
    }

    pub(crate) fn set_id(&self, id: &str) {
        let mut slot = lock(&self.inner.id);
        if slot.as_deref() != Some(id) {
            *slot = Some(id.to_string());
        }
    }

    pub(crate) fn ensure_open(&self) -> Result<(), HarnessError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(HarnessError::usage(format!(
                "{} session is closed",
                self.inner.backend
            )));
        }
        Ok(())
    }

    /// Remembers `stream` as the target of `abort`. Earlier streams keep running.
    pub(crate) fn track(&self, stream: &AgentStream) {
        *lock(&self.inner.current) = Some(stream.abort_handle());
    }

    pub(crate) fn abort(&self) {
        if let Some(handle) = lock(&self.inner.current).as_ref() {
            handle.abort();
        }
    }

    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
