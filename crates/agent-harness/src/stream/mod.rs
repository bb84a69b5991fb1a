//! Canonical stream contract shared by every backend.
//!
//! An [`AgentStream`] is lazy: nothing runs until the caller either iterates it
//! with [`AgentStream::events`] or asks for the terminal result with
//! [`AgentStream::result`]. The backend engine then runs on a spawned task and
//! feeds a bounded channel; the final [`PromptResult`] travels back over a
//! oneshot once the engine is done.

mod context;

pub use context::StreamContext;

use futures::stream::{self, Stream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument as _, debug};

use crate::config::PromptOptions;
use crate::errors::{AgentError, HarnessError};
use crate::event::AgentEvent;
use crate::message::PromptResult;
use crate::observability;

/// Backend engine that drives one prompt.
///
/// `drive` is called after the synthetic `TurnStart` has been emitted. It
/// pushes canonical events through the context and returns when the provider
/// stream is exhausted, fails, or the context is aborted.
#[async_trait::async_trait]
pub trait StreamDriver: Send + 'static {
    async fn drive(self: Box<Self>, ctx: &mut StreamContext);
}

/// Handle used to cancel a stream from elsewhere.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    /// Requests cancellation. Calling it more than once has no further effect.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}

type Outcome = Result<PromptResult, HarnessError>;

/// Single-consumption stream of canonical events plus a terminal result.
pub struct AgentStream {
    backend: String,
    abort: CancellationToken,
    capacity: usize,
    driver: Option<Box<dyn StreamDriver>>,
    rx: Option<mpsc::Receiver<AgentEvent>>,
    final_rx: Option<oneshot::Receiver<Result<PromptResult, AgentError>>>,
    consumed: bool,
    outcome: Option<Outcome>,
}

impl AgentStream {
    /// Wraps a backend driver. No work happens until the stream is consumed.
    pub fn new(
        backend: impl Into<String>,
        driver: Box<dyn StreamDriver>,
        options: &PromptOptions,
    ) -> Self {
        Self {
            backend: backend.into(),
            // A child token follows the caller's token without a listener task.
            abort: options
                .cancellation
                .as_ref()
                .map(CancellationToken::child_token)
                .unwrap_or_default(),
            capacity: options.stream_buffer_capacity.max(1),
            driver: Some(driver),
            rx: None,
            final_rx: None,
            consumed: false,
            outcome: None,
        }
    }

    /// Name of the backend producing this stream.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Returns a handle that can cancel this stream.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            token: self.abort.clone(),
        }
    }

    /// Cancels the stream. Idempotent.
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Starts the one and only iteration over this stream's events.
    ///
    /// Fails with `HarnessError::Usage` if the events were already iterated or
    /// drained by [`AgentStream::result`].
    pub fn events(&mut self) -> Result<EventIter<'_>, HarnessError> {
        if self.consumed {
            return Err(HarnessError::usage(format!(
                "{} stream can only be iterated once",
                self.backend
            )));
        }
        self.consumed = true;
        Ok(EventIter { stream: self })
    }

    /// Returns the terminal result, draining any events not yet consumed.
    ///
    /// Repeated calls return the same outcome. After an abort this always
    /// returns an abort-class error.
    pub async fn result(&mut self) -> Result<PromptResult, HarnessError> {
        if self.is_aborted() {
            return Err(AgentError::abort(self.backend.clone()).into());
        }
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        self.consumed = true;
        while self.next_event().await.is_some() {}

        let outcome = if self.is_aborted() {
            Err(AgentError::abort(self.backend.clone()).into())
        } else {
            match self.final_rx.take() {
                Some(final_rx) => match final_rx.await {
                    Ok(result) => result.map_err(HarnessError::from),
                    Err(_) => Err(AgentError::provider(
                        self.backend.clone(),
                        "stream engine ended without a final result",
                    )
                    .into()),
                },
                None => Err(AgentError::provider(
                    self.backend.clone(),
                    "stream engine was never started",
                )
                .into()),
            }
        };
        if self.is_aborted() {
            return Err(AgentError::abort(self.backend.clone()).into());
        }
        self.outcome = Some(outcome.clone());
        outcome
    }

    async fn next_event(&mut self) -> Option<AgentEvent> {
        if self.is_aborted() {
            return None;
        }
        self.ensure_started();
        let rx = self.rx.as_mut()?;
        let event = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            event = rx.recv() => event,
        };
        if self.abort.is_cancelled() {
            return None;
        }
        event
    }

    fn ensure_started(&mut self) {
        let Some(driver) = self.driver.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(self.capacity);
        let (final_tx, final_rx) = oneshot::channel();
        self.rx = Some(rx);
        self.final_rx = Some(final_rx);

        let ctx = StreamContext::new(self.backend.clone(), tx, self.abort.clone());
        let span = observability::prompt_span(&self.backend);
        debug!(parent: &span, "starting stream engine");
        tokio::spawn(run_engine(driver, ctx, final_tx).instrument(span));
    }
}

impl Drop for AgentStream {
    fn drop(&mut self) {
        if self.outcome.is_none() && self.driver.is_none() {
            self.abort.cancel();
        }
    }
}

async fn run_engine(
    driver: Box<dyn StreamDriver>,
    mut ctx: StreamContext,
    final_tx: oneshot::Sender<Result<PromptResult, AgentError>>,
) {
    if ctx.emit(AgentEvent::TurnStart).await && !ctx.is_aborted() {
        driver.drive(&mut ctx).await;
    }
    let outcome = ctx.finish().await;
    debug!(ok = outcome.is_ok(), "stream engine finished");
    let _ = final_tx.send(outcome);
}

/// Borrowing iterator over a stream's events.
pub struct EventIter<'a> {
    stream: &'a mut AgentStream,
}

impl<'a> EventIter<'a> {
    /// Waits for the next event. Returns `None` when the stream is exhausted or aborted.
    pub async fn next(&mut self) -> Option<AgentEvent> {
        self.stream.next_event().await
    }

    /// Adapts the iterator into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = AgentEvent> + 'a {
        stream::unfold(self, |mut iter| async move {
            iter.next().await.map(|event| (event, iter))
        })
    }
}
