//! Bounded fan-out of units to a backend

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::{RetryPolicy, Unit, UnitFailure, UnitOutcome};
use crate::backend::{BackendError, SynthesisParams, TtsBackend};
use crate::config::SynthesisConfig;

/// A unit that reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The dispatched unit
    pub unit: Unit,
    /// Backend invocations made
    pub attempts: u32,
    /// Audio or final failure
    pub outcome: UnitOutcome,
}

/// Runs at most `limit` backend calls at once for one request.
///
/// Slots are semaphore permits: the session acquires one, then hands it to
/// [`DispatchPool::dispatch`], which moves it into the spawned task. The
/// task releases the slot before reporting its completion, and on
/// cancellation it releases the slot without reporting at all.
pub struct DispatchPool {
    backend: Arc<dyn TtsBackend>,
    params: Arc<SynthesisParams>,
    slots: Arc<Semaphore>,
    limit: usize,
    timeout: Duration,
    retry: RetryPolicy,
    cancel: CancellationToken,
    completions: mpsc::UnboundedSender<Completion>,
}

impl DispatchPool {
    /// Create a pool and the receiver its completions arrive on
    #[must_use]
    pub fn new(
        backend: Arc<dyn TtsBackend>,
        params: SynthesisParams,
        config: &SynthesisConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let limit = config.max_concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();

        let pool = Self {
            backend,
            params: Arc::new(params),
            slots: Arc::new(Semaphore::new(limit)),
            limit,
            timeout: config.unit_timeout,
            retry: config.retry.clone(),
            cancel,
            completions: tx,
        };
        (pool, rx)
    }

    /// Wait for a free slot. Returns `None` once the pool is cancelled.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            permit = Arc::clone(&self.slots).acquire_owned() => permit.ok(),
        }
    }

    /// Spawn the backend call for `unit`, holding `permit` until it finishes
    pub fn dispatch(&self, unit: Unit, permit: OwnedSemaphorePermit) {
        if self.cancel.is_cancelled() {
            return;
        }

        let span = tracing::debug_span!("unit", index = unit.index);
        let backend = Arc::clone(&self.backend);
        let params = Arc::clone(&self.params);
        let retry = self.retry.clone();
        let timeout = self.timeout;
        let cancel = self.cancel.clone();
        let tx = self.completions.clone();

        tokio::spawn(
            async move {
                tracing::debug!(chars = unit.text.chars().count(), "dispatching unit");

                let finished = tokio::select! {
                    biased;
                    () = cancel.cancelled() => None,
                    result = run_unit(backend.as_ref(), &params, &unit.text, timeout, &retry) => Some(result),
                };
                drop(permit);

                let Some((attempts, outcome)) = finished else {
                    tracing::debug!("unit abandoned");
                    return;
                };
                if cancel.is_cancelled() {
                    tracing::debug!("discarding late completion");
                    return;
                }

                match &outcome {
                    UnitOutcome::Success(audio) => {
                        tracing::debug!(attempts, bytes = audio.data.len(), "unit synthesized");
                    }
                    UnitOutcome::Failure(failure) => {
                        tracing::warn!(attempts, code = failure.error.code(), error = %failure.error, "unit failed");
                    }
                }
                let _ = tx.send(Completion {
                    unit,
                    attempts,
                    outcome,
                });
            }
            .instrument(span),
        );
    }

    /// Configured concurrency limit
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    /// Slots not held by a running task
    #[must_use]
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Abandon every running call and refuse further dispatch. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`DispatchPool::cancel`] (or a parent token) fired
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Call the backend until success, a non-retryable error, or the attempt cap
async fn run_unit(
    backend: &dyn TtsBackend,
    params: &SynthesisParams,
    text: &str,
    timeout: Duration,
    retry: &RetryPolicy,
) -> (u32, UnitOutcome) {
    let mut attempt = 0;

    loop {
        attempt += 1;
        let error = match call_once(backend, params, text, timeout).await {
            Ok(audio) => return (attempt, UnitOutcome::Success(audio)),
            Err(e) => e,
        };

        let Some(delay) = retry.next_delay(attempt, &error) else {
            return (
                attempt,
                UnitOutcome::Failure(UnitFailure {
                    error,
                    attempts: attempt,
                }),
            );
        };
        tracing::debug!(attempt, code = error.code(), delay_ms = delay.as_millis(), "retrying unit");
        tokio::time::sleep(delay).await;
    }
}

async fn call_once(
    backend: &dyn TtsBackend,
    params: &SynthesisParams,
    text: &str,
    timeout: Duration,
) -> Result<crate::backend::AudioPayload, BackendError> {
    let call = AssertUnwindSafe(backend.synthesize(text, params)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Err(_) => Err(BackendError::Timeout(timeout)),
        Ok(Err(_)) => Err(BackendError::Permanent(format!(
            "{} backend panicked",
            backend.name()
        ))),
        Ok(Ok(result)) => result,
    }
}
