//! Per-request event loop

use std::collections::VecDeque;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    Completion, DispatchPool, EventSink, Outcome, ReorderBuffer, RequestError, Segmenter, Summary,
    SynthesisEvent, Unit, UnitOutcome, UnitState,
};
use crate::backend::ResolvedVoice;
use crate::config::SynthesisConfig;

/// Where a request is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reading input, nothing dispatched yet
    Collecting,
    /// Reading input while units are in flight
    Dispatching,
    /// Input ended; waiting for the remaining units
    Draining,
    /// Every unit released
    Complete,
    /// Torn down early
    Cancelled,
}

impl SessionState {
    /// Whether the session can no longer change state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

/// One synthesis request, from first fragment to terminal event
pub struct Session {
    id: Uuid,
    voice: ResolvedVoice,
    config: SynthesisConfig,
    cancel: CancellationToken,
}

impl Session {
    /// Create a session for a resolved voice
    #[must_use]
    pub fn new(voice: ResolvedVoice, config: SynthesisConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            voice,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `cancel` (typically a child of the connection's token)
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts this session when cancelled
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request id used in logs
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Drive the request until its terminal event.
    ///
    /// Fragments are segmented as they arrive and units are dispatched while
    /// input is still streaming. Events reach `sink` in unit order, and a
    /// [`SynthesisEvent::Finished`] is always the last one sent. If `sink`
    /// fails the session treats it as a disconnect and cancels itself.
    pub async fn run<S, K>(self, input: S, sink: &mut K) -> Summary
    where
        S: Stream<Item = String> + Unpin + Send,
        K: EventSink + ?Sized,
    {
        let span = tracing::info_span!(
            "request",
            id = %self.id,
            voice = %self.voice.params.voice,
            backend = self.voice.backend.name(),
        );
        self.drive(input, sink).instrument(span).await
    }

    async fn drive<S, K>(self, mut input: S, sink: &mut K) -> Summary
    where
        S: Stream<Item = String> + Unpin + Send,
        K: EventSink + ?Sized,
    {
        let Self {
            voice,
            config,
            cancel,
            ..
        } = self;

        let (pool, mut completions) = DispatchPool::new(
            voice.backend,
            voice.params,
            &config,
            cancel.child_token(),
        );
        let mut segmenter =
            Segmenter::new(config.max_unit_chars).with_input_limit(config.max_input_chars);
        let mut progress = Progress::new(config.max_failed_units);
        let mut pending: VecDeque<Unit> = VecDeque::new();
        let mut input_open = true;
        let mut state = SessionState::Collecting;

        tracing::info!("request started");

        let abort = loop {
            if !input_open && pending.is_empty() && progress.in_flight == 0 {
                break None;
            }

            tokio::select! {
                biased;

                () = cancel.cancelled() => break Some(RequestError::Cancelled),

                Some(done) = completions.recv(), if progress.in_flight > 0 => {
                    if let Err(reason) = progress.complete(done, &cancel, sink).await {
                        break Some(reason);
                    }
                }

                permit = pool.acquire(), if !pending.is_empty() => {
                    let Some(permit) = permit else { continue };
                    let Some(unit) = pending.pop_front() else { continue };
                    progress.mark(unit.index, UnitState::InFlight);
                    progress.in_flight += 1;
                    pool.dispatch(unit, permit);
                    if state == SessionState::Collecting {
                        state = transition(state, SessionState::Dispatching);
                    }
                }

                fragment = input.next(), if input_open => {
                    let units = match fragment {
                        Some(text) => match segmenter.push(&text) {
                            Ok(units) => units,
                            Err(e) => {
                                tracing::warn!(error = %e, "rejecting request text");
                                break Some(RequestError::Segmentation(e));
                            }
                        },
                        None => {
                            input_open = false;
                            state = transition(state, SessionState::Draining);
                            segmenter.finish()
                        }
                    };
                    for unit in units {
                        tracing::debug!(index = unit.index, text = %unit.text, "unit ready");
                        progress.push(&unit);
                        pending.push_back(unit);
                    }
                }
            }
        };

        let outcome = match abort {
            Some(reason) => {
                pool.cancel();
                transition(state, SessionState::Cancelled);
                tracing::info!(
                    reason = %reason,
                    abandoned = progress.in_flight + pending.len(),
                    "request aborted"
                );
                Outcome::Aborted(reason)
            }
            None => {
                transition(state, SessionState::Complete);
                Outcome::Completed
            }
        };

        let summary = Summary {
            units: segmenter.emitted(),
            succeeded: progress.succeeded,
            failed: progress.failed,
            outcome,
        };
        tracing::info!(%summary, "request finished");

        if let Err(e) = sink.emit(SynthesisEvent::Finished(summary.clone())).await {
            tracing::debug!(error = %e, "terminal event not delivered");
        }
        summary
    }
}

fn transition(from: SessionState, to: SessionState) -> SessionState {
    if from != to {
        tracing::debug!(?from, ?to, "session state");
    }
    to
}

/// Unit ledger, reorder state and counters owned by the session loop
struct Progress {
    ledger: Vec<UnitState>,
    reorder: ReorderBuffer<UnitOutcome>,
    in_flight: usize,
    completed_failures: usize,
    succeeded: usize,
    failed: usize,
    max_failed: Option<usize>,
}

impl Progress {
    fn new(max_failed: Option<usize>) -> Self {
        Self {
            ledger: Vec::new(),
            reorder: ReorderBuffer::new(),
            in_flight: 0,
            completed_failures: 0,
            succeeded: 0,
            failed: 0,
            max_failed,
        }
    }

    fn push(&mut self, unit: &Unit) {
        debug_assert_eq!(usize::try_from(unit.index).ok(), Some(self.ledger.len()));
        self.ledger.push(UnitState::Pending);
    }

    fn state(&self, index: u64) -> Option<UnitState> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.ledger.get(i))
            .copied()
    }

    fn mark(&mut self, index: u64, state: UnitState) {
        if let Some(slot) = usize::try_from(index)
            .ok()
            .and_then(|i| self.ledger.get_mut(i))
        {
            *slot = state;
        }
    }

    /// Record a completion, then emit every unit it unblocks
    async fn complete<K>(
        &mut self,
        done: Completion,
        cancel: &CancellationToken,
        sink: &mut K,
    ) -> Result<(), RequestError>
    where
        K: EventSink + ?Sized,
    {
        self.in_flight = self.in_flight.saturating_sub(1);
        let index = done.unit.index;

        if self.state(index) != Some(UnitState::InFlight) {
            tracing::warn!(index, "ignoring completion for a unit not in flight");
            return Ok(());
        }
        self.mark(index, done.outcome.state());

        if matches!(done.outcome, UnitOutcome::Failure(_)) {
            self.completed_failures += 1;
        }
        if let Err(e) = self.reorder.insert(index, done.outcome) {
            tracing::warn!(error = %e, "dropping completion");
            return Ok(());
        }
        if self.reorder.cursor() != index {
            tracing::trace!(index, waiting_on = self.reorder.cursor(), "holding unit");
        }

        while let Some((index, outcome)) = self.reorder.pop_ready() {
            let (event, ok) = match outcome {
                UnitOutcome::Success(audio) => (SynthesisEvent::Audio { index, audio }, true),
                UnitOutcome::Failure(failure) => (
                    SynthesisEvent::UnitFailed {
                        index,
                        error: failure.error,
                    },
                    false,
                ),
            };

            if cancel.is_cancelled() {
                return Err(RequestError::Cancelled);
            }
            if let Err(e) = sink.emit(event).await {
                tracing::info!(error = %e, "client went away");
                cancel.cancel();
                return Err(RequestError::Cancelled);
            }
            if ok {
                self.succeeded += 1;
            } else {
                self.failed += 1;
            }
        }

        if let Some(limit) = self.max_failed
            && self.completed_failures > limit
        {
            return Err(RequestError::TooManyFailures {
                failed: self.completed_failures,
                limit,
            });
        }
        Ok(())
    }
}
