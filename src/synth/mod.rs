//! Streaming synthesis orchestrator
//!
//! Turns a stream of text fragments into an ordered stream of audio:
//!
//! ```text
//! fragments ─▶ Segmenter ─▶ pending units ─▶ DispatchPool ──┐ (out of order)
//!                                                           ▼
//!            EventSink ◀── ReorderBuffer ◀── completion channel
//! ```
//!
//! A [`Session`] owns one request end to end. Only the dispatch tasks run
//! concurrently; segmenting, reordering and emitting all happen on the
//! session's own loop, so none of that state is shared.

mod dispatch;
mod reorder;
mod retry;
mod segmenter;
mod session;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{AudioPayload, BackendError};
use crate::{Error, Result};

pub use dispatch::{Completion, DispatchPool};
pub use reorder::{ReorderBuffer, ReorderError};
pub use retry::RetryPolicy;
pub use segmenter::{DEFAULT_MAX_INPUT_CHARS, SegmentError, Segmenter, segment};
pub use session::{Session, SessionState};

/// One segment of text scheduled for independent synthesis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// 0-based position in the request's output
    pub index: u64,
    /// Normalized text to synthesize
    pub text: String,
}

/// Lifecycle of a unit within its request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Produced by the segmenter, waiting for a slot
    Pending,
    /// Backend call (or backoff) in progress
    InFlight,
    /// Audio received
    Succeeded,
    /// Gave up; the error is final
    Failed,
}

/// Final error for a unit, with how many calls were made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// Last error returned by the backend
    pub error: BackendError,
    /// Backend invocations made for the unit
    pub attempts: u32,
}

/// Result of dispatching a unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    /// Synthesized audio
    Success(AudioPayload),
    /// Terminal failure
    Failure(UnitFailure),
}

impl UnitOutcome {
    /// Unit state this outcome moves to
    #[must_use]
    pub const fn state(&self) -> UnitState {
        match self {
            Self::Success(_) => UnitState::Succeeded,
            Self::Failure(_) => UnitState::Failed,
        }
    }
}

/// Why a whole request stopped early
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// Client disconnected, interrupted, or the server is shutting down
    #[error("request cancelled")]
    Cancelled,
    /// Input text could not be segmented
    #[error("segmentation failed: {0}")]
    Segmentation(#[source] SegmentError),
    /// More units failed than the configured threshold allows
    #[error("{failed} units failed (limit {limit})")]
    TooManyFailures {
        /// Units failed so far
        failed: usize,
        /// Configured threshold
        limit: usize,
    },
}

impl RequestError {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Segmentation(_) => "segmentation_error",
            Self::TooManyFailures { .. } => "too_many_failures",
        }
    }
}

/// How a request ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Every unit reached a terminal state and was released
    Completed,
    /// The pipeline was torn down early
    Aborted(RequestError),
}

/// Counts carried by the terminal event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    /// Units produced by the segmenter
    pub units: u64,
    /// Units released with audio
    pub succeeded: usize,
    /// Units released as failures
    pub failed: usize,
    /// How the request ended
    pub outcome: Outcome,
}

impl Summary {
    /// Whether the request ran to completion (possibly with unit failures)
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.outcome, Outcome::Completed)
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed of {} units",
            self.succeeded, self.failed, self.units
        )?;
        if let Outcome::Aborted(reason) = &self.outcome {
            write!(f, " ({reason})")?;
        }
        Ok(())
    }
}

/// Ordered output of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SynthesisEvent {
    /// Audio for one unit
    Audio {
        /// Sequence index of the unit
        index: u64,
        /// Synthesized audio
        audio: AudioPayload,
    },
    /// Partial-failure marker: the unit at `index` produced no audio
    UnitFailed {
        /// Sequence index of the unit
        index: u64,
        /// Final backend error
        error: BackendError,
    },
    /// Terminal event; always the last one emitted
    Finished(Summary),
}

/// Consumer of a session's ordered events (the protocol side)
#[async_trait]
pub trait EventSink: Send {
    /// Deliver one event
    ///
    /// # Errors
    ///
    /// An error means the client is gone; the session cancels itself
    async fn emit(&mut self, event: SynthesisEvent) -> Result<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<SynthesisEvent> {
    async fn emit(&mut self, event: SynthesisEvent) -> Result<()> {
        self.send(event).await.map_err(|_| Error::Disconnected)
    }
}

#[async_trait]
impl EventSink for mpsc::UnboundedSender<SynthesisEvent> {
    async fn emit(&mut self, event: SynthesisEvent) -> Result<()> {
        self.send(event).map_err(|_| Error::Disconnected)
    }
}
