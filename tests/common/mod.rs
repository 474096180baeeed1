//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use wyoming_streamer::backend::{Provider, ResolvedVoice};
use wyoming_streamer::synth::{Summary, SynthesisEvent};
use wyoming_streamer::{AudioFormat, AudioPayload, BackendError, SynthesisParams, TtsBackend};

/// Format every scripted payload is reported in
pub const FORMAT: AudioFormat = AudioFormat::pcm16_mono(16_000);

/// What the backend does for one call
#[derive(Debug, Clone)]
pub enum Step {
    /// Wait, then return the unit text as audio bytes
    Succeed(Duration),
    /// Wait, then fail
    Fail(Duration, BackendError),
    /// Never return
    Hang,
}

/// Mock backend driven by per-text scripts.
///
/// Calls for text containing a scripted key consume that key's steps in
/// order; once a script runs out (or for unscripted text) the call succeeds
/// immediately. Successful audio is the unit's UTF-8 text, which lets tests
/// read back the order units were emitted in.
#[derive(Default)]
pub struct ScriptedBackend {
    scripts: Mutex<Vec<(String, Vec<Step>)>>,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script calls for text containing `key`
    #[must_use]
    pub fn script(self, key: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .expect("lock")
            .push((key.to_string(), steps.into_iter().rev().collect()));
        self
    }

    /// Calls made for text containing `key`
    pub fn calls_for(&self, key: &str) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|(text, _)| text.contains(key))
            .map(|(_, n)| n)
            .sum()
    }

    /// Total calls made
    pub fn total_calls(&self) -> usize {
        self.calls.lock().expect("lock").values().sum()
    }

    /// Calls currently running
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Most calls ever running at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn next_step(&self, text: &str) -> Step {
        let mut scripts = self.scripts.lock().expect("lock");
        scripts
            .iter_mut()
            .find(|(key, _)| text.contains(key.as_str()))
            .and_then(|(_, steps)| steps.pop())
            .unwrap_or(Step::Succeed(Duration::ZERO))
    }
}

/// Decrements the active-call counter when a call ends or is dropped
struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TtsBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn synthesize(
        &self,
        text: &str,
        _params: &SynthesisParams,
    ) -> Result<AudioPayload, BackendError> {
        *self
            .calls
            .lock()
            .expect("lock")
            .entry(text.to_string())
            .or_default() += 1;

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        match self.next_step(text) {
            Step::Succeed(delay) => {
                tokio::time::sleep(delay).await;
                Ok(AudioPayload::new(FORMAT, text.as_bytes().to_vec()))
            }
            Step::Fail(delay, error) => {
                tokio::time::sleep(delay).await;
                Err(error)
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

/// Voice routed to `backend`
pub fn voice(backend: Arc<dyn TtsBackend>) -> ResolvedVoice {
    ResolvedVoice {
        provider: Provider::OpenAi,
        backend,
        params: SynthesisParams {
            voice: "en-US-openai-alloy".to_string(),
            language: "en-US".to_string(),
            format: FORMAT,
        },
    }
}

/// Drain every event a finished session sent
pub async fn collect(mut rx: mpsc::UnboundedReceiver<SynthesisEvent>) -> Vec<SynthesisEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

/// Compact view of an event stream: `"audio:<text>"`, `"failed:<index>"`, `"end"`
pub fn describe(events: &[SynthesisEvent]) -> Vec<String> {
    events
        .iter()
        .map(|event| match event {
            SynthesisEvent::Audio { audio, .. } => {
                format!("audio:{}", String::from_utf8_lossy(&audio.data))
            }
            SynthesisEvent::UnitFailed { index, .. } => format!("failed:{index}"),
            SynthesisEvent::Finished(_) => "end".to_string(),
        })
        .collect()
}

/// The terminal summary, asserting it is the last event
pub fn summary_of(events: &[SynthesisEvent]) -> &Summary {
    match events.last() {
        Some(SynthesisEvent::Finished(summary)) => summary,
        other => panic!("last event is not terminal: {other:?}"),
    }
}
