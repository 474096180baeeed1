//! Cloud text-to-speech backends
//!
//! Each provider implements [`TtsBackend`]: one bounded piece of text in,
//! one PCM payload out. Retries, timeouts and ordering live in
//! [`crate::synth`]; backends only classify what went wrong.

mod catalog;
mod google;
mod http;
mod openai;
mod registry;
#[cfg(test)]
mod test_server;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use catalog::{CatalogVoice, VoiceCatalog};
pub use google::GoogleBackend;
pub use http::{classify_status, pcm_from_wav};
pub use openai::OpenAiBackend;
pub use registry::{BackendRegistry, Provider, ResolvedVoice, language_from_voice};

/// Raw PCM layout of an audio payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Sample rate in Hz
    pub rate: u32,
    /// Bytes per sample (2 for 16-bit)
    pub width: u16,
    /// Channel count
    pub channels: u16,
}

impl AudioFormat {
    /// 16-bit mono at the given rate
    #[must_use]
    pub const fn pcm16_mono(rate: u32) -> Self {
        Self {
            rate,
            width: 2,
            channels: 1,
        }
    }

    /// Bytes in one frame (one sample for every channel)
    #[must_use]
    pub const fn frame_bytes(&self) -> usize {
        self.width as usize * self.channels as usize
    }

    /// Bytes needed for `duration` of audio, rounded down to whole frames
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn bytes_for(&self, duration: Duration) -> usize {
        let frames = (duration.as_secs_f64() * f64::from(self.rate)) as usize;
        frames * self.frame_bytes()
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_mono(22_050)
    }
}

/// Synthesized audio for one unit of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    /// Layout of `data`
    pub format: AudioFormat,
    /// Interleaved little-endian PCM frames
    pub data: Vec<u8>,
}

impl AudioPayload {
    /// Create a payload from raw PCM bytes
    #[must_use]
    pub const fn new(format: AudioFormat, data: Vec<u8>) -> Self {
        Self { format, data }
    }

    /// Silence of the given length
    #[must_use]
    pub fn silence(format: AudioFormat, duration: Duration) -> Self {
        Self::new(format, vec![0; format.bytes_for(duration)])
    }

    /// Playback length of the payload
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        let frame = self.format.frame_bytes();
        if frame == 0 || self.format.rate == 0 {
            return Duration::ZERO;
        }
        let frames = (self.data.len() / frame) as f64;
        Duration::from_secs_f64(frames / f64::from(self.format.rate))
    }

    /// Whether the payload holds no audio
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Voice and output parameters for one synthesis call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisParams {
    /// Provider voice name (e.g. `en-US-Chirp3-HD-Charon`)
    pub voice: String,
    /// BCP-47 language code (e.g. `en-US`)
    pub language: String,
    /// Preferred output layout; backends report what they actually produced
    pub format: AudioFormat,
}

/// Why a backend call failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Provider throttled the request
    #[error("rate limited by provider")]
    RateLimited {
        /// Server-suggested wait before retrying
        retry_after: Option<Duration>,
    },

    /// Credentials missing or rejected
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Network failure or provider-side error worth retrying
    #[error("transient error: {0}")]
    Transient(String),

    /// Call exceeded the per-unit timeout
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Request can never succeed as sent
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl BackendError {
    /// Whether another attempt may succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Transient(_) | Self::Timeout(_)
        )
    }

    /// Provider-suggested delay before the next attempt
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "backend_rate_limited",
            Self::Auth(_) => "backend_auth",
            Self::Transient(_) => "backend_transient",
            Self::Timeout(_) => "timeout",
            Self::Permanent(_) => "backend_permanent",
        }
    }
}

/// A text-to-speech provider
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &'static str;

    /// Synthesize one unit of text
    ///
    /// # Errors
    ///
    /// Returns a classified [`BackendError`]; the caller decides whether to retry
    async fn synthesize(
        &self,
        text: &str,
        params: &SynthesisParams,
    ) -> std::result::Result<AudioPayload, BackendError>;
}

/// Wraps a backend with a process-wide request quota
///
/// Every request holding a clone of the wrapper draws from the same
/// bucket, matching how providers throttle per API key.
pub struct RateLimitedBackend {
    inner: Arc<dyn TtsBackend>,
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitedBackend {
    /// Allow at most `per_second` calls per second through to `inner`
    #[must_use]
    pub fn new(inner: Arc<dyn TtsBackend>, per_second: NonZeroU32) -> Self {
        Self {
            inner,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }
}

#[async_trait]
impl TtsBackend for RateLimitedBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &SynthesisParams,
    ) -> std::result::Result<AudioPayload, BackendError> {
        self.limiter.until_ready().await;
        self.inner.synthesize(text, params).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TtsBackend for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn synthesize(
            &self,
            _text: &str,
            params: &SynthesisParams,
        ) -> std::result::Result<AudioPayload, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AudioPayload::new(params.format, vec![0; 2]))
        }
    }

    fn params() -> SynthesisParams {
        SynthesisParams {
            voice: "en-US-openai-nova".to_string(),
            language: "en-US".to_string(),
            format: AudioFormat::default(),
        }
    }

    // governor keeps its own clock, so this runs in real time
    #[tokio::test]
    async fn rate_limit_holds_calls_beyond_quota() {
        let inner = Arc::new(Counting::default());
        let per_second = NonZeroU32::new(2).expect("non-zero");
        let limited = RateLimitedBackend::new(inner.clone(), per_second);
        let params = params();

        limited.synthesize("one", &params).await.expect("first");
        limited.synthesize("two", &params).await.expect("second");

        let third = tokio::time::timeout(
            Duration::from_millis(100),
            limited.synthesize("three", &params),
        )
        .await;
        assert!(third.is_err(), "third call should wait for the quota");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        limited.synthesize("four", &params).await.expect("after refill");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(limited.name(), "counting");
    }

    #[test]
    fn retryable_classification() {
        assert!(BackendError::RateLimited { retry_after: None }.is_retryable());
        assert!(BackendError::Transient("reset".into()).is_retryable());
        assert!(BackendError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!BackendError::Auth("bad key".into()).is_retryable());
        assert!(!BackendError::Permanent("bad voice".into()).is_retryable());
    }

    #[test]
    fn payload_duration_from_format() {
        // One second of 16-bit mono at 24 kHz
        let payload = AudioPayload::new(AudioFormat::pcm16_mono(24_000), vec![0; 48_000]);
        assert_eq!(payload.duration(), Duration::from_secs(1));
    }

    #[test]
    fn silence_is_frame_aligned() {
        let format = AudioFormat {
            rate: 16_000,
            width: 2,
            channels: 2,
        };
        let silence = AudioPayload::silence(format, Duration::from_millis(250));
        assert_eq!(silence.data.len(), 4_000 * 4);
        assert!(silence.data.iter().all(|b| *b == 0));
    }

    #[test]
    fn zero_rate_has_no_duration() {
        let format = AudioFormat {
            rate: 0,
            width: 2,
            channels: 1,
        };
        assert_eq!(AudioPayload::new(format, vec![0; 10]).duration(), Duration::ZERO);
    }
}
