//! Configuration management for the Wyoming streamer
//!
//! Every setting resolves as environment variable > TOML file > default.
//! CLI flags are applied on top by the binary.

pub mod file;

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use self::file::StreamerConfigFile;
use crate::synth::{DEFAULT_MAX_INPUT_CHARS, RetryPolicy};
use crate::{Error, Result};

/// Voice used when neither the request nor the config names one
pub const DEFAULT_VOICE: &str = "en-US-Chirp3-HD-Charon";

/// Streamer configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Listener configuration
    pub server: ServerConfig,

    /// Pipeline tuning
    pub synthesis: SynthesisConfig,

    /// Voice selection
    pub voices: VoicesConfig,

    /// Provider credentials and endpoints
    pub backends: BackendsConfig,
}

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `tcp://host:port`, `unix:///path` or `stdio://`
    pub uri: String,

    /// Advertise and accept `synthesize-start/chunk/stop`
    pub streaming: bool,

    /// Samples per outgoing `audio-chunk`
    pub samples_per_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            uri: "stdio://".to_string(),
            streaming: false,
            samples_per_chunk: 1024,
        }
    }
}

/// What the client hears in place of a failed unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMarker {
    /// Silence of the given length keeps the remaining audio aligned
    Silence(Duration),
    /// The unit is skipped without any audio
    None,
}

impl Default for FailureMarker {
    fn default() -> Self {
        Self::Silence(Duration::from_millis(250))
    }
}

impl FailureMarker {
    /// Parse the `failure_marker` setting
    ///
    /// # Errors
    ///
    /// Returns error for anything other than `silence` or `none`
    pub fn parse(kind: &str, silence: Duration) -> Result<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "silence" => Ok(Self::Silence(silence)),
            "none" => Ok(Self::None),
            other => Err(Error::Config(format!(
                "unknown failure marker {other:?} (expected \"silence\" or \"none\")"
            ))),
        }
    }
}

/// Pipeline tuning for every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisConfig {
    /// Longest unit handed to a backend, in characters
    pub max_unit_chars: usize,

    /// Largest accepted request text, in characters
    pub max_input_chars: usize,

    /// Concurrent backend calls per request
    pub max_concurrency: usize,

    /// Deadline for a single backend call
    pub unit_timeout: Duration,

    /// Attempts and backoff for retryable failures
    pub retry: RetryPolicy,

    /// Abort a request once more than this many units failed
    pub max_failed_units: Option<usize>,

    /// Audio substituted for a failed unit
    pub failure_marker: FailureMarker,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_unit_chars: 300,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            max_concurrency: 3,
            unit_timeout: Duration::from_secs(20),
            retry: RetryPolicy::default(),
            max_failed_units: None,
            failure_marker: FailureMarker::default(),
        }
    }
}

/// Voice selection
#[derive(Debug, Clone)]
pub struct VoicesConfig {
    /// Voice used when a request names none
    pub default_voice: String,

    /// `voices.json` catalog; the built-in catalog is used when unset
    pub catalog: Option<PathBuf>,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            default_voice: DEFAULT_VOICE.to_string(),
            catalog: None,
        }
    }
}

/// Provider credentials and endpoints
#[derive(Clone)]
pub struct BackendsConfig {
    /// `OpenAI` API key (`OPENAI_API_KEY`)
    pub openai_api_key: Option<String>,

    /// `OpenAI` speech model (`OPENAI_TTS_MODEL`)
    pub openai_model: Option<String>,

    /// Override for the `OpenAI` API base URL
    pub openai_base_url: Option<String>,

    /// Google Cloud API key (`GOOGLE_API_KEY`)
    pub google_api_key: Option<String>,

    /// Override for the Google TTS API base URL
    pub google_base_url: Option<String>,

    /// LINEAR16 sample rate requested from Google
    pub google_sample_rate: u32,

    /// Per-provider request quota shared by all requests
    pub requests_per_second: Option<NonZeroU32>,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            openai_model: None,
            openai_base_url: None,
            google_api_key: None,
            google_base_url: None,
            google_sample_rate: 24_000,
            requests_per_second: None,
        }
    }
}

impl std::fmt::Debug for BackendsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |key: &Option<String>| key.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("BackendsConfig")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_model", &self.openai_model)
            .field("openai_base_url", &self.openai_base_url)
            .field("google_api_key", &redact(&self.google_api_key))
            .field("google_base_url", &self.google_base_url)
            .field("google_sample_rate", &self.google_sample_rate)
            .field("requests_per_second", &self.requests_per_second)
            .finish()
    }
}

impl Config {
    /// Load configuration from the process environment and the TOML file.
    ///
    /// `path` overrides the standard config file location.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or a
    /// setting is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = file::load_config_file(path)?;
        Self::from_sources(fc, |name| std::env::var(name).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a setting is invalid
    pub fn from_sources(
        fc: StreamerConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let env = |name: &str| env(name).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        // Server (env > toml > default)
        let server = ServerConfig {
            uri: env("WYOMING_STREAMER_URI")
                .or(fc.server.uri)
                .unwrap_or(defaults.server.uri),
            streaming: env("WYOMING_STREAMER_STREAMING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.server.streaming)
                .unwrap_or(defaults.server.streaming),
            samples_per_chunk: fc
                .server
                .samples_per_chunk
                .filter(|n| *n > 0)
                .unwrap_or(defaults.server.samples_per_chunk),
        };

        // Synthesis (env > toml > default)
        let sc = fc.synthesis;
        let ds = defaults.synthesis;
        let silence = sc
            .failure_silence_ms
            .map_or(Duration::from_millis(250), Duration::from_millis);
        let failure_marker = match sc.failure_marker.as_deref() {
            Some(kind) => FailureMarker::parse(kind, silence)?,
            None => FailureMarker::Silence(silence),
        };
        let synthesis = SynthesisConfig {
            max_unit_chars: parse_env(&env, "WYOMING_STREAMER_MAX_UNIT_CHARS")
                .or(sc.max_unit_chars)
                .unwrap_or(ds.max_unit_chars),
            max_input_chars: sc.max_input_chars.unwrap_or(ds.max_input_chars),
            max_concurrency: parse_env(&env, "WYOMING_STREAMER_MAX_CONCURRENCY")
                .or(sc.max_concurrency)
                .unwrap_or(ds.max_concurrency),
            unit_timeout: sc
                .unit_timeout_ms
                .map_or(ds.unit_timeout, Duration::from_millis),
            retry: RetryPolicy {
                max_attempts: sc.max_attempts.unwrap_or(ds.retry.max_attempts),
                base_delay: sc
                    .backoff_base_ms
                    .map_or(ds.retry.base_delay, Duration::from_millis),
                max_delay: sc
                    .backoff_max_ms
                    .map_or(ds.retry.max_delay, Duration::from_millis),
            },
            max_failed_units: sc.max_failed_units,
            failure_marker,
        };

        // Voices (env > toml > default)
        let voices = VoicesConfig {
            default_voice: env("WYOMING_STREAMER_DEFAULT_VOICE")
                .or(fc.voices.default)
                .unwrap_or(defaults.voices.default_voice),
            catalog: fc.voices.catalog.map(PathBuf::from),
        };

        // Backends (env > toml > None)
        let bc = fc.backends;
        let backends = BackendsConfig {
            openai_api_key: env("OPENAI_API_KEY").or(bc.openai_api_key),
            openai_model: env("OPENAI_TTS_MODEL").or(bc.openai_model),
            openai_base_url: bc.openai_base_url,
            google_api_key: env("GOOGLE_API_KEY").or(bc.google_api_key),
            google_base_url: bc.google_base_url,
            google_sample_rate: bc
                .google_sample_rate
                .unwrap_or(defaults.backends.google_sample_rate),
            requests_per_second: bc
                .requests_per_second
                .map(|rate| {
                    NonZeroU32::new(rate).ok_or_else(|| {
                        Error::Config(
                            "requests_per_second must be at least 1; omit it for no quota".into(),
                        )
                    })
                })
                .transpose()?,
        };

        let config = Self {
            server,
            synthesis,
            voices,
            backends,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns error describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        let s = &self.synthesis;
        if s.max_unit_chars == 0 {
            return Err(Error::Config("max_unit_chars must be at least 1".into()));
        }
        if s.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".into()));
        }
        if s.retry.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if s.unit_timeout.is_zero() {
            return Err(Error::Config("unit_timeout_ms must be positive".into()));
        }
        if self.backends.google_sample_rate == 0 {
            return Err(Error::Config("google_sample_rate must be positive".into()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(env: impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparsable environment variable");
            None
        }
    }
}
