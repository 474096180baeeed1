//! Voice-name based backend selection

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use secrecy::SecretString;

use super::openai;
use super::{
    AudioFormat, GoogleBackend, OpenAiBackend, RateLimitedBackend, SynthesisParams, TtsBackend,
};
use crate::config::BackendsConfig;
use crate::{Error, Result};

/// Language used when a voice name carries none
const DEFAULT_LANGUAGE: &str = "en-US";

static LANGUAGE_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z]{2,3})[-_]([A-Za-z]{2}|[0-9]{3})(?:-|$)").expect("valid regex")
});

/// Cloud provider family a voice belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    /// Google Cloud Chirp 3 HD voices
    Google,
    /// `OpenAI` speech voices
    OpenAi,
}

impl Provider {
    /// Detect the provider from an advertised voice name
    #[must_use]
    pub fn detect(voice_name: &str) -> Option<Self> {
        let lower = voice_name.trim().to_lowercase();
        if lower.contains("-chirp3-hd-") {
            Some(Self::Google)
        } else if lower.contains("-openai-") {
            Some(Self::OpenAi)
        } else {
            None
        }
    }

    /// Catalog key for this provider
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
        }
    }

    /// Parse a catalog key
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "google" => Some(Self::Google),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

/// Derive a BCP-47 language code from a voice name such as `en-US-Chirp3-HD-Charon`
#[must_use]
pub fn language_from_voice(voice_name: &str) -> String {
    LANGUAGE_PREFIX
        .captures(voice_name.trim())
        .map_or_else(
            || DEFAULT_LANGUAGE.to_string(),
            |c| format!("{}-{}", c[1].to_lowercase(), c[2].to_uppercase()),
        )
}

/// Backend and parameters chosen for one request
#[derive(Clone)]
pub struct ResolvedVoice {
    /// Provider the voice belongs to
    pub provider: Provider,
    /// Backend that will synthesize every unit of the request
    pub backend: Arc<dyn TtsBackend>,
    /// Voice, language and format passed on each call
    pub params: SynthesisParams,
}

impl std::fmt::Debug for ResolvedVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedVoice")
            .field("provider", &self.provider)
            .field("backend", &self.backend.name())
            .field("params", &self.params)
            .finish()
    }
}

/// Maps voice names onto configured backends
pub struct BackendRegistry {
    backends: HashMap<Provider, Arc<dyn TtsBackend>>,
    default_voice: String,
    /// Format requested from Google; `OpenAI` always answers at 24 kHz
    google_format: AudioFormat,
}

impl BackendRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(default_voice: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            backends: HashMap::new(),
            default_voice: default_voice.into(),
            google_format: format,
        }
    }

    /// Build every backend whose API key is configured.
    ///
    /// All backends share one HTTP connection pool.
    ///
    /// # Errors
    ///
    /// Returns error if a configured backend rejects its settings
    pub fn from_config(
        config: &BackendsConfig,
        default_voice: impl Into<String>,
        format: AudioFormat,
    ) -> Result<Self> {
        let client = reqwest::Client::new();
        let mut registry = Self::new(default_voice, format);

        if let Some(key) = &config.openai_api_key {
            let backend = OpenAiBackend::new(
                client.clone(),
                SecretString::from(key.clone()),
                config.openai_model.clone(),
                config.openai_base_url.clone(),
            )?;
            tracing::info!(model = backend.model(), "openai backend enabled");
            registry = registry.with_backend(
                Provider::OpenAi,
                limit(Arc::new(backend), config.requests_per_second),
            );
        }

        if let Some(key) = &config.google_api_key {
            let backend = GoogleBackend::new(
                client,
                SecretString::from(key.clone()),
                config.google_base_url.clone(),
                config.google_sample_rate,
            )?;
            tracing::info!(sample_rate = config.google_sample_rate, "google backend enabled");
            registry = registry.with_backend(
                Provider::Google,
                limit(Arc::new(backend), config.requests_per_second),
            );
        }

        if registry.backends.is_empty() {
            tracing::warn!("no TTS backend configured; set OPENAI_API_KEY or GOOGLE_API_KEY");
        }

        Ok(registry)
    }

    /// Register (or replace) the backend for a provider
    #[must_use]
    pub fn with_backend(mut self, provider: Provider, backend: Arc<dyn TtsBackend>) -> Self {
        self.backends.insert(provider, backend);
        self
    }

    /// Whether any backend is registered for `provider`
    #[must_use]
    pub fn has(&self, provider: Provider) -> bool {
        self.backends.contains_key(&provider)
    }

    /// Voice used when a request names none
    #[must_use]
    pub fn default_voice(&self) -> &str {
        &self.default_voice
    }

    /// Pick the backend for a requested voice.
    ///
    /// Missing or unrecognized voice names fall back to the default voice.
    /// An explicit `language` wins over the one embedded in the voice name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VoiceNotFound`] when no configured backend serves the voice
    pub fn resolve(&self, voice: Option<&str>, language: Option<&str>) -> Result<ResolvedVoice> {
        let requested = voice.map(str::trim).filter(|v| !v.is_empty());

        let (name, provider) = match requested.and_then(|v| Provider::detect(v).map(|p| (v, p))) {
            Some(found) => found,
            None => {
                if let Some(v) = requested {
                    tracing::warn!(voice = v, fallback = %self.default_voice, "unrecognized voice, using default");
                }
                let provider = Provider::detect(&self.default_voice)
                    .ok_or_else(|| Error::VoiceNotFound(self.default_voice.clone()))?;
                (self.default_voice.as_str(), provider)
            }
        };

        let backend = self.backends.get(&provider).cloned().ok_or_else(|| {
            Error::VoiceNotFound(format!("{name} (no {} backend configured)", provider.key()))
        })?;

        let language = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map_or_else(|| language_from_voice(name), |l| l.replace('_', "-"));

        Ok(ResolvedVoice {
            provider,
            backend,
            params: SynthesisParams {
                voice: name.to_string(),
                language,
                format: self.output_format(provider),
            },
        })
    }
}

impl BackendRegistry {
    /// Audio format the provider's backend produces
    const fn output_format(&self, provider: Provider) -> AudioFormat {
        match provider {
            Provider::Google => self.google_format,
            Provider::OpenAi => openai::OUTPUT_FORMAT,
        }
    }
}

fn limit(backend: Arc<dyn TtsBackend>, per_second: Option<NonZeroU32>) -> Arc<dyn TtsBackend> {
    match per_second {
        Some(rate) => Arc::new(RateLimitedBackend::new(backend, rate)),
        None => backend,
    }
}
