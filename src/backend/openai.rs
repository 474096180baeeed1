//! `OpenAI` speech synthesis

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use super::http::{check_response, classify_transport, pcm_from_wav};
use super::{AudioFormat, AudioPayload, BackendError, SynthesisParams, TtsBackend};
use crate::{Error, Result};

/// Default speech model when `OPENAI_TTS_MODEL` is unset
pub const DEFAULT_MODEL: &str = "gpt-4o-mini-tts";

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// `OpenAI` speech is 24 kHz 16-bit mono; also assumed when the WAV header is unusable
pub(crate) const OUTPUT_FORMAT: AudioFormat = AudioFormat::pcm16_mono(24_000);

/// Synthesizes speech through `OpenAI`'s `/v1/audio/speech` endpoint
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
    /// Create a new `OpenAI` backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        model: Option<String>,
        base_url: Option<String>,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("OpenAI API key required for TTS".to_string()));
        }

        Ok(Self {
            client,
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Model used for synthesis
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Reduce an advertised voice name to the bare `OpenAI` voice.
///
/// Accepts `en-US-openai-alloy` as well as plain `alloy`.
#[must_use]
pub fn parse_voice(voice_name: &str) -> String {
    let trimmed = voice_name.trim();
    let lower = trimmed.to_lowercase();
    lower
        .find("-openai-")
        .map_or(lower.as_str(), |i| &lower[i + "-openai-".len()..])
        .to_string()
}

#[async_trait]
impl TtsBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &SynthesisParams,
    ) -> std::result::Result<AudioPayload, BackendError> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'a str,
        }

        let voice = parse_voice(&params.voice);
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &voice,
            response_format: "wav",
        };

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response, self.name()).await?;
        let audio = response.bytes().await.map_err(|e| classify_transport(&e))?;

        pcm_from_wav(&audio, OUTPUT_FORMAT)
    }
}
