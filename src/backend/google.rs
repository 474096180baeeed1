//! Google Cloud Text-to-Speech

use async_trait::async_trait;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::http::{check_response, classify_transport, pcm_from_wav};
use super::{AudioFormat, AudioPayload, BackendError, SynthesisParams, TtsBackend};
use crate::{Error, Result};

/// Default API base URL
pub const DEFAULT_BASE_URL: &str = "https://texttospeech.googleapis.com";

/// Synthesizes speech through the Cloud Text-to-Speech REST API with `LINEAR16` output
pub struct GoogleBackend {
    client: reqwest::Client,
    api_key: SecretString,
    base_url: String,
    sample_rate: u32,
}

impl GoogleBackend {
    /// Create a new Google backend
    ///
    /// # Errors
    ///
    /// Returns error if the API key is empty or the sample rate is zero
    pub fn new(
        client: reqwest::Client,
        api_key: SecretString,
        base_url: Option<String>,
        sample_rate: u32,
    ) -> Result<Self> {
        if api_key.expose_secret().is_empty() {
            return Err(Error::Config("Google API key required for TTS".to_string()));
        }
        if sample_rate == 0 {
            return Err(Error::Config("Google sample rate must be non-zero".to_string()));
        }

        Ok(Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            sample_rate,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeRequest<'a> {
    input: TextInput<'a>,
    voice: VoiceSelection<'a>,
    audio_config: AudioConfig,
}

#[derive(Serialize)]
struct TextInput<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection<'a> {
    language_code: &'a str,
    name: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: &'static str,
    sample_rate_hertz: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SynthesizeResponse {
    #[serde(default)]
    audio_content: String,
}

#[async_trait]
impl TtsBackend for GoogleBackend {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn synthesize(
        &self,
        text: &str,
        params: &SynthesisParams,
    ) -> std::result::Result<AudioPayload, BackendError> {
        let request = SynthesizeRequest {
            input: TextInput { text },
            voice: VoiceSelection {
                language_code: &params.language,
                name: &params.voice,
            },
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16",
                sample_rate_hertz: self.sample_rate,
            },
        };

        let response = self
            .client
            .post(format!("{}/v1/text:synthesize", self.base_url))
            .header("x-goog-api-key", self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let response = check_response(response, self.name()).await?;
        let body: SynthesizeResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Permanent(format!("malformed Google response: {e}")))?;

        let audio = base64::engine::general_purpose::STANDARD
            .decode(body.audio_content.as_bytes())
            .map_err(|e| BackendError::Permanent(format!("invalid audioContent: {e}")))?;

        pcm_from_wav(&audio, AudioFormat::pcm16_mono(self.sample_rate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_server::{Reply, client, pcm, serve_once, wav};

    fn backend(base_url: String) -> GoogleBackend {
        GoogleBackend::new(
            client(),
            SecretString::from("g-key".to_string()),
            Some(base_url),
            16_000,
        )
        .expect("backend")
    }

    fn params() -> SynthesisParams {
        SynthesisParams {
            voice: "en-GB-Chirp3-HD-Kore".to_string(),
            language: "en-GB".to_string(),
            format: AudioFormat::pcm16_mono(16_000),
        }
    }

    fn json_reply(audio: &[u8]) -> Reply {
        let content = base64::engine::general_purpose::STANDARD.encode(audio);
        let body = serde_json::json!({ "audioContent": content }).to_string();
        Reply::ok("application/json", body.into_bytes())
    }

    #[tokio::test]
    async fn base64_wav_becomes_pcm() {
        let samples = [5, -5, 300, -300];
        let (base, server) = serve_once(json_reply(&wav(16_000, &samples))).await;

        let audio = backend(base)
            .synthesize("Good morning.", &params())
            .await
            .expect("audio");
        assert_eq!(audio.format, AudioFormat::pcm16_mono(16_000));
        assert_eq!(audio.data, pcm(&samples));

        let request = server.await.expect("server");
        assert!(request.head.starts_with("post /v1/text:synthesize "));
        assert!(request.head.contains("x-goog-api-key: g-key"));
        let body: serde_json::Value = serde_json::from_str(&request.body).expect("json body");
        assert_eq!(body["voice"]["name"], "en-GB-Chirp3-HD-Kore");
        assert_eq!(body["voice"]["languageCode"], "en-GB");
        assert_eq!(body["audioConfig"]["sampleRateHertz"], 16_000);
    }

    #[tokio::test]
    async fn headerless_audio_uses_requested_rate() {
        let samples = [1, 2, 3];
        let (base, server) = serve_once(json_reply(&pcm(&samples))).await;

        let audio = backend(base)
            .synthesize("Raw.", &params())
            .await
            .expect("audio");
        assert_eq!(audio.format, AudioFormat::pcm16_mono(16_000));
        assert_eq!(audio.data, pcm(&samples));
        server.await.expect("server");
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let (base, server) = serve_once(Reply::status("503 Service Unavailable")).await;

        let err = backend(base)
            .synthesize("Hello.", &params())
            .await
            .expect_err("unavailable");
        assert!(matches!(err, BackendError::Transient(_)));
        assert!(err.is_retryable());
        server.await.expect("server");
    }

    #[test]
    fn request_shape_matches_rest_api() {
        let request = SynthesizeRequest {
            input: TextInput { text: "Hello." },
            voice: VoiceSelection {
                language_code: "en-US",
                name: "en-US-Chirp3-HD-Charon",
            },
            audio_config: AudioConfig {
                audio_encoding: "LINEAR16",
                sample_rate_hertz: 24_000,
            },
        };
        let json = serde_json::to_value(&request).expect("json");
        assert_eq!(json["input"]["text"], "Hello.");
        assert_eq!(json["voice"]["languageCode"], "en-US");
        assert_eq!(json["voice"]["name"], "en-US-Chirp3-HD-Charon");
        assert_eq!(json["audioConfig"]["audioEncoding"], "LINEAR16");
        assert_eq!(json["audioConfig"]["sampleRateHertz"], 24_000);
    }

    #[test]
    fn rejects_zero_sample_rate() {
        let result = GoogleBackend::new(
            reqwest::Client::new(),
            SecretString::from("key".to_string()),
            None,
            0,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn missing_audio_content_defaults_empty() {
        let body: SynthesizeResponse = serde_json::from_str("{}").expect("json");
        assert!(body.audio_content.is_empty());
    }
}
