//! TOML configuration file loading
//!
//! Supports `~/.config/wyoming-streamer/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamerConfigFile {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Pipeline tuning
    #[serde(default)]
    pub synthesis: SynthesisFileConfig,

    /// Voice selection
    #[serde(default)]
    pub voices: VoicesFileConfig,

    /// Provider credentials and endpoints
    #[serde(default)]
    pub backends: BackendsFileConfig,
}

/// Listener configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// `tcp://host:port`, `unix:///path` or `stdio://`
    pub uri: Option<String>,

    /// Advertise and accept streaming synthesis
    pub streaming: Option<bool>,

    /// Samples per outgoing `audio-chunk`
    pub samples_per_chunk: Option<usize>,
}

/// Pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct SynthesisFileConfig {
    pub max_unit_chars: Option<usize>,
    pub max_input_chars: Option<usize>,
    pub max_concurrency: Option<usize>,
    pub unit_timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,

    /// Abort a request once more than this many units failed
    pub max_failed_units: Option<usize>,

    /// `"silence"` or `"none"`
    pub failure_marker: Option<String>,

    /// Length of the silence marker
    pub failure_silence_ms: Option<u64>,
}

/// Voice selection
#[derive(Debug, Default, Deserialize)]
pub struct VoicesFileConfig {
    /// Voice used when a request names none (e.g. "en-US-Chirp3-HD-Charon")
    pub default: Option<String>,

    /// Path to a `voices.json` catalog
    pub catalog: Option<String>,
}

/// Provider credentials and endpoints
#[derive(Debug, Default, Deserialize)]
pub struct BackendsFileConfig {
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub openai_base_url: Option<String>,
    pub google_api_key: Option<String>,
    pub google_base_url: Option<String>,
    pub google_sample_rate: Option<u32>,

    /// Per-provider request quota shared by all requests
    pub requests_per_second: Option<u32>,
}

/// Parse a config file body
///
/// # Errors
///
/// Returns error if the TOML is malformed or names unknown sections
pub fn parse_config_file(content: &str) -> Result<StreamerConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Load the TOML config file
///
/// An explicit `path` must exist and parse. Without one, the standard path is
/// tried and `StreamerConfigFile::default()` is returned if it is missing or
/// unreadable.
///
/// # Errors
///
/// Returns error only for an explicit path that cannot be read or parsed
pub fn load_config_file(path: Option<&Path>) -> Result<StreamerConfigFile> {
    if let Some(path) = path {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        let config = parse_config_file(&content)?;
        tracing::info!(path = %path.display(), "loaded config file");
        return Ok(config);
    }

    let Some(path) = config_file_path() else {
        return Ok(StreamerConfigFile::default());
    };

    if !path.exists() {
        return Ok(StreamerConfigFile::default());
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                Ok(StreamerConfigFile::default())
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            Ok(StreamerConfigFile::default())
        }
    }
}

/// Return the config file path: `~/.config/wyoming-streamer/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("wyoming-streamer").join("config.toml"))
}
