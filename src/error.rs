//! Error types for the Wyoming streamer

use thiserror::Error;

use crate::backend::BackendError;
use crate::synth::SegmentError;
use crate::wyoming::ProtocolError;

/// Result type alias for streamer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Wyoming streamer
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown or unusable voice
    #[error("voice not found: {0}")]
    VoiceNotFound(String),

    /// Text segmentation error
    #[error("segmentation error: {0}")]
    Segmentation(#[from] SegmentError),

    /// Text-to-speech backend error
    #[error("TTS error: {0}")]
    Backend(#[from] BackendError),

    /// Wyoming protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The client side of a request went away
    #[error("client disconnected")]
    Disconnected,

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// URI parsing error
    #[error("invalid uri: {0}")]
    Uri(#[from] url::ParseError),
}
