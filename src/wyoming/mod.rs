//! Wyoming protocol front end
//!
//! Speaks the line-delimited JSON event protocol used by Home Assistant:
//! every event is a header line, optionally followed by a JSON data block
//! and a binary payload.

mod emitter;
mod event;
mod handler;
mod server;

use thiserror::Error;

pub use emitter::WyomingEmitter;
pub use event::{
    Attribution, AudioInfo, ErrorEvent, Event, EventWriter, Frame, Info, MAX_DATA_BYTES,
    MAX_HEADER_BYTES, MAX_PAYLOAD_BYTES, SynthesizeChunk, SynthesizeRequest, SynthesizeStart,
    TtsProgram, TtsVoice, VoiceSelection, read_frame, write_frame,
};
pub use handler::{HandlerContext, handle_connection, info_for_catalog};
pub use server::{ListenAddr, serve};

/// Wire-level protocol failures
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Header line exceeded [`MAX_HEADER_BYTES`]
    #[error("event header exceeds {limit} bytes")]
    HeaderTooLarge {
        /// Configured limit
        limit: usize,
    },

    /// Declared data or payload length exceeded its limit
    #[error("event {section} of {len} bytes exceeds {limit} bytes")]
    TooLarge {
        /// `data` or `payload`
        section: &'static str,
        /// Declared length
        len: usize,
        /// Configured limit
        limit: usize,
    },

    /// Stream ended in the middle of an event
    #[error("connection closed mid-event")]
    UnexpectedEof,

    /// Header or data block is not valid JSON of the expected shape
    #[error("malformed {event_type} event: {reason}")]
    Malformed {
        /// Event type, or `header` when the header itself is broken
        event_type: String,
        /// Parser message
        reason: String,
    },

    /// Listener URI scheme or shape not supported
    #[error("unsupported uri {0:?} (expected tcp://host:port, unix:///path or stdio://)")]
    UnsupportedUri(String),

    /// Transport failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Stable machine-readable code
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::HeaderTooLarge { .. } | Self::TooLarge { .. } => "event_too_large",
            Self::UnexpectedEof => "unexpected_eof",
            Self::Malformed { .. } => "malformed_event",
            Self::UnsupportedUri(_) => "unsupported_uri",
            Self::Io(_) => "io_error",
        }
    }
}
