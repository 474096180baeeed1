//! Wyoming Streamer - sentence-level streaming for cloud text-to-speech
//!
//! This library provides the pieces of the `wyoming-streamer` server:
//! - Incremental segmentation of streamed text into sentence-sized units
//! - Bounded, retrying fan-out of units to cloud TTS backends
//! - In-order reassembly of out-of-order results
//! - The Wyoming protocol front end used by Home Assistant
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                Wyoming clients                      │
//! │        tcp://  │  unix://  │  stdio://              │
//! └────────────────────┬────────────────────────────────┘
//!                      │ synthesize / synthesize-chunk
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Session                           │
//! │  Segmenter → DispatchPool → ReorderBuffer → Emitter │
//! └────────────────────┬────────────────────────────────┘
//!                      │ one call per unit
//! ┌────────────────────▼────────────────────────────────┐
//! │                  Backends                           │
//! │          Google Chirp 3 HD  │  OpenAI               │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod synth;
pub mod wyoming;

pub use backend::{AudioFormat, AudioPayload, BackendError, SynthesisParams, TtsBackend};
pub use config::Config;
pub use error::{Error, Result};
pub use synth::{Session, Summary, SynthesisEvent};
