//! Event framing and typed events

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::ProtocolError;
use crate::backend::AudioFormat;

/// Protocol version written into every header
const PROTOCOL_VERSION: &str = "1.5.4";

/// Longest accepted header line, newline excluded
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Largest accepted JSON data block
pub const MAX_DATA_BYTES: usize = 1024 * 1024;

/// Largest accepted binary payload
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// One event as it travels on the wire
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    /// Event type, e.g. `audio-chunk`
    pub kind: String,
    /// Inline and out-of-line data merged into one object
    pub data: Map<String, Value>,
    /// Binary payload (PCM for audio chunks)
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload_length: Option<usize>,
}

/// Read the next event. Returns `Ok(None)` on a clean end of stream.
///
/// # Errors
///
/// Returns [`ProtocolError`] on oversized sections, malformed JSON, or a
/// stream that ends mid-event
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut limited = (&mut *reader).take(MAX_HEADER_BYTES as u64 + 1);
        let n = limited.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(if line.len() > MAX_HEADER_BYTES {
                ProtocolError::HeaderTooLarge {
                    limit: MAX_HEADER_BYTES,
                }
            } else {
                ProtocolError::UnexpectedEof
            });
        }
        if !line.iter().all(u8::is_ascii_whitespace) {
            break;
        }
    }

    let header: Header = serde_json::from_slice(&line).map_err(|e| ProtocolError::Malformed {
        event_type: "header".to_string(),
        reason: e.to_string(),
    })?;

    let mut data = header.data.unwrap_or_default();
    if let Some(len) = header.data_length.filter(|n| *n > 0) {
        let bytes = read_section(reader, "data", len, MAX_DATA_BYTES).await?;
        let extra: Map<String, Value> =
            serde_json::from_slice(&bytes).map_err(|e| ProtocolError::Malformed {
                event_type: header.kind.clone(),
                reason: e.to_string(),
            })?;
        data.extend(extra);
    }

    let payload = match header.payload_length.filter(|n| *n > 0) {
        Some(len) => read_section(reader, "payload", len, MAX_PAYLOAD_BYTES).await?,
        None => Vec::new(),
    };

    Ok(Some(Frame {
        kind: header.kind,
        data,
        payload,
    }))
}

async fn read_section<R>(
    reader: &mut R,
    section: &'static str,
    len: usize,
    limit: usize,
) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    if len > limit {
        return Err(ProtocolError::TooLarge {
            section,
            len,
            limit,
        });
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::UnexpectedEof
        } else {
            ProtocolError::Io(e)
        }
    })?;
    Ok(buf)
}

/// Write one event and flush it
///
/// # Errors
///
/// Returns error if the transport fails
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let data = if frame.data.is_empty() {
        None
    } else {
        Some(serde_json::to_vec(&frame.data).map_err(|e| malformed(&frame.kind, &e))?)
    };
    let header = Header {
        kind: frame.kind.clone(),
        version: Some(PROTOCOL_VERSION.to_string()),
        data: None,
        data_length: data.as_ref().map(Vec::len),
        payload_length: (!frame.payload.is_empty()).then_some(frame.payload.len()),
    };

    let mut out = serde_json::to_vec(&header).map_err(|e| malformed(&frame.kind, &e))?;
    out.push(b'\n');
    if let Some(data) = data {
        out.extend_from_slice(&data);
    }
    out.extend_from_slice(&frame.payload);

    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn malformed(kind: &str, e: &serde_json::Error) -> ProtocolError {
    ProtocolError::Malformed {
        event_type: kind.to_string(),
        reason: e.to_string(),
    }
}

/// Voice requested by the client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceSelection {
    /// Advertised voice name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Language override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Speaker within the voice (unused by cloud voices)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

/// `synthesize`: one-shot request with the whole text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizeRequest {
    /// Text to speak
    pub text: String,
    /// Requested voice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceSelection>,
}

/// `synthesize-start`: opens a streaming request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizeStart {
    /// Requested voice
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<VoiceSelection>,
}

/// `synthesize-chunk`: one text fragment of a streaming request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesizeChunk {
    /// Fragment with arbitrary boundaries
    pub text: String,
}

/// Audio layout carried by `audio-start` and `audio-chunk`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInfo {
    /// Sample rate in Hz
    pub rate: u32,
    /// Bytes per sample
    pub width: u16,
    /// Channel count
    pub channels: u16,
    /// Milliseconds since the start of the stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl From<AudioFormat> for AudioInfo {
    fn from(format: AudioFormat) -> Self {
        Self {
            rate: format.rate,
            width: format.width,
            channels: format.channels,
            timestamp: None,
        }
    }
}

impl AudioInfo {
    /// Layout without the timestamp
    #[must_use]
    pub const fn format(&self) -> AudioFormat {
        AudioFormat {
            rate: self.rate,
            width: self.width,
            channels: self.channels,
        }
    }
}

/// `error`: human-readable text plus a stable code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Description
    pub text: String,
    /// Machine-readable code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Credit shown next to a program or voice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    /// Who to credit
    pub name: String,
    /// Where to find them
    pub url: String,
}

/// One advertised voice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsVoice {
    /// Name clients pass back in `synthesize`
    pub name: String,
    /// Display text
    pub description: Option<String>,
    /// Provider credit
    pub attribution: Attribution,
    /// Always true for cloud voices
    pub installed: bool,
    /// Voice version, when the provider has one
    pub version: Option<String>,
    /// BCP-47 codes the voice speaks
    pub languages: Vec<String>,
    /// Multi-speaker variants; cloud voices have none
    #[serde(default)]
    pub speakers: Option<Vec<Value>>,
}

/// The TTS program this server exposes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TtsProgram {
    /// Program name
    pub name: String,
    /// Display text
    pub description: Option<String>,
    /// Program credit
    pub attribution: Attribution,
    /// Always true
    pub installed: bool,
    /// Crate version
    pub version: Option<String>,
    /// Voices with a configured backend
    pub voices: Vec<TtsVoice>,
    /// Whether `synthesize-start`/`-chunk`/`-stop` are accepted
    #[serde(default)]
    pub supports_synthesize_streaming: bool,
}

/// `info`: answer to `describe`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// TTS programs; this server advertises exactly one
    #[serde(default)]
    pub tts: Vec<TtsProgram>,
}

/// Typed view of the events this server reads or writes
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Client asks for the voice catalog
    Describe,
    /// Voice catalog
    Info(Info),
    /// One-shot request with the whole text
    Synthesize(SynthesizeRequest),
    /// Opens a streaming request
    SynthesizeStart(SynthesizeStart),
    /// Next text fragment of a streaming request
    SynthesizeChunk(SynthesizeChunk),
    /// No more text for the streaming request
    SynthesizeStop,
    /// All audio for the streaming request has been sent
    SynthesizeStopped,
    /// Audio stream opens in the given format
    AudioStart(AudioInfo),
    /// Slice of PCM audio
    AudioChunk {
        /// Layout of `audio`
        info: AudioInfo,
        /// PCM bytes
        audio: Vec<u8>,
    },
    /// Audio stream closed
    AudioStop,
    /// Request or protocol failure
    Error(ErrorEvent),
    /// Any event type this server does not interpret
    Other(Frame),
}

impl Event {
    /// Wire name of the event
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Describe => "describe",
            Self::Info(_) => "info",
            Self::Synthesize(_) => "synthesize",
            Self::SynthesizeStart(_) => "synthesize-start",
            Self::SynthesizeChunk(_) => "synthesize-chunk",
            Self::SynthesizeStop => "synthesize-stop",
            Self::SynthesizeStopped => "synthesize-stopped",
            Self::AudioStart(_) => "audio-start",
            Self::AudioChunk { .. } => "audio-chunk",
            Self::AudioStop => "audio-stop",
            Self::Error(_) => "error",
            Self::Other(frame) => &frame.kind,
        }
    }

    /// Interpret a frame
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Malformed`] if a known event carries data of
    /// the wrong shape
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let Frame {
            kind,
            data,
            payload,
        } = frame;

        let event = match kind.as_str() {
            "describe" => Self::Describe,
            "info" => Self::Info(decode(&kind, data)?),
            "synthesize" => Self::Synthesize(decode(&kind, data)?),
            "synthesize-start" => Self::SynthesizeStart(decode(&kind, data)?),
            "synthesize-chunk" => Self::SynthesizeChunk(decode(&kind, data)?),
            "synthesize-stop" => Self::SynthesizeStop,
            "synthesize-stopped" => Self::SynthesizeStopped,
            "audio-start" => Self::AudioStart(decode(&kind, data)?),
            "audio-chunk" => Self::AudioChunk {
                info: decode(&kind, data)?,
                audio: payload,
            },
            "audio-stop" => Self::AudioStop,
            "error" => Self::Error(decode(&kind, data)?),
            _ => Self::Other(Frame {
                kind,
                data,
                payload,
            }),
        };
        Ok(event)
    }

    /// Encode into a frame
    ///
    /// # Errors
    ///
    /// Returns error only if a data struct fails to serialize
    pub fn into_frame(self) -> Result<Frame, ProtocolError> {
        let kind = self.kind().to_string();
        let (data, payload) = match self {
            Self::Describe
            | Self::SynthesizeStop
            | Self::SynthesizeStopped
            | Self::AudioStop => (Map::new(), Vec::new()),
            Self::Info(info) => (encode(&kind, &info)?, Vec::new()),
            Self::Synthesize(req) => (encode(&kind, &req)?, Vec::new()),
            Self::SynthesizeStart(start) => (encode(&kind, &start)?, Vec::new()),
            Self::SynthesizeChunk(chunk) => (encode(&kind, &chunk)?, Vec::new()),
            Self::AudioStart(info) => (encode(&kind, &info)?, Vec::new()),
            Self::AudioChunk { info, audio } => (encode(&kind, &info)?, audio),
            Self::Error(err) => (encode(&kind, &err)?, Vec::new()),
            Self::Other(frame) => return Ok(frame),
        };
        Ok(Frame {
            kind,
            data,
            payload,
        })
    }
}

fn decode<T: DeserializeOwned>(kind: &str, data: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(data)).map_err(|e| malformed(kind, &e))
}

fn encode<T: Serialize>(kind: &str, value: &T) -> Result<Map<String, Value>, ProtocolError> {
    match serde_json::to_value(value).map_err(|e| malformed(kind, &e))? {
        Value::Object(map) => Ok(map),
        _ => Err(ProtocolError::Malformed {
            event_type: kind.to_string(),
            reason: "data is not an object".to_string(),
        }),
    }
}

/// Shared, serialized writer for one connection.
///
/// The connection handler and the request task both write through clones
/// of this; each event is written whole under the lock.
pub struct EventWriter<W> {
    inner: Arc<Mutex<W>>,
}

impl<W> Clone for EventWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<W> EventWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a transport
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Encode and write one event
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails
    pub async fn write(&self, event: Event) -> Result<(), ProtocolError> {
        let frame = event.into_frame()?;
        let mut writer = self.inner.lock().await;
        write_frame(&mut *writer, &frame).await
    }
}
