//! Maps session events onto Wyoming audio events

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use super::{AudioInfo, ErrorEvent, Event, EventWriter};
use crate::Result;
use crate::backend::{AudioFormat, AudioPayload};
use crate::config::FailureMarker;
use crate::synth::{EventSink, Outcome, SynthesisEvent};

/// [`EventSink`] that writes one request's audio to a Wyoming client.
///
/// The first real audio opens the stream with `audio-start` in the format
/// the backend produced; the terminal event closes it with `audio-stop`.
/// Silence markers for failures released before that audio are held back
/// and written once the stream format is known.
pub struct WyomingEmitter<W> {
    writer: EventWriter<W>,
    format: AudioFormat,
    samples_per_chunk: usize,
    marker: FailureMarker,
    streaming: bool,
    started: bool,
    held_silence: Duration,
    chunks: usize,
}

impl<W> WyomingEmitter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create an emitter; `format` is used only if no real audio ever arrives
    #[must_use]
    pub fn new(
        writer: EventWriter<W>,
        format: AudioFormat,
        samples_per_chunk: usize,
        marker: FailureMarker,
    ) -> Self {
        Self {
            writer,
            format,
            samples_per_chunk: samples_per_chunk.max(1),
            marker,
            streaming: false,
            started: false,
            held_silence: Duration::ZERO,
            chunks: 0,
        }
    }

    /// Follow the terminal `audio-stop` with `synthesize-stopped`
    #[must_use]
    pub const fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }

    /// `audio-chunk` events written so far
    #[must_use]
    pub const fn chunks_sent(&self) -> usize {
        self.chunks
    }

    async fn start(&mut self, format: AudioFormat) -> Result<()> {
        if self.started {
            if format != self.format {
                tracing::debug!(?format, announced = ?self.format, "audio format changed mid-stream");
            }
            return Ok(());
        }
        self.format = format;
        self.started = true;
        self.writer.write(Event::AudioStart(format.into())).await?;

        let held = std::mem::take(&mut self.held_silence);
        if !held.is_zero() {
            self.write_chunks(&AudioPayload::silence(format, held)).await?;
        }
        Ok(())
    }

    async fn send_audio(&mut self, audio: AudioPayload) -> Result<()> {
        if audio.is_empty() {
            return Ok(());
        }
        self.start(audio.format).await?;
        self.write_chunks(&audio).await
    }

    async fn write_chunks(&mut self, audio: &AudioPayload) -> Result<()> {
        let info = AudioInfo::from(audio.format);
        let chunk_bytes = self.samples_per_chunk * audio.format.frame_bytes().max(1);
        for chunk in audio.data.chunks(chunk_bytes) {
            self.writer
                .write(Event::AudioChunk {
                    info,
                    audio: chunk.to_vec(),
                })
                .await?;
            self.chunks += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl<W> EventSink for WyomingEmitter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn emit(&mut self, event: SynthesisEvent) -> Result<()> {
        match event {
            SynthesisEvent::Audio { audio, .. } => self.send_audio(audio).await,

            SynthesisEvent::UnitFailed { index, error } => {
                tracing::debug!(index, code = error.code(), "writing failure marker");
                match self.marker {
                    FailureMarker::Silence(duration) if !self.started => {
                        self.held_silence += duration;
                        Ok(())
                    }
                    FailureMarker::Silence(duration) => {
                        self.send_audio(AudioPayload::silence(self.format, duration))
                            .await
                    }
                    FailureMarker::None => Ok(()),
                }
            }

            SynthesisEvent::Finished(summary) => {
                if !self.held_silence.is_zero() {
                    self.start(self.format).await?;
                }
                // A streaming request that produced nothing never opened an
                // audio stream, so there is nothing to stop.
                if self.started || !self.streaming {
                    self.writer.write(Event::AudioStop).await?;
                }
                if let Outcome::Aborted(reason) = &summary.outcome {
                    self.writer
                        .write(Event::Error(ErrorEvent {
                            text: summary.to_string(),
                            code: Some(reason.code().to_string()),
                        }))
                        .await?;
                }
                if self.streaming {
                    self.writer.write(Event::SynthesizeStopped).await?;
                }
                Ok(())
            }
        }
    }
}
