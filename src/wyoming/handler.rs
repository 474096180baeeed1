//! Per-connection event handling

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    Attribution, ErrorEvent, Event, EventWriter, Info, ProtocolError, SynthesizeRequest,
    TtsProgram, TtsVoice, VoiceSelection, WyomingEmitter, read_frame,
};
use crate::Result;
use crate::backend::{BackendRegistry, VoiceCatalog};
use crate::config::SynthesisConfig;
use crate::synth::{Session, Summary};

/// Everything a connection needs, shared across connections
pub struct HandlerContext {
    /// Voice-to-backend routing
    pub registry: BackendRegistry,
    /// Pipeline tuning applied to every request
    pub synthesis: SynthesisConfig,
    /// Accept `synthesize-start/chunk/stop`
    pub streaming: bool,
    /// Samples per outgoing `audio-chunk`
    pub samples_per_chunk: usize,
    /// Answer to `describe`
    pub info: Info,
}

/// Build the `info` answer advertising `catalog`
#[must_use]
pub fn info_for_catalog(catalog: &VoiceCatalog, streaming: bool) -> Info {
    let version = Some(env!("CARGO_PKG_VERSION").to_string());
    let voices = catalog
        .voices()
        .iter()
        .map(|voice| {
            let (name, url) = voice.attribution();
            TtsVoice {
                name: voice.name.clone(),
                description: Some(voice.description.clone()),
                attribution: Attribution {
                    name: name.to_string(),
                    url: url.to_string(),
                },
                installed: true,
                version: None,
                languages: vec![voice.language.clone()],
                speakers: None,
            }
        })
        .collect();

    Info {
        tts: vec![TtsProgram {
            name: "wyoming-streamer".to_string(),
            description: Some(env!("CARGO_PKG_DESCRIPTION").to_string()),
            attribution: Attribution {
                name: "Omni".to_string(),
                url: env!("CARGO_PKG_REPOSITORY").to_string(),
            },
            installed: true,
            version,
            voices,
            supports_synthesize_streaming: streaming,
        }],
    }
}

/// The request currently running on a connection
struct ActiveRequest {
    /// Open while a streaming request still accepts chunks
    fragments: Option<mpsc::UnboundedSender<String>>,
    streaming: bool,
    cancel: CancellationToken,
    task: JoinHandle<Summary>,
}

struct Handler<W> {
    ctx: Arc<HandlerContext>,
    writer: EventWriter<W>,
    cancel: CancellationToken,
    active: Option<ActiveRequest>,
}

impl<W> Handler<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn handle(&mut self, event: Event) -> Result<()> {
        self.reap().await;

        match event {
            Event::Describe => {
                self.writer.write(Event::Info(self.ctx.info.clone())).await?;
                tracing::debug!("sent info");
            }

            Event::Synthesize(request) => {
                if self.streaming_open() {
                    tracing::debug!("ignoring synthesize during a streaming request");
                } else {
                    self.one_shot(request).await?;
                }
            }

            Event::SynthesizeStart(start) if self.ctx.streaming => {
                let (tx, rx) = mpsc::unbounded_channel();
                let input = UnboundedReceiverStream::new(rx);
                if self.start(start.voice, input, true, Some(tx)).await? {
                    tracing::debug!("text stream started");
                }
            }

            Event::SynthesizeChunk(chunk) if self.ctx.streaming => {
                match self.active.as_ref().and_then(|a| a.fragments.as_ref()) {
                    Some(tx) => {
                        if tx.send(chunk.text).is_err() {
                            tracing::debug!("request already finished, dropping chunk");
                        }
                    }
                    None => tracing::warn!("synthesize-chunk without synthesize-start"),
                }
            }

            Event::SynthesizeStop if self.ctx.streaming => {
                match self.active.as_mut().filter(|a| a.streaming) {
                    Some(active) => {
                        active.fragments = None;
                        tracing::debug!("text stream stopped");
                    }
                    None => {
                        tracing::warn!("synthesize-stop without synthesize-start");
                        self.writer.write(Event::SynthesizeStopped).await?;
                    }
                }
            }

            Event::SynthesizeStart(_) | Event::SynthesizeChunk(_) | Event::SynthesizeStop => {
                tracing::debug!("streaming disabled, ignoring streaming event");
            }

            other => tracing::debug!(event = other.kind(), "ignoring event"),
        }
        Ok(())
    }

    async fn one_shot(&mut self, request: SynthesizeRequest) -> Result<()> {
        let text = request.text.trim().lines().collect::<Vec<_>>().join(" ");
        if text.trim().is_empty() {
            self.interrupt().await;
            self.writer.write(Event::AudioStop).await?;
            return Ok(());
        }

        let input = futures::stream::iter(std::iter::once(text));
        self.start(request.voice, input, false, None).await?;
        Ok(())
    }

    /// Interrupt whatever is running and start a new request.
    /// Returns `false` if the voice could not be resolved.
    async fn start<S>(
        &mut self,
        voice: Option<VoiceSelection>,
        input: S,
        streaming: bool,
        fragments: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<bool>
    where
        S: futures::Stream<Item = String> + Unpin + Send + 'static,
    {
        self.interrupt().await;

        let voice = voice.unwrap_or_default();
        let resolved = match self
            .ctx
            .registry
            .resolve(voice.name.as_deref(), voice.language.as_deref())
        {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::warn!(error = %e, "cannot serve request");
                self.writer
                    .write(Event::Error(ErrorEvent {
                        text: e.to_string(),
                        code: Some("voice_not_found".to_string()),
                    }))
                    .await?;
                if !streaming {
                    self.writer.write(Event::AudioStop).await?;
                }
                return Ok(false);
            }
        };

        let mut emitter = WyomingEmitter::new(
            self.writer.clone(),
            resolved.params.format,
            self.ctx.samples_per_chunk,
            self.ctx.synthesis.failure_marker,
        )
        .streaming(streaming);
        let session = Session::new(resolved, self.ctx.synthesis.clone())
            .with_cancel(self.cancel.child_token());
        let cancel = session.cancel_token();
        let task = tokio::spawn(async move { session.run(input, &mut emitter).await });

        self.active = Some(ActiveRequest {
            fragments,
            streaming,
            cancel,
            task,
        });
        Ok(true)
    }

    fn streaming_open(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| a.streaming && (a.fragments.is_some() || !a.task.is_finished()))
    }

    /// Forget a request that already finished. A streaming request is kept
    /// until the client sends `synthesize-stop`.
    async fn reap(&mut self) {
        if self
            .active
            .as_ref()
            .is_some_and(|a| a.task.is_finished() && a.fragments.is_none())
            && let Some(active) = self.active.take()
        {
            join(active.task).await;
        }
    }

    /// Cancel the running request and wait for its terminal events
    async fn interrupt(&mut self) {
        if let Some(active) = self.active.take() {
            if !active.task.is_finished() {
                tracing::info!("interrupting running request");
            }
            active.cancel.cancel();
            join(active.task).await;
        }
    }
}

async fn join(task: JoinHandle<Summary>) {
    match task.await {
        Ok(summary) => tracing::debug!(%summary, "request task joined"),
        Err(e) => tracing::error!(error = %e, "request task failed"),
    }
}

/// Serve one client until it disconnects or `shutdown` fires.
///
/// Closing the connection cancels any request still running on it.
///
/// # Errors
///
/// Returns error if writing to the client fails outside of a request
pub async fn handle_connection<R, W>(
    ctx: Arc<HandlerContext>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut reader = BufReader::new(reader);
    let cancel = shutdown.child_token();
    let mut handler = Handler {
        ctx,
        writer: EventWriter::new(writer),
        cancel: cancel.clone(),
        active: None,
    };

    let result = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            frame = read_frame(&mut reader) => frame,
        };

        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!("client disconnected");
                break Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "unreadable event, closing connection");
                // Best effort; the transport may already be gone
                let _ = handler.writer.write(protocol_error(&e)).await;
                break Ok(());
            }
        };

        let event = match Event::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting event");
                if let Err(e) = handler.writer.write(protocol_error(&e)).await {
                    break Err(e.into());
                }
                continue;
            }
        };

        if let Err(e) = handler.handle(event).await {
            break Err(e);
        }
    };

    cancel.cancel();
    handler.interrupt().await;
    result
}

fn protocol_error(e: &ProtocolError) -> Event {
    Event::Error(ErrorEvent {
        text: e.to_string(),
        code: Some(e.code().to_string()),
    })
}
