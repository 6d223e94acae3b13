//! Media bridge: one full-duplex telephony audio stream
//!
//! Inbound: µ-law frames are decoded and forwarded to the STT stream
//! without ever blocking the provider read loop. Outbound: a pacer task
//! owns the frame queue and releases one 20ms frame per tick; fillers,
//! greetings and TTS chunks all go through the same queue, which is what
//! makes playback ordering within a turn structural.
//!
//! Barge-in and turn changes are generation bumps: `stop_speaking`
//! invalidates every queued and in-flight chunk of older generations, so a
//! stale TTS stream can never write into the next turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{CollabResult, MediaError};
use crate::events::{EventBus, SessionEvent};
use crate::media::codec;
use crate::speech::Synthesizer;
use crate::types::Language;

/// One 20ms µ-law frame at 8kHz.
pub const FRAME_BYTES: usize = 160;
/// Frame period on the wire.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);
/// TTS chunk idle deadline; a stalled synthesis is a collaborator failure.
const CHUNK_IDLE_DEADLINE: Duration = Duration::from_secs(5);

/// Queue behavior for `play_bytes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayPriority {
    /// Append after whatever is queued.
    Normal,
    /// Drop everything queued, then play.
    Interrupt,
}

/// Frames handed to the provider socket writer.
#[derive(Debug, PartialEq)]
pub enum OutboundFrame {
    /// One µ-law frame, ready for base64 wrapping.
    Audio(Vec<u8>),
    /// The bridge is done with this stream.
    Hangup,
}

enum PacerCommand {
    Enqueue {
        bytes: Vec<u8>,
        generation: u64,
        interrupt: bool,
    },
    Drain {
        min_generation: u64,
    },
    Close,
}

/// Owner of one stream's audio path.
pub struct MediaBridge {
    stream_id: String,
    pacer_tx: mpsc::Sender<PacerCommand>,
    stt_tx: mpsc::Sender<Vec<u8>>,
    generation: Arc<AtomicU64>,
    tts: Arc<dyn Synthesizer>,
    events: EventBus,
}

impl MediaBridge {
    /// Open the bridge for a newly announced stream.
    ///
    /// `encoding`/`sample_rate` are what the provider negotiated; anything
    /// but µ-law at 8kHz is refused.
    pub fn open(
        stream_id: String,
        encoding: &str,
        sample_rate: u32,
        out_tx: mpsc::Sender<OutboundFrame>,
        stt_tx: mpsc::Sender<Vec<u8>>,
        tts: Arc<dyn Synthesizer>,
        events: EventBus,
    ) -> Result<Arc<Self>, MediaError> {
        let normalized = encoding.to_ascii_lowercase();
        let is_mulaw = matches!(normalized.as_str(), "audio/x-mulaw" | "mulaw" | "ulaw");
        if !is_mulaw || sample_rate != 8000 {
            return Err(MediaError::BadCodec {
                got: format!("{encoding} @ {sample_rate}Hz"),
            });
        }

        let (pacer_tx, pacer_rx) = mpsc::channel(64);
        tokio::spawn(run_pacer(stream_id.clone(), pacer_rx, out_tx));
        info!(stream_id = %stream_id, "media bridge open");

        Ok(Arc::new(Self {
            stream_id,
            pacer_tx,
            stt_tx,
            generation: Arc::new(AtomicU64::new(0)),
            tts,
            events,
        }))
    }

    /// Push one inbound µ-law frame toward the STT.
    ///
    /// Uses `try_send`: if transcription falls behind, the frame is dropped
    /// rather than stalling the telephony read loop.
    pub fn feed_inbound(&self, mulaw: &[u8]) {
        let pcm = codec::decode_frame(mulaw);
        if let Err(err) = self.stt_tx.try_send(pcm) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!(stream_id = %self.stream_id, "stt backlog, dropping frame");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!(stream_id = %self.stream_id, "stt stream gone");
                }
            }
        }
    }

    /// Enqueue pre-encoded µ-law bytes (fillers, greetings).
    pub async fn play_bytes(&self, bytes: Vec<u8>, priority: PlayPriority) {
        let generation = self.generation.load(Ordering::SeqCst);
        let _ = self
            .pacer_tx
            .send(PacerCommand::Enqueue {
                bytes,
                generation,
                interrupt: priority == PlayPriority::Interrupt,
            })
            .await;
    }

    /// Synthesize `text` and stream it into the outbound queue.
    ///
    /// Returns once synthesis has started; chunks flow in the background.
    /// The first enqueued chunk is surfaced as a `FirstAudio` event.
    pub async fn speak(&self, text: &str, language: Language) -> CollabResult<tokio::task::JoinHandle<()>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let started = Instant::now();
        let mut chunks = self.tts.synthesize(text, language).await?;

        let pacer_tx = self.pacer_tx.clone();
        let live_generation = Arc::clone(&self.generation);
        let events = self.events.clone();
        let stream_id = self.stream_id.clone();

        let handle = tokio::spawn(async move {
            let mut first = true;
            loop {
                let chunk = match tokio::time::timeout(CHUNK_IDLE_DEADLINE, chunks.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) => {
                        warn!(stream_id = %stream_id, "tts chunk deadline elapsed, abandoning utterance");
                        break;
                    }
                };
                // A barge-in or turn change bumped the generation; this
                // synthesis no longer has the floor.
                if live_generation.load(Ordering::SeqCst) != generation {
                    debug!(stream_id = %stream_id, "speak superseded, discarding remaining chunks");
                    break;
                }
                if first {
                    first = false;
                    events.publish(SessionEvent::FirstAudio {
                        stream_id: stream_id.clone(),
                        latency_ms: started.elapsed().as_millis() as u64,
                    });
                }
                if pacer_tx
                    .send(PacerCommand::Enqueue {
                        bytes: chunk,
                        generation,
                        interrupt: false,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        Ok(handle)
    }

    /// Cancel in-flight speech and drop queued audio. Barge-in entry point.
    pub async fn stop_speaking(&self) {
        let next = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self
            .pacer_tx
            .send(PacerCommand::Drain { min_generation: next })
            .await;
    }

    /// Flush and close the outbound path.
    pub async fn close(&self, reason: &str) {
        info!(stream_id = %self.stream_id, reason, "closing media bridge");
        let _ = self.pacer_tx.send(PacerCommand::Close).await;
    }
}

/// Outbound pacer: owns the byte queue, releases one frame per tick.
async fn run_pacer(
    stream_id: String,
    mut rx: mpsc::Receiver<PacerCommand>,
    out_tx: mpsc::Sender<OutboundFrame>,
) {
    let mut buffer: std::collections::VecDeque<u8> = std::collections::VecDeque::new();
    let mut min_generation: u64 = 0;
    let mut ticker = tokio::time::interval(FRAME_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Commands first: a drain must take effect before the next
            // frame leaves, or barge-in lets one stale frame slip out.
            biased;
            command = rx.recv() => {
                match command {
                    Some(PacerCommand::Enqueue { bytes, generation, interrupt }) => {
                        if generation < min_generation {
                            // Stale chunk from a superseded speak.
                            continue;
                        }
                        if interrupt {
                            buffer.clear();
                        }
                        buffer.extend(bytes);
                    }
                    Some(PacerCommand::Drain { min_generation: next }) => {
                        min_generation = min_generation.max(next);
                        buffer.clear();
                    }
                    Some(PacerCommand::Close) | None => break,
                }
            }
            _ = ticker.tick() => {
                if buffer.is_empty() {
                    continue;
                }
                let take = buffer.len().min(FRAME_BYTES);
                let mut frame: Vec<u8> = buffer.drain(..take).collect();
                // Pad a trailing partial frame with µ-law silence.
                frame.resize(FRAME_BYTES, codec::ULAW_SILENCE);
                if out_tx.send(OutboundFrame::Audio(frame)).await.is_err() {
                    break;
                }
            }
        }
    }
    let _ = out_tx.send(OutboundFrame::Hangup).await;
    debug!(stream_id = %stream_id, "pacer stopped");
}
