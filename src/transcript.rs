//! Transcript aggregation: STT events → utterances
//!
//! One utterance per non-empty STT final. Finals arriving within 250ms of
//! each other are concatenated (providers split run-on speech at odd
//! places). Partials never reach the workflow; they go to the event bus
//! for observability only.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::events::{EventBus, SessionEvent};
use crate::speech::{SttEvent, SttEventKind};
use crate::types::Language;

/// Window inside which consecutive finals merge into one utterance.
pub const CONCAT_WINDOW: Duration = Duration::from_millis(250);

/// One aggregated user utterance.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    /// Language the STT identified for this stretch of speech, if any.
    pub language: Option<Language>,
}

/// Run aggregation for one session's STT stream.
///
/// Ends when the STT stream closes; a pending utterance is flushed first.
pub fn spawn_aggregator(
    stream_id: String,
    mut stt_rx: mpsc::Receiver<SttEvent>,
    utterance_tx: mpsc::Sender<Utterance>,
    bus: EventBus,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: Option<Utterance> = None;
        let mut flush_at = Instant::now();

        loop {
            let event = if pending.is_some() {
                match tokio::time::timeout_at(flush_at, stt_rx.recv()).await {
                    Ok(event) => event,
                    Err(_) => {
                        if let Some(utterance) = pending.take() {
                            if utterance_tx.send(utterance).await.is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                }
            } else {
                stt_rx.recv().await
            };

            let Some(event) = event else {
                if let Some(utterance) = pending.take() {
                    let _ = utterance_tx.send(utterance).await;
                }
                debug!(stream_id = %stream_id, "stt stream closed, aggregator done");
                return;
            };

            match event.kind {
                SttEventKind::Partial => {
                    if !event.transcript.trim().is_empty() {
                        bus.publish(SessionEvent::PartialTranscript {
                            stream_id: stream_id.clone(),
                            text: event.transcript,
                        });
                    }
                }
                SttEventKind::Final => {
                    let trimmed = event.transcript.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match pending.as_mut() {
                        Some(utterance) => {
                            utterance.text.push(' ');
                            utterance.text.push_str(trimmed);
                            if event.language.is_some() {
                                utterance.language = event.language;
                            }
                        }
                        None => {
                            pending = Some(Utterance {
                                text: trimmed.to_string(),
                                language: event.language,
                            });
                        }
                    }
                    flush_at = Instant::now() + CONCAT_WINDOW;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn final_event(text: &str) -> SttEvent {
        SttEvent {
            kind: SttEventKind::Final,
            transcript: text.into(),
            language: None,
        }
    }

    fn partial_event(text: &str) -> SttEvent {
        SttEvent {
            kind: SttEventKind::Partial,
            transcript: text.into(),
            language: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_final_becomes_one_utterance() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        stt_tx.send(final_event("shift my appointment")).await.unwrap();
        tokio::time::advance(CONCAT_WINDOW + Duration::from_millis(10)).await;

        let utterance = utterance_rx.recv().await.unwrap();
        assert_eq!(utterance.text, "shift my appointment");
    }

    #[tokio::test(start_paused = true)]
    async fn close_finals_are_concatenated() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        stt_tx.send(final_event("the eye checkup")).await.unwrap();
        tokio::time::advance(Duration::from_millis(100)).await;
        stt_tx.send(final_event("to Monday at 2 PM")).await.unwrap();
        tokio::time::advance(CONCAT_WINDOW + Duration::from_millis(10)).await;

        let utterance = utterance_rx.recv().await.unwrap();
        assert_eq!(utterance.text, "the eye checkup to Monday at 2 PM");
    }

    #[tokio::test(start_paused = true)]
    async fn separated_finals_stay_separate() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        // Awaiting the flush between sends guarantees the second final
        // falls outside the first one's window.
        stt_tx.send(final_event("hello")).await.unwrap();
        assert_eq!(utterance_rx.recv().await.unwrap().text, "hello");
        stt_tx.send(final_event("goodbye")).await.unwrap();
        assert_eq!(utterance_rx.recv().await.unwrap().text, "goodbye");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_finals_and_partials_are_suppressed() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        stt_tx.send(partial_event("hel")).await.unwrap();
        stt_tx.send(final_event("   ")).await.unwrap();
        stt_tx.send(final_event("hello")).await.unwrap();
        tokio::time::advance(CONCAT_WINDOW + Duration::from_millis(10)).await;

        let utterance = utterance_rx.recv().await.unwrap();
        assert_eq!(utterance.text, "hello");
        assert!(utterance_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_utterance_flushes_on_stream_close() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        stt_tx.send(final_event("bye")).await.unwrap();
        drop(stt_tx);

        let utterance = utterance_rx.recv().await.unwrap();
        assert_eq!(utterance.text, "bye");
    }

    #[tokio::test(start_paused = true)]
    async fn language_identification_carries_through() {
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (utterance_tx, mut utterance_rx) = mpsc::channel(8);
        spawn_aggregator("s1".into(), stt_rx, utterance_tx, EventBus::default());

        stt_tx
            .send(SttEvent {
                kind: SttEventKind::Final,
                transcript: "guten Tag".into(),
                language: Some(Language::German),
            })
            .await
            .unwrap();
        tokio::time::advance(CONCAT_WINDOW + Duration::from_millis(10)).await;

        assert_eq!(utterance_rx.recv().await.unwrap().language, Some(Language::German));
    }
}
