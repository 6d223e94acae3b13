//! Streaming speech-to-text adapter
//!
//! The media bridge pushes 16-bit linear PCM frames into `audio_tx`; the
//! transcript aggregator reads partial/final events from `events_rx`. The
//! provider socket runs in two pump tasks so neither direction can stall
//! the other. Mid-stream language identification rides the result frames.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::SpeechConfig;
use crate::error::{CollabResult, CollaboratorError};
use crate::types::Language;

/// Kind of transcription event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttEventKind {
    Partial,
    Final,
}

/// One event from the transcription stream.
#[derive(Debug, Clone)]
pub struct SttEvent {
    pub kind: SttEventKind,
    pub transcript: String,
    /// Language the provider identified mid-stream, when it reports one.
    pub language: Option<Language>,
}

/// Handles to one live transcription stream.
pub struct SttStream {
    /// Little-endian 16-bit PCM at 8kHz, one frame per send.
    pub audio_tx: mpsc::Sender<Vec<u8>>,
    pub events_rx: mpsc::Receiver<SttEvent>,
}

/// Streaming transcription seam.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn start_stream(&self, language_hint: Option<Language>) -> CollabResult<SttStream>;
}

/// Deepgram-style streaming client over WebSocket.
pub struct StreamingStt {
    endpoint: String,
    api_key: String,
}

impl StreamingStt {
    pub fn new(config: &SpeechConfig) -> Self {
        Self {
            endpoint: config.stt_endpoint.clone(),
            api_key: config.stt_api_key.clone(),
        }
    }

    fn stream_url(&self, language_hint: Option<Language>) -> String {
        let language = match language_hint {
            Some(Language::German) => "de",
            Some(Language::Hindi) | Some(Language::HindiMixed) => "multi",
            Some(Language::English) => "en",
            // No hint: let the provider identify the language mid-stream.
            None => "multi",
        };
        format!(
            "{}?encoding=linear16&sample_rate=8000&channels=1&interim_results=true&language={}",
            self.endpoint, language
        )
    }
}

/// Provider result frame, reduced to the fields we consume.
#[derive(Debug, Deserialize)]
struct ResultFrame {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<ResultChannel>,
}

#[derive(Debug, Deserialize)]
struct ResultChannel {
    #[serde(default)]
    alternatives: Vec<ResultAlternative>,
}

#[derive(Debug, Deserialize)]
struct ResultAlternative {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    languages: Vec<String>,
}

#[async_trait]
impl Transcriber for StreamingStt {
    async fn start_stream(&self, language_hint: Option<Language>) -> CollabResult<SttStream> {
        let url = self.stream_url(language_hint);
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|err| CollaboratorError::invalid("stt", err.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key)
                .parse()
                .map_err(|_| CollaboratorError::invalid("stt", "api key not header-safe"))?,
        );

        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| CollaboratorError::unavailable("stt", err.to_string()))?;
        let (mut ws_tx, mut ws_rx) = socket.split();

        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        let (events_tx, events_rx) = mpsc::channel::<SttEvent>(64);

        // Audio pump: session frames → provider socket.
        tokio::spawn(async move {
            while let Some(frame) = audio_rx.recv().await {
                if ws_tx.send(Message::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            // Sender side closed: tell the provider we are done.
            let _ = ws_tx
                .send(Message::Text(r#"{"type":"CloseStream"}"#.into()))
                .await;
        });

        // Result pump: provider frames → transcript events.
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let frame: ResultFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        debug!(error = %err, "unparsed stt frame");
                        continue;
                    }
                };
                let Some(alternative) = frame
                    .channel
                    .as_ref()
                    .and_then(|channel| channel.alternatives.first())
                else {
                    continue;
                };
                let event = SttEvent {
                    kind: if frame.is_final {
                        SttEventKind::Final
                    } else {
                        SttEventKind::Partial
                    },
                    transcript: alternative.transcript.clone(),
                    language: alternative
                        .languages
                        .first()
                        .and_then(|code| Language::from_stt_code(code)),
                };
                if events_tx.send(event).await.is_err() {
                    break;
                }
            }
            warn!("stt result stream ended");
        });

        Ok(SttStream { audio_tx, events_rx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_defaults_to_language_identification() {
        let stt = StreamingStt {
            endpoint: "wss://api.deepgram.com/v1/listen".into(),
            api_key: "key".into(),
        };
        let url = stt.stream_url(None);
        assert!(url.contains("language=multi"));
        assert!(url.contains("sample_rate=8000"));
        assert!(url.contains("encoding=linear16"));
    }

    #[test]
    fn stream_url_honors_hint() {
        let stt = StreamingStt {
            endpoint: "wss://api.deepgram.com/v1/listen".into(),
            api_key: "key".into(),
        };
        assert!(stt.stream_url(Some(Language::German)).contains("language=de"));
        assert!(stt.stream_url(Some(Language::HindiMixed)).contains("language=multi"));
    }

    #[test]
    fn result_frame_parses_provider_shape() {
        let raw = r#"{
            "is_final": true,
            "channel": {"alternatives": [{"transcript": "hello there", "languages": ["en-US"]}]}
        }"#;
        let frame: ResultFrame = serde_json::from_str(raw).unwrap();
        assert!(frame.is_final);
        let alt = &frame.channel.unwrap().alternatives[0];
        assert_eq!(alt.transcript, "hello there");
        assert_eq!(Language::from_stt_code(&alt.languages[0]), Some(Language::English));
    }
}
