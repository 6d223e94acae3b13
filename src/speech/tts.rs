//! Streaming text-to-speech adapter
//!
//! `synthesize` returns a channel of µ-law/8kHz byte chunks as the provider
//! streams them, so the first frame can hit the wire before synthesis of
//! the full sentence finishes. Clips for the filler library are produced
//! offline with the same provider and output format.

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::backoff::{retry_with_deadline, RetryPolicy};
use crate::config::SpeechConfig;
use crate::error::{CollabResult, CollaboratorError};
use crate::types::Language;

/// Telephony output format requested from the provider.
const OUTPUT_FORMAT: &str = "raw-8khz-8bit-mono-mulaw";

/// Streaming synthesis seam.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Start synthesis; chunks arrive on the returned channel as the
    /// provider produces them. Dropping the receiver cancels the transfer.
    async fn synthesize(&self, text: &str, language: Language) -> CollabResult<mpsc::Receiver<Vec<u8>>>;
}

/// Azure-style regional TTS over HTTP with chunked transfer.
pub struct StreamingTts {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl StreamingTts {
    pub fn new(config: &SpeechConfig, http: reqwest::Client) -> Self {
        Self {
            http,
            endpoint: format!(
                "https://{}.tts.speech.microsoft.com/cognitiveservices/v1",
                config.tts_region
            ),
            api_key: config.tts_api_key.clone(),
        }
    }

    fn voice(language: Language) -> &'static str {
        match language {
            Language::English => "en-US-JennyNeural",
            Language::German => "de-DE-KatjaNeural",
            Language::Hindi | Language::HindiMixed => "hi-IN-SwaraNeural",
        }
    }

    fn ssml(text: &str, language: Language) -> String {
        let voice = Self::voice(language);
        let escaped = text
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        format!(
            r#"<speak version="1.0" xml:lang="en-US"><voice name="{voice}">{escaped}</voice></speak>"#
        )
    }
}

#[async_trait]
impl Synthesizer for StreamingTts {
    async fn synthesize(&self, text: &str, language: Language) -> CollabResult<mpsc::Receiver<Vec<u8>>> {
        let body = Self::ssml(text, language);

        // Retry only the request setup; once the stream is flowing, failures
        // surface to the consumer as a closed channel.
        let response = retry_with_deadline(
            "tts",
            RetryPolicy::default(),
            std::time::Duration::from_secs(5),
            || async {
                self.http
                    .post(&self.endpoint)
                    .header("Ocp-Apim-Subscription-Key", &self.api_key)
                    .header("X-Microsoft-OutputFormat", OUTPUT_FORMAT)
                    .header("Content-Type", "application/ssml+xml")
                    .body(body.clone())
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("tts", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("tts", err.to_string()))
            },
        )
        .await?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) if !bytes.is_empty() => {
                        if tx.send(bytes.to_vec()).await.is_err() {
                            // Consumer hung up (barge-in); stop pulling.
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "tts stream broke mid-utterance");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssml_escapes_markup() {
        let ssml = StreamingTts::ssml("a < b & c", Language::English);
        assert!(ssml.contains("a &lt; b &amp; c"));
        assert!(ssml.contains("en-US-JennyNeural"));
    }

    #[test]
    fn hindi_variants_share_a_voice() {
        assert_eq!(
            StreamingTts::voice(Language::Hindi),
            StreamingTts::voice(Language::HindiMixed)
        );
    }
}
