//! Media stream WebSocket handler
//!
//! One socket per call. JSON control frames come in (`start`, `media`,
//! `stop`); base64 µ-law frames go out under the provider's stream sid. A
//! writer task owns the outbound half so the read loop never blocks on a
//! send; ten consecutive malformed frames close the stream as a protocol
//! error.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::Response,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::media::OutboundFrame;
use crate::orchestrator::{begin_session, AppContext, SessionRuntime, StreamStart};
use crate::termination::schedule_termination;

const MALFORMED_FRAME_LIMIT: u32 = 10;

/// Provider control frames, reduced to what we consume.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StreamEvent {
    Connected {},
    Start {
        #[serde(rename = "streamSid")]
        stream_sid: String,
        start: StartMetadata,
    },
    Media {
        media: MediaPayload,
    },
    Mark {},
    Stop {},
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartMetadata {
    #[serde(default)]
    call_sid: String,
    #[serde(default)]
    custom_parameters: HashMap<String, String>,
    #[serde(default)]
    media_format: Option<MediaFormat>,
}

#[derive(Debug, Deserialize)]
struct MediaFormat {
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default, rename = "sampleRate")]
    sample_rate: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct MediaPayload {
    /// base64-encoded µ-law frame.
    payload: String,
}

pub async fn upgrade(ws: WebSocketUpgrade, State(app): State<AppContext>) -> Response {
    ws.on_upgrade(|socket| handle_media_stream(socket, app))
}

/// Outbound half: frames from the pacer → provider messages.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<OutboundFrame>,
    stream_sid: String,
) {
    while let Some(frame) = out_rx.recv().await {
        match frame {
            OutboundFrame::Audio(bytes) => {
                let message = serde_json::json!({
                    "event": "media",
                    "streamSid": stream_sid,
                    "media": { "payload": BASE64.encode(&bytes) },
                });
                if ws_tx.send(Message::Text(message.to_string().into())).await.is_err() {
                    break;
                }
            }
            OutboundFrame::Hangup => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn handle_media_stream(socket: WebSocket, app: AppContext) {
    info!("media stream connected");
    let (ws_tx, mut ws_rx) = socket.split();
    let mut ws_tx = Some(ws_tx);

    let mut runtime: Option<SessionRuntime> = None;
    let mut malformed_streak: u32 = 0;

    while let Some(message) = ws_rx.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        let event: StreamEvent = match serde_json::from_str(&text) {
            Ok(event) => {
                malformed_streak = 0;
                event
            }
            Err(err) => {
                malformed_streak += 1;
                warn!(error = %err, streak = malformed_streak, "malformed provider frame dropped");
                if malformed_streak >= MALFORMED_FRAME_LIMIT {
                    if let Some(runtime) = runtime.take() {
                        schedule_termination(
                            termination_deps(&app),
                            runtime.stream_id,
                            "protocol_error".into(),
                            std::time::Duration::ZERO,
                        );
                    }
                    break;
                }
                continue;
            }
        };

        match event {
            StreamEvent::Connected {} => debug!("provider handshake"),
            StreamEvent::Start { stream_sid, start } => {
                if runtime.is_some() {
                    warn!("duplicate start frame ignored");
                    continue;
                }
                let format = start.media_format.as_ref();
                let stream_start = StreamStart {
                    stream_sid: stream_sid.clone(),
                    call_sid: start.call_sid.clone(),
                    from_number: start
                        .custom_parameters
                        .get("From")
                        .cloned()
                        .unwrap_or_default(),
                    encoding: format
                        .and_then(|format| format.encoding.clone())
                        .unwrap_or_else(|| "audio/x-mulaw".into()),
                    sample_rate: format.and_then(|format| format.sample_rate).unwrap_or(8000),
                    linked_stream_id: start.custom_parameters.get("StreamId").cloned(),
                };

                let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(256);
                match begin_session(app.clone(), stream_start, out_tx).await {
                    Ok(started) => {
                        // The provider addresses outbound media by its own sid.
                        if let Some(ws_tx) = ws_tx.take() {
                            tokio::spawn(run_writer(ws_tx, out_rx, stream_sid));
                        }
                        runtime = Some(started);
                    }
                    Err(err) => {
                        warn!(error = %err, "session start failed, dropping stream");
                        break;
                    }
                }
            }
            StreamEvent::Media { media } => {
                let Some(runtime) = runtime.as_ref() else {
                    continue;
                };
                match BASE64.decode(media.payload.as_bytes()) {
                    Ok(frame) => runtime.bridge.feed_inbound(&frame),
                    Err(err) => {
                        malformed_streak += 1;
                        debug!(error = %err, "undecodable media payload");
                        if malformed_streak >= MALFORMED_FRAME_LIMIT {
                            schedule_termination(
                                termination_deps(&app),
                                runtime.stream_id.clone(),
                                "protocol_error".into(),
                                std::time::Duration::ZERO,
                            );
                            break;
                        }
                    }
                }
            }
            StreamEvent::Mark {} => debug!("mark acknowledged"),
            StreamEvent::Stop {} => {
                info!("provider stopped stream");
                break;
            }
        }
    }

    // Socket done: if the session is still around (caller hung up before a
    // workflow ended it), tear it down now.
    if let Some(runtime) = runtime {
        if app.store.contains(&runtime.stream_id) {
            schedule_termination(
                termination_deps(&app),
                runtime.stream_id,
                "stream_closed".into(),
                std::time::Duration::ZERO,
            );
        }
    }
    info!("media stream disconnected");
}

fn termination_deps(app: &AppContext) -> crate::termination::TerminationDeps {
    crate::termination::TerminationDeps {
        store: std::sync::Arc::clone(&app.store),
        audit: app.audit.clone(),
        events: app.events.clone(),
        sms: std::sync::Arc::clone(&app.sms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_frame_parses_with_custom_parameters() {
        let raw = r#"{
            "event": "start",
            "streamSid": "MZabc",
            "start": {
                "callSid": "CA123",
                "customParameters": {"From": "+4917260734880", "CallSid": "CA123"},
                "mediaFormat": {"encoding": "audio/x-mulaw", "sampleRate": 8000, "channels": 1}
            }
        }"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        match event {
            StreamEvent::Start { stream_sid, start } => {
                assert_eq!(stream_sid, "MZabc");
                assert_eq!(start.call_sid, "CA123");
                assert_eq!(start.custom_parameters["From"], "+4917260734880");
                let format = start.media_format.unwrap();
                assert_eq!(format.encoding.as_deref(), Some("audio/x-mulaw"));
                assert_eq!(format.sample_rate, Some(8000));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn media_frame_parses() {
        let raw = r#"{"event":"media","streamSid":"MZabc","media":{"payload":"//8A"}}"#;
        let event: StreamEvent = serde_json::from_str(raw).unwrap();
        assert!(matches!(event, StreamEvent::Media { .. }));
    }

    #[test]
    fn unknown_event_is_an_error() {
        let raw = r#"{"event":"dtmf","streamSid":"MZabc"}"#;
        assert!(serde_json::from_str::<StreamEvent>(raw).is_err());
    }
}
