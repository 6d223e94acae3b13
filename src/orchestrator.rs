//! Session orchestrator
//!
//! One per process. For every media stream it builds the per-session
//! machinery (bridge, STT stream, transcript aggregator, conversation
//! loop), then drives the per-utterance cycle: pre-filter → classify →
//! workflow step → speak. Utterances are processed strictly one at a
//! time; anything arriving mid-turn queues in the channel. A workflow
//! declaring `call_end` hands the session to the termination controller
//! and no further classification runs.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::audit::AuditLog;
use crate::calendar::CalendarApi;
use crate::config::Config;
use crate::events::{EventBus, SessionEvent};
use crate::filler::{FillerCategory, FillerLibrary};
use crate::intent::{self, prefilter, ClassifierRole, Intent};
use crate::llm::{ChatMessage, ChatModel};
use crate::media::{MediaBridge, OutboundFrame, PlayPriority};
use crate::outbound::OutboundPort;
use crate::phonebook::Phonebook;
use crate::session::{Preload, Session, SessionStore};
use crate::sms::SmsSender;
use crate::speech::{Synthesizer, Transcriber};
use crate::termination::{schedule_termination, TerminationDeps};
use crate::transcript::{spawn_aggregator, Utterance};
use crate::types::{CallDirection, Language, Peer, PeerRole, Turn, TurnKind, TurnRole};
use crate::workflow::{FlowAction, FlowReply, TurnContext, WorkflowInstance};

/// Spoken when a freshly generated reply would repeat the previous one.
const DUPLICATE_FALLBACK: &str =
    "Let me help you in a different way. Could you tell me once more what you need?";
/// Spoken when a turn blows up before closing the stream.
const TROUBLE_FAREWELL: &str = "I'm having trouble right now, please try again later. Goodbye!";

/// Process-wide wiring handed to every session.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub phonebook: Arc<Phonebook>,
    pub fillers: Arc<FillerLibrary>,
    pub llm: Arc<dyn ChatModel>,
    pub calendar: Arc<dyn CalendarApi>,
    pub stt: Arc<dyn Transcriber>,
    pub tts: Arc<dyn Synthesizer>,
    pub sms: Arc<dyn SmsSender>,
    pub outbound: Arc<dyn OutboundPort>,
    pub audit: AuditLog,
    pub events: EventBus,
}

impl AppContext {
    fn termination_deps(&self) -> TerminationDeps {
        TerminationDeps {
            store: Arc::clone(&self.store),
            audit: self.audit.clone(),
            events: self.events.clone(),
            sms: Arc::clone(&self.sms),
        }
    }

    fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.call.termination_grace_ms)
    }
}

/// Stream-open metadata parsed from the provider's start frame.
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub stream_sid: String,
    pub call_sid: String,
    pub from_number: String,
    pub encoding: String,
    pub sample_rate: u32,
    /// Set on outbound legs: the pre-created session this stream belongs to.
    pub linked_stream_id: Option<String>,
}

/// Handle the media socket keeps while the session runs.
pub struct SessionRuntime {
    pub stream_id: String,
    pub bridge: Arc<MediaBridge>,
}

/// Build a session's machinery when its media stream starts.
pub async fn begin_session(
    app: AppContext,
    start: StreamStart,
    out_tx: mpsc::Sender<OutboundFrame>,
) -> Result<SessionRuntime> {
    // Outbound legs adopt the session the dispatcher pre-created; inbound
    // streams get a fresh one keyed by the provider's stream sid.
    let adopted = start
        .linked_stream_id
        .as_ref()
        .filter(|id| app.store.contains(id.as_str()))
        .cloned();
    let stream_id = adopted.clone().unwrap_or_else(|| start.stream_sid.clone());

    let peer = match &adopted {
        Some(id) => app.store.peer(id).context("adopted session vanished")?,
        None => app.phonebook.lookup(&start.from_number),
    };

    let stt_stream = app
        .stt
        .start_stream(Some(peer.language))
        .await
        .context("starting transcription stream")?;

    let bridge = MediaBridge::open(
        stream_id.clone(),
        &start.encoding,
        start.sample_rate,
        out_tx,
        stt_stream.audio_tx,
        Arc::clone(&app.tts),
        app.events.clone(),
    )?;

    let direction = if adopted.is_some() {
        app.store.with(&stream_id, |session| {
            session.call_id = start.call_sid.clone();
            session.media = Some(Arc::clone(&bridge));
        });
        CallDirection::Outbound
    } else {
        let mut session = Session::inbound(stream_id.clone(), start.call_sid.clone(), peer.clone());
        session.media = Some(Arc::clone(&bridge));
        if session.wants_preload() {
            let (tx, preload) = Preload::pending();
            session.preload = preload;
            let calendar = Arc::clone(&app.calendar);
            let preload_peer = peer.clone();
            tokio::spawn(async move {
                let result = calendar
                    .list_appointments(&preload_peer)
                    .await
                    .map_err(|err| err.to_string());
                let _ = tx.send(Some(result));
            });
        }
        app.store
            .insert(session)
            .map_err(|reason| anyhow::anyhow!(reason))?;
        CallDirection::Inbound
    };

    app.events.publish(SessionEvent::CallStarted {
        stream_id: stream_id.clone(),
        direction: match direction {
            CallDirection::Inbound => "inbound".into(),
            CallDirection::Outbound => "outbound".into(),
        },
        peer_number: peer.phone_number.clone(),
        peer_role: peer.role.to_string(),
    });
    info!(stream_id = %stream_id, from = %peer.phone_number, role = %peer.role, "session started");

    let (utterance_tx, utterance_rx) = mpsc::channel(16);
    spawn_aggregator(stream_id.clone(), stt_stream.events_rx, utterance_tx, app.events.clone());

    let loop_app = app.clone();
    let loop_bridge = Arc::clone(&bridge);
    let loop_stream_id = stream_id.clone();
    tokio::spawn(async move {
        run_conversation(loop_app, loop_stream_id, loop_bridge, utterance_rx).await;
    });

    Ok(SessionRuntime { stream_id, bridge })
}

/// Per-session conversation loop: greeting, then one utterance at a time.
async fn run_conversation(
    app: AppContext,
    stream_id: String,
    bridge: Arc<MediaBridge>,
    mut utterance_rx: mpsc::Receiver<Utterance>,
) {
    if let Err(err) = emit_greeting(&app, &stream_id, &bridge).await {
        warn!(stream_id = %stream_id, error = %err, "greeting failed");
    }

    while let Some(utterance) = utterance_rx.recv().await {
        // Barge-in on finals: whatever we were saying, stop within the
        // frame period.
        bridge.stop_speaking().await;

        let refused = app
            .store
            .with(&stream_id, |session| {
                session.end_requested
                    || session
                        .workflow
                        .as_ref()
                        .is_some_and(|workflow| workflow.call_end())
            })
            .unwrap_or(true);
        if refused {
            continue;
        }

        if let Some(language) = utterance.language {
            app.store.with(&stream_id, |session| session.peer.language = language);
        }
        app.events.publish(SessionEvent::Utterance {
            stream_id: stream_id.clone(),
            text: utterance.text.clone(),
        });

        if let Err(err) = process_turn(&app, &stream_id, &bridge, &utterance.text).await {
            error!(stream_id = %stream_id, error = %err, "turn failed, ending session");
            let language = app
                .store
                .peer(&stream_id)
                .map(|peer| peer.language)
                .unwrap_or_default();
            let _ = bridge.speak(TROUBLE_FAREWELL, language).await;
            schedule_termination(
                app.termination_deps(),
                stream_id.clone(),
                "task_error".into(),
                app.grace(),
            );
            break;
        }
    }
    info!(stream_id = %stream_id, "conversation loop ended");
}

/// Role- and language-appropriate opening line.
fn greeting_text(peer: &Peer) -> String {
    let name = peer.name.as_deref().unwrap_or_default();
    match (peer.role, peer.language) {
        (PeerRole::Customer, Language::German) => {
            format!("Hallo {name}! Wie kann ich Ihnen heute helfen?")
        }
        (PeerRole::Customer, Language::Hindi | Language::HindiMixed) => {
            format!("Namaste {name}! Main aapki kya madad kar sakti hoon?")
        }
        (PeerRole::Customer, _) => format!("Hello {name}! How can I help you today?"),
        (PeerRole::Teammate, Language::German) => format!("Hallo {name}, was brauchst du?"),
        (PeerRole::Teammate, _) => format!("Hi {name}, what do you need?"),
        (PeerRole::Unknown, Language::German) => {
            "Hallo! Danke für Ihren Anruf. Wie kann ich helfen?".into()
        }
        (PeerRole::Unknown, _) => "Hello! Thanks for calling. How can I help you?".into(),
    }
}

/// Speak the greeting: pre-rendered clip when available (first-audio
/// latency near zero), live TTS otherwise. Outbound verification legs get
/// their workflow's fixed script instead.
async fn emit_greeting(app: &AppContext, stream_id: &str, bridge: &Arc<MediaBridge>) -> Result<()> {
    let verify_greeting = app.store.with(stream_id, |session| {
        match session.workflow.as_mut() {
            Some(WorkflowInstance::Verify(flow)) => Some(flow.take_greeting()),
            _ => None,
        }
    });
    let Some(verify_greeting) = verify_greeting else {
        return Ok(());
    };

    let peer = app.store.peer(stream_id).context("session gone")?;
    let is_verify = verify_greeting.is_some();
    let text = verify_greeting.unwrap_or_else(|| greeting_text(&peer));

    // The pre-rendered clip only fits the generic role greeting; the
    // verification script names the appointment, so it is always spoken.
    let clip = if is_verify {
        None
    } else {
        app.fillers.greeting(peer.language, peer.role).map(|bytes| bytes.to_vec())
    };
    match clip {
        Some(bytes) => bridge.play_bytes(bytes, PlayPriority::Normal).await,
        None => {
            let _ = bridge.speak(&text, peer.language).await?;
        }
    }

    app.store.with(stream_id, |session| {
        session.last_assistant = Some(text.clone());
        session.conversation.push(Turn::assistant(text.clone(), TurnKind::Greeting));
    });
    app.events.publish(SessionEvent::AssistantReply {
        stream_id: stream_id.to_string(),
        text,
    });
    Ok(())
}

/// Snapshot of what a turn needs from the session, taken under one lock.
struct TurnSnapshot {
    peer: Peer,
    turn_count: u32,
    history: Vec<ChatMessage>,
    preload: Preload,
    has_workflow: bool,
    is_verify: bool,
}

fn take_snapshot(app: &AppContext, stream_id: &str, utterance: &str) -> Option<TurnSnapshot> {
    app.store.with(stream_id, |session| {
        // History covers the turns *before* this utterance; the utterance
        // itself is passed to the workflow separately.
        let history = session
            .conversation
            .iter()
            .map(|turn| match turn.role {
                TurnRole::User => ChatMessage::user(&turn.content),
                TurnRole::Assistant => ChatMessage::assistant(&turn.content),
            })
            .collect();
        session.conversation.push(Turn::user(utterance));
        session.turn_count += 1;
        session.filler_sent = false;
        TurnSnapshot {
            peer: session.peer.clone(),
            turn_count: session.turn_count,
            history,
            preload: session.preload.clone(),
            has_workflow: session.workflow.is_some(),
            is_verify: matches!(session.workflow, Some(WorkflowInstance::Verify(_))),
        }
    })
}

/// Drive one utterance through pre-filter, classification and workflow.
async fn process_turn(
    app: &AppContext,
    stream_id: &str,
    bridge: &Arc<MediaBridge>,
    utterance: &str,
) -> Result<()> {
    let snapshot = take_snapshot(app, stream_id, utterance).context("session gone mid-turn")?;

    // Outbound verification drives every turn through its workflow; the
    // choice classifier owns ambiguity there.
    if snapshot.is_verify {
        return run_workflow_turn(app, stream_id, bridge, &snapshot, utterance).await;
    }

    // Pre-filter: customers always; teammates and unknowns skip it on
    // their first turn so an immediate request isn't mistaken for small
    // talk.
    let skip_prefilter =
        snapshot.peer.role != PeerRole::Customer && snapshot.turn_count <= 1;
    if !skip_prefilter {
        let verdict = prefilter::prefilter(utterance);
        match verdict {
            prefilter::PrefilterVerdict::Process => {}
            prefilter::PrefilterVerdict::Farewell if !snapshot.has_workflow => {
                speak_reply(
                    app,
                    stream_id,
                    bridge,
                    prefilter::canned_reply(verdict, snapshot.peer.language),
                    TurnKind::Farewell,
                )
                .await?;
                schedule_termination(
                    app.termination_deps(),
                    stream_id.to_string(),
                    "caller_farewell".into(),
                    app.grace(),
                );
                return Ok(());
            }
            prefilter::PrefilterVerdict::Farewell => {}
            _ if !snapshot.has_workflow => {
                speak_reply(
                    app,
                    stream_id,
                    bridge,
                    prefilter::canned_reply(verdict, snapshot.peer.language),
                    TurnKind::SmallTalk,
                )
                .await?;
                return Ok(());
            }
            // Mid-workflow, short answers like "ok" are real input.
            _ => {}
        }
    }

    if snapshot.has_workflow {
        return run_workflow_turn(app, stream_id, bridge, &snapshot, utterance).await;
    }

    // No workflow yet: decide whether this utterance deserves the
    // classifier at all.
    if snapshot.peer.role == PeerRole::Customer
        && !prefilter::should_classify(app.llm.as_ref(), utterance).await
    {
        speak_reply(
            app,
            stream_id,
            bridge,
            "I see! Is there anything I can help you with?",
            TurnKind::SmallTalk,
        )
        .await?;
        return Ok(());
    }

    let role = match snapshot.peer.role {
        PeerRole::Customer => ClassifierRole::Customer,
        PeerRole::Teammate => ClassifierRole::Teammate,
        PeerRole::Unknown => ClassifierRole::Unknown,
    };
    let intent = intent::classify(app.llm.as_ref(), role, utterance, stream_id, &app.audit).await;
    app.events.publish(SessionEvent::IntentClassified {
        stream_id: stream_id.to_string(),
        intent: intent.as_str().to_string(),
    });

    let workflow = match intent {
        Intent::ShiftCancelAppointment => Some(WorkflowInstance::Reschedule(
            crate::workflow::reschedule::RescheduleFlow::new(),
        )),
        Intent::DelayNotification => {
            Some(WorkflowInstance::Delay(crate::workflow::delay::DelayFlow::new()))
        }
        _ => None,
    };

    match workflow {
        Some(instance) => {
            app.store.with(stream_id, |session| session.workflow = Some(instance));
            run_workflow_turn(app, stream_id, bridge, &snapshot, utterance).await
        }
        None => {
            speak_reply(
                app,
                stream_id,
                bridge,
                canned_intent_reply(intent, &snapshot.peer),
                TurnKind::WorkflowReply,
            )
            .await
        }
    }
}

/// Canned responses for intents that don't open a workflow.
fn canned_intent_reply(intent: Intent, peer: &Peer) -> &'static str {
    match intent {
        Intent::InvoicingQuestion => {
            "For invoice questions our billing team is the right place, they'll \
             call you back today. Anything else?"
        }
        Intent::AppointmentInfo => {
            "I can check your appointments. Just say, for example, 'when is my \
             next appointment?'"
        }
        Intent::AdditionalDemands => {
            "Noted, I'll pass that on to the team. Anything else I can do?"
        }
        Intent::ScheduleMeeting | Intent::TeamCoordination => {
            "I'll flag that for the office manager. Anything else?"
        }
        Intent::CheckSchedule => {
            "I'll text you today's schedule in a moment. Anything else?"
        }
        Intent::FreeCapacityInquiry | Intent::AppointmentRequest => {
            "We'd love to help. Our team will call you back shortly to find a slot."
        }
        Intent::ServiceInquiry => {
            "We do installations, repairs and maintenance. Our team can call you \
             with details, does that work?"
        }
        _ => match peer.role {
            PeerRole::Customer => "Sorry, I didn't quite get that. You can ask me to \
                 move an appointment, for example.",
            _ => "Sorry, I didn't quite get that. Could you rephrase?",
        },
    }
}

/// Step the session's workflow with this utterance and act on the reply.
async fn run_workflow_turn(
    app: &AppContext,
    stream_id: &str,
    bridge: &Arc<MediaBridge>,
    snapshot: &TurnSnapshot,
    utterance: &str,
) -> Result<()> {
    // Take the instance out; the store lock must not cover the step.
    let Some(mut instance) = app
        .store
        .with(stream_id, |session| session.workflow.take())
        .flatten()
    else {
        return Ok(());
    };

    let turn_ctx = TurnContext {
        session_id: stream_id.to_string(),
        peer: snapshot.peer.clone(),
        language: snapshot.peer.language,
        history: snapshot.history.clone(),
        now: Utc::now(),
        llm: Arc::clone(&app.llm),
        calendar: Arc::clone(&app.calendar),
        phonebook: Arc::clone(&app.phonebook),
        audit: app.audit.clone(),
        events: app.events.clone(),
        filler: Arc::new(BridgeFiller {
            app: app.clone(),
            bridge: Arc::clone(bridge),
            stream_id: stream_id.to_string(),
            language: snapshot.peer.language,
        }),
        preload: snapshot.preload.clone(),
    };

    let reply = instance.step(&turn_ctx, utterance).await;
    let done = instance.done();
    let call_end = instance.call_end();

    // Put it back; a finished non-terminal flow clears so the next turn
    // classifies fresh. Verification flows stay for the termination
    // controller to read the outcome.
    let keep = !done || call_end || matches!(instance, WorkflowInstance::Verify(_));
    app.store.with(stream_id, |session| {
        session.workflow = if keep { Some(instance) } else { None };
    });

    handle_flow_actions(app, &reply);
    speak_reply(app, stream_id, bridge, &reply.text, TurnKind::WorkflowReply).await?;

    if call_end {
        schedule_termination(
            app.termination_deps(),
            stream_id.to_string(),
            "workflow_complete".into(),
            app.grace(),
        );
    }
    Ok(())
}

/// Execute deferred flow actions.
fn handle_flow_actions(app: &AppContext, reply: &FlowReply) {
    for action in &reply.actions {
        match action {
            FlowAction::ScheduleOutbound(request) => {
                let app = app.clone();
                let request = request.clone();
                let cooldown =
                    std::time::Duration::from_secs(app.config.call.outbound_cooldown_secs);
                tokio::spawn(async move {
                    // Cool-down: let the teammate leg tear down fully before
                    // asking the provider to dial again.
                    tokio::time::sleep(cooldown).await;
                    let parent_phone = request.parent_phone.clone();
                    let customer = request.customer_name.clone();
                    match app.outbound.dispatch(request).await {
                        Ok(ticket) => {
                            app.events.publish(SessionEvent::OutboundDispatched {
                                stream_id: ticket.child_stream_id.clone(),
                                child_stream_id: ticket.child_stream_id,
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "outbound dispatch failed");
                            let body = format!(
                                "I couldn't start the call to {customer}. Please reach \
                                 them directly."
                            );
                            if let Err(sms_err) = app.sms.send(&parent_phone, &body).await {
                                warn!(error = %sms_err, "dispatch-failure sms failed");
                            }
                        }
                    }
                });
            }
        }
    }
}

/// Speak `text` with duplicate suppression, and record it as the turn's
/// assistant output.
async fn speak_reply(
    app: &AppContext,
    stream_id: &str,
    bridge: &Arc<MediaBridge>,
    text: &str,
    kind: TurnKind,
) -> Result<()> {
    let (spoken, language) = app
        .store
        .with(stream_id, |session| {
            let spoken = if session.last_assistant.as_deref() == Some(text) {
                DUPLICATE_FALLBACK.to_string()
            } else {
                text.to_string()
            };
            session.last_assistant = Some(spoken.clone());
            session.conversation.push(Turn {
                role: TurnRole::Assistant,
                content: spoken.clone(),
                timestamp: Utc::now(),
                kind,
            });
            (spoken, session.peer.language)
        })
        .context("session gone before reply")?;

    app.events.publish(SessionEvent::AssistantReply {
        stream_id: stream_id.to_string(),
        text: spoken.clone(),
    });
    let _ = bridge.speak(&spoken, language).await?;
    Ok(())
}

/// Filler playback backed by the bridge and the per-turn guard.
struct BridgeFiller {
    app: AppContext,
    bridge: Arc<MediaBridge>,
    stream_id: String,
    language: Language,
}

#[async_trait]
impl crate::workflow::FillerSink for BridgeFiller {
    async fn play(&self, category: FillerCategory) {
        // Test-and-set under the store lock: one filler per turn.
        let first = self
            .app
            .store
            .with(&self.stream_id, |session| {
                if session.filler_sent {
                    false
                } else {
                    session.filler_sent = true;
                    true
                }
            })
            .unwrap_or(false);
        if !first {
            return;
        }
        let Some(clip) = self.app.fillers.pick(self.language, category) else {
            return;
        };
        self.bridge.play_bytes(clip.payload.clone(), PlayPriority::Normal).await;
        self.app.events.publish(SessionEvent::FillerPlayed {
            stream_id: self.stream_id.clone(),
            category: category.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greeting_matches_role_and_language() {
        let anna = Peer {
            phone_number: "+4917260734880".into(),
            name: Some("Anna".into()),
            role: PeerRole::Customer,
            email: None,
            language: Language::German,
        };
        assert_eq!(greeting_text(&anna), "Hallo Anna! Wie kann ich Ihnen heute helfen?");

        let unknown = Peer::unknown("+19998887777");
        assert!(greeting_text(&unknown).contains("Thanks for calling"));
    }

    #[test]
    fn canned_replies_cover_non_workflow_intents() {
        let peer = Peer::unknown("+19998887777");
        assert!(canned_intent_reply(Intent::ServiceInquiry, &peer).contains("installations"));
        assert!(canned_intent_reply(Intent::NoIntentDetected, &peer).contains("rephrase"));
    }
}
