//! Workflow engine: per-call state machines with memory
//!
//! Three graphs live here: customer rescheduling, teammate delay
//! notification, and outbound customer verification. A flow instance is
//! owned by its session; the orchestrator takes it out of the store for
//! the duration of one utterance step and puts it back — no flow ever
//! holds the session, and no lock is ever held across a collaborator call.
//!
//! Steps receive a `TurnContext` carrying collaborators plus the
//! conversation history snapshot, and may play a latency-masking filler
//! before awaiting slow work. Replies come back as text plus deferred
//! actions for the orchestrator to execute.

pub mod delay;
pub mod reschedule;
pub mod timeparse;
pub mod verify;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use crate::audit::{AuditKind, AuditLog};
use crate::calendar::CalendarApi;
use crate::events::{EventBus, SessionEvent};
use crate::filler::FillerCategory;
use crate::llm::{ChatMessage, ChatModel, ChatRequest};
use crate::phonebook::Phonebook;
use crate::session::Preload;
use crate::types::{Appointment, Language, Peer, ZonedTime};

/// Everything one workflow step may touch.
pub struct TurnContext {
    pub session_id: String,
    pub peer: Peer,
    pub language: Language,
    /// Conversation so far, mapped for LLM consumption. Append-only input;
    /// flows never mutate it.
    pub history: Vec<ChatMessage>,
    pub now: DateTime<Utc>,
    pub llm: Arc<dyn ChatModel>,
    pub calendar: Arc<dyn CalendarApi>,
    pub phonebook: Arc<Phonebook>,
    pub audit: AuditLog,
    pub events: EventBus,
    pub filler: Arc<dyn FillerSink>,
    /// Background-loaded calendar, when the orchestrator started one.
    pub preload: Preload,
}

impl TurnContext {
    /// Record a workflow transition for audit and observability.
    pub fn transition(&self, workflow: &str, state: &str) {
        self.audit.emit_payload(
            &self.session_id,
            AuditKind::WorkflowTransition,
            json!({ "workflow": workflow, "state": state }),
        );
        self.events.publish(SessionEvent::WorkflowTransition {
            stream_id: self.session_id.clone(),
            workflow: workflow.to_string(),
            state: state.to_string(),
        });
    }
}

/// Plays latency-masking clips; the orchestrator backs this with the media
/// bridge and the per-turn `filler_sent` guard.
#[async_trait]
pub trait FillerSink: Send + Sync {
    async fn play(&self, category: FillerCategory);
}

/// Deferred side effect a step asks the orchestrator to run.
#[derive(Debug, Clone)]
pub enum FlowAction {
    /// Dial the customer after the configured cool-down.
    ScheduleOutbound(OutboundRequest),
}

/// What the outbound dispatcher needs to spin up the verification leg.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub customer_phone: String,
    pub customer_name: String,
    pub customer_language: Language,
    /// Captured verbatim from the calendar; never re-serialized by an LLM.
    pub appointment: Appointment,
    pub delay_minutes: Option<u32>,
    pub alternative_time: Option<String>,
    /// The primary new start offered to the customer.
    pub proposed_start: ZonedTime,
    pub parent_stream_id: String,
    /// Where the outcome SMS goes.
    pub parent_phone: String,
}

/// One step's outcome.
#[derive(Debug, Clone)]
pub struct FlowReply {
    pub text: String,
    pub actions: Vec<FlowAction>,
}

impl FlowReply {
    pub fn say(text: impl Into<String>) -> Self {
        Self { text: text.into(), actions: Vec::new() }
    }

    pub fn with_action(text: impl Into<String>, action: FlowAction) -> Self {
        Self { text: text.into(), actions: vec![action] }
    }
}

/// The one workflow a session may carry.
pub enum WorkflowInstance {
    Reschedule(reschedule::RescheduleFlow),
    Delay(delay::DelayFlow),
    Verify(verify::VerifyFlow),
}

impl WorkflowInstance {
    pub fn kind_name(&self) -> &'static str {
        match self {
            WorkflowInstance::Reschedule(_) => "customer_reschedule",
            WorkflowInstance::Delay(_) => "teammate_delay",
            WorkflowInstance::Verify(_) => "outbound_verify",
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self {
            WorkflowInstance::Reschedule(flow) => flow.state_name(),
            WorkflowInstance::Delay(flow) => flow.state_name(),
            WorkflowInstance::Verify(flow) => flow.state_name(),
        }
    }

    /// True once the flow has nothing more to do with utterances.
    pub fn done(&self) -> bool {
        match self {
            WorkflowInstance::Reschedule(flow) => flow.done,
            WorkflowInstance::Delay(flow) => flow.done,
            WorkflowInstance::Verify(flow) => flow.done,
        }
    }

    /// True when finishing the flow should also end the call.
    pub fn call_end(&self) -> bool {
        match self {
            WorkflowInstance::Reschedule(flow) => flow.call_end,
            WorkflowInstance::Delay(flow) => flow.call_end,
            WorkflowInstance::Verify(flow) => flow.call_end,
        }
    }

    /// Drive the flow with one user utterance.
    pub async fn step(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match self {
            WorkflowInstance::Reschedule(flow) => flow.step(ctx, utterance).await,
            WorkflowInstance::Delay(flow) => flow.step(ctx, utterance).await,
            WorkflowInstance::Verify(flow) => flow.step(ctx, utterance).await,
        }
    }
}

/// Three-way reply classification used by confirmation turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YesNo {
    Yes,
    No,
    Unclear,
}

/// Keyword fast-path first, model second. The fast-path keeps the common
/// "yes"/"no" turn off the LLM entirely.
pub async fn classify_yes_no(llm: &dyn ChatModel, text: &str) -> YesNo {
    let lower = text.trim().to_lowercase();
    let affirm = ["yes", "yeah", "yep", "sure", "correct", "right", "exactly", "ja", "genau", "haan", "haanji", "bilkul"];
    let negate = ["no", "nope", "wrong", "incorrect", "nein", "nahi", "nahin"];

    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let has_affirm = words.iter().any(|word| affirm.contains(word));
    let has_negate = words.iter().any(|word| negate.contains(word));
    match (has_affirm, has_negate) {
        (true, false) => return YesNo::Yes,
        (false, true) => return YesNo::No,
        _ => {}
    }

    let request = ChatRequest::deterministic(
        vec![
            ChatMessage::system(
                "The caller was asked a yes/no question. Answer with exactly one \
                 word: yes, no, or unclear.",
            ),
            ChatMessage::user(text),
        ],
        15,
    );
    match llm.chat(request).await {
        Ok(outcome) => {
            let answer = outcome.text.trim().to_lowercase();
            if answer.starts_with("yes") {
                YesNo::Yes
            } else if answer.starts_with("no") {
                YesNo::No
            } else {
                YesNo::Unclear
            }
        }
        Err(_) => YesNo::Unclear,
    }
}
