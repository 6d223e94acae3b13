//! Intent classification
//!
//! Role-specific classifiers over fixed closed sets. The LLM gets a
//! deterministic prompt (temperature 0, tight token cap) and must answer
//! with a single category token; whatever comes back is normalized by
//! substring match, and keyword heuristics over the raw transcript back
//! the whole thing up. A classifier failure is never a turn failure.

pub mod prefilter;

use serde_json::json;
use tracing::{debug, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::llm::{ChatMessage, ChatModel, ChatRequest};

/// Which closed set applies to this utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierRole {
    Customer,
    Teammate,
    Unknown,
    OutboundVerify,
}

/// Union of all role intents; each role only ever produces its own subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    // Customer inbound
    ShiftCancelAppointment,
    InvoicingQuestion,
    AppointmentInfo,
    AdditionalDemands,
    // Teammate inbound
    DelayNotification,
    ScheduleMeeting,
    CheckSchedule,
    TeamCoordination,
    // Unknown / potential client inbound
    FreeCapacityInquiry,
    ServiceInquiry,
    AppointmentRequest,
    // Outbound verification
    AppointmentConfirmed,
    AppointmentRescheduled,
    AppointmentDeclined,
    UnclearResponse,
    // Shared
    NoIntentDetected,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::ShiftCancelAppointment => "shift_cancel_appointment",
            Intent::InvoicingQuestion => "invoicing_question",
            Intent::AppointmentInfo => "appointment_info",
            Intent::AdditionalDemands => "additional_demands",
            Intent::DelayNotification => "delay_notification",
            Intent::ScheduleMeeting => "schedule_meeting",
            Intent::CheckSchedule => "check_schedule",
            Intent::TeamCoordination => "team_coordination",
            Intent::FreeCapacityInquiry => "free_capacity_inquiry",
            Intent::ServiceInquiry => "service_inquiry",
            Intent::AppointmentRequest => "appointment_request",
            Intent::AppointmentConfirmed => "appointment_confirmed",
            Intent::AppointmentRescheduled => "appointment_rescheduled",
            Intent::AppointmentDeclined => "appointment_declined",
            Intent::UnclearResponse => "unclear_response",
            Intent::NoIntentDetected => "no_intent_detected",
        }
    }
}

impl ClassifierRole {
    /// The closed category set for this role, `no_intent_detected` last.
    pub fn categories(&self) -> &'static [Intent] {
        match self {
            ClassifierRole::Customer => &[
                Intent::ShiftCancelAppointment,
                Intent::InvoicingQuestion,
                Intent::AppointmentInfo,
                Intent::AdditionalDemands,
                Intent::NoIntentDetected,
            ],
            ClassifierRole::Teammate => &[
                Intent::DelayNotification,
                Intent::ScheduleMeeting,
                Intent::CheckSchedule,
                Intent::TeamCoordination,
                Intent::NoIntentDetected,
            ],
            ClassifierRole::Unknown => &[
                Intent::FreeCapacityInquiry,
                Intent::ServiceInquiry,
                Intent::AppointmentRequest,
                Intent::NoIntentDetected,
            ],
            ClassifierRole::OutboundVerify => &[
                Intent::AppointmentConfirmed,
                Intent::AppointmentRescheduled,
                Intent::AppointmentDeclined,
                Intent::UnclearResponse,
                Intent::NoIntentDetected,
            ],
        }
    }

    fn system_prompt(&self) -> String {
        let categories: Vec<&str> = self.categories().iter().map(Intent::as_str).collect();
        format!(
            "You classify one caller utterance into exactly one category. \
             Respond with a single lowercase category token and nothing else. \
             Categories: {}.",
            categories.join(", ")
        )
    }
}

/// Normalize raw LLM output against the role's categories.
fn normalize(role: ClassifierRole, raw: &str) -> Option<Intent> {
    let cleaned = raw.trim().to_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    // Exact token first, then substring either way around (models love to
    // wrap the token in a sentence).
    for intent in role.categories() {
        if cleaned == intent.as_str() {
            return Some(*intent);
        }
    }
    role.categories()
        .iter()
        .find(|intent| cleaned.contains(intent.as_str()))
        .copied()
}

/// Keyword heuristics over the raw transcript; the last line of defense.
fn heuristic(role: ClassifierRole, transcript: &str) -> Intent {
    let lower = transcript.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|word| lower.contains(word));

    match role {
        ClassifierRole::Customer => {
            if has(&["shift", "cancel", "reschedule", "move", "postpone", "verschieben", "absagen"]) {
                Intent::ShiftCancelAppointment
            } else if has(&["invoice", "bill", "payment", "rechnung"]) {
                Intent::InvoicingQuestion
            } else if has(&["when is", "what time", "my appointment", "wann ist"]) {
                Intent::AppointmentInfo
            } else if has(&["also need", "one more thing", "additionally", "außerdem"]) {
                Intent::AdditionalDemands
            } else {
                Intent::NoIntentDetected
            }
        }
        ClassifierRole::Teammate => {
            if has(&["late", "delay", "running behind", "verspäte", "stuck in traffic"]) {
                Intent::DelayNotification
            } else if has(&["set up a meeting", "schedule a meeting", "meeting with"]) {
                Intent::ScheduleMeeting
            } else if has(&["my schedule", "what's next", "appointments today", "mein plan"]) {
                Intent::CheckSchedule
            } else if has(&["cover for", "swap", "hand over", "team"]) {
                Intent::TeamCoordination
            } else {
                Intent::NoIntentDetected
            }
        }
        ClassifierRole::Unknown => {
            if has(&["free slot", "availability", "capacity", "available"]) {
                Intent::FreeCapacityInquiry
            } else if has(&["do you offer", "services", "what do you do", "price"]) {
                Intent::ServiceInquiry
            } else if has(&["appointment", "book", "termin"]) {
                Intent::AppointmentRequest
            } else {
                Intent::NoIntentDetected
            }
        }
        ClassifierRole::OutboundVerify => {
            if has(&["yes", "sure", "works for me", "sounds good", "ja", "haan", "confirm"]) {
                Intent::AppointmentConfirmed
            } else if has(&["another time", "different time", "call back", "later this week"]) {
                Intent::AppointmentRescheduled
            } else if has(&["no", "can't", "cannot", "won't make it", "nein", "nahi"]) {
                Intent::AppointmentDeclined
            } else {
                Intent::UnclearResponse
            }
        }
    }
}

/// Classify one utterance for a role.
///
/// Emits an intent audit record with both the normalized category and the
/// raw model string; LLM failure falls back to the heuristic.
pub async fn classify(
    llm: &dyn ChatModel,
    role: ClassifierRole,
    transcript: &str,
    session_id: &str,
    audit: &AuditLog,
) -> Intent {
    let request = ChatRequest::deterministic(
        vec![
            ChatMessage::system(role.system_prompt()),
            ChatMessage::user(transcript),
        ],
        20,
    );

    let (intent, raw) = match llm.chat(request).await {
        Ok(outcome) => match normalize(role, &outcome.text) {
            Some(intent) => (intent, outcome.text),
            None => {
                debug!(raw = %outcome.text, "unrecognized classifier output, using heuristic");
                (heuristic(role, transcript), outcome.text)
            }
        },
        Err(err) => {
            warn!(error = %err, "classifier llm failed, using heuristic");
            (heuristic(role, transcript), format!("<error: {err}>"))
        }
    };

    audit.emit_payload(
        session_id,
        AuditKind::Intent,
        json!({
            "intent": intent.as_str(),
            "raw": raw,
            "transcript": transcript,
        }),
    );
    intent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollabResult, CollaboratorError};
    use crate::llm::ChatOutcome;
    use async_trait::async_trait;

    struct FixedModel(&'static str);

    #[async_trait]
    impl ChatModel for FixedModel {
        async fn chat(&self, _request: ChatRequest) -> CollabResult<ChatOutcome> {
            Ok(ChatOutcome { text: self.0.to_string(), tool_calls: vec![] })
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl ChatModel for BrokenModel {
        async fn chat(&self, _request: ChatRequest) -> CollabResult<ChatOutcome> {
            Err(CollaboratorError::unavailable("llm", "boom"))
        }
    }

    #[test]
    fn normalize_exact_and_substring() {
        assert_eq!(
            normalize(ClassifierRole::Customer, "shift_cancel_appointment"),
            Some(Intent::ShiftCancelAppointment)
        );
        assert_eq!(
            normalize(ClassifierRole::Customer, "The category is: shift_cancel_appointment."),
            Some(Intent::ShiftCancelAppointment)
        );
        assert_eq!(normalize(ClassifierRole::Customer, "delay_notification"), None);
        assert_eq!(normalize(ClassifierRole::Customer, ""), None);
    }

    #[test]
    fn heuristic_catches_reschedule_words() {
        assert_eq!(
            heuristic(ClassifierRole::Customer, "I want to shift my appointment"),
            Intent::ShiftCancelAppointment
        );
        assert_eq!(
            heuristic(ClassifierRole::Teammate, "I'm running 30 minutes late for James"),
            Intent::DelayNotification
        );
        assert_eq!(
            heuristic(ClassifierRole::OutboundVerify, "no I can't make it"),
            Intent::AppointmentDeclined
        );
    }

    #[tokio::test]
    async fn classify_is_idempotent_for_fixed_model() {
        let model = FixedModel("shift_cancel_appointment");
        let audit = AuditLog::disabled();
        let first = classify(&model, ClassifierRole::Customer, "shift it", "s1", &audit).await;
        let second = classify(&model, ClassifierRole::Customer, "shift it", "s1", &audit).await;
        assert_eq!(first, second);
        assert_eq!(first, Intent::ShiftCancelAppointment);
    }

    #[tokio::test]
    async fn classify_falls_back_when_llm_is_down() {
        let audit = AuditLog::disabled();
        let intent = classify(
            &BrokenModel,
            ClassifierRole::Customer,
            "please cancel my appointment",
            "s1",
            &audit,
        )
        .await;
        assert_eq!(intent, Intent::ShiftCancelAppointment);
    }

    #[tokio::test]
    async fn classify_audits_intent_and_raw() {
        let (audit, mut rx) = AuditLog::capture();
        let model = FixedModel("definitely invoicing_question here");
        classify(&model, ClassifierRole::Customer, "about my bill", "s1", &audit).await;
        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, AuditKind::Intent);
        assert_eq!(record.payload["intent"], "invoicing_question");
        assert_eq!(record.payload["raw"], "definitely invoicing_question here");
    }
}
