//! Outbound customer verification workflow
//!
//! Runs on the child session the dispatcher creates. Greeting →
//! AwaitingChoice → outcome. The greeting is a fixed script referencing
//! the appointment and the proposed new time; one clarification turn is
//! allowed before the call downgrades to manual follow-up.

use serde_json::json;
use tracing::warn;

use crate::audit::AuditKind;
use crate::calendar::AppointmentChange;
use crate::filler::FillerCategory;
use crate::intent::{classify, ClassifierRole, Intent};
use crate::types::{Appointment, ZonedTime};
use crate::workflow::timeparse::format_in_zone;
use crate::workflow::{FlowReply, OutboundRequest, TurnContext};

const WORKFLOW: &str = "outbound_verify";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Greeting,
    AwaitingChoice,
    Farewell,
}

/// How the verification ended; drives the parent SMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Confirmed,
    Declined,
    /// Needs a human: customer wants a different time, or never answered
    /// clearly.
    PendingManualFollowup,
}

pub struct VerifyFlow {
    state: State,
    pub appointment: Appointment,
    pub proposed_start: ZonedTime,
    pub delay_minutes: Option<u32>,
    pub alternative_time: Option<String>,
    pub customer_name: String,
    pub parent_stream_id: String,
    /// Captured at dispatch time; the parent session may be gone by the
    /// time the SMS goes out.
    pub parent_phone: String,
    clarified: bool,
    pub outcome: Option<VerifyOutcome>,
    pub done: bool,
    pub call_end: bool,
}

impl VerifyFlow {
    pub fn from_request(request: &OutboundRequest) -> Self {
        Self {
            state: State::Greeting,
            appointment: request.appointment.clone(),
            proposed_start: request.proposed_start.clone(),
            delay_minutes: request.delay_minutes,
            alternative_time: request.alternative_time.clone(),
            customer_name: request.customer_name.clone(),
            parent_stream_id: request.parent_stream_id.clone(),
            parent_phone: request.parent_phone.clone(),
            clarified: false,
            outcome: None,
            done: false,
            call_end: false,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::Greeting => "greeting",
            State::AwaitingChoice => "awaiting_choice",
            State::Farewell => "farewell",
        }
    }

    /// The fixed opening script; calling this moves the flow to
    /// AwaitingChoice.
    pub fn take_greeting(&mut self) -> String {
        self.state = State::AwaitingChoice;
        let when = format_in_zone(self.appointment.start.date_time, &self.appointment.start.time_zone);
        let proposed = format_in_zone(self.proposed_start.date_time, &self.proposed_start.time_zone);
        let reason = match self.delay_minutes {
            Some(minutes) => format!("our technician is running about {minutes} minutes late"),
            None => "we need to adjust the schedule".to_string(),
        };
        format!(
            "Hello {}, this is the scheduling assistant calling about your {} on {}. \
             Unfortunately {}. Would {} work for you instead?",
            self.customer_name, self.appointment.summary, when, reason, proposed
        )
    }

    pub async fn step(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match self.state {
            // A step before the greeting was spoken should not happen; treat
            // it as the greeting turn.
            State::Greeting => {
                let text = self.take_greeting();
                FlowReply::say(text)
            }
            State::AwaitingChoice => self.handle_choice(ctx, utterance).await,
            State::Farewell => {
                self.done = true;
                FlowReply::say("Thank you, goodbye!")
            }
        }
    }

    async fn handle_choice(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        let intent = classify(
            ctx.llm.as_ref(),
            ClassifierRole::OutboundVerify,
            utterance,
            &ctx.session_id,
            &ctx.audit,
        )
        .await;

        match intent {
            Intent::AppointmentConfirmed => self.apply_confirmation(ctx).await,
            Intent::AppointmentRescheduled => {
                self.finish(ctx, VerifyOutcome::PendingManualFollowup, "pending_manual_followup");
                FlowReply::say(
                    "No problem at all. Our team will call you to find a time that suits \
                     you better. Goodbye!",
                )
            }
            Intent::AppointmentDeclined => {
                self.finish(ctx, VerifyOutcome::Declined, "cancelled");
                FlowReply::say(
                    "Understood, I've cancelled the appointment. Thanks for letting us \
                     know. Goodbye!",
                )
            }
            // unclear_response, no_intent_detected, or anything off-set.
            _ => {
                if !self.clarified {
                    self.clarified = true;
                    let proposed =
                        format_in_zone(self.proposed_start.date_time, &self.proposed_start.time_zone);
                    return FlowReply::say(format!(
                        "Sorry, just to check: does {proposed} work for you — yes or no?"
                    ));
                }
                self.finish(ctx, VerifyOutcome::PendingManualFollowup, "pending_manual_followup");
                FlowReply::say(
                    "No worries — our team will call you back to sort it out. Goodbye!",
                )
            }
        }
    }

    async fn apply_confirmation(&mut self, ctx: &TurnContext) -> FlowReply {
        ctx.transition(WORKFLOW, "applying_outcome");
        ctx.filler.play(FillerCategory::CalendarUpdate).await;

        let duration = self.appointment.end.date_time - self.appointment.start.date_time;
        let new_end = self.proposed_start.date_time + duration;
        let change = AppointmentChange {
            start: self.proposed_start.clone(),
            end: ZonedTime {
                date_time: new_end,
                time_zone: self.proposed_start.time_zone.clone(),
            },
            status: Some("confirmed".into()),
        };

        match ctx.calendar.update_appointment(&self.appointment.id, &change).await {
            Ok(()) => {
                ctx.audit.emit_payload(
                    &ctx.session_id,
                    AuditKind::CalendarUpdate,
                    json!({
                        "appointment_id": self.appointment.id,
                        "summary": self.appointment.summary,
                        "before": {
                            "start": self.appointment.start.date_time,
                            "end": self.appointment.end.date_time,
                        },
                        "after": { "start": self.proposed_start.date_time, "end": new_end },
                    }),
                );
                self.finish(ctx, VerifyOutcome::Confirmed, "confirmed");
                let proposed =
                    format_in_zone(self.proposed_start.date_time, &self.proposed_start.time_zone);
                FlowReply::say(format!(
                    "Great, you're confirmed for {proposed}. See you then. Goodbye!"
                ))
            }
            Err(err) => {
                warn!(error = %err, "confirmation calendar write failed");
                self.finish(ctx, VerifyOutcome::PendingManualFollowup, "pending_manual_followup");
                FlowReply::say(
                    "I'm sorry, I couldn't update the booking just now. Our team will \
                     call you to confirm. Goodbye!",
                )
            }
        }
    }

    fn finish(&mut self, ctx: &TurnContext, outcome: VerifyOutcome, status: &str) {
        ctx.audit.emit_payload(
            &ctx.session_id,
            AuditKind::CustomerResponse,
            json!({
                "status": status,
                "customer": self.customer_name,
                "appointment_id": self.appointment.id,
                "parent_stream_id": self.parent_stream_id,
            }),
        );
        self.outcome = Some(outcome);
        self.state = State::Farewell;
        self.done = true;
        self.call_end = true;
        ctx.transition(WORKFLOW, "farewell");
    }

    /// Text for the SMS the termination controller sends to the teammate.
    pub fn sms_summary(&self) -> Option<String> {
        let proposed = format_in_zone(self.proposed_start.date_time, &self.proposed_start.time_zone);
        match self.outcome? {
            VerifyOutcome::Confirmed => Some(format!(
                "{} confirmed the new time: {}.",
                self.customer_name, proposed
            )),
            VerifyOutcome::Declined => Some(format!(
                "{} can't make it — the appointment was cancelled.",
                self.customer_name
            )),
            VerifyOutcome::PendingManualFollowup => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;
    use crate::workflow::testutil::{appointment, context, FakeCalendar, RecordingFiller, ScriptedModel};

    fn request() -> OutboundRequest {
        OutboundRequest {
            customer_phone: "+4915112345678".into(),
            customer_name: "James".into(),
            customer_language: Language::English,
            appointment: appointment(
                "B1",
                "Kitchen installation",
                "2025-10-14T12:00:00Z",
                "2025-10-14T13:00:00Z",
            ),
            delay_minutes: Some(30),
            alternative_time: Some("18:00".into()),
            proposed_start: ZonedTime {
                date_time: "2025-10-14T16:00:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            parent_stream_id: "MZparent".into(),
            parent_phone: "+4915199988877".into(),
        }
    }

    #[test]
    fn greeting_references_appointment_and_proposal() {
        let mut flow = VerifyFlow::from_request(&request());
        let greeting = flow.take_greeting();
        assert!(greeting.contains("James"));
        assert!(greeting.contains("Kitchen installation"));
        // 16:00Z is 18:00 Berlin.
        assert!(greeting.contains("6:00 PM"), "got: {greeting}");
        assert_eq!(flow.state_name(), "awaiting_choice");
    }

    #[tokio::test]
    async fn confirmation_updates_calendar_and_sets_outcome() {
        let model = ScriptedModel::texts(&["appointment_confirmed"]);
        let calendar = FakeCalendar::with(vec![]);
        let ctx = context(model, calendar.clone(), RecordingFiller::new());

        let mut flow = VerifyFlow::from_request(&request());
        let _ = flow.take_greeting();
        let reply = flow.step(&ctx, "yes six PM works").await;

        assert_eq!(flow.outcome, Some(VerifyOutcome::Confirmed));
        assert!(flow.done && flow.call_end);
        assert!(reply.text.contains("confirmed"));

        let updates = calendar.updates.lock().unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, "B1");
        assert_eq!(
            updates[0].1.start.date_time,
            "2025-10-14T16:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
        );
        // Hour-long slot keeps its length.
        assert_eq!(
            updates[0].1.end.date_time,
            "2025-10-14T17:00:00Z".parse::<chrono::DateTime<chrono::Utc>>().unwrap()
        );
    }

    #[tokio::test]
    async fn decline_audits_cancelled_without_calendar_write() {
        let model = ScriptedModel::texts(&["appointment_declined"]);
        let calendar = FakeCalendar::with(vec![]);
        let mut ctx = context(model, calendar.clone(), RecordingFiller::new());
        let (audit, mut audit_rx) = crate::audit::AuditLog::capture();
        ctx.audit = audit;

        let mut flow = VerifyFlow::from_request(&request());
        let _ = flow.take_greeting();
        let _ = flow.step(&ctx, "no I can't make it").await;

        assert_eq!(flow.outcome, Some(VerifyOutcome::Declined));
        assert!(calendar.updates.lock().unwrap().is_empty());

        let mut saw_cancelled = false;
        while let Ok(record) = audit_rx.try_recv() {
            if record.kind == AuditKind::CustomerResponse {
                assert_eq!(record.payload["status"], "cancelled");
                saw_cancelled = true;
            }
        }
        assert!(saw_cancelled);
    }

    #[tokio::test]
    async fn second_unclear_downgrades_to_manual_followup() {
        let model = ScriptedModel::texts(&["unclear_response", "unclear_response"]);
        let calendar = FakeCalendar::with(vec![]);
        let ctx = context(model, calendar, RecordingFiller::new());

        let mut flow = VerifyFlow::from_request(&request());
        let _ = flow.take_greeting();

        let first = flow.step(&ctx, "ehh what do you mean").await;
        assert!(first.text.contains("yes or no"));
        assert!(!flow.done);

        let second = flow.step(&ctx, "the weather is nice").await;
        assert_eq!(flow.outcome, Some(VerifyOutcome::PendingManualFollowup));
        assert!(flow.done && flow.call_end);
        assert!(second.text.contains("call you back"));
    }

    #[test]
    fn sms_summary_only_for_definite_outcomes() {
        let mut flow = VerifyFlow::from_request(&request());
        assert!(flow.sms_summary().is_none());
        flow.outcome = Some(VerifyOutcome::Confirmed);
        assert!(flow.sms_summary().unwrap().contains("James confirmed"));
        flow.outcome = Some(VerifyOutcome::PendingManualFollowup);
        assert!(flow.sms_summary().is_none());
    }
}
