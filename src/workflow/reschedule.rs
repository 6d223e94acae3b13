//! Customer reschedule workflow
//!
//! Idle → (preload) → AwaitingSelection → AwaitingNewTime
//! [→ AwaitingMissingInfo] → AwaitingConfirmation → (applying update)
//! → PostUpdate → done. Memory carries the selected appointment, the
//! candidate time, and a clarification budget; the conversation history in
//! the `TurnContext` is the context for every model call.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::warn;

use crate::audit::AuditKind;
use crate::calendar::AppointmentChange;
use crate::filler::FillerCategory;
use crate::llm::{ChatMessage, ChatRequest};
use crate::types::{Appointment, ZonedTime};
use crate::workflow::timeparse::{self, ParsedTime, TimeValidation};
use crate::workflow::{classify_yes_no, FlowReply, TurnContext, YesNo};

const WORKFLOW: &str = "customer_reschedule";
/// Give up after this many failed clarifications in a row.
const MAX_CLARIFICATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingSelection,
    AwaitingNewTime,
    AwaitingMissingInfo,
    AwaitingConfirmation,
    PostUpdate,
}

/// Which half of the datetime the caller still owes us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MissingField {
    Date,
    Time,
}

pub struct RescheduleFlow {
    state: State,
    appointments: Vec<Appointment>,
    selected: Option<Appointment>,
    candidate: Option<DateTime<Utc>>,
    missing: Option<MissingField>,
    clarification_attempts: u32,
    post_update_attempts: u32,
    pub done: bool,
    pub call_end: bool,
}

impl Default for RescheduleFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl RescheduleFlow {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            appointments: Vec::new(),
            selected: None,
            candidate: None,
            missing: None,
            clarification_attempts: 0,
            post_update_attempts: 0,
            done: false,
            call_end: false,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::Idle => "idle",
            State::AwaitingSelection => "awaiting_selection",
            State::AwaitingNewTime => "awaiting_new_time",
            State::AwaitingMissingInfo => "awaiting_missing_info",
            State::AwaitingConfirmation => "awaiting_confirmation",
            State::PostUpdate => "post_update",
        }
    }

    pub async fn step(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match self.state {
            State::Idle => self.begin(ctx).await,
            State::AwaitingSelection => self.select(ctx, utterance).await,
            State::AwaitingNewTime | State::AwaitingMissingInfo => {
                self.handle_new_time(ctx, utterance).await
            }
            State::AwaitingConfirmation => self.confirm(ctx, utterance).await,
            State::PostUpdate => self.post_update(ctx, utterance).await,
        }
    }

    /// First step: resolve the preloaded calendar and list appointments.
    async fn begin(&mut self, ctx: &TurnContext) -> FlowReply {
        ctx.transition(WORKFLOW, "preload");
        ctx.filler.play(FillerCategory::CalendarFetch).await;

        let fetched = match ctx.preload.wait().await {
            Some(result) => result,
            // No preload was started (rare: store rebuilt mid-call); fetch now.
            None => ctx
                .calendar
                .list_appointments(&ctx.peer)
                .await
                .map_err(|err| err.to_string()),
        };

        let appointments = match fetched {
            Ok(appointments) => appointments,
            Err(reason) => {
                warn!(reason, "calendar fetch failed, abandoning reschedule");
                self.done = true;
                self.call_end = true;
                ctx.transition(WORKFLOW, "done");
                return FlowReply::say(
                    "I'm sorry, I can't reach the calendar right now. \
                     Please call again in a few minutes.",
                );
            }
        };

        if appointments.is_empty() {
            self.done = true;
            ctx.transition(WORKFLOW, "done");
            return FlowReply::say(
                "It looks like you don't have any upcoming appointments. \
                 Is there anything else I can help you with?",
            );
        }

        self.appointments = appointments;
        self.state = State::AwaitingSelection;
        ctx.transition(WORKFLOW, "awaiting_selection");

        let listing = self.listing();
        FlowReply::say(format!(
            "You have {}: {}. Which one would you like to move?",
            if self.appointments.len() == 1 { "one appointment" } else { "these appointments" },
            listing
        ))
    }

    fn listing(&self) -> String {
        self.appointments
            .iter()
            .enumerate()
            .map(|(index, appointment)| {
                format!(
                    "{}. {} on {}",
                    index + 1,
                    appointment.summary,
                    timeparse::format_in_zone(appointment.start.date_time, &appointment.start.time_zone)
                )
            })
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Resolve which appointment the caller means.
    async fn select(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        let choice = self.resolve_selection(ctx, utterance).await;

        let Some(index) = choice else {
            self.clarification_attempts += 1;
            if self.clarification_attempts >= MAX_CLARIFICATIONS {
                return self.give_up(ctx);
            }
            return FlowReply::say(format!(
                "Sorry, I didn't catch which appointment you mean. {}. \
                 You can say the number or the name.",
                self.listing()
            ));
        };

        self.clarification_attempts = 0;
        self.selected = Some(self.appointments[index].clone());
        self.state = State::AwaitingNewTime;
        ctx.transition(WORKFLOW, "awaiting_new_time");

        // The same utterance often carries the new time ("the eye checkup
        // to Monday at 2 PM"); parse it in this turn instead of asking.
        if timeparse::has_time_keywords(utterance) {
            return self.handle_new_time(ctx, utterance).await;
        }

        let selected = self.selected.as_ref().expect("just set");
        FlowReply::say(format!(
            "Alright, the {}. When would you like to move it to?",
            selected.summary
        ))
    }

    async fn resolve_selection(&self, ctx: &TurnContext, utterance: &str) -> Option<usize> {
        // Model first: it sees the list and the utterance.
        let request = ChatRequest::deterministic(
            vec![
                ChatMessage::system(format!(
                    "The caller was offered these appointments: {}. Which one does \
                     the reply refer to? Answer with the 1-based number only, or \
                     'unclear'.",
                    self.listing()
                )),
                ChatMessage::user(utterance),
            ],
            15,
        );
        if let Ok(outcome) = ctx.llm.chat(request).await {
            let reply = outcome.text.trim().to_lowercase();
            if let Ok(number) = reply.trim_end_matches('.').parse::<usize>() {
                if (1..=self.appointments.len()).contains(&number) {
                    return Some(number - 1);
                }
            }
        }

        // Heuristics: bare digits, ordinal words, summary words.
        let lower = utterance.to_lowercase();
        for (index, _) in self.appointments.iter().enumerate() {
            let spoken = format!("{}", index + 1);
            let ordinal = ["first", "second", "third", "fourth", "fifth"].get(index);
            if lower.split_whitespace().any(|word| word == spoken)
                || ordinal.is_some_and(|word| lower.contains(word))
            {
                return Some(index);
            }
        }
        self.appointments.iter().position(|appointment| {
            let summary = appointment.summary.to_lowercase();
            summary
                .split_whitespace()
                .filter(|word| word.len() > 3)
                .any(|word| lower.contains(word))
        })
    }

    /// Parse the requested new time out of this turn plus the history.
    async fn handle_new_time(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        ctx.filler.play(FillerCategory::Reschedule).await;

        let tz = self
            .selected
            .as_ref()
            .map(|appointment| appointment.start.time_zone.clone())
            .unwrap_or_else(|| "UTC".to_string());

        let parsed =
            timeparse::parse_datetime(ctx.llm.as_ref(), utterance, &ctx.history, ctx.now, &tz).await;

        match parsed {
            ParsedTime::Resolved(candidate) => match timeparse::validate(candidate, ctx.now) {
                TimeValidation::Ok => {
                    self.candidate = Some(candidate);
                    self.missing = None;
                    self.clarification_attempts = 0;
                    self.state = State::AwaitingConfirmation;
                    ctx.transition(WORKFLOW, "awaiting_confirmation");
                    FlowReply::say(format!(
                        "Just to confirm, you want to move your appointment to {}. Is that correct?",
                        timeparse::format_in_zone(candidate, &tz)
                    ))
                }
                TimeValidation::TooFarAhead => {
                    self.clarify(ctx, "That's more than a year from now. Which day did you mean?")
                }
                TimeValidation::InPast => {
                    self.clarify(ctx, "That time has already passed. When should I move it to instead?")
                }
            },
            ParsedTime::MissingTime { date } => {
                if self.missing == Some(MissingField::Time) {
                    // Already clarified the time once; the budget decides.
                    return self.clarify(ctx, "Sorry, I still need a time of day, like 2 PM.");
                }
                self.missing = Some(MissingField::Time);
                self.state = State::AwaitingMissingInfo;
                ctx.transition(WORKFLOW, "awaiting_missing_info");
                FlowReply::say(format!(
                    "Got it, {}. What time of day works for you?",
                    date.format("%B %-d")
                ))
            }
            ParsedTime::MissingDate { time } => {
                if self.missing == Some(MissingField::Date) {
                    return self.clarify(ctx, "Sorry, I still need the day, like next Monday.");
                }
                self.missing = Some(MissingField::Date);
                self.state = State::AwaitingMissingInfo;
                ctx.transition(WORKFLOW, "awaiting_missing_info");
                FlowReply::say(format!(
                    "Okay, {}. Which day should I move it to?",
                    time.format("%-I:%M %p")
                ))
            }
            ParsedTime::Unclear => {
                let hint = if self.clarification_attempts >= 1 {
                    "When would you like the appointment? For example, 'next Monday at 2 PM'."
                } else {
                    "Sorry, when exactly would you like the appointment?"
                };
                self.clarify(ctx, hint)
            }
        }
    }

    fn clarify(&mut self, ctx: &TurnContext, prompt: &str) -> FlowReply {
        self.clarification_attempts += 1;
        if self.clarification_attempts >= MAX_CLARIFICATIONS {
            return self.give_up(ctx);
        }
        FlowReply::say(prompt)
    }

    fn give_up(&mut self, ctx: &TurnContext) -> FlowReply {
        self.done = true;
        self.call_end = true;
        ctx.transition(WORKFLOW, "done");
        FlowReply::say(
            "I'm sorry, I'm having trouble understanding. Our team will call you \
             back to sort this out. Goodbye!",
        )
    }

    /// Confirmation turn; a yes applies the calendar write.
    async fn confirm(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match classify_yes_no(ctx.llm.as_ref(), utterance).await {
            YesNo::Yes => self.apply_update(ctx).await,
            YesNo::No => {
                self.candidate = None;
                self.state = State::AwaitingNewTime;
                ctx.transition(WORKFLOW, "awaiting_new_time");
                FlowReply::say("Okay, no problem. When would work better?")
            }
            YesNo::Unclear => self.clarify(
                ctx,
                "Sorry, was that a yes? I just need a quick confirmation before I move it.",
            ),
        }
    }

    async fn apply_update(&mut self, ctx: &TurnContext) -> FlowReply {
        ctx.transition(WORKFLOW, "applying_update");
        ctx.filler.play(FillerCategory::CalendarUpdate).await;

        let selected = self.selected.clone().expect("confirmed without selection");
        let candidate = self.candidate.expect("confirmed without candidate");
        let tz = selected.start.time_zone.clone();
        let new_end = candidate + (selected.end.date_time - selected.start.date_time);

        let change = AppointmentChange {
            start: ZonedTime { date_time: candidate, time_zone: tz.clone() },
            end: ZonedTime { date_time: new_end, time_zone: tz.clone() },
            status: None,
        };

        match ctx.calendar.update_appointment(&selected.id, &change).await {
            Ok(()) => {
                ctx.audit.emit_payload(
                    &ctx.session_id,
                    AuditKind::CalendarUpdate,
                    json!({
                        "appointment_id": selected.id,
                        "summary": selected.summary,
                        "before": { "start": selected.start.date_time, "end": selected.end.date_time },
                        "after": { "start": candidate, "end": new_end },
                    }),
                );
                self.state = State::PostUpdate;
                ctx.transition(WORKFLOW, "post_update");
                FlowReply::say(format!(
                    "Done! Your {} is now on {}. Do you need help with anything else?",
                    selected.summary,
                    timeparse::format_in_zone(candidate, &tz)
                ))
            }
            Err(err) => {
                warn!(error = %err, "calendar update failed");
                self.done = true;
                self.call_end = true;
                ctx.transition(WORKFLOW, "done");
                FlowReply::say(
                    "I'm sorry, I couldn't update the appointment just now. \
                     Our team will call you back to fix it. Goodbye!",
                )
            }
        }
    }

    async fn post_update(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match classify_yes_no(ctx.llm.as_ref(), utterance).await {
            YesNo::Yes => {
                self.done = true;
                ctx.transition(WORKFLOW, "done");
                FlowReply::say("Of course — what else can I help you with?")
            }
            YesNo::No => {
                self.done = true;
                self.call_end = true;
                ctx.transition(WORKFLOW, "done");
                FlowReply::say("Perfect. Have a great day, goodbye!")
            }
            YesNo::Unclear => {
                self.post_update_attempts += 1;
                if self.post_update_attempts >= 2 {
                    self.done = true;
                    self.call_end = true;
                    ctx.transition(WORKFLOW, "done");
                    FlowReply::say("Alright, I'll let you go. Have a great day!")
                } else {
                    FlowReply::say("Is there anything else I can help you with?")
                }
            }
        }
    }
}
