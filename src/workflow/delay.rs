//! Teammate delay workflow
//!
//! Gathering → Confirming → dispatching the outbound leg. Gathering runs
//! the tool-calling loop: the model extracts `{delay_minutes,
//! customer_name, alternative_time}` and must look the appointment up
//! before it is allowed to wrap up. The appointment's datetimes are
//! captured verbatim from the calendar; the confirmation sentence is
//! assembled here, not by the model.

use chrono::NaiveTime;
use serde_json::json;
use tracing::warn;

use crate::filler::FillerCategory;
use crate::llm::{run_tool_loop, ChatMessage, ToolDefinition, ToolExecutor, ToolLoopConfig, ToolOutcome};
use crate::types::{Appointment, Peer, ZonedTime};
use crate::workflow::timeparse::{format_in_zone, local_to_utc};
use crate::workflow::{classify_yes_no, FlowAction, FlowReply, OutboundRequest, TurnContext, YesNo};

const WORKFLOW: &str = "teammate_delay";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Gathering,
    Confirming,
}

/// What the tool loop has extracted so far. Carried across turns so the
/// teammate is never asked twice for the same thing.
#[derive(Default)]
struct DelayMemory {
    delay_minutes: Option<u32>,
    customer_name: Option<String>,
    /// 24h local wall-clock, "18:00".
    alternative_time: Option<String>,
    customer: Option<Peer>,
    appointment: Option<Appointment>,
}

pub struct DelayFlow {
    state: State,
    memory: DelayMemory,
    pub done: bool,
    pub call_end: bool,
}

impl Default for DelayFlow {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayFlow {
    pub fn new() -> Self {
        Self {
            state: State::Gathering,
            memory: DelayMemory::default(),
            done: false,
            call_end: false,
        }
    }

    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::Gathering => "gathering",
            State::Confirming => "confirming",
        }
    }

    pub async fn step(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match self.state {
            State::Gathering => self.gather(ctx, utterance).await,
            State::Confirming => self.confirm(ctx, utterance).await,
        }
    }

    fn tools() -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "record_delay_details".into(),
                description: "Record what the teammate said about the delay. Call with any \
                              fields you have; they accumulate across calls."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "delay_minutes": { "type": "integer", "description": "How many minutes late" },
                        "customer_name": { "type": "string", "description": "Affected customer's name" },
                        "alternative_time": { "type": "string", "description": "Alternative start as 24h local time, e.g. 18:00" }
                    }
                }),
            },
            ToolDefinition {
                name: "lookup_appointment".into(),
                description: "Find the customer's current appointment. Requires the customer \
                              name to be recorded first."
                    .into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    async fn gather(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        ctx.transition(WORKFLOW, "gathering");

        let config = ToolLoopConfig {
            system_prompt: "You help a field teammate notify a customer about a delay. \
                            Extract the delay details with record_delay_details, then call \
                            lookup_appointment. When everything is gathered, summarize in one \
                            sentence ending with 'Proceed?'. Never invent appointment times."
                .into(),
            tools: Self::tools(),
            max_iterations: 6,
            max_tokens: 300,
            terminal_phrase: Some("proceed".into()),
            required_tool: Some("lookup_appointment".into()),
            nudge: "You still need to record the details and look up the appointment \
                    before finishing."
                .into(),
        };

        let mut messages = ctx.history.clone();
        messages.push(ChatMessage::user(utterance));

        let mut executor = DelayToolExecutor { memory: &mut self.memory, ctx };
        let loop_result = run_tool_loop(ctx.llm.as_ref(), messages, &config, &mut executor).await;

        match loop_result {
            Ok(result) if result.success && self.ready() => {
                self.state = State::Confirming;
                ctx.transition(WORKFLOW, "confirming");
                FlowReply::say(self.confirmation_sentence())
            }
            Ok(_) => self.ask_for_missing(),
            Err(err) => {
                warn!(error = %err, "delay gathering loop failed");
                self.ask_for_missing()
            }
        }
    }

    fn ready(&self) -> bool {
        self.memory.appointment.is_some()
            && self.memory.customer.is_some()
            && (self.memory.delay_minutes.is_some() || self.memory.alternative_time.is_some())
    }

    /// Deterministic clarification from what memory still lacks.
    fn ask_for_missing(&self) -> FlowReply {
        if self.memory.customer_name.is_none() {
            FlowReply::say("Which customer is this about?")
        } else if self.memory.delay_minutes.is_none() && self.memory.alternative_time.is_none() {
            FlowReply::say("How many minutes late will you be, or what alternative time should I offer?")
        } else if self.memory.appointment.is_none() {
            FlowReply::say(format!(
                "I couldn't find an upcoming appointment for {}. Could you check the name?",
                self.memory.customer_name.as_deref().unwrap_or("them")
            ))
        } else {
            FlowReply::say("Sorry, could you say that again?")
        }
    }

    /// One sentence, datetimes verbatim from the calendar.
    fn confirmation_sentence(&self) -> String {
        let appointment = self.memory.appointment.as_ref().expect("ready() checked");
        let customer = self
            .memory
            .customer_name
            .clone()
            .unwrap_or_else(|| "the customer".into());
        let mut options = Vec::new();
        if let Some(minutes) = self.memory.delay_minutes {
            options.push(format!("wait {minutes} minutes"));
        }
        if let Some(alt) = &self.memory.alternative_time {
            options.push(format!("move to {alt}"));
        }
        format!(
            "Found {} on {}. I'll call {} with: {}. Proceed?",
            appointment.summary,
            format_in_zone(appointment.start.date_time, &appointment.start.time_zone),
            customer,
            options.join(" or ")
        )
    }

    async fn confirm(&mut self, ctx: &TurnContext, utterance: &str) -> FlowReply {
        match classify_yes_no(ctx.llm.as_ref(), utterance).await {
            YesNo::Yes => {
                ctx.transition(WORKFLOW, "dispatching");
                let request = match self.outbound_request(ctx) {
                    Some(request) => request,
                    None => {
                        self.done = true;
                        self.call_end = true;
                        ctx.transition(WORKFLOW, "ending");
                        return FlowReply::say(
                            "I'm sorry, something went wrong preparing the call. \
                             Please reach the customer directly.",
                        );
                    }
                };
                self.done = true;
                self.call_end = true;
                ctx.transition(WORKFLOW, "ending");
                FlowReply::with_action(
                    "Calling them now — I'll text you their choice. Thanks!",
                    FlowAction::ScheduleOutbound(request),
                )
            }
            YesNo::No => {
                self.done = true;
                ctx.transition(WORKFLOW, "ending");
                FlowReply::say("Okay, I won't call them. Anything else?")
            }
            YesNo::Unclear => FlowReply::say("Should I go ahead and call them? Yes or no."),
        }
    }

    /// The proposed new start: the alternative wall-clock time if one was
    /// offered, otherwise the original start pushed by the delay.
    fn outbound_request(&self, ctx: &TurnContext) -> Option<OutboundRequest> {
        let appointment = self.memory.appointment.clone()?;
        let customer = self.memory.customer.clone()?;
        let tz = appointment.start.time_zone.clone();

        let proposed_utc = if let Some(alt) = &self.memory.alternative_time {
            let time = NaiveTime::parse_from_str(alt, "%H:%M").ok()?;
            let local_date = {
                use chrono::TimeZone;
                let zone: chrono_tz::Tz = tz.parse().unwrap_or(chrono_tz::UTC);
                zone.from_utc_datetime(&appointment.start.date_time.naive_utc())
                    .date_naive()
            };
            local_to_utc(local_date, time, &tz)?
        } else {
            appointment.start.date_time
                + chrono::Duration::minutes(i64::from(self.memory.delay_minutes?))
        };

        Some(OutboundRequest {
            customer_phone: customer.phone_number.clone(),
            customer_name: self
                .memory
                .customer_name
                .clone()
                .or(customer.name.clone())
                .unwrap_or_default(),
            customer_language: customer.language,
            appointment,
            delay_minutes: self.memory.delay_minutes,
            alternative_time: self.memory.alternative_time.clone(),
            proposed_start: ZonedTime { date_time: proposed_utc, time_zone: tz },
            parent_stream_id: ctx.session_id.clone(),
            parent_phone: ctx.peer.phone_number.clone(),
        })
    }
}

/// Executes the gathering tools against memory, phonebook and calendar.
struct DelayToolExecutor<'a> {
    memory: &'a mut DelayMemory,
    ctx: &'a TurnContext,
}

#[async_trait::async_trait]
impl ToolExecutor for DelayToolExecutor<'_> {
    async fn execute(&mut self, name: &str, arguments: &serde_json::Value) -> ToolOutcome {
        match name {
            "record_delay_details" => {
                if let Some(minutes) = arguments.get("delay_minutes").and_then(|v| v.as_u64()) {
                    self.memory.delay_minutes = Some(minutes as u32);
                }
                if let Some(name) = arguments.get("customer_name").and_then(|v| v.as_str()) {
                    if !name.trim().is_empty() {
                        self.memory.customer_name = Some(name.trim().to_string());
                    }
                }
                if let Some(alt) = arguments.get("alternative_time").and_then(|v| v.as_str()) {
                    if !alt.trim().is_empty() {
                        self.memory.alternative_time = Some(alt.trim().to_string());
                    }
                }
                let mut still_missing = Vec::new();
                if self.memory.customer_name.is_none() {
                    still_missing.push("customer_name");
                }
                if self.memory.delay_minutes.is_none() && self.memory.alternative_time.is_none() {
                    still_missing.push("delay_minutes or alternative_time");
                }
                ToolOutcome {
                    success: true,
                    content: if still_missing.is_empty() {
                        "recorded; all details present".into()
                    } else {
                        format!("recorded; still missing: {}", still_missing.join(", "))
                    },
                }
            }
            "lookup_appointment" => {
                let Some(customer_name) = self.memory.customer_name.clone() else {
                    return ToolOutcome {
                        success: false,
                        content: "cannot look up yet: customer_name is not recorded".into(),
                    };
                };
                let Some(customer) = self.ctx.phonebook.find_by_name(&customer_name) else {
                    return ToolOutcome {
                        success: false,
                        content: format!("no phonebook entry found for {customer_name}"),
                    };
                };

                self.ctx.filler.play(FillerCategory::DelayLookup).await;
                match self.ctx.calendar.list_appointments(&customer).await {
                    Ok(appointments) => {
                        let upcoming = appointments
                            .iter()
                            .find(|appointment| appointment.start.date_time >= self.ctx.now)
                            .or(appointments.first())
                            .cloned();
                        match upcoming {
                            Some(appointment) => {
                                let content = format!(
                                    "found appointment: {} start={} end={} (use these \
                                     datetimes exactly as given)",
                                    appointment.summary,
                                    appointment.start.date_time.to_rfc3339(),
                                    appointment.end.date_time.to_rfc3339()
                                );
                                self.memory.customer = Some(customer);
                                self.memory.appointment = Some(appointment);
                                ToolOutcome { success: true, content }
                            }
                            None => ToolOutcome {
                                success: false,
                                content: format!("{customer_name} has no appointments on file"),
                            },
                        }
                    }
                    Err(err) => ToolOutcome {
                        success: false,
                        content: format!("calendar lookup failed: {err}"),
                    },
                }
            }
            unknown => ToolOutcome {
                success: false,
                content: format!("unknown tool {unknown}"),
            },
        }
    }
}
