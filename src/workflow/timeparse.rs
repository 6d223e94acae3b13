//! Natural-language datetime parsing for reschedule requests
//!
//! The LLM does the language understanding ("next Monday at 2 PM"), this
//! module does everything that must not be left to a language model:
//! timezone conversion, partial-input detection, the sanity window, and
//! presentation formatting. The model's contract is one line of output in
//! a fixed shape; anything else is `Unclear`.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::llm::{ChatMessage, ChatModel, ChatRequest};

/// Outcome of parsing one utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedTime {
    /// Full datetime, already in UTC.
    Resolved(DateTime<Utc>),
    /// Caller gave a time but no date.
    MissingDate { time: NaiveTime },
    /// Caller gave a date but no time.
    MissingTime { date: NaiveDate },
    Unclear,
}

/// Window check for a candidate appointment time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeValidation {
    Ok,
    /// More than a year out; almost certainly a parsing accident.
    TooFarAhead,
    /// Before an hour ago; callers don't reschedule into the past.
    InPast,
}

pub fn validate(candidate: DateTime<Utc>, now: DateTime<Utc>) -> TimeValidation {
    if candidate > now + Duration::days(365) {
        TimeValidation::TooFarAhead
    } else if candidate < now - Duration::hours(1) {
        TimeValidation::InPast
    } else {
        TimeValidation::Ok
    }
}

/// Words that suggest an utterance carries a date or time; lets the
/// selection turn run time parsing eagerly.
static TIME_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2}(:\d{2})?\s*(am|pm|uhr|baje)|monday|tuesday|wednesday|thursday|friday|saturday|sunday|tomorrow|today|next week|morning|afternoon|evening|noon|montag|dienstag|mittwoch|donnerstag|freitag|samstag|sonntag|morgen|kal|parso|subah|shaam|o'?clock)\b",
    )
    .unwrap()
});

pub fn has_time_keywords(text: &str) -> bool {
    TIME_WORDS.is_match(text)
}

fn zone(tz_name: &str) -> Tz {
    tz_name.parse().unwrap_or(chrono_tz::UTC)
}

/// Convert a local wall-clock datetime in `tz_name` to UTC.
pub fn local_to_utc(date: NaiveDate, time: NaiveTime, tz_name: &str) -> Option<DateTime<Utc>> {
    let tz = zone(tz_name);
    tz.from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Render a UTC instant as caller-facing local wording.
pub fn format_in_zone(instant: DateTime<Utc>, tz_name: &str) -> String {
    let local = instant.with_timezone(&zone(tz_name));
    format!("{}", local.format("%A, %B %-d at %-I:%M %p"))
}

const MODEL_CONTRACT: &str = "You extract the appointment date and time a caller is asking for. \
Consider the whole conversation. Reply with exactly one line, nothing else:\n\
- full date and time, converted to UTC: 2025-10-13T13:00Z\n\
- date but no time:   date-only: 2025-10-06\n\
- time but no date:   time-only: 14:00\n\
- neither:            unclear";

/// Parse one model reply into a `ParsedTime`.
///
/// Resolved datetimes are UTC by contract; a reply without an offset is
/// still read as UTC rather than discarded.
fn interpret(reply: &str) -> ParsedTime {
    let line = reply.trim().trim_matches('"');
    let lower = line.to_lowercase();

    if lower.contains("unclear") || line.is_empty() {
        return ParsedTime::Unclear;
    }
    if let Some(rest) = lower.strip_prefix("date-only:") {
        return match NaiveDate::parse_from_str(rest.trim(), "%Y-%m-%d") {
            Ok(date) => ParsedTime::MissingTime { date },
            Err(_) => ParsedTime::Unclear,
        };
    }
    if let Some(rest) = lower.strip_prefix("time-only:") {
        return match NaiveTime::parse_from_str(rest.trim(), "%H:%M") {
            Ok(time) => ParsedTime::MissingDate { time },
            Err(_) => ParsedTime::Unclear,
        };
    }
    if let Ok(absolute) = DateTime::parse_from_rfc3339(line) {
        return ParsedTime::Resolved(absolute.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%SZ", "%Y-%m-%dT%H:%MZ", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(line, format) {
            return ParsedTime::Resolved(Utc.from_utc_datetime(&naive));
        }
    }
    ParsedTime::Unclear
}

/// Ask the model to resolve the requested time out of the conversation.
///
/// `history` is the append-only conversation so far; multi-turn parsing
/// ("October 6" … "2 PM") works because every turn is in the input, not
/// because the parser remembers anything. The wall-clock anchor for words
/// like "tomorrow" is the caller's zone.
pub async fn parse_datetime(
    llm: &dyn ChatModel,
    utterance: &str,
    history: &[ChatMessage],
    now: DateTime<Utc>,
    tz_name: &str,
) -> ParsedTime {
    let local_now = now.with_timezone(&zone(tz_name));
    let mut messages = vec![ChatMessage::system(format!(
        "{MODEL_CONTRACT}\nCurrent local time for the caller: {} ({tz_name}).",
        local_now.format("%Y-%m-%dT%H:%M, %A")
    ))];
    messages.extend_from_slice(history);
    messages.push(ChatMessage::user(utterance));

    match llm.chat(ChatRequest::deterministic(messages, 30)).await {
        Ok(outcome) => interpret(&outcome.text),
        Err(_) => ParsedTime::Unclear,
    }
}
