//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

/// Who the peer on the line is, as far as the phonebook knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Teammate,
    Customer,
    Unknown,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerRole::Teammate => write!(f, "teammate"),
            PeerRole::Customer => write!(f, "customer"),
            PeerRole::Unknown => write!(f, "unknown"),
        }
    }
}

/// Languages the agent speaks and recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    English,
    German,
    Hindi,
    /// Hindi with English code-switching, common on Indian calls.
    HindiMixed,
}

impl Default for Language {
    fn default() -> Self {
        Language::English
    }
}

impl Language {
    /// Short tag used in clip paths and STT language hints.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::German => "de",
            Language::Hindi => "hi",
            Language::HindiMixed => "hi-mixed",
        }
    }

    /// Map an STT-reported language code onto our closed set.
    pub fn from_stt_code(code: &str) -> Option<Self> {
        let lower = code.to_ascii_lowercase();
        match lower.split(&['-', '_'][..]).next().unwrap_or("") {
            "en" => Some(Language::English),
            "de" => Some(Language::German),
            "hi" => Some(Language::Hindi),
            _ => None,
        }
    }
}

/// The person on the other end of a media stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// E.164 phone number, e.g. "+4917260734880".
    pub phone_number: String,
    pub name: Option<String>,
    pub role: PeerRole,
    pub email: Option<String>,
    pub language: Language,
}

impl Peer {
    /// Peer for a number the phonebook does not know.
    pub fn unknown(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            name: None,
            role: PeerRole::Unknown,
            email: None,
            language: Language::default(),
        }
    }
}

/// Role of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// What produced a turn; used by observability and duplicate suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Utterance,
    Greeting,
    Filler,
    WorkflowReply,
    SmallTalk,
    Farewell,
}

/// One entry in a session's ordered conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TurnKind,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
            kind: TurnKind::Utterance,
        }
    }

    pub fn assistant(content: impl Into<String>, kind: TurnKind) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
            kind,
        }
    }
}

/// A point in time carrying its calendar zone, as the calendar stores it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonedTime {
    #[serde(rename = "dateTime")]
    pub date_time: DateTime<Utc>,
    #[serde(rename = "timeZone")]
    pub time_zone: String,
}

/// An appointment as returned by the calendar collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Appointment {
    pub id: String,
    pub summary: String,
    pub start: ZonedTime,
    pub end: ZonedTime,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "confirmed".to_string()
}

impl Appointment {
    /// Duration of the slot; used to keep the length when moving it.
    pub fn duration(&self) -> chrono::Duration {
        self.end.date_time - self.start.date_time
    }
}

/// Validate an E.164 phone number ("+" followed by 7..=15 digits, no leading zero).
pub fn is_e164(number: &str) -> bool {
    static E164: once_cell::sync::Lazy<regex::Regex> =
        once_cell::sync::Lazy::new(|| regex::Regex::new(r"^\+[1-9]\d{6,14}$").unwrap());
    E164.is_match(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn e164_accepts_real_numbers() {
        assert!(is_e164("+4917260734880"));
        assert!(is_e164("+12025550143"));
        assert!(is_e164("+919876543210"));
    }

    #[test]
    fn e164_rejects_garbage() {
        assert!(!is_e164("4917260734880"));
        assert!(!is_e164("+0123456789"));
        assert!(!is_e164("+49 172 60734880"));
        assert!(!is_e164("+49"));
        assert!(!is_e164(""));
    }

    #[test]
    fn language_from_stt_code() {
        assert_eq!(Language::from_stt_code("en-US"), Some(Language::English));
        assert_eq!(Language::from_stt_code("de"), Some(Language::German));
        assert_eq!(Language::from_stt_code("hi_IN"), Some(Language::Hindi));
        assert_eq!(Language::from_stt_code("fr"), None);
    }

    #[test]
    fn appointment_duration_preserved() {
        let appt = Appointment {
            id: "A1".into(),
            summary: "Eye checkup".into(),
            start: ZonedTime {
                date_time: "2025-10-12T09:00:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            end: ZonedTime {
                date_time: "2025-10-12T09:30:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            status: "confirmed".into(),
        };
        assert_eq!(appt.duration(), chrono::Duration::minutes(30));
    }
}
