//! Calendar collaborator
//!
//! Appointments live in an external calendar service; the agent only lists
//! and updates them. Datetimes returned here are carried verbatim through
//! the workflows — the LLM never gets to re-serialize them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::backoff::{retry_with_deadline, RetryPolicy};
use crate::error::{CollabResult, CollaboratorError};
use crate::types::{Appointment, Peer, ZonedTime};

const CALENDAR_DEADLINE: Duration = Duration::from_secs(15);

/// Fields an update may change.
#[derive(Debug, Clone, Serialize)]
pub struct AppointmentChange {
    pub start: ZonedTime,
    pub end: ZonedTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Calendar seam.
#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn list_appointments(&self, peer: &Peer) -> CollabResult<Vec<Appointment>>;
    async fn update_appointment(&self, id: &str, change: &AppointmentChange) -> CollabResult<()>;
    async fn health_check(&self) -> CollabResult<()>;
}

/// HTTP adapter against the calendar service.
pub struct HttpCalendar {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCalendar {
    pub fn new(base_url: String, http: reqwest::Client) -> Self {
        Self { http, base_url }
    }
}

#[async_trait]
impl CalendarApi for HttpCalendar {
    async fn list_appointments(&self, peer: &Peer) -> CollabResult<Vec<Appointment>> {
        let url = format!("{}/appointments", self.base_url);
        let phone = peer.phone_number.clone();
        let appointments: Vec<Appointment> = retry_with_deadline(
            "calendar",
            RetryPolicy::default(),
            CALENDAR_DEADLINE,
            || async {
                let resp = self
                    .http
                    .get(&url)
                    .query(&[("phone", phone.as_str())])
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?;
                resp.json()
                    .await
                    .map_err(|err| CollaboratorError::invalid("calendar", err.to_string()))
            },
        )
        .await?;
        debug!(phone = %peer.phone_number, count = appointments.len(), "appointments listed");
        Ok(appointments)
    }

    async fn update_appointment(&self, id: &str, change: &AppointmentChange) -> CollabResult<()> {
        let url = format!("{}/appointments/{}", self.base_url, id);
        retry_with_deadline(
            "calendar",
            RetryPolicy::default(),
            CALENDAR_DEADLINE,
            || async {
                self.http
                    .patch(&url)
                    .json(change)
                    .send()
                    .await
                    .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?
                    .error_for_status()
                    .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?;
                Ok(())
            },
        )
        .await
    }

    async fn health_check(&self) -> CollabResult<()> {
        let url = format!("{}/health", self.base_url);
        self.http
            .get(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?
            .error_for_status()
            .map_err(|err| CollaboratorError::unavailable("calendar", err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_serializes_calendar_shape() {
        let change = AppointmentChange {
            start: ZonedTime {
                date_time: "2025-10-13T13:00:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            end: ZonedTime {
                date_time: "2025-10-13T13:30:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            status: None,
        };
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["start"]["timeZone"], "Europe/Berlin");
        assert!(json.get("status").is_none());
    }
}
