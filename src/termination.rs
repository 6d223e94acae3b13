//! Termination controller: deterministic call teardown
//!
//! Once a workflow declares the call over, termination is scheduled, not
//! improvised: wait for the outbound queue to drain, close the bridge,
//! audit the ending, drop the session, and — for outbound verification
//! legs that reached a definite outcome — text the teammate one second
//! later.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

use crate::audit::{AuditKind, AuditLog};
use crate::events::{EventBus, SessionEvent};
use crate::session::SessionStore;
use crate::sms::SmsSender;
use crate::workflow::WorkflowInstance;

/// Delay between session teardown and the outcome SMS.
const SMS_OFFSET: Duration = Duration::from_secs(1);

/// Everything teardown needs; cheap to clone per session.
#[derive(Clone)]
pub struct TerminationDeps {
    pub store: Arc<SessionStore>,
    pub audit: AuditLog,
    pub events: EventBus,
    pub sms: Arc<dyn SmsSender>,
}

/// Schedule a graceful end for `stream_id`.
///
/// Marks the session immediately so no further classification turns run,
/// then tears down after `grace`.
pub fn schedule_termination(
    deps: TerminationDeps,
    stream_id: String,
    reason: String,
    grace: Duration,
) -> tokio::task::JoinHandle<()> {
    // Refuse new turns from this moment on.
    deps.store.with(&stream_id, |session| session.end_requested = true);
    info!(stream_id = %stream_id, reason = %reason, grace_ms = grace.as_millis() as u64, "termination scheduled");

    tokio::spawn(async move {
        tokio::time::sleep(grace).await;

        let snapshot = deps.store.with(&stream_id, |session| {
            let sms_outcome = match &session.workflow {
                Some(WorkflowInstance::Verify(flow)) => {
                    flow.sms_summary().map(|body| (flow.parent_phone.clone(), body))
                }
                _ => None,
            };
            (session.media.clone(), sms_outcome)
        });

        let Some((media, sms_outcome)) = snapshot else {
            // Already gone (provider hangup raced us); nothing to tear down.
            return;
        };

        if let Some(bridge) = media {
            bridge.close(&reason).await;
        }

        deps.audit.emit_payload(
            &stream_id,
            AuditKind::WorkflowTransition,
            json!({ "state": "ended", "reason": reason }),
        );
        deps.store.remove(&stream_id);
        deps.events.publish(SessionEvent::CallEnded {
            stream_id: stream_id.clone(),
            reason: reason.clone(),
        });

        if let Some((parent_phone, body)) = sms_outcome {
            tokio::time::sleep(SMS_OFFSET).await;
            if let Err(err) = deps.sms.send(&parent_phone, &body).await {
                warn!(error = %err, "outcome sms failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CollabResult;
    use crate::session::Session;
    use crate::types::{Appointment, Language, Peer, PeerRole, ZonedTime};
    use crate::workflow::verify::{VerifyFlow, VerifyOutcome};
    use crate::workflow::OutboundRequest;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FakeSms {
        sent: Mutex<Vec<(String, String)>>,
    }

    impl FakeSms {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(vec![]) })
        }
    }

    #[async_trait]
    impl SmsSender for FakeSms {
        async fn send(&self, to: &str, body: &str) -> CollabResult<()> {
            self.sent.lock().unwrap().push((to.to_string(), body.to_string()));
            Ok(())
        }
    }

    fn deps(sms: Arc<FakeSms>) -> TerminationDeps {
        TerminationDeps {
            store: SessionStore::new(),
            audit: AuditLog::disabled(),
            events: EventBus::default(),
            sms,
        }
    }

    fn verified_child_session(outcome: VerifyOutcome) -> Session {
        let request = OutboundRequest {
            customer_phone: "+4915112345678".into(),
            customer_name: "James".into(),
            customer_language: Language::English,
            appointment: Appointment {
                id: "B1".into(),
                summary: "Kitchen installation".into(),
                start: ZonedTime {
                    date_time: "2025-10-14T12:00:00Z".parse().unwrap(),
                    time_zone: "Europe/Berlin".into(),
                },
                end: ZonedTime {
                    date_time: "2025-10-14T13:00:00Z".parse().unwrap(),
                    time_zone: "Europe/Berlin".into(),
                },
                status: "confirmed".into(),
            },
            delay_minutes: Some(30),
            alternative_time: Some("18:00".into()),
            proposed_start: ZonedTime {
                date_time: "2025-10-14T16:00:00Z".parse().unwrap(),
                time_zone: "Europe/Berlin".into(),
            },
            parent_stream_id: "MZparent".into(),
            parent_phone: "+4915199988877".into(),
        };
        let mut flow = VerifyFlow::from_request(&request);
        flow.outcome = Some(outcome);
        Session::outbound(
            "OBchild",
            Peer {
                phone_number: "+4915112345678".into(),
                name: Some("James".into()),
                role: PeerRole::Customer,
                email: None,
                language: Language::English,
            },
            WorkflowInstance::Verify(flow),
            "MZparent",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_gone_within_grace_window() {
        let sms = FakeSms::new();
        let deps = deps(sms);
        deps.store
            .insert(Session::inbound("MZ1", "CA1", Peer::unknown("+19998887777")))
            .unwrap();

        schedule_termination(deps.clone(), "MZ1".into(), "workflow_complete".into(), Duration::from_secs(3));

        // Immediately marked; no new turns.
        assert_eq!(deps.store.with("MZ1", |s| s.end_requested), Some(true));
        assert!(deps.store.contains("MZ1"));

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!deps.store.contains("MZ1"));
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_child_texts_parent_after_offset() {
        let sms = FakeSms::new();
        let deps = deps(sms.clone());
        deps.store.insert(verified_child_session(VerifyOutcome::Confirmed)).unwrap();

        schedule_termination(deps.clone(), "OBchild".into(), "workflow_complete".into(), Duration::from_secs(3));

        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::task::yield_now().await;
        assert!(!deps.store.contains("OBchild"));
        // SMS rides one second behind teardown.
        assert!(sms.sent.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        let sent = sms.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "+4915199988877");
        assert!(sent[0].1.contains("James confirmed"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_followup_child_sends_no_sms() {
        let sms = FakeSms::new();
        let deps = deps(sms.clone());
        deps.store
            .insert(verified_child_session(VerifyOutcome::PendingManualFollowup))
            .unwrap();

        schedule_termination(deps.clone(), "OBchild".into(), "workflow_complete".into(), Duration::from_secs(3));
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;

        assert!(!deps.store.contains("OBchild"));
        assert!(sms.sent.lock().unwrap().is_empty());
    }
}
