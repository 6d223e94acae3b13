//! Outbound dispatcher: spinning up the verification leg
//!
//! Creates the child session *before* the provider dials, so that when the
//! callee answers and the media stream opens, the webhook's stream id
//! already resolves to a session pre-populated with its verification
//! workflow. A 30-second collector reaps children whose media never
//! arrives (nobody picked up) and tells the teammate by SMS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditKind, AuditLog};
use crate::error::DispatchError;
use crate::session::{Session, SessionStore};
use crate::sms::SmsSender;
use crate::telephony::CallPlacer;
use crate::types::{is_e164, Peer, PeerRole};
use crate::workflow::verify::VerifyFlow;
use crate::workflow::{OutboundRequest, WorkflowInstance};

/// How long a child session may wait for its media stream.
pub const MEDIA_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a successful dispatch.
#[derive(Debug, Clone)]
pub struct OutboundTicket {
    pub child_stream_id: String,
    pub call_id: String,
}

/// Seam the delay workflow's deferred action goes through.
#[async_trait]
pub trait OutboundPort: Send + Sync {
    async fn dispatch(&self, request: OutboundRequest) -> Result<OutboundTicket, DispatchError>;
}

pub struct OutboundDispatcher {
    store: Arc<SessionStore>,
    placer: Arc<dyn CallPlacer>,
    sms: Arc<dyn SmsSender>,
    audit: AuditLog,
    /// Public base for the child-call webhook.
    base_url: String,
    media_open_timeout: Duration,
}

impl OutboundDispatcher {
    pub fn new(
        store: Arc<SessionStore>,
        placer: Arc<dyn CallPlacer>,
        sms: Arc<dyn SmsSender>,
        audit: AuditLog,
        base_url: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            placer,
            sms,
            audit,
            base_url,
            media_open_timeout: MEDIA_OPEN_TIMEOUT,
        })
    }

    #[cfg(test)]
    pub fn with_media_timeout(
        store: Arc<SessionStore>,
        placer: Arc<dyn CallPlacer>,
        sms: Arc<dyn SmsSender>,
        audit: AuditLog,
        base_url: String,
        media_open_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self { store, placer, sms, audit, base_url, media_open_timeout })
    }

    /// Reap the child if its media stream never opened.
    fn spawn_media_collector(&self, child_stream_id: String, request: OutboundRequest) {
        let store = Arc::clone(&self.store);
        let audit = self.audit.clone();
        let sms = Arc::clone(&self.sms);
        let timeout = self.media_open_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let unanswered = store
                .with(&child_stream_id, |session| session.media.is_none())
                .unwrap_or(false);
            if !unanswered {
                return;
            }
            warn!(child_stream_id = %child_stream_id, "outbound call never got media, collecting");
            store.remove(&child_stream_id);
            audit.emit_payload(
                &child_stream_id,
                AuditKind::CustomerResponse,
                json!({
                    "status": "pending_manual_followup",
                    "reason": "no_media",
                    "customer": request.customer_name,
                }),
            );
            let body = format!(
                "I couldn't reach {} about the delay. Please follow up directly.",
                request.customer_name
            );
            if let Err(err) = sms.send(&request.parent_phone, &body).await {
                warn!(error = %err, "no-answer sms failed");
            }
        });
    }
}

#[async_trait]
impl OutboundPort for OutboundDispatcher {
    async fn dispatch(&self, request: OutboundRequest) -> Result<OutboundTicket, DispatchError> {
        if !is_e164(&request.customer_phone) {
            return Err(DispatchError::InvalidNumber(request.customer_phone.clone()));
        }

        let child_stream_id = format!("OB{}", Uuid::new_v4().simple());
        let peer = Peer {
            phone_number: request.customer_phone.clone(),
            name: Some(request.customer_name.clone()),
            role: PeerRole::Customer,
            email: None,
            language: request.customer_language,
        };
        let flow = VerifyFlow::from_request(&request);
        let session = Session::outbound(
            child_stream_id.clone(),
            peer,
            WorkflowInstance::Verify(flow),
            request.parent_stream_id.clone(),
        );
        if let Err(reason) = self.store.insert(session) {
            return Err(DispatchError::DispatchFailed(reason));
        }

        let webhook_url = format!("{}/voice/outbound?stream_id={}", self.base_url, child_stream_id);
        let call_id = match self.placer.place_call(&request.customer_phone, &webhook_url).await {
            Ok(call_id) => call_id,
            Err(err) => {
                self.store.remove(&child_stream_id);
                self.audit.emit_payload(
                    &request.parent_stream_id,
                    AuditKind::OutboundCall,
                    json!({
                        "success": false,
                        "customer": request.customer_name,
                        "error": err.to_string(),
                    }),
                );
                return Err(DispatchError::DispatchFailed(err.to_string()));
            }
        };

        self.store.with(&child_stream_id, |session| {
            session.call_id = call_id.clone();
        });
        self.store.link_child(&request.parent_stream_id, &child_stream_id);
        self.audit.emit_payload(
            &request.parent_stream_id,
            AuditKind::OutboundCall,
            json!({
                "success": true,
                "child_stream_id": child_stream_id,
                "call_sid": call_id,
                "customer": request.customer_name,
            }),
        );
        info!(
            child_stream_id = %child_stream_id,
            parent = %request.parent_stream_id,
            "outbound verification leg dispatched"
        );

        self.spawn_media_collector(child_stream_id.clone(), request);

        Ok(OutboundTicket { child_stream_id, call_id })
    }
}
