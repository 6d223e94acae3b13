//! Audit trail: append-only records emitted by the core
//!
//! Many writers, one draining writer. Sessions push records onto an
//! unbounded channel; a single drain task posts them to the audit store.
//! The core never reads records back. With no `AUDIT_DB_URI` configured the
//! drain task just logs, which keeps development honest about what would
//! have been persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Intent,
    WorkflowTransition,
    CalendarUpdate,
    OutboundCall,
    CustomerResponse,
}

/// One append-only audit document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub session_id: String,
    pub kind: AuditKind,
    pub timestamp_utc: DateTime<Utc>,
    pub payload: Value,
}

impl AuditRecord {
    pub fn new(session_id: impl Into<String>, kind: AuditKind, payload: Value) -> Self {
        Self {
            session_id: session_id.into(),
            kind,
            timestamp_utc: Utc::now(),
            payload,
        }
    }
}

/// Cloneable writer handle. Emission never blocks and never fails the turn.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::UnboundedSender<AuditRecord>,
}

impl AuditLog {
    /// Create the log and spawn its drain task.
    pub fn start(db_uri: String, http: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx, db_uri, http));
        Self { tx }
    }

    /// A log whose records go nowhere; useful in tests that do not assert on audit.
    pub fn disabled() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        Self { tx }
    }

    /// A log captured into a channel, for tests that assert on audit output.
    pub fn capture() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, record: AuditRecord) {
        if self.tx.send(record).is_err() {
            warn!("audit drain task gone, record dropped");
        }
    }

    pub fn emit_payload(&self, session_id: &str, kind: AuditKind, payload: Value) {
        self.emit(AuditRecord::new(session_id, kind, payload));
    }
}

async fn drain(mut rx: mpsc::UnboundedReceiver<AuditRecord>, db_uri: String, http: reqwest::Client) {
    while let Some(record) = rx.recv().await {
        if db_uri.is_empty() {
            debug!(
                session_id = %record.session_id,
                kind = ?record.kind,
                payload = %record.payload,
                "audit (not persisted)"
            );
            continue;
        }
        let result = http
            .post(&db_uri)
            .json(&record)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        if let Err(err) = result {
            // One-way append: the record is lost, the call is not.
            warn!(error = %err, kind = ?record.kind, "audit append failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_receives_emitted_records() {
        let (log, mut rx) = AuditLog::capture();
        log.emit_payload("s1", AuditKind::Intent, serde_json::json!({"intent": "no_intent_detected"}));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.session_id, "s1");
        assert_eq!(record.kind, AuditKind::Intent);
        assert_eq!(record.payload["intent"], "no_intent_detected");
    }

    #[test]
    fn record_serializes_with_snake_case_kind() {
        let record = AuditRecord::new("s1", AuditKind::CalendarUpdate, serde_json::json!({}));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "calendar_update");
    }
}
