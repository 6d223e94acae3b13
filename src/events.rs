//! Observability event bus
//!
//! Sessions publish lifecycle events onto a broadcast channel; the SSE
//! endpoint fans them out to dashboard clients. Lossy by design: a slow
//! subscriber skips events rather than slowing a call.

use serde::Serialize;
use tokio::sync::broadcast;

/// Event published by the orchestrator and media path.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    CallStarted {
        stream_id: String,
        direction: String,
        peer_number: String,
        peer_role: String,
    },
    PartialTranscript {
        stream_id: String,
        text: String,
    },
    Utterance {
        stream_id: String,
        text: String,
    },
    IntentClassified {
        stream_id: String,
        intent: String,
    },
    WorkflowTransition {
        stream_id: String,
        workflow: String,
        state: String,
    },
    FillerPlayed {
        stream_id: String,
        category: String,
    },
    /// First synthesized byte hit the outbound queue for a turn.
    FirstAudio {
        stream_id: String,
        latency_ms: u64,
    },
    AssistantReply {
        stream_id: String,
        text: String,
    },
    OutboundDispatched {
        stream_id: String,
        child_stream_id: String,
    },
    CallEnded {
        stream_id: String,
        reason: String,
    },
}

/// Cloneable publisher; subscribers come from `subscribe`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is normal when no dashboard is attached.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
