//! Session store: the registry of live calls
//!
//! One `Session` per media stream id, owned exclusively by the store.
//! Tasks identify themselves by stream id and look their session up under a
//! short mutex; the lock is never held across an await. Parent/child
//! linkage between an inbound teammate call and its spawned outbound
//! verification call also lives here — there is no other channel between
//! sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use crate::media::MediaBridge;
use crate::types::{Appointment, CallDirection, Peer, PeerRole, Turn};
use crate::workflow::WorkflowInstance;

/// Result of a background calendar preload.
pub type PreloadResult = Result<Vec<Appointment>, String>;

/// Where a session's preloaded calendar stands.
#[derive(Clone)]
pub enum Preload {
    /// Never started (unknown callers, outbound legs).
    None,
    /// Fetch in flight; the watch resolves exactly once.
    Pending(watch::Receiver<Option<PreloadResult>>),
}

impl Preload {
    /// Start a preload slot; the caller hands the sender to the fetch task.
    pub fn pending() -> (watch::Sender<Option<PreloadResult>>, Preload) {
        let (tx, rx) = watch::channel(None);
        (tx, Preload::Pending(rx))
    }

    /// Await the preload outcome. `None` if no preload was started.
    pub async fn wait(&self) -> Option<PreloadResult> {
        match self {
            Preload::None => None,
            Preload::Pending(rx) => {
                let mut rx = rx.clone();
                // The sender may already have resolved, or may be gone.
                let outcome = rx.wait_for(|value| value.is_some()).await.map(|v| v.clone());
                match outcome {
                    Ok(value) => value,
                    Err(_) => rx.borrow().clone(),
                }
            }
        }
    }
}

/// One live call.
pub struct Session {
    pub stream_id: String,
    pub call_id: String,
    pub direction: CallDirection,
    pub peer: Peer,
    pub conversation: Vec<Turn>,
    /// Last assistant text actually sent to synthesis; duplicate suppression
    /// compares against this.
    pub last_assistant: Option<String>,
    pub turn_count: u32,
    pub workflow: Option<WorkflowInstance>,
    pub preload: Preload,
    /// One filler per turn; reset when a new utterance arrives.
    pub filler_sent: bool,
    pub parent_stream_id: Option<String>,
    pub child_stream_id: Option<String>,
    pub end_requested: bool,
    pub media: Option<Arc<MediaBridge>>,
}

impl Session {
    pub fn inbound(stream_id: impl Into<String>, call_id: impl Into<String>, peer: Peer) -> Self {
        Self {
            stream_id: stream_id.into(),
            call_id: call_id.into(),
            direction: CallDirection::Inbound,
            peer,
            conversation: Vec::new(),
            last_assistant: None,
            turn_count: 0,
            workflow: None,
            preload: Preload::None,
            filler_sent: false,
            parent_stream_id: None,
            child_stream_id: None,
            end_requested: false,
            media: None,
        }
    }

    /// Outbound child leg, pre-populated with its verification workflow.
    pub fn outbound(
        stream_id: impl Into<String>,
        peer: Peer,
        workflow: WorkflowInstance,
        parent_stream_id: impl Into<String>,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            call_id: String::new(),
            direction: CallDirection::Outbound,
            peer,
            conversation: Vec::new(),
            last_assistant: None,
            turn_count: 0,
            workflow: Some(workflow),
            preload: Preload::None,
            filler_sent: false,
            parent_stream_id: Some(parent_stream_id.into()),
            child_stream_id: None,
            end_requested: false,
            media: None,
        }
    }

    /// Calendar preload is only for known inbound callers.
    pub fn wants_preload(&self) -> bool {
        self.direction == CallDirection::Inbound && self.peer.role != PeerRole::Unknown
    }
}

/// Process-wide session registry.
#[derive(Default)]
pub struct SessionStore {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a session. Refuses a second session on the same stream id.
    pub fn insert(&self, session: Session) -> Result<(), String> {
        let mut inner = self.inner.lock().expect("session store poisoned");
        if inner.contains_key(&session.stream_id) {
            return Err(format!("stream {} already has a live session", session.stream_id));
        }
        inner.insert(session.stream_id.clone(), session);
        Ok(())
    }

    pub fn remove(&self, stream_id: &str) -> Option<Session> {
        self.inner.lock().expect("session store poisoned").remove(stream_id)
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.inner.lock().expect("session store poisoned").contains_key(stream_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the session, under the lock. Keep `f` synchronous
    /// and small; collaborator calls never happen in here.
    pub fn with<R>(&self, stream_id: &str, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut inner = self.inner.lock().expect("session store poisoned");
        inner.get_mut(stream_id).map(f)
    }

    /// Record parent → child linkage after a successful dispatch.
    pub fn link_child(&self, parent_stream_id: &str, child_stream_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("session store poisoned");
        match inner.get_mut(parent_stream_id) {
            Some(parent) => {
                parent.child_stream_id = Some(child_stream_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Snapshot of the peer, for tasks that outlive their session lookup.
    pub fn peer(&self, stream_id: &str) -> Option<Peer> {
        self.with(stream_id, |session| session.peer.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Language;

    fn anna() -> Peer {
        Peer {
            phone_number: "+4917260734880".into(),
            name: Some("Anna".into()),
            role: PeerRole::Customer,
            email: None,
            language: Language::German,
        }
    }

    #[test]
    fn one_session_per_stream_id() {
        let store = SessionStore::new();
        store.insert(Session::inbound("MZ1", "CA1", anna())).unwrap();
        let duplicate = Session::inbound("MZ1", "CA2", anna());
        assert!(store.insert(duplicate).is_err());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn link_child_sets_only_parent_side() {
        let store = SessionStore::new();
        store.insert(Session::inbound("MZ1", "CA1", anna())).unwrap();
        assert!(store.link_child("MZ1", "OB1"));
        assert_eq!(
            store.with("MZ1", |s| s.child_stream_id.clone()).unwrap(),
            Some("OB1".to_string())
        );
        assert!(!store.link_child("MZgone", "OB1"));
    }

    #[test]
    fn unknown_callers_never_want_preload() {
        let session = Session::inbound("MZ1", "CA1", Peer::unknown("+19998887777"));
        assert!(!session.wants_preload());
        let known = Session::inbound("MZ2", "CA2", anna());
        assert!(known.wants_preload());
    }

    #[tokio::test]
    async fn preload_wait_resolves_when_fetch_lands() {
        let (tx, preload) = Preload::pending();
        let waiter = tokio::spawn(async move { preload.wait().await });
        tx.send(Some(Ok(vec![]))).unwrap();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Some(Ok(ref v)) if v.is_empty()));
    }

    #[tokio::test]
    async fn preload_none_waits_nothing() {
        assert!(Preload::None.wait().await.is_none());
    }

    #[tokio::test]
    async fn preload_wait_survives_dropped_sender() {
        let (tx, preload) = Preload::pending();
        tx.send(Some(Err("calendar down".into()))).unwrap();
        drop(tx);
        let result = preload.wait().await;
        assert!(matches!(result, Some(Err(ref msg)) if msg == "calendar down"));
    }
}
