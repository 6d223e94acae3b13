//! Error taxonomy for collaborator adapters and media handling
//!
//! Collaborator errors are wrapped at the adapter boundary; the workflow
//! decides whether to surface, retry, or abandon. Nothing here reaches the
//! orchestrator raw.

use thiserror::Error;

/// Failure of an external collaborator (LLM, STT, TTS, calendar, SMS, telephony).
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// Still failing after the adapter's own retries.
    #[error("{service} unavailable: {reason}")]
    Unavailable { service: &'static str, reason: String },

    /// The per-call deadline elapsed.
    #[error("{service} timed out after {millis}ms")]
    Deadline { service: &'static str, millis: u64 },

    /// The collaborator answered, but with something we cannot use.
    #[error("{service} returned an invalid response: {reason}")]
    InvalidResponse { service: &'static str, reason: String },
}

impl CollaboratorError {
    pub fn unavailable(service: &'static str, reason: impl Into<String>) -> Self {
        Self::Unavailable { service, reason: reason.into() }
    }

    pub fn invalid(service: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidResponse { service, reason: reason.into() }
    }
}

/// Errors on the media path.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The provider negotiated a codec other than µ-law/8kHz.
    #[error("bad codec: expected audio/x-mulaw @ 8000Hz, got {got}")]
    BadCodec { got: String },

    /// The outbound socket is gone; the session is over.
    #[error("media stream closed")]
    StreamClosed,

    /// Ten consecutive malformed provider frames.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors from the outbound dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid callee number: {0}")]
    InvalidNumber(String),

    /// Provider refused the call (non-2xx).
    #[error("provider rejected outbound call: {0}")]
    DispatchFailed(String),

    /// The provider accepted but no media stream arrived in time.
    #[error("no media stream opened for outbound call within {secs}s")]
    NoMedia { secs: u64 },
}

pub type CollabResult<T> = Result<T, CollaboratorError>;
