//! Voicedesk - Telephony Voice Agent Library
//!
//! A single-process, multi-session voice agent for appointment scheduling:
//! - Telephony media streams bridged over WebSocket (µ-law, 8kHz)
//! - Streaming STT with mid-call language identification
//! - Role-specific intent classification with heuristic fallback
//! - Workflow state machines: customer rescheduling, teammate delay
//!   notification, outbound customer verification
//! - Latency-hiding filler playback and barge-in on user finals
//! - Parent/child call linkage with SMS outcome reporting

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod error;
pub mod config;
pub mod backoff;
pub mod audit;
pub mod events;
pub mod phonebook;
pub mod filler;
pub mod media;
pub mod speech;
pub mod llm;
pub mod transcript;
pub mod intent;
pub mod calendar;
pub mod sms;
pub mod telephony;
pub mod session;
pub mod workflow;
pub mod outbound;
pub mod termination;
pub mod orchestrator;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;
pub use orchestrator::AppContext;
pub use session::{Session, SessionStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
