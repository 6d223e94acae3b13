//! Speech collaborators: streaming transcription and synthesis
//!
//! Both sides are trait seams so the orchestrator and tests never touch a
//! vendor SDK directly. Production adapters: a WebSocket streaming STT and
//! an HTTP streaming TTS that emits telephony-ready µ-law.

pub mod stt;
pub mod tts;

pub use stt::{SttEvent, SttEventKind, SttStream, Transcriber};
pub use tts::Synthesizer;
