//! Audio path: codec and per-stream media bridge

pub mod bridge;
pub mod codec;

pub use bridge::{MediaBridge, OutboundFrame, PlayPriority, FRAME_BYTES, FRAME_INTERVAL};
