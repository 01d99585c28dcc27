//! Sender and receiver orchestration on the control context

pub mod broadcast;
pub mod playback;

pub use broadcast::BroadcastPipeline;
pub use playback::{PlaybackPipeline, PlaybackSnapshot, PlaybackStats};
