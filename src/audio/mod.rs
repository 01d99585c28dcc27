//! Audio subsystem module

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;

pub use buffer::{AudioFrame, JitterBuffer, RingBuffer, RingStats};
pub use capture::{Capture, CpalCapture, FrameSink, ManualCapture, ManualCaptureHandle, SharedProfile};
pub use device::{list_devices, DeviceInfo};
pub use playback::{CpalRender, RecordingRender, Render};
