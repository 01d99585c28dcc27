//! # Mic Broadcast
//!
//! Low-latency broadcast of one microphone to a bounded pool of wireless
//! receiver sessions.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                  SENDER                                      │
//! │  ┌─────────────┐    real-time context (never blocks)                        │
//! │  │ Microphone  │──► FrameSink: quantize ─► PcmEncoder (decimate) ─┐          │
//! │  └─────────────┘                                                 │          │
//! │                                  bounded channel (EncodedPacket) │          │
//! │  ┌───────────────────────────────────────────────────────────────▼───────┐  │
//! │  │ BroadcastPipeline (control context)                                   │  │
//! │  │   protocol::split(packet, mtu) ─► fan-out to every Active session     │  │
//! │  │          │                          ┌──────────────────────────────┐  │  │
//! │  │          │                          │ SessionPool (capacity 7)     │  │  │
//! │  │          │                          │ Connecting→Active→Draining→  │  │  │
//! │  │          │                          │ Closed, FIFO admission queue │  │  │
//! │  │          ▼                          └──────────────────────────────┘  │  │
//! │  │   Telemetry (latency windows, alerts) ─► EventHub subscribers         │  │
//! │  └───────────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────┬──────────────────────────────────────┘
//!                                        │ Transport: [packetId|index|count|..]
//!                                        ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                 RECEIVER                                     │
//! │  ┌───────────────────────────────────────────────────────────────────────┐  │
//! │  │ PlaybackPipeline (control context)                                    │  │
//! │  │   Reassembler ─► PcmDecoder ─► JitterBuffer (packet order, adaptive)  │  │
//! │  │        │ arrival intervals ─► buffer health                           │  │
//! │  └────────┼──────────────────────────────────────────────┬──────────────┘  │
//! │           ▼                                              ▼ render tick      │
//! │       Telemetry                                ┌──────────────────┐         │
//! │                                                │  Render (speaker)│         │
//! │                                                └──────────────────┘         │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod session;
pub mod telemetry;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Only mono capture is supported
    pub const CHANNELS: u16 = 1;

    /// Samples per captured frame
    pub const DEFAULT_FRAME_SIZE: usize = 4096;

    /// Maximum number of concurrently admitted sessions
    pub const MAX_SESSIONS: usize = 7;

    /// An Active session idle for longer than this may be evicted
    pub const INACTIVITY_THRESHOLD_MS: u64 = 5000;

    /// How long a queued connection request may wait for a slot
    pub const ADMISSION_DEADLINE_MS: u64 = 10_000;

    /// Consecutive failed writes before a session is drained
    pub const WRITE_FAILURE_LIMIT: u32 = 3;

    /// Partial packets older than this are dropped
    pub const REASSEMBLY_TIMEOUT_MS: u64 = 500;

    /// Default transport MTU (payload bytes per chunk)
    pub const DEFAULT_MTU: usize = 512;

    /// Default UDP port for audio streaming
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Jitter buffer capacity in frames
    pub const JITTER_BUFFER_CAPACITY: usize = 32;

    /// Frames buffered before playback begins
    pub const JITTER_MIN_DELAY: usize = 2;

    /// Upper bound for the adaptive jitter depth
    pub const JITTER_MAX_DELAY: usize = 8;

    /// Capture → control channel capacity (in packets)
    pub const CAPTURE_CHANNEL_CAPACITY: usize = 64;

    /// Lock-free ring buffer capacity (in frames)
    pub const RING_BUFFER_CAPACITY: usize = 16;
}
