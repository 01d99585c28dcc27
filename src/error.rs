//! Error types for the broadcast and playback pipelines

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Role-start failures (no transport, no microphone) are fatal; queue
    /// timeouts, capacity rejections and per-packet faults are not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Audio(AudioError::MicrophoneUnavailable(_)) => false,
            Error::Audio(_) => false,
            Error::Codec(_) | Error::Chunk(_) => true,
            Error::Transport(e) => e.is_recoverable(),
            Error::Session(e) => e.is_recoverable(),
            Error::Config(_) | Error::Io(_) => false,
        }
    }
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Microphone unavailable: {0}")]
    MicrophoneUnavailable(String),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed packet {packet_id}: {reason}")]
    MalformedPacket { packet_id: u32, reason: String },
}

/// Fragmentation and reassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk too short: {0} bytes")]
    TooShort(usize),

    #[error("Invalid chunk header: {0}")]
    InvalidHeader(String),

    #[error("Chunk index {index} out of range for count {count}")]
    IndexOutOfRange { index: u16, count: u16 },

    #[error("Packet {packet_id} announced {expected} chunks, chunk says {actual}")]
    ChunkCountMismatch {
        packet_id: u32,
        expected: u16,
        actual: u16,
    },

    #[error("Invalid MTU: {0}")]
    InvalidMtu(usize),

    #[error("Packet too large: {0} chunks")]
    PacketTooLarge(usize),

    #[error("Packet {0} timed out during reassembly")]
    PacketTimeout(u32),
}

/// Transport collaborator errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Device incompatible: {0}")]
    DeviceIncompatible(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Payload too large: {size} bytes exceeds MTU {mtu}")]
    PayloadTooLarge { size: usize, mtu: usize },

    #[error("Unknown transport handle: {0}")]
    UnknownHandle(u64),

    #[error("IO error: {0}")]
    Io(String),
}

impl TransportError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::Unavailable(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Session pool and admission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Capacity exceeded: {0} sessions")]
    CapacityExceeded(usize),

    #[error("Connection request timed out after {0} ms")]
    ConnectionTimeout(u64),

    #[error("Device incompatible: {0}")]
    DeviceIncompatible(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Session not found: {0}")]
    NotFound(u64),

    #[error("Session {0} was closed before its handshake completed")]
    Aborted(u64),

    #[error("Session pool is closed")]
    PoolClosed,
}

impl SessionError {
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SessionError::CapacityExceeded(_)
                | SessionError::ConnectionTimeout(_)
                | SessionError::DeviceIncompatible(_)
                | SessionError::Aborted(_)
        )
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable(msg) => SessionError::TransportUnavailable(msg),
            TransportError::DeviceIncompatible(msg) | TransportError::HandshakeFailed(msg) => {
                SessionError::DeviceIncompatible(msg)
            }
            other => SessionError::DeviceIncompatible(other.to_string()),
        }
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
