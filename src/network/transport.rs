//! Transport collaborator interface
//!
//! The pipelines never see the wireless stack itself; they see a
//! [`Transport`] that can open a link to a candidate device, write chunk
//! datagrams to it, report its signal and tell when the peer goes away.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;

use crate::error::TransportError;

/// A receiver offered by discovery, not yet admitted
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceCandidate {
    /// Transport-specific address (e.g. `192.168.1.20:5000`)
    pub device_id: String,
    pub name: String,
}

impl DeviceCandidate {
    pub fn new(device_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.device_id)
    }
}

/// Opaque link handle issued by a transport.
///
/// The session pool keeps each handle inside exactly one session and hands
/// it back through [`Transport::release`] once.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportHandle {
    id: u64,
    device_id: String,
}

impl TransportHandle {
    pub fn new(id: u64, device_id: impl Into<String>) -> Self {
        Self {
            id,
            device_id: device_id.into(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

/// Acknowledgement of a completed write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// When the peer acknowledged, for transports that report it
    pub acked_at: Option<Instant>,
}

impl WriteAck {
    pub fn unacknowledged() -> Self {
        Self { acked_at: None }
    }

    pub fn acked(at: Instant) -> Self {
        Self { acked_at: Some(at) }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Largest chunk payload a single write may carry
    fn mtu(&self) -> usize;

    /// Fails when the transport cannot serve a role at all (radio off)
    async fn check_available(&self) -> Result<(), TransportError>;

    /// Open a link to the candidate (handshake)
    async fn connect(&self, candidate: &DeviceCandidate) -> Result<TransportHandle, TransportError>;

    async fn write(&self, handle: &TransportHandle, bytes: Bytes) -> Result<WriteAck, TransportError>;

    /// Current RSSI in dBm, if the transport can measure it
    async fn read_signal(&self, handle: &TransportHandle) -> Result<Option<i32>, TransportError>;

    /// Resolves when the peer disconnects on its own
    async fn disconnected(&self, handle: &TransportHandle);

    /// Tear down the link
    fn release(&self, handle: TransportHandle);
}
