//! In-process transport
//!
//! Links are entries in a table; writes are recorded per device. Failure,
//! latency, signal and disconnects can be injected per device, which makes
//! this the transport the pipelines are tested against.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::transport::{DeviceCandidate, Transport, TransportHandle, WriteAck};
use crate::error::TransportError;

struct Link {
    device_id: String,
    disconnect: Arc<Notify>,
}

#[derive(Default)]
struct DeviceBehavior {
    fail_writes: bool,
    ack_delay: Option<Duration>,
    rssi: Option<i32>,
}

#[derive(Default)]
struct State {
    available: bool,
    incompatible: HashSet<String>,
    handshake_delay: Duration,
    next_handle: u64,
    links: HashMap<u64, Link>,
    behavior: HashMap<String, DeviceBehavior>,
    delivered: HashMap<String, Vec<Bytes>>,
    released: Vec<u64>,
    double_releases: usize,
    max_live: usize,
}

/// Loopback transport with fault injection
#[derive(Clone)]
pub struct MemoryTransport {
    mtu: usize,
    state: Arc<Mutex<State>>,
}

impl MemoryTransport {
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            state: Arc::new(Mutex::new(State {
                available: true,
                ..State::default()
            })),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Handshakes with this device fail
    pub fn mark_incompatible(&self, device_id: &str) {
        self.state.lock().incompatible.insert(device_id.to_string());
    }

    pub fn set_handshake_delay(&self, delay: Duration) {
        self.state.lock().handshake_delay = delay;
    }

    pub fn set_write_failure(&self, device_id: &str, fail: bool) {
        self.state
            .lock()
            .behavior
            .entry(device_id.to_string())
            .or_default()
            .fail_writes = fail;
    }

    /// Writes to this device are acknowledged after `delay`
    pub fn set_ack_delay(&self, device_id: &str, delay: Option<Duration>) {
        self.state
            .lock()
            .behavior
            .entry(device_id.to_string())
            .or_default()
            .ack_delay = delay;
    }

    pub fn set_rssi(&self, device_id: &str, rssi: Option<i32>) {
        self.state
            .lock()
            .behavior
            .entry(device_id.to_string())
            .or_default()
            .rssi = rssi;
    }

    /// Simulate the peer dropping every link to `device_id`
    pub fn drop_link(&self, device_id: &str) {
        let state = self.state.lock();
        for link in state.links.values().filter(|l| l.device_id == device_id) {
            link.disconnect.notify_one();
        }
    }

    /// Every datagram written to `device_id`, in write order
    pub fn delivered(&self, device_id: &str) -> Vec<Bytes> {
        self.state
            .lock()
            .delivered
            .get(device_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn live_links(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Highest number of simultaneously open links seen
    pub fn max_live_links(&self) -> usize {
        self.state.lock().max_live
    }

    /// Handle ids in release order
    pub fn released(&self) -> Vec<u64> {
        self.state.lock().released.clone()
    }

    /// Releases of handles that were already released
    pub fn double_releases(&self) -> usize {
        self.state.lock().double_releases
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn check_available(&self) -> Result<(), TransportError> {
        if self.state.lock().available {
            Ok(())
        } else {
            Err(TransportError::Unavailable("memory transport disabled".into()))
        }
    }

    async fn connect(&self, candidate: &DeviceCandidate) -> Result<TransportHandle, TransportError> {
        let delay = {
            let state = self.state.lock();
            if !state.available {
                return Err(TransportError::Unavailable("memory transport disabled".into()));
            }
            state.handshake_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.incompatible.contains(&candidate.device_id) {
            return Err(TransportError::DeviceIncompatible(candidate.device_id.clone()));
        }
        let id = state.next_handle;
        state.next_handle += 1;
        state.links.insert(
            id,
            Link {
                device_id: candidate.device_id.clone(),
                disconnect: Arc::new(Notify::new()),
            },
        );
        state.max_live = state.max_live.max(state.links.len());
        Ok(TransportHandle::new(id, candidate.device_id.clone()))
    }

    async fn write(&self, handle: &TransportHandle, bytes: Bytes) -> Result<WriteAck, TransportError> {
        if bytes.len() > self.mtu + crate::protocol::CHUNK_OVERHEAD {
            return Err(TransportError::PayloadTooLarge {
                size: bytes.len(),
                mtu: self.mtu,
            });
        }

        let ack_delay = {
            let mut state = self.state.lock();
            if !state.links.contains_key(&handle.id()) {
                return Err(TransportError::UnknownHandle(handle.id()));
            }
            let behavior = state.behavior.get(handle.device_id());
            if behavior.is_some_and(|b| b.fail_writes) {
                return Err(TransportError::WriteFailed(format!(
                    "link to {} rejected write",
                    handle.device_id()
                )));
            }
            let ack_delay = behavior.and_then(|b| b.ack_delay);
            state
                .delivered
                .entry(handle.device_id().to_string())
                .or_default()
                .push(bytes);
            ack_delay
        };

        match ack_delay {
            Some(delay) => {
                tokio::time::sleep(delay).await;
                Ok(WriteAck::acked(Instant::now()))
            }
            None => Ok(WriteAck::unacknowledged()),
        }
    }

    async fn read_signal(&self, handle: &TransportHandle) -> Result<Option<i32>, TransportError> {
        let state = self.state.lock();
        if !state.links.contains_key(&handle.id()) {
            return Err(TransportError::UnknownHandle(handle.id()));
        }
        Ok(state.behavior.get(handle.device_id()).and_then(|b| b.rssi))
    }

    async fn disconnected(&self, handle: &TransportHandle) {
        let notify = self
            .state
            .lock()
            .links
            .get(&handle.id())
            .map(|l| Arc::clone(&l.disconnect));
        if let Some(notify) = notify {
            notify.notified().await;
        }
    }

    fn release(&self, handle: TransportHandle) {
        let mut state = self.state.lock();
        if state.links.remove(&handle.id()).is_none() {
            state.double_releases += 1;
            return;
        }
        state.released.push(handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_write_release() {
        let transport = MemoryTransport::new(512);
        let handle = transport
            .connect(&DeviceCandidate::new("dev-a", "A"))
            .await
            .unwrap();
        assert_eq!(transport.live_links(), 1);

        transport.write(&handle, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(transport.delivered("dev-a"), vec![Bytes::from_static(b"hello")]);

        let id = handle.id();
        transport.release(handle.clone());
        transport.release(handle);
        assert_eq!(transport.released(), vec![id]);
        assert_eq!(transport.double_releases(), 1);
        assert_eq!(transport.live_links(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let transport = MemoryTransport::new(512);
        transport.mark_incompatible("old-phone");
        assert!(matches!(
            transport.connect(&DeviceCandidate::new("old-phone", "Old")).await,
            Err(TransportError::DeviceIncompatible(_))
        ));

        let handle = transport
            .connect(&DeviceCandidate::new("dev-b", "B"))
            .await
            .unwrap();
        transport.set_write_failure("dev-b", true);
        assert!(transport.write(&handle, Bytes::new()).await.is_err());

        transport.set_available(false);
        assert!(transport.check_available().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_delay_and_disconnect() {
        let transport = MemoryTransport::new(512);
        let handle = transport
            .connect(&DeviceCandidate::new("dev-c", "C"))
            .await
            .unwrap();
        transport.set_ack_delay("dev-c", Some(Duration::from_millis(30)));
        transport.set_rssi("dev-c", Some(-60));

        let sent = Instant::now();
        let ack = transport.write(&handle, Bytes::new()).await.unwrap();
        assert_eq!(ack.acked_at.unwrap() - sent, Duration::from_millis(30));
        assert_eq!(transport.read_signal(&handle).await.unwrap(), Some(-60));

        transport.drop_link("dev-c");
        tokio::time::timeout(Duration::from_secs(1), transport.disconnected(&handle))
            .await
            .unwrap();
    }
}
