//! UDP datagram transport
//!
//! Each chunk is one datagram. UDP has no handshake, acknowledgement or
//! signal measurement, so `connect` only resolves the address and the other
//! optional capabilities report nothing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::transport::{DeviceCandidate, Transport, TransportHandle, WriteAck};
use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::protocol::CHUNK_OVERHEAD;

/// Largest UDP payload that avoids IP fragmentation on Ethernet
pub const MAX_DATAGRAM_SIZE: usize = 1472;

/// Create a tokio UDP socket with tuned buffers
pub fn create_socket(addr: SocketAddr, config: &NetworkConfig) -> Result<tokio::net::UdpSocket, TransportError> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(tokio::net::UdpSocket::from_std(std_socket)?)
}

/// Sender side: one socket, one handle per admitted receiver address
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
    mtu: usize,
    next_handle: AtomicU64,
    peers: Mutex<HashMap<u64, SocketAddr>>,
}

impl UdpTransport {
    pub fn bind(config: &NetworkConfig) -> Result<Self, TransportError> {
        let addr: SocketAddr = format!("{}:0", config.bind_address)
            .parse()
            .map_err(|e| TransportError::Unavailable(format!("bad bind address: {}", e)))?;
        let mtu = config.mtu.min(MAX_DATAGRAM_SIZE - CHUNK_OVERHEAD);
        Ok(Self {
            socket: create_socket(addr, config)?,
            mtu,
            next_handle: AtomicU64::new(1),
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl Transport for UdpTransport {
    fn mtu(&self) -> usize {
        self.mtu
    }

    async fn check_available(&self) -> Result<(), TransportError> {
        self.socket
            .local_addr()
            .map(|_| ())
            .map_err(|e| TransportError::Unavailable(e.to_string()))
    }

    async fn connect(&self, candidate: &DeviceCandidate) -> Result<TransportHandle, TransportError> {
        let addr = tokio::net::lookup_host(candidate.device_id.as_str())
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::DeviceIncompatible(candidate.device_id.clone()))?;

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.peers.lock().insert(id, addr);
        tracing::debug!(peer = %addr, handle = id, "udp peer registered");
        Ok(TransportHandle::new(id, candidate.device_id.clone()))
    }

    async fn write(&self, handle: &TransportHandle, bytes: Bytes) -> Result<WriteAck, TransportError> {
        let addr = self
            .peers
            .lock()
            .get(&handle.id())
            .copied()
            .ok_or(TransportError::UnknownHandle(handle.id()))?;

        let sent = self
            .socket
            .send_to(&bytes, addr)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        if sent != bytes.len() {
            return Err(TransportError::WriteFailed(format!(
                "short send: {} of {} bytes",
                sent,
                bytes.len()
            )));
        }
        Ok(WriteAck::unacknowledged())
    }

    async fn read_signal(&self, _handle: &TransportHandle) -> Result<Option<i32>, TransportError> {
        Ok(None)
    }

    async fn disconnected(&self, _handle: &TransportHandle) {
        // Datagram peers never announce a disconnect
        std::future::pending::<()>().await
    }

    fn release(&self, handle: TransportHandle) {
        self.peers.lock().remove(&handle.id());
    }
}

/// Receiver side: yields raw chunk datagrams
pub struct UdpReceiver {
    socket: tokio::net::UdpSocket,
    buf: BytesMut,
}

impl UdpReceiver {
    pub fn bind(config: &NetworkConfig) -> Result<Self, TransportError> {
        let addr: SocketAddr = format!("{}:{}", config.bind_address, config.udp_port)
            .parse()
            .map_err(|e| TransportError::Unavailable(format!("bad bind address: {}", e)))?;
        Ok(Self {
            socket: create_socket(addr, config)?,
            buf: BytesMut::with_capacity(MAX_DATAGRAM_SIZE),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Wait for the next datagram
    pub async fn recv(&mut self) -> Result<(Bytes, SocketAddr), TransportError> {
        self.buf.clear();
        self.buf.resize(MAX_DATAGRAM_SIZE, 0);
        let (len, from) = self.socket.recv_from(&mut self.buf).await?;
        self.buf.truncate(len);
        Ok((self.buf.split().freeze(), from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config(port: u16) -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            udp_port: port,
            ..NetworkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_udp_roundtrip() {
        let mut receiver = UdpReceiver::bind(&loopback_config(0)).unwrap();
        let target = receiver.local_addr().unwrap();

        let transport = UdpTransport::bind(&loopback_config(0)).unwrap();
        let handle = transport
            .connect(&DeviceCandidate::new(target.to_string(), "loopback"))
            .await
            .unwrap();
        transport
            .write(&handle, Bytes::from_static(b"chunk"))
            .await
            .unwrap();

        let (data, _) = receiver.recv().await.unwrap();
        assert_eq!(&data[..], b"chunk");

        transport.release(handle.clone());
        assert!(matches!(
            transport.write(&handle, Bytes::new()).await,
            Err(TransportError::UnknownHandle(_))
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_candidate_is_incompatible() {
        let transport = UdpTransport::bind(&loopback_config(0)).unwrap();
        assert!(matches!(
            transport
                .connect(&DeviceCandidate::new("not an address", "bogus"))
                .await,
            Err(TransportError::DeviceIncompatible(_))
        ));
    }

    #[test]
    fn test_mtu_fits_datagram() {
        let mut config = loopback_config(0);
        config.mtu = 9000;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let transport = rt.block_on(async { UdpTransport::bind(&config) }).unwrap();
        assert_eq!(transport.mtu() + CHUNK_OVERHEAD, MAX_DATAGRAM_SIZE);
    }
}
