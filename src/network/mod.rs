//! Transports carrying chunks between sender and receivers

pub mod memory;
pub mod transport;
pub mod udp;

pub use memory::MemoryTransport;
pub use transport::{DeviceCandidate, Transport, TransportHandle, WriteAck};
pub use udp::{create_socket, UdpReceiver, UdpTransport};
