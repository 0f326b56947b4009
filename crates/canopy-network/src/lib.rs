//! Canopy Network Layer
//!
//! Wire framing, UDP transport and the TUN device abstraction:
//! - Fixed 16-byte packet header shared by every overlay datagram
//! - Async UDP socket handling with rebind support
//! - Plaintext frame source/sink trait with a channel-backed test device

pub mod error;
pub mod header;
pub mod transport;
pub mod tun;

pub use error::{NetworkError, NetworkResult};
pub use header::{Header, PacketType, HEADER_LEN, WIRE_VERSION};
pub use transport::{Datagram, UdpTransport, UdpTransportBuilder, MAX_DATAGRAM_SIZE};
pub use tun::{ChannelTun, TunConfig, TunDevice};
