//! UDP transport
//!
//! Async UDP socket handling for overlay traffic. Datagrams are opaque
//! at this layer; framing lives in [`crate::header`]. The socket can be
//! rebound in place (laptop roams, interface changes); each rebind bumps
//! a counter the connection manager watches to decide when to ask a
//! lighthouse for a punch.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::{NetworkError, NetworkResult};

/// Maximum datagram we will send or receive
pub const MAX_DATAGRAM_SIZE: usize = 9001;

/// A received datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Source address
    pub from: SocketAddr,
    /// Raw payload
    pub data: Vec<u8>,
}

/// UDP transport for overlay packets
pub struct UdpTransport {
    socket: RwLock<Arc<UdpSocket>>,
    bind_addr: SocketAddr,
    rebind_count: AtomicU32,
}

impl UdpTransport {
    /// Bind to the specified address
    pub async fn bind(addr: SocketAddr) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetworkError::AddressInUse(addr)
            } else {
                NetworkError::Io(e)
            }
        })?;

        let local_addr = socket.local_addr()?;
        debug!("udp transport bound to {}", local_addr);

        Ok(Self {
            socket: RwLock::new(Arc::new(socket)),
            bind_addr: local_addr,
            rebind_count: AtomicU32::new(0),
        })
    }

    fn current_socket(&self) -> Arc<UdpSocket> {
        self.socket.read().expect("socket lock poisoned").clone()
    }

    /// Local address of the current socket
    pub fn local_addr(&self) -> NetworkResult<SocketAddr> {
        Ok(self.current_socket().local_addr()?)
    }

    /// How many times the socket has been rebound since startup
    pub fn rebind_count(&self) -> u32 {
        self.rebind_count.load(Ordering::Relaxed)
    }

    /// Replace the socket with a fresh one on the same interface.
    ///
    /// The new socket takes an ephemeral port, so the kernel allocates a
    /// new NAT mapping; the bumped rebind counter prompts punch
    /// notifications upstream and a lighthouse update announces the new
    /// endpoint.
    pub async fn rebind(&self) -> NetworkResult<()> {
        let fresh = UdpSocket::bind(SocketAddr::new(self.bind_addr.ip(), 0)).await?;
        let local = fresh.local_addr()?;
        *self.socket.write().expect("socket lock poisoned") = Arc::new(fresh);
        self.rebind_count.fetch_add(1, Ordering::Relaxed);
        debug!("udp transport rebound to {}", local);
        Ok(())
    }

    /// Send one datagram
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> NetworkResult<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::InvalidPacket(format!(
                "datagram too large: {} bytes",
                data.len()
            )));
        }
        trace!("sending {} bytes to {}", data.len(), addr);
        self.current_socket().send_to(data, addr).await?;
        Ok(())
    }

    /// Receive one datagram
    pub async fn recv(&self) -> NetworkResult<Datagram> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self.current_socket().recv_from(&mut buf).await?;
        buf.truncate(len);
        trace!("received {} bytes from {}", len, from);
        Ok(Datagram { from, data: buf })
    }
}

/// Builder for a transport with custom socket options
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
}

impl UdpTransportBuilder {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// Kernel receive buffer size in bytes
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Kernel send buffer size in bytes
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Build the transport
    pub async fn build(self) -> NetworkResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;
        let local_addr = tokio_socket.local_addr()?;
        debug!("udp transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: RwLock::new(Arc::new(tokio_socket)),
            bind_addr: local_addr,
            rebind_count: AtomicU32::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(transport.local_addr().unwrap().port() > 0);
    }

    #[tokio::test]
    async fn test_transport_send_recv() {
        let t1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        t1.send_to(b"hello overlay", t2.local_addr().unwrap())
            .await
            .unwrap();

        let datagram = t2.recv().await.unwrap();
        assert_eq!(datagram.from, t1.local_addr().unwrap());
        assert_eq!(datagram.data, b"hello overlay");
    }

    #[tokio::test]
    async fn test_rebind_bumps_counter() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(transport.rebind_count(), 0);

        transport.rebind().await.unwrap();
        assert_eq!(transport.rebind_count(), 1);
    }

    #[tokio::test]
    async fn test_oversized_datagram_rejected() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let too_big = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(transport
            .send_to(&too_big, "127.0.0.1:9".parse().unwrap())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_builder_with_buffer_sizes() {
        let transport = UdpTransportBuilder::new("127.0.0.1:0".parse().unwrap())
            .recv_buffer_size(1 << 20)
            .send_buffer_size(1 << 20)
            .build()
            .await
            .unwrap();
        assert!(transport.local_addr().unwrap().port() > 0);
    }
}
