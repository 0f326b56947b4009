//! TUN device abstraction
//!
//! The overlay core reads and writes plaintext IP frames through this
//! trait; device creation and platform plumbing live outside the core.
//! A channel-backed implementation is provided for tests and for
//! embedding the engine without a real interface.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::{NetworkError, NetworkResult};

/// TUN device configuration
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name (e.g. "canopy0")
    pub name: String,

    /// Device IP address (the node's primary overlay address)
    pub address: std::net::Ipv4Addr,

    /// Subnet mask
    pub netmask: std::net::Ipv4Addr,

    /// Maximum transmission unit
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "canopy0".to_string(),
            address: std::net::Ipv4Addr::new(10, 128, 0, 1),
            netmask: std::net::Ipv4Addr::new(255, 255, 0, 0),
            mtu: 1300,
        }
    }
}

/// Plaintext IP frame source/sink
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read the next inner IP frame. Returns [`NetworkError::DeviceClosed`]
    /// once the device is shut down.
    async fn read_packet(&self) -> NetworkResult<Bytes>;

    /// Write one inner IP frame toward the host stack
    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Device name for logging
    fn name(&self) -> &str;
}

/// In-memory TUN backed by channels.
///
/// Frames pushed with [`ChannelTun::inject`] appear on `read_packet`;
/// frames written by the engine are delivered to the receiver returned
/// at construction.
pub struct ChannelTun {
    name: String,
    inject_tx: mpsc::Sender<Bytes>,
    read_rx: Mutex<mpsc::Receiver<Bytes>>,
    write_tx: mpsc::Sender<Bytes>,
}

impl ChannelTun {
    /// Create a device plus the receiving end for engine-written frames
    pub fn new(name: &str) -> (Self, mpsc::Receiver<Bytes>) {
        let (inject_tx, read_rx) = mpsc::channel(256);
        let (write_tx, write_rx) = mpsc::channel(256);
        (
            Self {
                name: name.to_string(),
                inject_tx,
                read_rx: Mutex::new(read_rx),
                write_tx,
            },
            write_rx,
        )
    }

    /// Push a frame that the engine will see on its next read
    pub async fn inject(&self, packet: Bytes) -> NetworkResult<()> {
        self.inject_tx
            .send(packet)
            .await
            .map_err(|_| NetworkError::DeviceClosed)
    }
}

#[async_trait]
impl TunDevice for ChannelTun {
    async fn read_packet(&self) -> NetworkResult<Bytes> {
        let mut rx = self.read_rx.lock().await;
        rx.recv().await.ok_or(NetworkError::DeviceClosed)
    }

    async fn write_packet(&self, packet: &[u8]) -> NetworkResult<()> {
        self.write_tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| NetworkError::DeviceClosed)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_tun_roundtrip() {
        let (tun, mut written) = ChannelTun::new("canopy-test");

        tun.inject(Bytes::from_static(b"inbound frame"))
            .await
            .unwrap();
        let frame = tun.read_packet().await.unwrap();
        assert_eq!(&frame[..], b"inbound frame");

        tun.write_packet(b"outbound frame").await.unwrap();
        let frame = written.recv().await.unwrap();
        assert_eq!(&frame[..], b"outbound frame");
    }

    #[tokio::test]
    async fn test_closed_device_errors() {
        let (tun, written) = ChannelTun::new("canopy-test");
        drop(written);
        assert!(matches!(
            tun.write_packet(b"frame").await,
            Err(NetworkError::DeviceClosed)
        ));
    }
}
