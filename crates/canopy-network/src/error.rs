//! Network layer errors

use std::net::SocketAddr;

use thiserror::Error;

/// Errors from the UDP transport, TUN device and wire framing
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Underlying socket or device I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Bind address already taken
    #[error("address already in use: {0}")]
    AddressInUse(SocketAddr),

    /// Wire bytes did not parse as a packet
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The TUN device has been closed
    #[error("device closed")]
    DeviceClosed,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
