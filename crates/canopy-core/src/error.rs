//! Core engine errors

use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors from the data plane and tunnel lifecycle engine
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid configuration, fatal at startup
    #[error("configuration error: {0}")]
    Config(String),

    /// Handshake could not be built or verified
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Received packet referenced an index we do not know
    #[error("unknown remote index: {0}")]
    UnknownIndex(u32),

    /// No tunnel or pending state for an overlay address
    #[error("no tunnel to {0}")]
    PeerNotFound(Ipv4Addr),

    /// Relay operation failed
    #[error("relay error: {0}")]
    Relay(String),

    /// A bounded queue was full and the item was dropped
    #[error("channel full: {0}")]
    ChannelFull(&'static str),

    /// Inner IP frame did not parse
    #[error("malformed inner packet: {0}")]
    MalformedPacket(String),

    /// Crypto failure (auth, replay, counter exhaustion)
    #[error("crypto error: {0}")]
    Crypto(#[from] canopy_crypto::CryptoError),

    /// Certificate failure
    #[error("certificate error: {0}")]
    Certificate(#[from] canopy_cert::CertificateError),

    /// Transport or framing failure
    #[error("network error: {0}")]
    Network(#[from] canopy_network::NetworkError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
