//! Canopy Cryptographic Primitives
//!
//! This crate provides the cryptographic operations for the canopy
//! overlay network:
//! - Key exchange (X25519, P-256 ECDH)
//! - Tunnel AEAD (AES-GCM-128 or ChaCha20-Poly1305)
//! - Anti-replay windows
//! - Key derivation (HKDF-SHA256)

pub mod error;
pub mod keys;
pub mod replay;
pub mod tunnel;

pub use error::{CryptoError, CryptoResult};
pub use keys::{combine_secrets, Curve, DerivedKeys, KeyPair, PublicKey, SecretKey, SharedSecret};
pub use replay::{ReplayVerdict, ReplayWindow};
pub use tunnel::{build_nonce, Cipher, CryptoTunnel, SessionKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::keys::*;
    pub use crate::replay::*;
    pub use crate::tunnel::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Derived symmetric key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// AES-GCM-128 key size
    pub const AES_KEY_SIZE: usize = 16;

    /// AEAD nonce size
    pub const NONCE_SIZE: usize = 12;

    /// Poly1305 / GCM authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Anti-replay window size in counters
    pub const REPLAY_WINDOW_SIZE: usize = 1024;
}
