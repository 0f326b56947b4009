//! Crypto errors

use thiserror::Error;

/// Errors from key handling, AEAD and replay protection
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD authentication failed on decrypt
    #[error("authentication failed")]
    AuthFail,

    /// Counter was already seen or fell behind the replay window
    #[error("counter replayed or too old")]
    ReplayOrTooOld,

    /// Send counter reached its ceiling; the tunnel must re-key
    #[error("send counter exhausted, tunnel requires a new handshake")]
    CounterExhausted,

    /// Key material had the wrong length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Public key bytes did not decode on the expected curve
    #[error("invalid public key")]
    InvalidPublicKey,

    /// DH attempted between keys on different curves
    #[error("curve mismatch: {ours} vs {theirs}")]
    CurveMismatch { ours: &'static str, theirs: &'static str },

    /// Encryption failed (cipher construction or sealing)
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;
