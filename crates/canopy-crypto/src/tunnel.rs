//! Tunnel encryption
//!
//! Authenticated encryption for one established tunnel: a send key and a
//! receive key derived from the handshake, a monotonically increasing send
//! counter, and a replay window on the receive side. The cipher suite is
//! network-wide; both variants expose the same AEAD surface so the choice
//! is made once at tunnel construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aes_gcm::Aes128Gcm;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305,
};
use zeroize::Zeroizing;

use crate::constants::{AES_KEY_SIZE, AUTH_TAG_SIZE, NONCE_SIZE, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::replay::{ReplayVerdict, ReplayWindow};

/// Nonce domain for data packets
pub const NONCE_DOMAIN_DATA: u32 = 0;
/// Nonce domain for handshake-stage AEAD
pub const NONCE_DOMAIN_HANDSHAKE: u32 = 1;

/// AEAD cipher suite, fixed for the whole network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    /// AES-GCM with a 128-bit key
    Aes,
    /// ChaCha20-Poly1305
    ChaCha,
}

impl Cipher {
    /// Parse the configuration name for a cipher
    pub fn from_name(name: &str) -> CryptoResult<Self> {
        match name {
            "aes" => Ok(Cipher::Aes),
            "chachapoly" => Ok(Cipher::ChaCha),
            other => Err(CryptoError::EncryptionFailed(format!(
                "unknown cipher: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Cipher::Aes => "aes",
            Cipher::ChaCha => "chachapoly",
        }
    }
}

enum AeadState {
    Aes(Aes128Gcm),
    ChaCha(ChaCha20Poly1305),
}

/// One directional AEAD key
pub struct SessionKey {
    state: AeadState,
}

/// Build the 12-byte nonce: 4-byte big-endian domain separator followed by
/// the 8-byte little-endian counter.
pub fn build_nonce(domain: u32, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&domain.to_be_bytes());
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

impl SessionKey {
    /// Construct a session key from 32 bytes of derived key material.
    ///
    /// AES-GCM-128 consumes the first 16 bytes; ChaCha20-Poly1305 takes
    /// all 32.
    pub fn new(cipher: Cipher, key: &[u8; SYMMETRIC_KEY_SIZE]) -> Self {
        let state = match cipher {
            Cipher::Aes => {
                let short = Zeroizing::new(key[..AES_KEY_SIZE].to_vec());
                AeadState::Aes(
                    Aes128Gcm::new_from_slice(&short).expect("fixed-size AES key"),
                )
            }
            Cipher::ChaCha => AeadState::ChaCha(
                ChaCha20Poly1305::new_from_slice(key).expect("fixed-size ChaCha key"),
            ),
        };
        Self { state }
    }

    /// Encrypt, appending the 16-byte tag
    pub fn seal(
        &self,
        domain: u32,
        counter: u64,
        ad: &[u8],
        plaintext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        let nonce = build_nonce(domain, counter);
        let payload = Payload {
            msg: plaintext,
            aad: ad,
        };
        match &self.state {
            AeadState::Aes(c) => c.encrypt((&nonce).into(), payload),
            AeadState::ChaCha(c) => c.encrypt((&nonce).into(), payload),
        }
        .map_err(|_| CryptoError::EncryptionFailed("AEAD seal failed".into()))
    }

    /// Decrypt and verify; the tag is expected at the end of `ciphertext`
    pub fn open(
        &self,
        domain: u32,
        counter: u64,
        ad: &[u8],
        ciphertext: &[u8],
    ) -> CryptoResult<Vec<u8>> {
        if ciphertext.len() < AUTH_TAG_SIZE {
            return Err(CryptoError::AuthFail);
        }
        let nonce = build_nonce(domain, counter);
        let payload = Payload {
            msg: ciphertext,
            aad: ad,
        };
        match &self.state {
            AeadState::Aes(c) => c.decrypt((&nonce).into(), payload),
            AeadState::ChaCha(c) => c.decrypt((&nonce).into(), payload),
        }
        .map_err(|_| CryptoError::AuthFail)
    }
}

/// Encryption state for one established tunnel
pub struct CryptoTunnel {
    send: SessionKey,
    recv: SessionKey,
    /// Next counter to use on send; data counters start at 1
    send_counter: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl CryptoTunnel {
    /// Build a tunnel from the two directional keys
    pub fn new(
        cipher: Cipher,
        send_key: &[u8; SYMMETRIC_KEY_SIZE],
        recv_key: &[u8; SYMMETRIC_KEY_SIZE],
    ) -> Self {
        Self {
            send: SessionKey::new(cipher, send_key),
            recv: SessionKey::new(cipher, recv_key),
            send_counter: AtomicU64::new(1),
            replay: Mutex::new(ReplayWindow::new()),
        }
    }

    /// Claim the next send counter.
    ///
    /// Counters never wrap: once the ceiling is reached every send fails
    /// until a new handshake replaces the tunnel. The guard band below
    /// u64::MAX keeps concurrent claimers from racing past the wrap.
    pub fn next_counter(&self) -> CryptoResult<u64> {
        const CEILING: u64 = u64::MAX - 4096;
        let c = self.send_counter.fetch_add(1, Ordering::Relaxed);
        if c >= CEILING {
            self.send_counter.store(CEILING, Ordering::Relaxed);
            return Err(CryptoError::CounterExhausted);
        }
        Ok(c)
    }

    /// Current value of the send counter (next to be claimed)
    pub fn send_counter(&self) -> u64 {
        self.send_counter.load(Ordering::Relaxed)
    }

    /// Encrypt an outbound frame under the given counter
    pub fn encrypt(&self, counter: u64, ad: &[u8], plaintext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.send.seal(NONCE_DOMAIN_DATA, counter, ad, plaintext)
    }

    /// Decrypt an inbound frame. Authentication only; call
    /// [`CryptoTunnel::replay_check`] after a successful decrypt.
    pub fn decrypt(&self, counter: u64, ad: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.recv.open(NONCE_DOMAIN_DATA, counter, ad, ciphertext)
    }

    /// Record an authenticated counter in the replay window.
    ///
    /// Only call this after decrypt succeeded, so forged packets cannot
    /// poison the window.
    pub fn replay_check(&self, counter: u64) -> CryptoResult<()> {
        let mut window = self.replay.lock().expect("replay lock poisoned");
        match window.check_and_update(counter) {
            ReplayVerdict::Accept => Ok(()),
            ReplayVerdict::DuplicateOrTooOld => Err(CryptoError::ReplayOrTooOld),
        }
    }
}
