//! Key exchange
//!
//! Diffie-Hellman key agreement for tunnel establishment. Curve25519 is
//! the default; P-256 is supported for networks whose CA was minted on
//! that curve. The curve is carried as a tag on every key so a mismatch
//! surfaces as an error instead of garbage shared secrets.

use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{SYMMETRIC_KEY_SIZE, X25519_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// Curve a key lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    Curve25519,
    P256,
}

impl Curve {
    pub fn name(&self) -> &'static str {
        match self {
            Curve::Curve25519 => "curve25519",
            Curve::P256 => "p256",
        }
    }
}

/// A DH public key, tagged with its curve.
///
/// Curve25519 keys are 32 raw bytes; P-256 keys are SEC1-encoded points.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    curve: Curve,
    bytes: Vec<u8>,
}

/// A DH secret key, tagged with its curve
#[derive(ZeroizeOnDrop)]
pub enum SecretKey {
    #[zeroize(skip)]
    Curve25519(StaticSecret),
    #[zeroize(skip)]
    P256(p256::SecretKey),
}

/// A keypair containing both halves
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

/// Shared secret derived from a DH exchange
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; SYMMETRIC_KEY_SIZE],
}

impl PublicKey {
    /// Wrap raw Curve25519 public bytes
    pub fn curve25519(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self {
            curve: Curve::Curve25519,
            bytes: bytes.to_vec(),
        }
    }

    /// Validate and wrap encoded public bytes for the given curve
    pub fn from_bytes(curve: Curve, bytes: &[u8]) -> CryptoResult<Self> {
        match curve {
            Curve::Curve25519 => {
                if bytes.len() != X25519_KEY_SIZE {
                    return Err(CryptoError::InvalidKeyLength {
                        expected: X25519_KEY_SIZE,
                        actual: bytes.len(),
                    });
                }
            }
            Curve::P256 => {
                p256::PublicKey::from_sec1_bytes(bytes)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
            }
        }
        Ok(Self {
            curve,
            bytes: bytes.to_vec(),
        })
    }

    pub fn curve(&self) -> Curve {
        self.curve
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}, {:02x?}...)", self.curve.name(), &self.bytes[..4.min(self.bytes.len())])
    }
}

impl SecretKey {
    /// Generate a new random secret key on the given curve
    pub fn generate(curve: Curve) -> Self {
        match curve {
            Curve::Curve25519 => Self::Curve25519(StaticSecret::random_from_rng(OsRng)),
            Curve::P256 => Self::P256(p256::SecretKey::random(&mut OsRng)),
        }
    }

    /// Rebuild a Curve25519 secret from raw bytes
    pub fn curve25519_from_bytes(bytes: [u8; X25519_KEY_SIZE]) -> Self {
        Self::Curve25519(StaticSecret::from(bytes))
    }

    /// Rebuild a P-256 secret from raw scalar bytes
    pub fn p256_from_bytes(bytes: &[u8]) -> CryptoResult<Self> {
        let sk = p256::SecretKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual: bytes.len(),
        })?;
        Ok(Self::P256(sk))
    }

    pub fn curve(&self) -> Curve {
        match self {
            SecretKey::Curve25519(_) => Curve::Curve25519,
            SecretKey::P256(_) => Curve::P256,
        }
    }

    /// The corresponding public key
    pub fn public_key(&self) -> PublicKey {
        match self {
            SecretKey::Curve25519(sk) => PublicKey {
                curve: Curve::Curve25519,
                bytes: X25519Public::from(sk).to_bytes().to_vec(),
            },
            SecretKey::P256(sk) => PublicKey {
                curve: Curve::P256,
                bytes: sk.public_key().to_encoded_point(false).as_bytes().to_vec(),
            },
        }
    }

    /// Export raw secret bytes (use with caution)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            SecretKey::Curve25519(sk) => sk.to_bytes().to_vec(),
            SecretKey::P256(sk) => sk.to_bytes().to_vec(),
        }
    }

    /// Perform Diffie-Hellman against a peer public key on the same curve
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> CryptoResult<SharedSecret> {
        match (self, their_public.curve) {
            (SecretKey::Curve25519(sk), Curve::Curve25519) => {
                let mut pk = [0u8; X25519_KEY_SIZE];
                pk.copy_from_slice(&their_public.bytes);
                let shared = sk.diffie_hellman(&X25519Public::from(pk));
                Ok(SharedSecret {
                    bytes: shared.to_bytes(),
                })
            }
            (SecretKey::P256(sk), Curve::P256) => {
                let pk = p256::PublicKey::from_sec1_bytes(&their_public.bytes)
                    .map_err(|_| CryptoError::InvalidPublicKey)?;
                let shared =
                    p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
                let mut bytes = [0u8; SYMMETRIC_KEY_SIZE];
                bytes.copy_from_slice(shared.raw_secret_bytes());
                Ok(SharedSecret { bytes })
            }
            _ => Err(CryptoError::CurveMismatch {
                ours: self.curve().name(),
                theirs: their_public.curve.name(),
            }),
        }
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        match self {
            SecretKey::Curve25519(sk) => SecretKey::Curve25519(StaticSecret::from(sk.to_bytes())),
            SecretKey::P256(sk) => SecretKey::P256(sk.clone()),
        }
    }
}

impl KeyPair {
    /// Generate a fresh keypair on the given curve
    pub fn generate(curve: Curve) -> Self {
        let secret = SecretKey::generate(curve);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Build from an existing secret
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self {
            secret: self.secret.clone(),
            public: self.public.clone(),
        }
    }
}

impl SharedSecret {
    pub fn from_bytes(bytes: [u8; SYMMETRIC_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; SYMMETRIC_KEY_SIZE] {
        &self.bytes
    }

    /// Derive one directional key pair from this secret using HKDF-SHA256
    pub fn derive_keys(&self, info: &[u8]) -> DerivedKeys {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hkdf = Hkdf::<Sha256>::new(None, &self.bytes);

        let mut forward_key = [0u8; SYMMETRIC_KEY_SIZE];
        let mut backward_key = [0u8; SYMMETRIC_KEY_SIZE];

        let mut forward_info = info.to_vec();
        forward_info.extend_from_slice(b":forward");
        hkdf.expand(&forward_info, &mut forward_key)
            .expect("HKDF expand failed");

        let mut backward_info = info.to_vec();
        backward_info.extend_from_slice(b":backward");
        hkdf.expand(&backward_info, &mut backward_key)
            .expect("HKDF expand failed");

        DerivedKeys {
            forward_key,
            backward_key,
        }
    }
}

impl Clone for SharedSecret {
    fn clone(&self) -> Self {
        Self { bytes: self.bytes }
    }
}

/// Directional key material derived from a shared secret
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    /// Initiator-to-responder key
    pub forward_key: [u8; SYMMETRIC_KEY_SIZE],
    /// Responder-to-initiator key
    pub backward_key: [u8; SYMMETRIC_KEY_SIZE],
}

/// Combine two shared secrets into one using HKDF-SHA256
pub fn combine_secrets(secret1: &SharedSecret, secret2: &SharedSecret) -> SharedSecret {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let mut combined_input = [0u8; 64];
    combined_input[..32].copy_from_slice(secret1.as_bytes());
    combined_input[32..].copy_from_slice(secret2.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(b"canopy:combine"), &combined_input);
    let mut output = [0u8; SYMMETRIC_KEY_SIZE];
    hkdf.expand(b"combined-secret", &mut output)
        .expect("HKDF expand failed");
    combined_input.zeroize();

    SharedSecret::from_bytes(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_exchange_curve25519() {
        let alice = KeyPair::generate(Curve::Curve25519);
        let bob = KeyPair::generate(Curve::Curve25519);

        let alice_shared = alice.secret.diffie_hellman(&bob.public).unwrap();
        let bob_shared = bob.secret.diffie_hellman(&alice.public).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_key_exchange_p256() {
        let alice = KeyPair::generate(Curve::P256);
        let bob = KeyPair::generate(Curve::P256);

        let alice_shared = alice.secret.diffie_hellman(&bob.public).unwrap();
        let bob_shared = bob.secret.diffie_hellman(&alice.public).unwrap();

        assert_eq!(alice_shared.as_bytes(), bob_shared.as_bytes());
    }

    #[test]
    fn test_curve_mismatch_rejected() {
        let alice = KeyPair::generate(Curve::Curve25519);
        let bob = KeyPair::generate(Curve::P256);

        assert!(matches!(
            alice.secret.diffie_hellman(&bob.public),
            Err(CryptoError::CurveMismatch { .. })
        ));
    }

    #[test]
    fn test_key_derivation_directions_differ() {
        let alice = KeyPair::generate(Curve::Curve25519);
        let bob = KeyPair::generate(Curve::Curve25519);

        let shared = alice.secret.diffie_hellman(&bob.public).unwrap();
        let keys = shared.derive_keys(b"canopy:session");

        assert_ne!(keys.forward_key, keys.backward_key);
    }

    #[test]
    fn test_combine_secrets_is_symmetric_input_order_sensitive() {
        let a = SharedSecret::from_bytes([1u8; 32]);
        let b = SharedSecret::from_bytes([2u8; 32]);

        let ab = combine_secrets(&a, &b);
        let ba = combine_secrets(&b, &a);
        assert_ne!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn test_secret_key_roundtrip() {
        let sk = SecretKey::generate(Curve::Curve25519);
        let bytes = sk.to_bytes();
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&bytes);
        let restored = SecretKey::curve25519_from_bytes(raw);
        assert_eq!(sk.public_key(), restored.public_key());
    }
}
