//! PEM encoding for certificates and keys
//!
//! Banner set:
//! - `NEBULA CERTIFICATE` (v1; a `NEBULA CERTIFICATE V2` block is
//!   tolerated but ignored with a warning)
//! - `NEBULA {ED25519|ECDSA P256} PRIVATE KEY` (CA signing keys)
//! - `NEBULA {X25519|P256} {PRIVATE|PUBLIC} KEY` (node DH keys)
//! - `NEBULA ED25519 ENCRYPTED PRIVATE KEY` (Argon2id-wrapped
//!   AES-256-GCM, parameters embedded in the record)

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm,
};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::warn;
use zeroize::Zeroizing;

use canopy_crypto::Curve;

use crate::cert::{Certificate, SigningKey};
use crate::error::{CertResult, CertificateError};

pub const CERT_BANNER: &str = "NEBULA CERTIFICATE";
pub const CERT_V2_BANNER: &str = "NEBULA CERTIFICATE V2";

pub const ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 PRIVATE KEY";
pub const ECDSA_P256_PRIVATE_KEY_BANNER: &str = "NEBULA ECDSA P256 PRIVATE KEY";
pub const ENCRYPTED_ED25519_PRIVATE_KEY_BANNER: &str = "NEBULA ED25519 ENCRYPTED PRIVATE KEY";

pub const X25519_PRIVATE_KEY_BANNER: &str = "NEBULA X25519 PRIVATE KEY";
pub const X25519_PUBLIC_KEY_BANNER: &str = "NEBULA X25519 PUBLIC KEY";
pub const P256_PRIVATE_KEY_BANNER: &str = "NEBULA P256 PRIVATE KEY";
pub const P256_PUBLIC_KEY_BANNER: &str = "NEBULA P256 PUBLIC KEY";

fn encode_block(banner: &str, contents: Vec<u8>) -> String {
    pem::encode(&pem::Pem::new(banner, contents))
}

fn parse_one(bytes: &[u8]) -> CertResult<pem::Pem> {
    pem::parse(bytes).map_err(|e| CertificateError::InvalidPem(e.to_string()))
}

/// Serialize a certificate into a PEM block
pub fn cert_to_pem(cert: &Certificate) -> String {
    encode_block(CERT_BANNER, cert.encode())
}

/// Parse a single certificate PEM block
pub fn cert_from_pem(bytes: &[u8]) -> CertResult<Certificate> {
    let block = parse_one(bytes)?;
    match block.tag() {
        CERT_BANNER => Certificate::decode(block.contents()),
        CERT_V2_BANNER => Err(CertificateError::UnsupportedVersion(2)),
        other => Err(CertificateError::UnknownBanner(other.to_string())),
    }
}

/// Parse every certificate block in a PEM bundle.
///
/// V2 blocks are skipped with a warning pushed onto `warnings`; any other
/// foreign banner is an error.
pub fn certs_from_pem(
    bytes: &[u8],
    warnings: &mut Vec<CertificateError>,
) -> CertResult<Vec<Certificate>> {
    let blocks = pem::parse_many(bytes).map_err(|e| CertificateError::InvalidPem(e.to_string()))?;
    let mut certs = Vec::with_capacity(blocks.len());
    for block in blocks {
        match block.tag() {
            CERT_BANNER => certs.push(Certificate::decode(block.contents())?),
            CERT_V2_BANNER => {
                warn!("ignoring v2 certificate block in PEM bundle");
                warnings.push(CertificateError::UnsupportedVersion(2));
            }
            other => return Err(CertificateError::UnknownBanner(other.to_string())),
        }
    }
    Ok(certs)
}

/// Serialize a CA signing key
pub fn signing_key_to_pem(key: &SigningKey) -> String {
    match key {
        SigningKey::Ed25519(_) => encode_block(ED25519_PRIVATE_KEY_BANNER, key.to_bytes()),
        SigningKey::EcdsaP256(_) => encode_block(ECDSA_P256_PRIVATE_KEY_BANNER, key.to_bytes()),
    }
}

/// Parse a CA signing key from its PEM block
pub fn signing_key_from_pem(bytes: &[u8]) -> CertResult<SigningKey> {
    let block = parse_one(bytes)?;
    match block.tag() {
        ED25519_PRIVATE_KEY_BANNER => signing_key_from_ed25519_bytes(block.contents()),
        ECDSA_P256_PRIVATE_KEY_BANNER => {
            let key = p256::ecdsa::SigningKey::from_slice(block.contents())
                .map_err(|_| CertificateError::InvalidKey("bad p256 signing key".into()))?;
            Ok(SigningKey::EcdsaP256(key))
        }
        other => Err(CertificateError::UnknownBanner(other.to_string())),
    }
}

fn signing_key_from_ed25519_bytes(contents: &[u8]) -> CertResult<SigningKey> {
    let raw: [u8; 64] = contents
        .try_into()
        .map_err(|_| CertificateError::InvalidKey("bad ed25519 keypair length".into()))?;
    let key = ed25519_dalek::SigningKey::from_keypair_bytes(&raw)
        .map_err(|_| CertificateError::InvalidKey("bad ed25519 keypair".into()))?;
    Ok(SigningKey::Ed25519(key))
}

/// Serialize a node DH private key
pub fn private_key_to_pem(curve: Curve, key: &[u8]) -> String {
    let banner = match curve {
        Curve::Curve25519 => X25519_PRIVATE_KEY_BANNER,
        Curve::P256 => P256_PRIVATE_KEY_BANNER,
    };
    encode_block(banner, key.to_vec())
}

/// Parse a node DH private key, returning the curve it belongs to
pub fn private_key_from_pem(bytes: &[u8]) -> CertResult<(Curve, Vec<u8>)> {
    let block = parse_one(bytes)?;
    match block.tag() {
        X25519_PRIVATE_KEY_BANNER => Ok((Curve::Curve25519, block.contents().to_vec())),
        P256_PRIVATE_KEY_BANNER => Ok((Curve::P256, block.contents().to_vec())),
        other => Err(CertificateError::UnknownBanner(other.to_string())),
    }
}

/// Serialize a node DH public key
pub fn public_key_to_pem(curve: Curve, key: &[u8]) -> String {
    let banner = match curve {
        Curve::Curve25519 => X25519_PUBLIC_KEY_BANNER,
        Curve::P256 => P256_PUBLIC_KEY_BANNER,
    };
    encode_block(banner, key.to_vec())
}

/// Parse a node DH public key, returning the curve it belongs to
pub fn public_key_from_pem(bytes: &[u8]) -> CertResult<(Curve, Vec<u8>)> {
    let block = parse_one(bytes)?;
    match block.tag() {
        X25519_PUBLIC_KEY_BANNER => Ok((Curve::Curve25519, block.contents().to_vec())),
        P256_PUBLIC_KEY_BANNER => Ok((Curve::P256, block.contents().to_vec())),
        other => Err(CertificateError::UnknownBanner(other.to_string())),
    }
}

/// Argon2id cost parameters for encrypted private keys
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Argon2Options {
    /// Memory in KiB
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Argon2Options {
    fn default() -> Self {
        Self {
            memory: 64 * 1024,
            iterations: 3,
            parallelism: 4,
        }
    }
}

/// The first (and only) record of an encrypted private key block
#[derive(Serialize, Deserialize)]
struct EncryptedKeyRecord {
    options: Argon2Options,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn derive_wrap_key(
    passphrase: &[u8],
    salt: &[u8],
    options: Argon2Options,
) -> CertResult<Zeroizing<[u8; 32]>> {
    let params = Params::new(options.memory, options.iterations, options.parallelism, Some(32))
        .map_err(|e| CertificateError::InvalidKey(format!("bad argon2 parameters: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut key = [0u8; 32];
    argon
        .hash_password_into(passphrase, salt, &mut key)
        .map_err(|e| CertificateError::InvalidKey(format!("argon2 failure: {e}")))?;
    Ok(Zeroizing::new(key))
}

/// Wrap an Ed25519 signing key under a passphrase
pub fn encrypted_signing_key_to_pem(
    key: &SigningKey,
    passphrase: &[u8],
    options: Argon2Options,
) -> CertResult<String> {
    if !matches!(key, SigningKey::Ed25519(_)) {
        return Err(CertificateError::InvalidKey(
            "only ed25519 keys support passphrase encryption".into(),
        ));
    }

    let mut salt = vec![0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut salt);
    let mut nonce = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let wrap_key = derive_wrap_key(passphrase, &salt, options)?;
    let cipher = Aes256Gcm::new_from_slice(&*wrap_key)
        .map_err(|_| CertificateError::InvalidKey("bad wrap key".into()))?;
    let ciphertext = cipher
        .encrypt(&nonce.into(), key.to_bytes().as_slice())
        .map_err(|_| CertificateError::InvalidKey("key encryption failed".into()))?;

    let record = EncryptedKeyRecord {
        options,
        salt,
        nonce: nonce.to_vec(),
        ciphertext,
    };
    let contents = bincode::serialize(&record)
        .map_err(|e| CertificateError::InvalidKey(e.to_string()))?;
    Ok(encode_block(ENCRYPTED_ED25519_PRIVATE_KEY_BANNER, contents))
}

/// Unwrap a passphrase-encrypted Ed25519 signing key
pub fn encrypted_signing_key_from_pem(bytes: &[u8], passphrase: &[u8]) -> CertResult<SigningKey> {
    let block = parse_one(bytes)?;
    if block.tag() != ENCRYPTED_ED25519_PRIVATE_KEY_BANNER {
        return Err(CertificateError::UnknownBanner(block.tag().to_string()));
    }

    let record: EncryptedKeyRecord = bincode::deserialize(block.contents())
        .map_err(|e| CertificateError::InvalidPem(e.to_string()))?;
    let nonce: [u8; 12] = record
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| CertificateError::InvalidPem("bad nonce length".into()))?;

    let wrap_key = derive_wrap_key(passphrase, &record.salt, record.options)?;
    let cipher = Aes256Gcm::new_from_slice(&*wrap_key)
        .map_err(|_| CertificateError::InvalidKey("bad wrap key".into()))?;
    let plaintext = cipher
        .decrypt(&nonce.into(), record.ciphertext.as_slice())
        .map_err(|_| CertificateError::InvalidPassphrase)?;

    signing_key_from_ed25519_bytes(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert::test_helpers::*;

    fn light_options() -> Argon2Options {
        Argon2Options {
            memory: 8 * 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_cert_pem_roundtrip() {
        let t = now();
        let (ca, _) = test_ca("ca", vec!["10.0.0.0/8".parse().unwrap()], t, t + 3600);

        let text = cert_to_pem(&ca);
        assert!(text.contains("-----BEGIN NEBULA CERTIFICATE-----"));

        let parsed = cert_from_pem(text.as_bytes()).unwrap();
        assert_eq!(ca, parsed);
    }

    #[test]
    fn test_v2_banner_skipped_with_warning() {
        let t = now();
        let (ca, _) = test_ca("ca", vec![], t, t + 3600);

        let mut bundle = cert_to_pem(&ca);
        bundle.push_str(&encode_block(CERT_V2_BANNER, vec![1, 2, 3]));

        let mut warnings = Vec::new();
        let certs = certs_from_pem(bundle.as_bytes(), &mut warnings).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(matches!(
            warnings.as_slice(),
            [CertificateError::UnsupportedVersion(2)]
        ));
    }

    #[test]
    fn test_unknown_banner_rejected() {
        let text = encode_block("RSA PRIVATE KEY", vec![0u8; 16]);
        assert!(matches!(
            cert_from_pem(text.as_bytes()),
            Err(CertificateError::UnknownBanner(_))
        ));
    }

    #[test]
    fn test_signing_key_pem_roundtrip() {
        for curve in [canopy_crypto::Curve::Curve25519, canopy_crypto::Curve::P256] {
            let key = SigningKey::generate(curve);
            let text = signing_key_to_pem(&key);
            let parsed = signing_key_from_pem(text.as_bytes()).unwrap();
            assert_eq!(key.public_key_bytes(), parsed.public_key_bytes());
        }
    }

    #[test]
    fn test_dh_key_pem_roundtrip() {
        use canopy_crypto::{Curve, KeyPair};

        let pair = KeyPair::generate(Curve::Curve25519);
        let secret_bytes = pair.secret.to_bytes();

        let text = private_key_to_pem(Curve::Curve25519, &secret_bytes);
        assert!(text.contains("NEBULA X25519 PRIVATE KEY"));
        let (curve, parsed) = private_key_from_pem(text.as_bytes()).unwrap();
        assert_eq!(curve, Curve::Curve25519);
        assert_eq!(parsed, secret_bytes);

        let text = public_key_to_pem(Curve::P256, pair.public.as_bytes());
        assert!(text.contains("NEBULA P256 PUBLIC KEY"));
    }

    #[test]
    fn test_encrypted_key_roundtrip() {
        let key = SigningKey::generate(canopy_crypto::Curve::Curve25519);
        let text =
            encrypted_signing_key_to_pem(&key, b"open sesame", light_options()).unwrap();
        assert!(text.contains("NEBULA ED25519 ENCRYPTED PRIVATE KEY"));

        let parsed = encrypted_signing_key_from_pem(text.as_bytes(), b"open sesame").unwrap();
        assert_eq!(key.public_key_bytes(), parsed.public_key_bytes());
    }

    #[test]
    fn test_encrypted_key_wrong_passphrase() {
        let key = SigningKey::generate(canopy_crypto::Curve::Curve25519);
        let text =
            encrypted_signing_key_to_pem(&key, b"open sesame", light_options()).unwrap();

        assert!(matches!(
            encrypted_signing_key_from_pem(text.as_bytes(), b"wrong"),
            Err(CertificateError::InvalidPassphrase)
        ));
    }
}
