//! Canopy Identity Certificates
//!
//! Signed identity for overlay nodes:
//! - Certificate detail block with canonical encoding and SHA-256
//!   fingerprints
//! - CA pool with blocklist support
//! - PEM handling for certificates and keys, including Argon2id-wrapped
//!   encrypted private keys

pub mod cert;
pub mod error;
pub mod pem;
pub mod pool;

pub use cert::{hex_decode, hex_encode, Certificate, Details, SigningKey, CERT_VERSION};
pub use error::{CertResult, CertificateError};
pub use pool::CaPool;
