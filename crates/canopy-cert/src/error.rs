//! Certificate errors

use thiserror::Error;

/// Errors from certificate parsing, signing and verification
#[derive(Debug, Error)]
pub enum CertificateError {
    /// Certificate is outside its validity window
    #[error("certificate is expired")]
    Expired,

    /// The signing CA is outside its validity window
    #[error("root certificate is expired")]
    RootExpired,

    /// Signature did not verify against the signing key
    #[error("certificate signature did not match")]
    InvalidSignature,

    /// A CA operation was attempted on a non-CA certificate
    #[error("certificate is not a CA")]
    NotCA,

    /// A CA certificate whose signature is not its own
    #[error("certificate is not self-signed")]
    NotSelfSigned,

    /// Serialized certificate carried an unknown version
    #[error("unsupported certificate version: {0}")]
    UnsupportedVersion(u8),

    /// Fingerprint appears on the node's block list
    #[error("certificate is in the block list")]
    Blocklisted,

    /// A field exceeds what the signing CA permits
    #[error("certificate contained {field} outside the limitations of the signing ca: {value}")]
    FieldOutsideCa {
        field: &'static str,
        value: String,
    },

    /// Validity window starts before the signing CA's
    #[error("certificate is valid before the signing certificate")]
    ValidBeforeCa,

    /// Validity window ends after the signing CA's
    #[error("certificate expires after the signing certificate")]
    ExpiresAfterCa,

    /// Certificate names no issuer
    #[error("no issuer in certificate")]
    NoIssuer,

    /// Issuer fingerprint is not in the CA pool
    #[error("could not find ca for the certificate")]
    UnknownIssuer,

    /// Serialized bytes did not decode
    #[error("corrupt certificate: {0}")]
    Corrupt(String),

    /// PEM wrapper was malformed
    #[error("invalid PEM: {0}")]
    InvalidPem(String),

    /// PEM banner is not one this implementation knows
    #[error("unsupported PEM banner: {0}")]
    UnknownBanner(String),

    /// Encrypted private key did not unwrap with the given passphrase
    #[error("invalid passphrase or corrupt private key")]
    InvalidPassphrase,

    /// Key material had an unexpected shape
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

/// Result type for certificate operations
pub type CertResult<T> = Result<T, CertificateError>;
