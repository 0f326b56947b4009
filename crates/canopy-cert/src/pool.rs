//! CA pool and certificate blocklist
//!
//! Holds the trusted root certificates, keyed by fingerprint, plus the
//! set of blocklisted certificate fingerprints. Expired roots are kept
//! in the pool (their children must still resolve an issuer to produce
//! a precise error) but adding one reports a warning-grade error.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::cert::Certificate;
use crate::error::{CertResult, CertificateError};
use crate::pem;

/// Trusted CA certificates and blocklisted fingerprints
#[derive(Clone, Default)]
pub struct CaPool {
    cas: HashMap<String, Certificate>,
    blocklist: HashSet<String>,
}

impl CaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool from PEM bytes holding one or more CA certificates.
    ///
    /// Warning-grade problems (expired roots, tolerated-but-ignored
    /// banners) are returned alongside the pool; the pool itself is an
    /// error only if no usable CA was present.
    pub fn from_pem(pem_bytes: &[u8]) -> CertResult<(Self, Vec<CertificateError>)> {
        let mut pool = Self::new();
        let mut warnings = Vec::new();
        let mut good = 0;

        for cert in pem::certs_from_pem(pem_bytes, &mut warnings)? {
            match pool.add_ca(cert) {
                Ok(()) => good += 1,
                Err(e @ CertificateError::RootExpired) => warnings.push(e),
                Err(e) => return Err(e),
            }
        }

        if good == 0 {
            return Err(CertificateError::InvalidPem(
                "no valid CA certificates present".into(),
            ));
        }
        Ok((pool, warnings))
    }

    /// Verify and insert a CA certificate.
    ///
    /// The certificate must be a self-signed CA. An expired CA is still
    /// inserted but reported as [`CertificateError::RootExpired`] so the
    /// caller can warn.
    pub fn add_ca(&mut self, cert: Certificate) -> CertResult<()> {
        if !cert.details.is_ca {
            return Err(CertificateError::NotCA);
        }
        if !cert.check_signature(&cert.details.public_key)? {
            return Err(CertificateError::NotSelfSigned);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let expired = cert.expired(now);
        if expired {
            warn!(name = %cert.details.name, "adding expired CA certificate to pool");
        }

        self.cas.insert(cert.fingerprint(), cert);

        if expired {
            return Err(CertificateError::RootExpired);
        }
        Ok(())
    }

    /// Add a certificate fingerprint to the blocklist
    pub fn blocklist_fingerprint(&mut self, fingerprint: &str) {
        self.blocklist.insert(fingerprint.to_lowercase());
    }

    /// Drop all blocklisted fingerprints
    pub fn reset_blocklist(&mut self) {
        self.blocklist.clear();
    }

    /// Whether the certificate's fingerprint is blocklisted
    pub fn is_blocklisted(&self, cert: &Certificate) -> bool {
        self.blocklist.contains(&cert.fingerprint())
    }

    /// Find the signing CA for a certificate by issuer fingerprint.
    /// No signature validation is performed here.
    pub fn get_ca_for_cert(&self, cert: &Certificate) -> CertResult<&Certificate> {
        if cert.details.issuer.is_empty() {
            return Err(CertificateError::NoIssuer);
        }
        self.cas
            .get(&cert.details.issuer)
            .ok_or(CertificateError::UnknownIssuer)
    }

    /// Fingerprints of every trusted CA
    pub fn fingerprints(&self) -> Vec<String> {
        self.cas.keys().cloned().collect()
    }

    /// Number of CAs in the pool
    pub fn len(&self) -> usize {
        self.cas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cas.is_empty()
    }
}
