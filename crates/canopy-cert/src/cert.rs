//! Identity certificates
//!
//! A certificate binds a name, a set of overlay networks, routable
//! subnets and groups to a Diffie-Hellman public key, signed by a CA.
//! The detail block has a canonical length-delimited encoding; the
//! SHA-256 of that encoding is the certificate's fingerprint and is how
//! issuers are referenced.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signer as _, Verifier as _};
use ipnet::Ipv4Net;
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

use canopy_crypto::{Curve, PublicKey};

use crate::error::{CertResult, CertificateError};
use crate::pool::CaPool;

/// Serialized certificate version understood by this implementation
pub const CERT_VERSION: u8 = 1;

/// The signed fields of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Details {
    /// Node or CA name
    pub name: String,
    /// Overlay networks; the first entry is the node's primary address
    pub ips: Vec<Ipv4Net>,
    /// Unsafe-route subnets this node may announce
    pub subnets: Vec<Ipv4Net>,
    /// Group memberships consumed by firewall rules
    pub groups: Vec<String>,
    /// Validity window start, unix seconds
    pub not_before: u64,
    /// Validity window end, unix seconds
    pub not_after: u64,
    /// DH public key (nodes) or signature verification key (CAs)
    pub public_key: Vec<u8>,
    /// Whether this certificate may sign others
    pub is_ca: bool,
    /// Hex fingerprint of the signing CA; empty for self-signed roots
    pub issuer: String,
    /// Curve family for both key exchange and signatures
    pub curve: Curve,
}

/// A certificate: signed details plus the signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub details: Details,
    pub signature: Vec<u8>,
}

/// A CA signing key
pub enum SigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    EcdsaP256(p256::ecdsa::SigningKey),
}

impl SigningKey {
    /// Generate a signing key for the given curve family
    pub fn generate(curve: Curve) -> Self {
        match curve {
            Curve::Curve25519 => Self::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng)),
            Curve::P256 => Self::EcdsaP256(p256::ecdsa::SigningKey::random(&mut OsRng)),
        }
    }

    pub fn curve(&self) -> Curve {
        match self {
            Self::Ed25519(_) => Curve::Curve25519,
            Self::EcdsaP256(_) => Curve::P256,
        }
    }

    /// Public verification key bytes, as stored in a CA certificate
    pub fn public_key_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(k) => k.verifying_key().to_bytes().to_vec(),
            Self::EcdsaP256(k) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                k.verifying_key()
                    .to_encoded_point(false)
                    .as_bytes()
                    .to_vec()
            }
        }
    }

    /// Raw private bytes for PEM export
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Ed25519(k) => k.to_keypair_bytes().to_vec(),
            Self::EcdsaP256(k) => k.to_bytes().to_vec(),
        }
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Ed25519(k) => k.sign(message).to_bytes().to_vec(),
            Self::EcdsaP256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(message);
                sig.to_bytes().to_vec()
            }
        }
    }
}

impl Details {
    /// Canonical encoding of the detail block. This is what gets signed
    /// and what the fingerprint is computed over.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(CERT_VERSION);
        buf.put_u8(match self.curve {
            Curve::Curve25519 => 0,
            Curve::P256 => 1,
        });
        put_str(&mut buf, &self.name);

        buf.put_u16(self.ips.len() as u16);
        for net in &self.ips {
            put_net(&mut buf, net);
        }
        buf.put_u16(self.subnets.len() as u16);
        for net in &self.subnets {
            put_net(&mut buf, net);
        }
        buf.put_u16(self.groups.len() as u16);
        for group in &self.groups {
            put_str(&mut buf, group);
        }

        buf.put_u64(self.not_before);
        buf.put_u64(self.not_after);
        put_bytes(&mut buf, &self.public_key);
        buf.put_u8(self.is_ca as u8);
        put_str(&mut buf, &self.issuer);
        buf.to_vec()
    }

    fn decode(buf: &mut Bytes) -> CertResult<Self> {
        let version = get_u8(buf)?;
        if version != CERT_VERSION {
            return Err(CertificateError::UnsupportedVersion(version));
        }
        let curve = match get_u8(buf)? {
            0 => Curve::Curve25519,
            1 => Curve::P256,
            other => {
                return Err(CertificateError::Corrupt(format!(
                    "unknown curve tag: {other}"
                )))
            }
        };
        let name = get_str(buf)?;

        let ips = get_nets(buf)?;
        let subnets = get_nets(buf)?;

        let group_count = get_u16(buf)?;
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            groups.push(get_str(buf)?);
        }

        let not_before = get_u64(buf)?;
        let not_after = get_u64(buf)?;
        let public_key = get_bytes(buf)?;
        let is_ca = get_u8(buf)? != 0;
        let issuer = get_str(buf)?;

        Ok(Self {
            name,
            ips,
            subnets,
            groups,
            not_before,
            not_after,
            public_key,
            is_ca,
            issuer,
            curve,
        })
    }
}

impl Certificate {
    /// Sign a detail block, filling in the issuer fingerprint
    pub fn sign(mut details: Details, ca: Option<&Certificate>, key: &SigningKey) -> CertResult<Self> {
        if let Some(ca) = ca {
            details.issuer = ca.fingerprint();
        }
        if details.curve != key.curve() {
            return Err(CertificateError::InvalidKey(format!(
                "signing key curve {} does not match certificate curve {}",
                key.curve().name(),
                details.curve.name()
            )));
        }
        let signature = key.sign(&details.encode());
        Ok(Self { details, signature })
    }

    /// Mint a self-signed CA certificate
    pub fn self_signed_ca(details: Details, key: &SigningKey) -> CertResult<Self> {
        let mut details = details;
        details.is_ca = true;
        details.public_key = key.public_key_bytes();
        details.issuer = String::new();
        Certificate::sign(details, None, key)
    }

    /// Serialize details + signature, each length-delimited
    pub fn encode(&self) -> Vec<u8> {
        let details = self.details.encode();
        let mut buf = BytesMut::with_capacity(details.len() + self.signature.len() + 4);
        buf.put_u16(details.len() as u16);
        buf.put_slice(&details);
        buf.put_u16(self.signature.len() as u16);
        buf.put_slice(&self.signature);
        buf.to_vec()
    }

    /// Parse a serialized certificate
    pub fn decode(bytes: &[u8]) -> CertResult<Self> {
        let mut buf = Bytes::copy_from_slice(bytes);
        let details_len = get_u16(&mut buf)? as usize;
        if buf.remaining() < details_len {
            return Err(CertificateError::Corrupt("truncated detail block".into()));
        }
        let mut details_buf = buf.copy_to_bytes(details_len);
        let details = Details::decode(&mut details_buf)?;
        if details_buf.has_remaining() {
            return Err(CertificateError::Corrupt(
                "trailing bytes in detail block".into(),
            ));
        }
        let signature = get_bytes(&mut buf)?;
        Ok(Self { details, signature })
    }

    /// Hex SHA-256 fingerprint of the canonical detail block
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.details.encode());
        hex_encode(&digest)
    }

    /// The certificate's DH (node) or verification (CA) public key
    pub fn public_key(&self) -> CertResult<PublicKey> {
        PublicKey::from_bytes(self.details.curve, &self.details.public_key)
            .map_err(|e| CertificateError::InvalidKey(e.to_string()))
    }

    /// The node's primary overlay address (first configured network)
    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.details.ips.first().map(|net| net.addr())
    }

    /// Whether `now` (unix seconds) falls outside the validity window
    pub fn expired(&self, now: u64) -> bool {
        now < self.details.not_before || now > self.details.not_after
    }

    /// Verify this certificate's signature against a signing key
    pub fn check_signature(&self, signer_public: &[u8]) -> CertResult<bool> {
        let message = self.details.encode();
        match self.details.curve {
            Curve::Curve25519 => {
                let key_bytes: [u8; 32] = signer_public
                    .try_into()
                    .map_err(|_| CertificateError::InvalidKey("bad ed25519 key length".into()))?;
                let key = ed25519_dalek::VerifyingKey::from_bytes(&key_bytes)
                    .map_err(|_| CertificateError::InvalidKey("bad ed25519 key".into()))?;
                let sig_bytes: [u8; 64] = self
                    .signature
                    .as_slice()
                    .try_into()
                    .map_err(|_| CertificateError::InvalidSignature)?;
                let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
                Ok(key.verify(&message, &sig).is_ok())
            }
            Curve::P256 => {
                let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(signer_public)
                    .map_err(|_| CertificateError::InvalidKey("bad p256 key".into()))?;
                let sig = p256::ecdsa::Signature::from_slice(&self.signature)
                    .map_err(|_| CertificateError::InvalidSignature)?;
                Ok(key.verify(&message, &sig).is_ok())
            }
        }
    }

    /// Full chain verification: blocklist, issuer lookup, validity
    /// windows, signature, and CA field constraints.
    pub fn verify(&self, now: u64, pool: &CaPool) -> CertResult<()> {
        if pool.is_blocklisted(self) {
            return Err(CertificateError::Blocklisted);
        }

        let ca = pool.get_ca_for_cert(self)?;
        if ca.expired(now) {
            return Err(CertificateError::RootExpired);
        }
        if self.expired(now) {
            return Err(CertificateError::Expired);
        }

        if !self.check_signature(&ca.details.public_key)? {
            return Err(CertificateError::InvalidSignature);
        }

        self.check_constraints(ca)
    }

    /// Enforce that this certificate stays inside the signing CA's
    /// assignments and validity window.
    fn check_constraints(&self, ca: &Certificate) -> CertResult<()> {
        if self.details.not_before < ca.details.not_before {
            return Err(CertificateError::ValidBeforeCa);
        }
        if self.details.not_after > ca.details.not_after {
            return Err(CertificateError::ExpiresAfterCa);
        }

        // An empty constraint list on the CA means unconstrained.
        if !ca.details.ips.is_empty() {
            for net in &self.details.ips {
                if !ca.details.ips.iter().any(|ca_net| ca_net.contains(net)) {
                    return Err(CertificateError::FieldOutsideCa {
                        field: "an ip assignment",
                        value: net.to_string(),
                    });
                }
            }
        }
        if !ca.details.subnets.is_empty() {
            for net in &self.details.subnets {
                if !ca.details.subnets.iter().any(|ca_net| ca_net.contains(net)) {
                    return Err(CertificateError::FieldOutsideCa {
                        field: "a subnet assignment",
                        value: net.to_string(),
                    });
                }
            }
        }
        if !ca.details.groups.is_empty() {
            for group in &self.details.groups {
                if !ca.details.groups.contains(group) {
                    return Err(CertificateError::FieldOutsideCa {
                        field: "a group assignment",
                        value: group.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.put_u16(b.len() as u16);
    buf.put_slice(b);
}

fn put_net(buf: &mut BytesMut, net: &Ipv4Net) {
    buf.put_u32(u32::from(net.addr()));
    buf.put_u8(net.prefix_len());
}

fn get_u8(buf: &mut Bytes) -> CertResult<u8> {
    if buf.remaining() < 1 {
        return Err(CertificateError::Corrupt("short buffer".into()));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> CertResult<u16> {
    if buf.remaining() < 2 {
        return Err(CertificateError::Corrupt("short buffer".into()));
    }
    Ok(buf.get_u16())
}

fn get_u64(buf: &mut Bytes) -> CertResult<u64> {
    if buf.remaining() < 8 {
        return Err(CertificateError::Corrupt("short buffer".into()));
    }
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes) -> CertResult<Vec<u8>> {
    let len = get_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(CertificateError::Corrupt("truncated field".into()));
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn get_str(buf: &mut Bytes) -> CertResult<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes).map_err(|_| CertificateError::Corrupt("invalid utf-8".into()))
}

fn get_nets(buf: &mut Bytes) -> CertResult<Vec<Ipv4Net>> {
    let count = get_u16(buf)?;
    let mut nets = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if buf.remaining() < 5 {
            return Err(CertificateError::Corrupt("truncated network".into()));
        }
        let addr = Ipv4Addr::from(buf.get_u32());
        let prefix = buf.get_u8();
        let net = Ipv4Net::new(addr, prefix)
            .map_err(|_| CertificateError::Corrupt(format!("invalid prefix length: {prefix}")))?;
        nets.push(net);
    }
    Ok(nets)
}

/// Lowercase hex encoding, used for fingerprints
pub fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse a hex string, e.g. a configured blocklist fingerprint
pub fn hex_decode(hex: &str) -> CertResult<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(CertificateError::Corrupt("invalid hex length".into()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| CertificateError::Corrupt("invalid hex character".into()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod test_helpers {
    use super::*;
    use canopy_crypto::KeyPair;

    pub fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Mint a CA and its signing key
    pub fn test_ca(name: &str, ips: Vec<Ipv4Net>, not_before: u64, not_after: u64) -> (Certificate, SigningKey) {
        let key = SigningKey::generate(Curve::Curve25519);
        let ca = Certificate::self_signed_ca(
            Details {
                name: name.to_string(),
                ips,
                subnets: vec![],
                groups: vec![],
                not_before,
                not_after,
                public_key: vec![],
                is_ca: true,
                issuer: String::new(),
                curve: Curve::Curve25519,
            },
            &key,
        )
        .unwrap();
        (ca, key)
    }

    /// Mint a node certificate plus its DH keypair
    pub fn test_node_cert(
        name: &str,
        ip: Ipv4Net,
        groups: Vec<String>,
        ca: &Certificate,
        key: &SigningKey,
        not_before: u64,
        not_after: u64,
    ) -> (Certificate, KeyPair) {
        let dh = KeyPair::generate(Curve::Curve25519);
        let cert = Certificate::sign(
            Details {
                name: name.to_string(),
                ips: vec![ip],
                subnets: vec![],
                groups,
                not_before,
                not_after,
                public_key: dh.public.as_bytes().to_vec(),
                is_ca: false,
                issuer: String::new(),
                curve: Curve::Curve25519,
            },
            Some(ca),
            key,
        )
        .unwrap();
        (cert, dh)
    }
}

#[cfg(test)]
mod tests {
    use super::test_helpers::*;
    use super::*;
    use crate::pool::CaPool;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let t = now();
        let (ca, key) = test_ca("test ca", vec![net("10.0.0.0/16")], t - 10, t + 3600);
        let (cert, _) = test_node_cert(
            "node-a",
            net("10.0.0.1/24"),
            vec!["servers".into(), "db".into()],
            &ca,
            &key,
            t,
            t + 1800,
        );

        let decoded = Certificate::decode(&cert.encode()).unwrap();
        assert_eq!(cert, decoded);
        assert_eq!(cert.fingerprint(), decoded.fingerprint());
    }

    #[test]
    fn test_verify_good_cert() {
        let t = now();
        let (ca, key) = test_ca("ca", vec![net("10.0.0.0/16")], t - 10, t + 3600);
        let (cert, _) = test_node_cert("a", net("10.0.0.1/24"), vec![], &ca, &key, t, t + 1800);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        cert.verify(t + 5, &pool).unwrap();
    }

    #[test]
    fn test_ip_outside_ca_names_cidr() {
        let t = now();
        let (ca, key) = test_ca("ca", vec![net("10.0.0.0/16")], t - 10, t + 3600);
        let (cert, _) = test_node_cert("a", net("10.1.0.0/24"), vec![], &ca, &key, t, t + 1800);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        let err = cert.verify(t + 5, &pool).unwrap_err();
        assert!(err.to_string().contains("10.1.0.0/24"), "got: {err}");
    }

    #[test]
    fn test_expired_root() {
        let t = now();
        let (ca, key) = test_ca("ca", vec![], t - 3600, t - 1);
        let (cert, _) = test_node_cert("a", net("10.0.0.1/24"), vec![], &ca, &key, t - 3600, t - 1);

        let mut pool = CaPool::new();
        // expired CA is still added, with a warning-style error
        assert!(matches!(pool.add_ca(ca), Err(CertificateError::RootExpired)));
        let err = cert.verify(t, &pool).unwrap_err();
        assert_eq!(err.to_string(), "root certificate is expired");
    }

    #[test]
    fn test_tampered_details_fail_signature() {
        let t = now();
        let (ca, key) = test_ca("ca", vec![], t - 10, t + 3600);
        let (mut cert, _) = test_node_cert("a", net("10.0.0.1/24"), vec![], &ca, &key, t, t + 1800);
        cert.details.name = "mallory".into();

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        assert!(matches!(
            cert.verify(t + 5, &pool),
            Err(CertificateError::InvalidSignature)
        ));
    }

    #[test]
    fn test_validity_window_must_nest() {
        let t = now();
        let (ca, key) = test_ca("ca", vec![], t, t + 100);
        let (cert, _) = test_node_cert("a", net("10.0.0.1/24"), vec![], &ca, &key, t, t + 500);

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        assert!(matches!(
            cert.verify(t + 5, &pool),
            Err(CertificateError::ExpiresAfterCa)
        ));
    }

    #[test]
    fn test_group_outside_ca() {
        let t = now();
        let key = SigningKey::generate(Curve::Curve25519);
        let ca = Certificate::self_signed_ca(
            Details {
                name: "ca".into(),
                ips: vec![],
                subnets: vec![],
                groups: vec!["servers".into()],
                not_before: t - 10,
                not_after: t + 3600,
                public_key: vec![],
                is_ca: true,
                issuer: String::new(),
                curve: Curve::Curve25519,
            },
            &key,
        )
        .unwrap();
        let (cert, _) = test_node_cert(
            "a",
            net("10.0.0.1/24"),
            vec!["laptops".into()],
            &ca,
            &key,
            t,
            t + 1800,
        );

        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        let err = cert.verify(t + 5, &pool).unwrap_err();
        assert!(err.to_string().contains("laptops"));
    }

    #[test]
    fn test_p256_sign_verify() {
        let t = now();
        let key = SigningKey::generate(Curve::P256);
        let ca = Certificate::self_signed_ca(
            Details {
                name: "p256 ca".into(),
                ips: vec![],
                subnets: vec![],
                groups: vec![],
                not_before: t - 10,
                not_after: t + 3600,
                public_key: vec![],
                is_ca: true,
                issuer: String::new(),
                curve: Curve::P256,
            },
            &key,
        )
        .unwrap();

        assert!(ca.check_signature(&ca.details.public_key).unwrap());
    }
}
