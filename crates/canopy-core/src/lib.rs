//! Canopy Core Engine
//!
//! The data plane and tunnel lifecycle engine of one overlay node:
//! - Host map indexing live and half-open tunnels
//! - Two-message certificate-tagged handshakes with retries
//! - Connection maintenance: liveness probes, idle reaping, punching
//! - Stateful firewall with lazy conntrack revalidation
//! - Relay establishment and opaque frame forwarding
//! - Packet dispatch between the TUN device and the UDP transport

pub mod config;
pub mod connection_manager;
pub mod dispatch;
pub mod error;
pub mod firewall;
pub mod handshake;
pub mod handshake_manager;
pub mod hostmap;
pub mod lighthouse;
pub mod node;
pub mod relay;
pub mod timerwheel;

pub use config::{FirewallAction, RuleConfig, SendRecvError, Settings};
pub use error::{CoreError, CoreResult};
pub use firewall::{Firewall, FirewallPacket, FirewallStats};
pub use hostmap::{HostInfo, HostMap, Promotion};
pub use lighthouse::{LighthouseClient, LighthouseMsg};
pub use node::{Node, NodeStats, PkiState};
pub use relay::{RelayControlMsg, RelayEngine, RelayRole, RelayState};

#[cfg(test)]
pub(crate) mod test_support {
    use canopy_cert::{CaPool, Certificate, Details, SigningKey};
    use canopy_crypto::{Curve, KeyPair};
    use ipnet::Ipv4Net;

    pub use canopy_cert::CertificateError;

    pub fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    /// Mint a CA and its signing key
    pub fn test_ca(
        name: &str,
        ips: Vec<Ipv4Net>,
        not_before: u64,
        not_after: u64,
    ) -> (Certificate, SigningKey) {
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

    /// Convenience pool holding one CA
    #[allow(dead_code)]
    pub fn pool_with(ca: Certificate) -> CaPool {
        let mut pool = CaPool::new();
        pool.add_ca(ca).unwrap();
        pool
    }
}
