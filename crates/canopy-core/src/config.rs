//! Engine configuration
//!
//! The settings the core consumes, grouped the way the configuration
//! file groups them. Durations arrive as integer seconds/milliseconds
//! from the file layer; here they are real `Duration`s.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// When to answer an unknown remote index with a recv_error packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendRecvError {
    Always,
    Never,
    /// Only to RFC1918 sources, where spoofing is less of a concern
    Private,
}

impl SendRecvError {
    pub fn should_send(&self, remote: std::net::SocketAddr) -> bool {
        match self {
            SendRecvError::Always => true,
            SendRecvError::Never => false,
            SendRecvError::Private => match remote.ip() {
                std::net::IpAddr::V4(ip) => ip.is_private() || ip.is_loopback(),
                std::net::IpAddr::V6(_) => false,
            },
        }
    }
}

impl Default for SendRecvError {
    fn default() -> Self {
        SendRecvError::Always
    }
}

/// What to do with a denied packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Drop,
    Reject,
}

impl Default for FirewallAction {
    fn default() -> Self {
        FirewallAction::Drop
    }
}

/// One firewall rule as configured
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// "any", "tcp", "udp" or "icmp"
    pub proto: String,
    /// "any", "fragment", a single port or "low-high"
    pub port: String,
    /// Peer match: "any" or a certificate name
    #[serde(default)]
    pub host: Option<String>,
    /// Peer match: a single group
    #[serde(default)]
    pub group: Option<String>,
    /// Peer match: every listed group must be present
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    /// Peer match: overlay CIDR
    #[serde(default)]
    pub cidr: Option<Ipv4Net>,
    /// Restrict to certificates issued by this CA name
    #[serde(default)]
    pub ca_name: Option<String>,
    /// Restrict to certificates issued by this CA fingerprint
    #[serde(default)]
    pub ca_sha: Option<String>,
    /// Restrict which local address the rule covers
    #[serde(default)]
    pub local_cidr: Option<Ipv4Net>,
}

/// Conntrack expiry timers
#[derive(Debug, Clone, Copy)]
pub struct ConntrackTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub default: Duration,
}

impl Default for ConntrackTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(12 * 60),
            udp: Duration::from_secs(3 * 60),
            default: Duration::from_secs(10 * 60),
        }
    }
}

/// Firewall settings
#[derive(Debug, Clone, Default)]
pub struct FirewallSettings {
    pub conntrack: ConntrackTimeouts,
    pub inbound_action: FirewallAction,
    pub outbound_action: FirewallAction,
    pub default_local_cidr_any: bool,
    pub inbound: Vec<RuleConfig>,
    pub outbound: Vec<RuleConfig>,
}

/// Handshake pacing
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    /// Base retry interval; attempt n waits n times this
    pub try_interval: Duration,
    pub retries: u32,
    /// In-flight lighthouse query queue depth
    pub query_buffer: usize,
    /// Handshake trigger queue depth
    pub trigger_buffer: usize,
}

impl Default for HandshakeSettings {
    fn default() -> Self {
        Self {
            try_interval: Duration::from_millis(100),
            retries: 10,
            query_buffer: 64,
            trigger_buffer: 64,
        }
    }
}

/// Established-tunnel maintenance
#[derive(Debug, Clone, Copy)]
pub struct TunnelSettings {
    pub drop_inactive: bool,
    pub inactivity_timeout: Duration,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            drop_inactive: false,
            inactivity_timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// PKI behavior toggles
#[derive(Debug, Clone, Default)]
pub struct PkiSettings {
    /// Evict tunnels whose certificate has gone invalid
    pub disconnect_invalid: bool,
    /// Hex fingerprints of blocklisted certificates
    pub blocklist: Vec<String>,
}

/// Relay participation
#[derive(Debug, Clone, Default)]
pub struct RelaySettings {
    /// Forward frames on behalf of other nodes
    pub am_relay: bool,
    /// Fall back to relays when direct paths fail
    pub use_relays: bool,
    /// Overlay addresses of the relays this node may use
    pub relays: Vec<Ipv4Addr>,
}

/// Everything the engine consumes
#[derive(Debug, Clone)]
pub struct Settings {
    /// "aes" or "chachapoly"; network-wide
    pub cipher: String,
    /// Symmetric worker loops
    pub routines: usize,
    pub firewall: FirewallSettings,
    pub handshakes: HandshakeSettings,
    pub tunnels: TunnelSettings,
    pub pki: PkiSettings,
    pub send_recv_error: SendRecvError,
    pub relay: RelaySettings,
    /// Attempt a direct path every n inbound packets on a relayed tunnel
    pub try_promote_every: u64,
    /// Overlay addresses of the lighthouses
    pub lighthouses: Vec<Ipv4Addr>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cipher: "chachapoly".to_string(),
            routines: 1,
            firewall: FirewallSettings::default(),
            handshakes: HandshakeSettings::default(),
            tunnels: TunnelSettings::default(),
            pki: PkiSettings::default(),
            send_recv_error: SendRecvError::default(),
            relay: RelaySettings::default(),
            try_promote_every: 1000,
            lighthouses: Vec::new(),
        }
    }
}

impl Settings {
    /// Validate the parts that cannot be checked lazily
    pub fn validate(&self) -> CoreResult<()> {
        canopy_crypto::Cipher::from_name(&self.cipher)
            .map_err(|_| CoreError::Config(format!("unknown cipher: {}", self.cipher)))?;

        if self.routines == 0 {
            return Err(CoreError::Config("routines must be at least 1".into()));
        }
        if self.handshakes.retries == 0 {
            return Err(CoreError::Config("handshakes.retries must be at least 1".into()));
        }
        if self.handshakes.trigger_buffer == 0 || self.handshakes.query_buffer == 0 {
            return Err(CoreError::Config("handshake buffers must be nonzero".into()));
        }

        for fp in &self.pki.blocklist {
            let bytes = canopy_cert::hex_decode(fp)
                .map_err(|_| CoreError::Config(format!("invalid blocklist fingerprint: {fp}")))?;
            if bytes.len() != 32 {
                return Err(CoreError::Config(format!(
                    "blocklist fingerprint has wrong length: {fp}"
                )));
            }
        }

        for rule in self.firewall.inbound.iter().chain(&self.firewall.outbound) {
            crate::firewall::parse_proto(&rule.proto)
                .ok_or_else(|| CoreError::Config(format!("unknown protocol: {}", rule.proto)))?;
            crate::firewall::parse_port_range(&rule.port)
                .ok_or_else(|| CoreError::Config(format!("invalid port spec: {}", rule.port)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_bad_cipher_rejected() {
        let settings = Settings {
            cipher: "rot13".into(),
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_bad_blocklist_rejected() {
        let settings = Settings {
            pki: PkiSettings {
                blocklist: vec!["zz".into()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_send_recv_error_policy() {
        let private: std::net::SocketAddr = "192.168.1.5:4242".parse().unwrap();
        let public: std::net::SocketAddr = "8.8.8.8:4242".parse().unwrap();

        assert!(SendRecvError::Always.should_send(public));
        assert!(!SendRecvError::Never.should_send(private));
        assert!(SendRecvError::Private.should_send(private));
        assert!(!SendRecvError::Private.should_send(public));
    }

    #[test]
    fn test_bad_rule_rejected() {
        let mut settings = Settings::default();
        settings.firewall.inbound.push(RuleConfig {
            proto: "sctp".into(),
            port: "any".into(),
            host: None,
            group: None,
            groups: None,
            cidr: None,
            ca_name: None,
            ca_sha: None,
            local_cidr: None,
        });
        assert!(settings.validate().is_err());
    }
}
