//! Daemon configuration file
//!
//! TOML on disk, converted into the engine's [`Settings`]. Durations
//! are integer milliseconds or seconds in the file.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use canopy_core::config::{
    FirewallAction, FirewallSettings, HandshakeSettings, PkiSettings, RelaySettings, SendRecvError,
    Settings, TunnelSettings,
};
use canopy_core::RuleConfig;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileConfig {
    pub pki: PkiFile,
    #[serde(default)]
    pub listen: ListenFile,
    #[serde(default)]
    pub firewall: FirewallFile,
    #[serde(default)]
    pub handshakes: HandshakesFile,
    #[serde(default)]
    pub tunnels: TunnelsFile,
    #[serde(default)]
    pub relay: RelayFile,
    /// Overlay addresses of the lighthouses
    #[serde(default)]
    pub lighthouses: Vec<Ipv4Addr>,
    /// Statically known peers: overlay address → UDP endpoints
    #[serde(default)]
    pub static_hosts: HashMap<String, Vec<SocketAddr>>,
    /// "aes" or "chachapoly"
    #[serde(default = "default_cipher")]
    pub cipher: String,
    /// Worker loops per direction
    #[serde(default = "default_routines")]
    pub routines: usize,
}

fn default_cipher() -> String {
    "chachapoly".to_string()
}

fn default_routines() -> usize {
    1
}

/// Certificate material and PKI toggles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiFile {
    /// PEM bundle of trusted CA certificates
    pub ca: PathBuf,
    /// This node's certificate
    pub cert: PathBuf,
    /// This node's DH private key
    pub key: PathBuf,
    #[serde(default)]
    pub disconnect_invalid: bool,
    #[serde(default)]
    pub blocklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenFile {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// "always", "never" or "private"
    #[serde(default)]
    pub send_recv_error: Option<String>,
    #[serde(default)]
    pub read_buffer: Option<usize>,
    #[serde(default)]
    pub write_buffer: Option<usize>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4242
}

impl Default for ListenFile {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            send_recv_error: None,
            read_buffer: None,
            write_buffer: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirewallFile {
    #[serde(default)]
    pub conntrack: ConntrackFile,
    #[serde(default)]
    pub inbound_action: Option<String>,
    #[serde(default)]
    pub outbound_action: Option<String>,
    #[serde(default)]
    pub default_local_cidr_any: bool,
    #[serde(default)]
    pub inbound: Vec<RuleConfig>,
    #[serde(default)]
    pub outbound: Vec<RuleConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConntrackFile {
    #[serde(default = "default_tcp_timeout")]
    pub tcp_timeout_secs: u64,
    #[serde(default = "default_udp_timeout")]
    pub udp_timeout_secs: u64,
    #[serde(default = "default_any_timeout")]
    pub default_timeout_secs: u64,
}

fn default_tcp_timeout() -> u64 {
    12 * 60
}

fn default_udp_timeout() -> u64 {
    3 * 60
}

fn default_any_timeout() -> u64 {
    10 * 60
}

impl Default for ConntrackFile {
    fn default() -> Self {
        Self {
            tcp_timeout_secs: default_tcp_timeout(),
            udp_timeout_secs: default_udp_timeout(),
            default_timeout_secs: default_any_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakesFile {
    #[serde(default = "default_try_interval")]
    pub try_interval_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_buffer")]
    pub query_buffer: usize,
    #[serde(default = "default_buffer")]
    pub trigger_buffer: usize,
}

fn default_try_interval() -> u64 {
    100
}

fn default_retries() -> u32 {
    10
}

fn default_buffer() -> usize {
    64
}

impl Default for HandshakesFile {
    fn default() -> Self {
        Self {
            try_interval_ms: default_try_interval(),
            retries: default_retries(),
            query_buffer: default_buffer(),
            trigger_buffer: default_buffer(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelsFile {
    #[serde(default)]
    pub drop_inactive: bool,
    #[serde(default = "default_inactivity")]
    pub inactivity_timeout_secs: u64,
}

fn default_inactivity() -> u64 {
    10 * 60
}

impl Default for TunnelsFile {
    fn default() -> Self {
        Self {
            drop_inactive: false,
            inactivity_timeout_secs: default_inactivity(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayFile {
    #[serde(default)]
    pub am_relay: bool,
    #[serde(default)]
    pub use_relays: bool,
    #[serde(default)]
    pub relays: Vec<Ipv4Addr>,
}

fn parse_action(name: Option<&str>) -> Result<FirewallAction> {
    match name {
        None | Some("drop") => Ok(FirewallAction::Drop),
        Some("reject") => Ok(FirewallAction::Reject),
        Some(other) => anyhow::bail!("unknown firewall action: {other}"),
    }
}

fn parse_send_recv_error(name: Option<&str>) -> Result<SendRecvError> {
    match name {
        None | Some("always") => Ok(SendRecvError::Always),
        Some("never") => Ok(SendRecvError::Never),
        Some("private") => Ok(SendRecvError::Private),
        Some(other) => anyhow::bail!("unknown send_recv_error policy: {other}"),
    }
}

impl FileConfig {
    /// Read and parse the configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Statically configured peers, parsed
    pub fn static_hosts(&self) -> Result<Vec<(Ipv4Addr, Vec<SocketAddr>)>> {
        self.static_hosts
            .iter()
            .map(|(ip, addrs)| {
                let ip: Ipv4Addr = ip
                    .parse()
                    .with_context(|| format!("invalid static host address: {ip}"))?;
                Ok((ip, addrs.clone()))
            })
            .collect()
    }

    /// Convert into the engine settings
    pub fn to_settings(&self) -> Result<Settings> {
        let settings = Settings {
            cipher: self.cipher.clone(),
            routines: self.routines,
            firewall: FirewallSettings {
                conntrack: canopy_core::config::ConntrackTimeouts {
                    tcp: Duration::from_secs(self.firewall.conntrack.tcp_timeout_secs),
                    udp: Duration::from_secs(self.firewall.conntrack.udp_timeout_secs),
                    default: Duration::from_secs(self.firewall.conntrack.default_timeout_secs),
                },
                inbound_action: parse_action(self.firewall.inbound_action.as_deref())?,
                outbound_action: parse_action(self.firewall.outbound_action.as_deref())?,
                default_local_cidr_any: self.firewall.default_local_cidr_any,
                inbound: self.firewall.inbound.clone(),
                outbound: self.firewall.outbound.clone(),
            },
            handshakes: HandshakeSettings {
                try_interval: Duration::from_millis(self.handshakes.try_interval_ms),
                retries: self.handshakes.retries,
                query_buffer: self.handshakes.query_buffer,
                trigger_buffer: self.handshakes.trigger_buffer,
            },
            tunnels: TunnelSettings {
                drop_inactive: self.tunnels.drop_inactive,
                inactivity_timeout: Duration::from_secs(self.tunnels.inactivity_timeout_secs),
            },
            pki: PkiSettings {
                disconnect_invalid: self.pki.disconnect_invalid,
                blocklist: self.pki.blocklist.clone(),
            },
            send_recv_error: parse_send_recv_error(self.listen.send_recv_error.as_deref())?,
            relay: RelaySettings {
                am_relay: self.relay.am_relay,
                use_relays: self.relay.use_relays,
                relays: self.relay.relays.clone(),
            },
            try_promote_every: 1000,
            lighthouses: self.lighthouses.clone(),
        };
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses() {
        let text = r#"
            cipher = "aes"

            [pki]
            ca = "/etc/canopy/ca.crt"
            cert = "/etc/canopy/host.crt"
            key = "/etc/canopy/host.key"

            [listen]
            port = 4242

            [[firewall.outbound]]
            proto = "any"
            port = "any"
            host = "any"

            [[firewall.inbound]]
            proto = "tcp"
            port = "443"
            group = "servers"
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        assert_eq!(config.cipher, "aes");
        assert_eq!(config.firewall.inbound.len(), 1);

        let settings = config.to_settings().unwrap();
        settings.validate().unwrap();
    }

    #[test]
    fn test_bad_action_rejected() {
        let text = r#"
            [pki]
            ca = "ca.crt"
            cert = "host.crt"
            key = "host.key"

            [firewall]
            inbound_action = "bounce"
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        assert!(config.to_settings().is_err());
    }

    #[test]
    fn test_static_hosts_parse() {
        let text = r#"
            [pki]
            ca = "ca.crt"
            cert = "host.crt"
            key = "host.key"

            [static_hosts]
            "10.0.0.5" = ["192.0.2.10:4242"]
        "#;
        let config: FileConfig = toml::from_str(text).unwrap();
        let hosts = config.static_hosts().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].0, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
    }
}
