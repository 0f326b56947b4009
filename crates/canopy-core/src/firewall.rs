//! Stateful firewall
//!
//! Filters cleartext overlay traffic after decryption (inbound) and
//! before encryption (outbound). First matching rule wins and opens a
//! conntrack entry; later packets on the flow ride the entry. A reload
//! installs a new rule set with a bumped version and keeps the conntrack
//! table; entries with a stale version are re-validated against the new
//! rules on their next packet.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tracing::{info, warn};

use canopy_cert::{CaPool, Certificate};

use crate::config::{ConntrackTimeouts, FirewallAction, FirewallSettings, RuleConfig};
use crate::error::{CoreError, CoreResult};

pub const PROTO_ANY: u8 = 0;
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Expiry applied once a TCP flow saw RST or FIN
const TCP_CLOSING_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse a configured protocol name
pub fn parse_proto(name: &str) -> Option<u8> {
    match name {
        "any" => Some(PROTO_ANY),
        "icmp" => Some(PROTO_ICMP),
        "tcp" => Some(PROTO_TCP),
        "udp" => Some(PROTO_UDP),
        _ => None,
    }
}

/// Port selector for one rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Any,
    /// Matches only non-first fragments, which carry no ports
    Fragment,
    Range(u16, u16),
}

/// Parse "any", "fragment", "80" or "200-300"
pub fn parse_port_range(spec: &str) -> Option<PortRange> {
    match spec {
        "any" => Some(PortRange::Any),
        "fragment" => Some(PortRange::Fragment),
        _ => {
            if let Some((low, high)) = spec.split_once('-') {
                let low: u16 = low.trim().parse().ok()?;
                let high: u16 = high.trim().parse().ok()?;
                (low <= high).then_some(PortRange::Range(low, high))
            } else {
                let port: u16 = spec.trim().parse().ok()?;
                Some(PortRange::Range(port, port))
            }
        }
    }
}

/// Parsed 5-tuple of a cleartext overlay packet, direction-relative
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallPacket {
    pub local_ip: Ipv4Addr,
    pub remote_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    pub protocol: u8,
    pub fragment: bool,
    /// TCP RST or FIN seen; shortens the conntrack timer
    pub tcp_closing: bool,
}

/// Conntrack key: the direction-relative tuple is identical for both
/// directions of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ConnKey {
    protocol: u8,
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
}

impl FirewallPacket {
    /// Parse an IPv4 frame into a direction-relative tuple.
    ///
    /// `incoming` packets have local = destination; outgoing packets
    /// have local = source.
    pub fn parse(data: &[u8], incoming: bool) -> CoreResult<Self> {
        if data.len() < 20 {
            return Err(CoreError::MalformedPacket(format!(
                "ip header too short: {} bytes",
                data.len()
            )));
        }
        let version = data[0] >> 4;
        if version != 4 {
            return Err(CoreError::MalformedPacket(format!(
                "unsupported ip version: {version}"
            )));
        }
        let ihl = ((data[0] & 0x0F) as usize) * 4;
        if ihl < 20 || data.len() < ihl {
            return Err(CoreError::MalformedPacket("bad ihl".into()));
        }

        let protocol = data[9];
        let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);

        let flags_frag = u16::from_be_bytes([data[6], data[7]]);
        let fragment = (flags_frag & 0x1FFF) != 0;

        let (mut src_port, mut dst_port) = (0u16, 0u16);
        let mut tcp_closing = false;
        if !fragment && (protocol == PROTO_TCP || protocol == PROTO_UDP) {
            if data.len() < ihl + 4 {
                return Err(CoreError::MalformedPacket("transport header too short".into()));
            }
            src_port = u16::from_be_bytes([data[ihl], data[ihl + 1]]);
            dst_port = u16::from_be_bytes([data[ihl + 2], data[ihl + 3]]);
            if protocol == PROTO_TCP && data.len() >= ihl + 14 {
                let flags = data[ihl + 13];
                tcp_closing = flags & 0x05 != 0; // RST or FIN
            }
        }

        let (local_ip, remote_ip, local_port, remote_port) = if incoming {
            (dst, src, dst_port, src_port)
        } else {
            (src, dst, src_port, dst_port)
        };

        Ok(Self {
            local_ip,
            remote_ip,
            local_port,
            remote_port,
            protocol,
            fragment,
            tcp_closing,
        })
    }

    fn conn_key(&self) -> ConnKey {
        ConnKey {
            protocol: self.protocol,
            local_ip: self.local_ip,
            local_port: self.local_port,
            remote_ip: self.remote_ip,
            remote_port: self.remote_port,
        }
    }
}

/// Restriction on the packet's local address
#[derive(Debug, Clone, Copy)]
enum LocalCidr {
    Any,
    Net(Ipv4Net),
}

struct CompiledRule {
    proto: u8,
    port: PortRange,
    any: bool,
    host: Option<String>,
    group: Option<String>,
    groups: Vec<String>,
    cidr: Option<Ipv4Net>,
    ca_name: Option<String>,
    ca_sha: Option<String>,
    local: LocalCidr,
}

struct ConnEntry {
    expiry: Instant,
    rules_version: u16,
    incoming: bool,
}

#[derive(Default)]
struct Conntrack {
    entries: HashMap<ConnKey, ConnEntry>,
}

/// Snapshot of firewall counters
#[derive(Debug, Clone, Default)]
pub struct FirewallStats {
    pub dropped_inbound: u64,
    pub dropped_outbound: u64,
    pub conntrack_entries: usize,
}

/// One installed rule set plus the shared conntrack table
pub struct Firewall {
    inbound: Vec<CompiledRule>,
    outbound: Vec<CompiledRule>,
    conntrack: Mutex<Conntrack>,
    rules_version: u16,
    timeouts: ConntrackTimeouts,
    inbound_action: FirewallAction,
    outbound_action: FirewallAction,
    dropped_in: AtomicU64,
    dropped_out: AtomicU64,
}

impl Firewall {
    /// Build the initial firewall from settings and the node certificate
    pub fn new(settings: &FirewallSettings, our_cert: &Certificate) -> CoreResult<Self> {
        Self::build(settings, our_cert, 1)
    }

    /// Build a replacement rule set, inheriting the old conntrack table.
    ///
    /// The version is bumped so surviving entries re-validate lazily; a
    /// wrap back to zero flushes the table outright.
    pub fn from_reload(
        settings: &FirewallSettings,
        our_cert: &Certificate,
        old: &Firewall,
    ) -> CoreResult<Self> {
        let version = old.rules_version.wrapping_add(1);
        let fresh = Self::build(settings, our_cert, version)?;
        if version == 0 {
            warn!("firewall rules version wrapped, flushing conntrack");
        } else {
            let mut old_ct = old.conntrack.lock().expect("conntrack lock poisoned");
            let mut new_ct = fresh.conntrack.lock().expect("conntrack lock poisoned");
            new_ct.entries = std::mem::take(&mut old_ct.entries);
        }
        info!(
            rules_version = version,
            inbound = fresh.inbound.len(),
            outbound = fresh.outbound.len(),
            "new firewall has been installed"
        );
        Ok(fresh)
    }

    fn build(settings: &FirewallSettings, our_cert: &Certificate, version: u16) -> CoreResult<Self> {
        // Rules without an explicit local_cidr default to the node's
        // primary overlay address when the certificate carries subnets,
        // unless configured otherwise.
        let default_local = if !settings.default_local_cidr_any
            && !our_cert.details.subnets.is_empty()
        {
            match our_cert.primary_ip() {
                Some(ip) => LocalCidr::Net(
                    Ipv4Net::new(ip, 32).map_err(|e| CoreError::Config(e.to_string()))?,
                ),
                None => LocalCidr::Any,
            }
        } else {
            LocalCidr::Any
        };

        let compile_all = |configs: &[RuleConfig]| -> CoreResult<Vec<CompiledRule>> {
            configs
                .iter()
                .map(|c| Self::compile(c, default_local))
                .collect()
        };

        Ok(Self {
            inbound: compile_all(&settings.inbound)?,
            outbound: compile_all(&settings.outbound)?,
            conntrack: Mutex::new(Conntrack::default()),
            rules_version: version,
            timeouts: settings.conntrack,
            inbound_action: settings.inbound_action,
            outbound_action: settings.outbound_action,
            dropped_in: AtomicU64::new(0),
            dropped_out: AtomicU64::new(0),
        })
    }

    fn compile(config: &RuleConfig, default_local: LocalCidr) -> CoreResult<CompiledRule> {
        let proto = parse_proto(&config.proto)
            .ok_or_else(|| CoreError::Config(format!("unknown protocol: {}", config.proto)))?;
        let port = parse_port_range(&config.port)
            .ok_or_else(|| CoreError::Config(format!("invalid port spec: {}", config.port)))?;

        let any = matches!(config.host.as_deref(), Some("any"))
            || (config.host.is_none()
                && config.group.is_none()
                && config.groups.is_none()
                && config.cidr.is_none());

        Ok(CompiledRule {
            proto,
            port,
            any,
            host: config.host.clone().filter(|h| h != "any"),
            group: config.group.clone(),
            groups: config.groups.clone().unwrap_or_default(),
            cidr: config.cidr,
            ca_name: config.ca_name.clone(),
            ca_sha: config.ca_sha.clone(),
            local: match config.local_cidr {
                Some(net) => LocalCidr::Net(net),
                None => default_local,
            },
        })
    }

    pub fn rules_version(&self) -> u16 {
        self.rules_version
    }

    fn timeout_for(&self, protocol: u8) -> Duration {
        match protocol {
            PROTO_TCP => self.timeouts.tcp,
            PROTO_UDP => self.timeouts.udp,
            _ => self.timeouts.default,
        }
    }

    fn count_drop(&self, incoming: bool) {
        if incoming {
            self.dropped_in.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Admit or deny one packet. `Err` carries the configured action for
    /// the denied direction.
    pub fn check(
        &self,
        packet: &FirewallPacket,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
    ) -> Result<(), FirewallAction> {
        let action = if incoming {
            self.inbound_action
        } else {
            self.outbound_action
        };
        let now = Instant::now();
        let key = packet.conn_key();

        let mut ct = self.conntrack.lock().expect("conntrack lock poisoned");
        if let Some(entry) = ct.entries.get_mut(&key) {
            if now >= entry.expiry {
                ct.entries.remove(&key);
            } else if entry.rules_version == self.rules_version {
                entry.expiry = if packet.tcp_closing {
                    now + TCP_CLOSING_TIMEOUT
                } else {
                    now + self.timeout_for(packet.protocol)
                };
                return Ok(());
            } else {
                // Stale entry: the rules changed underneath this flow.
                // Re-validate against the current set for the flow's
                // original direction.
                let flow_incoming = entry.incoming;
                if self.match_rules(packet, flow_incoming, cert, pool) {
                    entry.rules_version = self.rules_version;
                    entry.expiry = now + self.timeout_for(packet.protocol);
                    return Ok(());
                }
                ct.entries.remove(&key);
                self.count_drop(incoming);
                return Err(action);
            }
        }

        if self.match_rules(packet, incoming, cert, pool) {
            ct.entries.insert(
                key,
                ConnEntry {
                    expiry: now + self.timeout_for(packet.protocol),
                    rules_version: self.rules_version,
                    incoming,
                },
            );
            return Ok(());
        }

        self.count_drop(incoming);
        Err(action)
    }

    fn match_rules(
        &self,
        packet: &FirewallPacket,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
    ) -> bool {
        let rules = if incoming { &self.inbound } else { &self.outbound };
        rules.iter().any(|r| Self::rule_matches(r, packet, incoming, cert, pool))
    }

    fn rule_matches(
        rule: &CompiledRule,
        packet: &FirewallPacket,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
    ) -> bool {
        if rule.proto != PROTO_ANY && rule.proto != packet.protocol {
            return false;
        }

        // The service port: local for inbound flows, remote for outbound.
        let port = if incoming {
            packet.local_port
        } else {
            packet.remote_port
        };
        match rule.port {
            PortRange::Any => {}
            PortRange::Fragment => {
                if !packet.fragment {
                    return false;
                }
            }
            PortRange::Range(low, high) => {
                if packet.fragment || port < low || port > high {
                    return false;
                }
            }
        }

        if let Some(ca_sha) = &rule.ca_sha {
            if !cert.details.issuer.eq_ignore_ascii_case(ca_sha) {
                return false;
            }
        }
        if let Some(ca_name) = &rule.ca_name {
            match pool.get_ca_for_cert(cert) {
                Ok(ca) if &ca.details.name == ca_name => {}
                _ => return false,
            }
        }

        let peer_matches = rule.any
            || rule
                .host
                .as_ref()
                .is_some_and(|h| h == &cert.details.name)
            || rule
                .group
                .as_ref()
                .is_some_and(|g| cert.details.groups.contains(g))
            || (!rule.groups.is_empty()
                && rule.groups.iter().all(|g| cert.details.groups.contains(g)))
            || rule
                .cidr
                .is_some_and(|net| net.contains(&packet.remote_ip));
        if !peer_matches {
            return false;
        }

        match rule.local {
            LocalCidr::Any => true,
            LocalCidr::Net(net) => net.contains(&packet.local_ip),
        }
    }

    /// Drop a flow's conntrack entry, if present
    pub fn remove_conntrack(&self, packet: &FirewallPacket) {
        let mut ct = self.conntrack.lock().expect("conntrack lock poisoned");
        ct.entries.remove(&packet.conn_key());
    }

    /// Remove expired entries; run from the maintenance timer
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut ct = self.conntrack.lock().expect("conntrack lock poisoned");
        let before = ct.entries.len();
        ct.entries.retain(|_, e| now < e.expiry);
        before - ct.entries.len()
    }

    pub fn stats(&self) -> FirewallStats {
        FirewallStats {
            dropped_inbound: self.dropped_in.load(Ordering::Relaxed),
            dropped_outbound: self.dropped_out.load(Ordering::Relaxed),
            conntrack_entries: self
                .conntrack
                .lock()
                .expect("conntrack lock poisoned")
                .entries
                .len(),
        }
    }
}
