//! Host map
//!
//! Owns every per-peer tunnel record. HostInfos are stored once, keyed
//! by their node-unique local index; the overlay-IP and remote-index
//! maps are projections maintained under the same lock. Components
//! outside the map hold the u32 index and re-resolve, never a direct
//! reference, which keeps teardown single-sited.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use rand::Rng;
use tracing::debug;

use canopy_cert::Certificate;
use canopy_crypto::CryptoTunnel;

/// Frame buffer bounds while a handshake is in flight
pub const OUTBOX_MAX_FRAMES: usize = 32;
pub const OUTBOX_MAX_BYTES: usize = 64 * 1024;

/// Plaintext frames staged while the tunnel comes up
pub struct Outbox {
    frames: VecDeque<Vec<u8>>,
    bytes: usize,
    dropped: u64,
}

impl Outbox {
    fn new() -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            dropped: 0,
        }
    }

    /// Stage a frame; returns false (and counts) when the caps are hit
    pub fn push(&mut self, frame: Vec<u8>) -> bool {
        if self.frames.len() >= OUTBOX_MAX_FRAMES || self.bytes + frame.len() > OUTBOX_MAX_BYTES {
            self.dropped += 1;
            return false;
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        true
    }

    /// Take every staged frame
    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.bytes = 0;
        self.frames.drain(..).collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// One peer tunnel, live or in establishment
pub struct HostInfo {
    /// Peer's primary overlay address
    pub vpn_ip: Ipv4Addr,
    /// Node-unique demux index we hand to the peer
    pub local_index: u32,
    /// Index the peer handed us; 0 while unknown
    remote_index: AtomicU32,

    /// Current remote UDP endpoint
    remote: Mutex<Option<SocketAddr>>,
    /// Candidate endpoints from lighthouse, config or observation
    candidates: Mutex<Vec<SocketAddr>>,
    /// Relay peer carrying this tunnel, if any
    via_relay: Mutex<Option<Ipv4Addr>>,

    tunnel: RwLock<Option<Arc<CryptoTunnel>>>,
    cert: RwLock<Option<Arc<Certificate>>>,

    pub created_at: Instant,
    /// Set when the remote endpoint moved on a live tunnel
    last_roam: Mutex<Option<Instant>>,

    // Liveness counters, written on the fast path
    in_packets: AtomicU64,
    out_packets: AtomicU64,
    last_in_ms: AtomicU64,
    last_out_ms: AtomicU64,
    // Connection-manager bookkeeping
    pub(crate) checked_in: AtomicU64,
    pub(crate) checked_out: AtomicU64,
    pub(crate) probe_pending: AtomicBool,
    pub(crate) promote_marker: AtomicU64,
    pub(crate) seen_rebind_count: AtomicU32,

    /// Firewall rules version at install time
    pub(crate) rules_version: AtomicU32,

    outbox: Mutex<Outbox>,
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HostInfo {
    fn new(vpn_ip: Ipv4Addr, local_index: u32) -> Self {
        Self {
            vpn_ip,
            local_index,
            remote_index: AtomicU32::new(0),
            remote: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            via_relay: Mutex::new(None),
            tunnel: RwLock::new(None),
            cert: RwLock::new(None),
            created_at: Instant::now(),
            last_roam: Mutex::new(None),
            in_packets: AtomicU64::new(0),
            out_packets: AtomicU64::new(0),
            last_in_ms: AtomicU64::new(0),
            last_out_ms: AtomicU64::new(0),
            checked_in: AtomicU64::new(0),
            checked_out: AtomicU64::new(0),
            probe_pending: AtomicBool::new(false),
            promote_marker: AtomicU64::new(0),
            seen_rebind_count: AtomicU32::new(0),
            rules_version: AtomicU32::new(0),
            outbox: Mutex::new(Outbox::new()),
        }
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.lock().expect("remote lock poisoned")
    }

    /// Set the remote endpoint, recording a roam if it moved
    pub fn set_remote(&self, addr: SocketAddr) {
        let mut remote = self.remote.lock().expect("remote lock poisoned");
        if let Some(old) = *remote {
            if old != addr {
                *self.last_roam.lock().expect("roam lock poisoned") = Some(Instant::now());
                debug!(vpn_ip = %self.vpn_ip, %old, new = %addr, "remote endpoint roamed");
            }
        }
        *remote = Some(addr);
    }

    pub fn last_roam(&self) -> Option<Instant> {
        *self.last_roam.lock().expect("roam lock poisoned")
    }

    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.candidates.lock().expect("candidates lock poisoned").clone()
    }

    pub fn add_candidates(&self, addrs: &[SocketAddr]) {
        let mut candidates = self.candidates.lock().expect("candidates lock poisoned");
        for addr in addrs {
            if !candidates.contains(addr) {
                candidates.push(*addr);
            }
        }
    }

    pub fn via_relay(&self) -> Option<Ipv4Addr> {
        *self.via_relay.lock().expect("relay lock poisoned")
    }

    pub fn set_via_relay(&self, relay: Option<Ipv4Addr>) {
        *self.via_relay.lock().expect("relay lock poisoned") = relay;
    }

    pub fn remote_index(&self) -> Option<u32> {
        match self.remote_index.load(Ordering::Acquire) {
            0 => None,
            idx => Some(idx),
        }
    }

    fn store_remote_index(&self, index: u32) {
        self.remote_index.store(index, Ordering::Release);
    }

    pub fn tunnel(&self) -> Option<Arc<CryptoTunnel>> {
        self.tunnel.read().expect("tunnel lock poisoned").clone()
    }

    pub fn set_tunnel(&self, tunnel: Arc<CryptoTunnel>) {
        *self.tunnel.write().expect("tunnel lock poisoned") = Some(tunnel);
    }

    pub fn cert(&self) -> Option<Arc<Certificate>> {
        self.cert.read().expect("cert lock poisoned").clone()
    }

    pub fn set_cert(&self, cert: Arc<Certificate>) {
        *self.cert.write().expect("cert lock poisoned") = Some(cert);
    }

    pub fn fingerprint(&self) -> Option<String> {
        self.cert().map(|c| c.fingerprint())
    }

    /// Tunnel keys present and usable
    pub fn is_established(&self) -> bool {
        self.tunnel.read().expect("tunnel lock poisoned").is_some()
    }

    pub fn record_in(&self) {
        self.in_packets.fetch_add(1, Ordering::Relaxed);
        self.last_in_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_out(&self) {
        self.out_packets.fetch_add(1, Ordering::Relaxed);
        self.last_out_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn in_packets(&self) -> u64 {
        self.in_packets.load(Ordering::Relaxed)
    }

    pub fn out_packets(&self) -> u64 {
        self.out_packets.load(Ordering::Relaxed)
    }

    /// Milliseconds since any traffic in either direction; u64::MAX if
    /// none ever
    pub fn idle_ms(&self) -> u64 {
        let last = self
            .last_in_ms
            .load(Ordering::Relaxed)
            .max(self.last_out_ms.load(Ordering::Relaxed));
        if last == 0 {
            return u64::MAX;
        }
        now_ms().saturating_sub(last)
    }

    /// Stage a frame while the handshake is in flight
    pub fn buffer_frame(&self, frame: Vec<u8>) -> bool {
        self.outbox.lock().expect("outbox lock poisoned").push(frame)
    }

    /// Take the staged frames (promotion flush or failure drop)
    pub fn drain_outbox(&self) -> Vec<Vec<u8>> {
        self.outbox.lock().expect("outbox lock poisoned").drain()
    }

    pub fn outbox_dropped(&self) -> u64 {
        self.outbox.lock().expect("outbox lock poisoned").dropped()
    }
}

/// Outcome of promoting a pending tunnel
pub enum Promotion {
    /// Now the main entry; any supplanted predecessor rides along for
    /// teardown
    Promoted { supplanted: Option<Arc<HostInfo>> },
    /// Tie-break kept the existing tunnel; the pending entry was removed
    KeptExisting(Arc<HostInfo>),
}

#[derive(Default)]
struct Inner {
    /// Owner map: every HostInfo, pending or main, by local index
    hosts: HashMap<u32, Arc<HostInfo>>,
    /// Main tunnels by overlay ip
    by_ip: HashMap<Ipv4Addr, u32>,
    /// Main tunnels by the index the peer assigned
    by_remote_index: HashMap<u32, u32>,
    /// Handshakes in flight by overlay ip
    pending_by_ip: HashMap<Ipv4Addr, u32>,
}

impl Inner {
    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        for idx in self.by_ip.values() {
            debug_assert!(self.hosts.contains_key(idx), "by_ip entry missing host");
        }
        for (remote, idx) in &self.by_remote_index {
            let host = self.hosts.get(idx).expect("by_remote_index entry missing host");
            debug_assert_eq!(host.remote_index(), Some(*remote));
        }
        for idx in self.pending_by_ip.values() {
            debug_assert!(self.hosts.contains_key(idx), "pending entry missing host");
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_invariants(&self) {}
}

/// Index of every tunnel on this node
pub struct HostMap {
    inner: RwLock<Inner>,
}

impl HostMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Create a pending HostInfo for an overlay ip, or return the one
    /// already in flight.
    pub fn add_pending(&self, vpn_ip: Ipv4Addr) -> Arc<HostInfo> {
        let mut inner = self.inner.write().expect("hostmap lock poisoned");
        if let Some(idx) = inner.pending_by_ip.get(&vpn_ip) {
            return inner.hosts[idx].clone();
        }

        let index = Self::allocate_index(&inner);
        let host = Arc::new(HostInfo::new(vpn_ip, index));
        inner.hosts.insert(index, host.clone());
        inner.pending_by_ip.insert(vpn_ip, index);
        inner.check_invariants();
        host
    }

    fn allocate_index(inner: &Inner) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let index: u32 = rng.gen();
            if index != 0 && !inner.hosts.contains_key(&index) {
                return index;
            }
        }
    }

    /// Move a pending entry into the main map.
    ///
    /// When a main entry already exists for the same overlay ip the new
    /// tunnel supplants it, unless both sides clearly raced the same
    /// handshake (same certificate fingerprint, same remote endpoint)
    /// and the new entry carries the numerically lower local index, in
    /// which case the existing tunnel is kept.
    pub fn promote(&self, local_index: u32) -> Option<Promotion> {
        let mut inner = self.inner.write().expect("hostmap lock poisoned");
        let host = inner.hosts.get(&local_index)?.clone();

        match inner.pending_by_ip.get(&host.vpn_ip) {
            Some(idx) if *idx == local_index => {}
            // Not the pending entry for its ip; nothing to promote.
            _ => return None,
        }
        inner.pending_by_ip.remove(&host.vpn_ip);

        let mut supplanted = None;
        if let Some(existing_idx) = inner.by_ip.get(&host.vpn_ip).copied() {
            let existing = inner.hosts[&existing_idx].clone();
            let same_peer = existing.fingerprint() == host.fingerprint()
                && existing.remote() == host.remote();
            if same_peer && host.local_index < existing.local_index {
                // Keep the old tunnel; discard the new one entirely.
                inner.hosts.remove(&local_index);
                inner.check_invariants();
                return Some(Promotion::KeptExisting(existing));
            }

            // Supplant: the old entry leaves the projections and is
            // handed back for teardown.
            inner.by_ip.remove(&host.vpn_ip);
            if let Some(remote) = existing.remote_index() {
                inner.by_remote_index.remove(&remote);
            }
            inner.hosts.remove(&existing_idx);
            supplanted = Some(existing);
        }

        inner.by_ip.insert(host.vpn_ip, local_index);
        if let Some(remote) = host.remote_index() {
            inner.by_remote_index.insert(remote, local_index);
        }
        inner.check_invariants();
        Some(Promotion::Promoted { supplanted })
    }

    /// Record the index the peer assigned to a tunnel
    pub fn set_remote_index(&self, local_index: u32, remote_index: u32) {
        let mut inner = self.inner.write().expect("hostmap lock poisoned");
        let Some(host) = inner.hosts.get(&local_index).cloned() else {
            return;
        };
        if let Some(old) = host.remote_index() {
            inner.by_remote_index.remove(&old);
        }
        host.store_remote_index(remote_index);
        // Only main entries are reachable through the remote-index map.
        if inner.by_ip.get(&host.vpn_ip) == Some(&local_index) {
            inner.by_remote_index.insert(remote_index, local_index);
        }
        inner.check_invariants();
    }

    /// Main-map lookup by overlay ip
    pub fn query_by_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        let idx = inner.by_ip.get(&vpn_ip)?;
        inner.hosts.get(idx).cloned()
    }

    /// Lookup by our own index; finds pending and main entries
    pub fn query_by_local_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        inner.hosts.get(&index).cloned()
    }

    /// Main-map lookup by the index the peer put on the wire
    pub fn query_by_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        let idx = inner.by_remote_index.get(&index)?;
        inner.hosts.get(idx).cloned()
    }

    /// Pending lookup by overlay ip
    pub fn query_pending_by_ip(&self, vpn_ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        let idx = inner.pending_by_ip.get(&vpn_ip)?;
        inner.hosts.get(idx).cloned()
    }

    /// Remove a HostInfo everywhere
    pub fn delete(&self, local_index: u32) -> Option<Arc<HostInfo>> {
        let mut inner = self.inner.write().expect("hostmap lock poisoned");
        let host = inner.hosts.remove(&local_index)?;

        if inner.by_ip.get(&host.vpn_ip) == Some(&local_index) {
            inner.by_ip.remove(&host.vpn_ip);
        }
        if inner.pending_by_ip.get(&host.vpn_ip) == Some(&local_index) {
            inner.pending_by_ip.remove(&host.vpn_ip);
        }
        if let Some(remote) = host.remote_index() {
            if inner.by_remote_index.get(&remote) == Some(&local_index) {
                inner.by_remote_index.remove(&remote);
            }
        }
        inner.check_invariants();
        Some(host)
    }

    /// Every main tunnel
    pub fn snapshot(&self) -> Vec<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        inner
            .by_ip
            .values()
            .filter_map(|idx| inner.hosts.get(idx).cloned())
            .collect()
    }

    /// (main, pending) counts
    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.read().expect("hostmap lock poisoned");
        (inner.by_ip.len(), inner.pending_by_ip.len())
    }

    /// Total owned HostInfos; always at least the main-map size
    pub fn index_len(&self) -> usize {
        self.inner.read().expect("hostmap lock poisoned").hosts.len()
    }
}

impl Default for HostMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[test]
    fn test_pending_then_promote() {
        let map = HostMap::new();
        let host = map.add_pending(ip("10.0.0.2"));

        assert!(map.query_by_ip(ip("10.0.0.2")).is_none());
        assert!(map.query_pending_by_ip(ip("10.0.0.2")).is_some());
        assert!(map.query_by_local_index(host.local_index).is_some());

        map.set_remote_index(host.local_index, 77);
        let Promotion::Promoted { supplanted } = map.promote(host.local_index).unwrap() else {
            panic!("expected promotion");
        };
        assert!(supplanted.is_none());

        assert!(map.query_by_ip(ip("10.0.0.2")).is_some());
        assert!(map.query_pending_by_ip(ip("10.0.0.2")).is_none());
        assert!(map.query_by_remote_index(77).is_some());
    }

    #[test]
    fn test_add_pending_is_idempotent() {
        let map = HostMap::new();
        let a = map.add_pending(ip("10.0.0.2"));
        let b = map.add_pending(ip("10.0.0.2"));
        assert_eq!(a.local_index, b.local_index);
        assert_eq!(map.index_len(), 1);
    }

    #[test]
    fn test_new_tunnel_supplants_old() {
        let map = HostMap::new();

        let old = map.add_pending(ip("10.0.0.2"));
        old.set_remote("192.0.2.1:4242".parse().unwrap());
        map.promote(old.local_index).unwrap();

        // New handshake from a different endpoint wins.
        let new = map.add_pending(ip("10.0.0.2"));
        new.set_remote("192.0.2.9:4242".parse().unwrap());
        let Promotion::Promoted { supplanted } = map.promote(new.local_index).unwrap() else {
            panic!("expected promotion");
        };
        assert_eq!(supplanted.unwrap().local_index, old.local_index);
        assert_eq!(
            map.query_by_ip(ip("10.0.0.2")).unwrap().local_index,
            new.local_index
        );
        // The supplanted entry is fully gone.
        assert!(map.query_by_local_index(old.local_index).is_none());
    }

    #[test]
    fn test_race_tie_break_keeps_lower_index() {
        // Same fingerprint (both None) and same endpoint: the entry with
        // the numerically lower local index survives the race.
        let addr: SocketAddr = "192.0.2.1:4242".parse().unwrap();

        for _ in 0..8 {
            let map = HostMap::new();
            let first = map.add_pending(ip("10.0.0.2"));
            first.set_remote(addr);
            map.promote(first.local_index).unwrap();

            let second = map.add_pending(ip("10.0.0.2"));
            second.set_remote(addr);

            match map.promote(second.local_index).unwrap() {
                Promotion::KeptExisting(kept) => {
                    assert!(second.local_index < first.local_index);
                    assert_eq!(kept.local_index, first.local_index);
                    assert!(map.query_by_local_index(second.local_index).is_none());
                }
                Promotion::Promoted { supplanted } => {
                    assert!(second.local_index > first.local_index);
                    assert_eq!(supplanted.unwrap().local_index, first.local_index);
                }
            }
        }
    }

    #[test]
    fn test_delete_cleans_all_indices() {
        let map = HostMap::new();
        let host = map.add_pending(ip("10.0.0.2"));
        map.set_remote_index(host.local_index, 55);
        map.promote(host.local_index).unwrap();

        map.delete(host.local_index).unwrap();
        assert!(map.query_by_ip(ip("10.0.0.2")).is_none());
        assert!(map.query_by_remote_index(55).is_none());
        assert!(map.query_by_local_index(host.local_index).is_none());
        assert_eq!(map.index_len(), 0);
    }

    #[test]
    fn test_index_superset_invariant() {
        let map = HostMap::new();
        for i in 0..10 {
            let host = map.add_pending(Ipv4Addr::new(10, 0, 0, i + 1));
            if i % 2 == 0 {
                map.promote(host.local_index);
            }
        }
        let (main, pending) = map.len();
        assert_eq!(main, 5);
        assert_eq!(pending, 5);
        assert!(map.index_len() >= main);
    }

    #[test]
    fn test_outbox_bounds() {
        let map = HostMap::new();
        let host = map.add_pending(ip("10.0.0.2"));

        for _ in 0..OUTBOX_MAX_FRAMES {
            assert!(host.buffer_frame(vec![0u8; 10]));
        }
        assert!(!host.buffer_frame(vec![0u8; 10]));
        assert_eq!(host.outbox_dropped(), 1);

        let drained = host.drain_outbox();
        assert_eq!(drained.len(), OUTBOX_MAX_FRAMES);
        // Byte cap, independent of the frame count cap
        assert!(host.buffer_frame(vec![0u8; OUTBOX_MAX_BYTES - 1]));
        assert!(!host.buffer_frame(vec![0u8; 2]));
    }

    #[test]
    fn test_roam_recorded() {
        let map = HostMap::new();
        let host = map.add_pending(ip("10.0.0.2"));
        host.set_remote("192.0.2.1:4242".parse().unwrap());
        assert!(host.last_roam().is_none());

        host.set_remote("192.0.2.1:4242".parse().unwrap());
        assert!(host.last_roam().is_none());

        host.set_remote("198.51.100.7:4242".parse().unwrap());
        assert!(host.last_roam().is_some());
    }
}
