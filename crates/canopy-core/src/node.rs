//! Node engine
//!
//! Ties the host map, firewall, handshake and connection managers,
//! relay engine and lighthouse client to one UDP transport and one TUN
//! device, and runs the worker loops. Per-packet classification lives
//! in [`crate::dispatch`].

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use canopy_cert::{CaPool, Certificate};
use canopy_crypto::{Cipher, CryptoError, SecretKey};
use canopy_network::header::{Header, PacketType, TEST_SUBTYPE_REQUEST};
use canopy_network::{TunDevice, UdpTransport, HEADER_LEN};

use crate::config::{SendRecvError, Settings};
use crate::connection_manager;
use crate::error::{CoreError, CoreResult};
use crate::firewall::Firewall;
use crate::handshake_manager::HandshakeManager;
use crate::hostmap::{HostInfo, HostMap};
use crate::lighthouse::{LighthouseClient, LighthouseMsg};
use crate::relay::{RelayControlMsg, RelayEngine};
use crate::timerwheel::TimerWheel;

/// How a packet reached us when it came through a relay
#[derive(Debug, Clone, Copy)]
pub struct RelayContext {
    /// Overlay address of the relay that forwarded the frame
    pub via_ip: Ipv4Addr,
    /// Overlay address of the far endpoint on this leg
    pub target: Ipv4Addr,
}

/// Certificate state: swapped wholesale on PKI reload
pub struct PkiState {
    pub cert: Arc<Certificate>,
    pub key: SecretKey,
    pub pool: CaPool,
}

/// Engine counters, snapshot through [`Node::stats`]
#[derive(Default)]
pub(crate) struct Counters {
    pub auth_fail: AtomicU64,
    pub replay_drop: AtomicU64,
    pub parse_drop: AtomicU64,
    pub fw_dropped_in: AtomicU64,
    pub fw_dropped_out: AtomicU64,
    pub recv_error_sent: AtomicU64,
    pub recv_error_recv: AtomicU64,
    pub relays_forwarded: AtomicU64,
    pub relay_refused: AtomicU64,
    pub outbox_flushed: AtomicU64,
    pub counter_exhausted: AtomicU64,
}

/// Point-in-time view of the engine counters
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    pub auth_fail: u64,
    pub replay_drop: u64,
    pub parse_drop: u64,
    pub fw_dropped_in: u64,
    pub fw_dropped_out: u64,
    pub recv_error_sent: u64,
    pub recv_error_recv: u64,
    pub relays_forwarded: u64,
    pub relay_refused: u64,
    pub outbox_flushed: u64,
    pub counter_exhausted: u64,
    pub handshakes_completed: u64,
    pub handshakes_failed: u64,
    pub tunnels: usize,
    pub pending: usize,
}

/// One overlay node's data plane
pub struct Node {
    my_ip: Ipv4Addr,
    cipher: Cipher,
    settings: Settings,

    hostmap: HostMap,
    firewall: RwLock<Arc<Firewall>>,
    pki: RwLock<Arc<PkiState>>,
    relay: RelayEngine,
    handshakes: HandshakeManager,
    lighthouse: LighthouseClient,
    maintenance: Mutex<TimerWheel<u32>>,

    transport: Arc<UdpTransport>,
    tun: Arc<dyn TunDevice>,

    send_recv_error: AtomicU8,
    disconnect_invalid: AtomicBool,

    closed: AtomicBool,
    shutdown: Notify,
    fatal: Notify,
    fatal_flag: AtomicBool,

    reload_lock: Mutex<()>,
    pub(crate) counters: Counters,
}

fn encode_sre(policy: SendRecvError) -> u8 {
    match policy {
        SendRecvError::Always => 0,
        SendRecvError::Never => 1,
        SendRecvError::Private => 2,
    }
}

fn decode_sre(raw: u8) -> SendRecvError {
    match raw {
        1 => SendRecvError::Never,
        2 => SendRecvError::Private,
        _ => SendRecvError::Always,
    }
}

impl Node {
    /// Build a node from validated inputs. Fails on configuration or
    /// certificate problems; never on network state.
    pub fn new(
        settings: Settings,
        cert: Certificate,
        key: SecretKey,
        mut pool: CaPool,
        transport: Arc<UdpTransport>,
        tun: Arc<dyn TunDevice>,
    ) -> CoreResult<Arc<Self>> {
        settings.validate()?;
        let cipher = Cipher::from_name(&settings.cipher)
            .map_err(|_| CoreError::Config(format!("unknown cipher: {}", settings.cipher)))?;

        if key.curve() != cert.details.curve {
            return Err(CoreError::Config(format!(
                "private key curve {} does not match certificate curve {}",
                key.curve().name(),
                cert.details.curve.name()
            )));
        }
        let my_ip = cert
            .primary_ip()
            .ok_or_else(|| CoreError::Config("certificate carries no overlay address".into()))?;

        for fingerprint in &settings.pki.blocklist {
            pool.blocklist_fingerprint(fingerprint);
        }

        let firewall = Firewall::new(&settings.firewall, &cert)?;

        let node = Arc::new(Self {
            my_ip,
            cipher,
            hostmap: HostMap::new(),
            firewall: RwLock::new(Arc::new(firewall)),
            pki: RwLock::new(Arc::new(PkiState {
                cert: Arc::new(cert),
                key,
                pool,
            })),
            relay: RelayEngine::new(settings.relay.am_relay),
            handshakes: HandshakeManager::new(&settings.handshakes),
            lighthouse: LighthouseClient::new(
                settings.lighthouses.clone(),
                settings.handshakes.query_buffer,
            ),
            maintenance: Mutex::new(TimerWheel::new(
                Duration::from_secs(1),
                Duration::from_secs(30),
            )),
            transport,
            tun,
            send_recv_error: AtomicU8::new(encode_sre(settings.send_recv_error)),
            disconnect_invalid: AtomicBool::new(settings.pki.disconnect_invalid),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            fatal: Notify::new(),
            fatal_flag: AtomicBool::new(false),
            reload_lock: Mutex::new(()),
            counters: Counters::default(),
            settings,
        });
        Ok(node)
    }

    pub fn my_ip(&self) -> Ipv4Addr {
        self.my_ip
    }

    pub fn cipher(&self) -> Cipher {
        self.cipher
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn hostmap(&self) -> &HostMap {
        &self.hostmap
    }

    pub fn relay_engine(&self) -> &RelayEngine {
        &self.relay
    }

    pub fn handshakes(&self) -> &HandshakeManager {
        &self.handshakes
    }

    pub fn lighthouse(&self) -> &LighthouseClient {
        &self.lighthouse
    }

    pub fn transport(&self) -> &UdpTransport {
        &self.transport
    }

    pub(crate) fn tun(&self) -> &dyn TunDevice {
        self.tun.as_ref()
    }

    pub fn firewall(&self) -> Arc<Firewall> {
        self.firewall.read().expect("firewall lock poisoned").clone()
    }

    pub fn pki(&self) -> Arc<PkiState> {
        self.pki.read().expect("pki lock poisoned").clone()
    }

    pub(crate) fn maintenance_wheel(&self) -> &Mutex<TimerWheel<u32>> {
        &self.maintenance
    }

    pub fn send_recv_error_policy(&self) -> SendRecvError {
        decode_sre(self.send_recv_error.load(Ordering::Relaxed))
    }

    pub fn disconnect_invalid(&self) -> bool {
        self.disconnect_invalid.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn shutdown_signal(&self) -> tokio::sync::futures::Notified<'_> {
        self.shutdown.notified()
    }

    /// Resolves once a fatal device error occurred; the caller should
    /// exit the process with status 2.
    pub async fn fatal_signal(&self) {
        if self.fatal_flag.load(Ordering::Relaxed) {
            return;
        }
        self.fatal.notified().await;
    }

    pub(crate) fn raise_fatal(&self) {
        self.fatal_flag.store(true, Ordering::Relaxed);
        self.fatal.notify_waiters();
    }

    /// Queue a maintenance check for a tunnel
    pub fn schedule_check(&self, local_index: u32, delay: Duration) {
        self.maintenance
            .lock()
            .expect("maintenance wheel poisoned")
            .add(local_index, delay);
    }

    /// Launch the worker loops. The caller owns the handles; `close`
    /// makes every loop wind down.
    pub fn run(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for routine in 0..self.settings.routines.max(1) {
            let node = self.clone();
            handles.push(tokio::spawn(async move {
                node.udp_loop(routine).await;
            }));
            let node = self.clone();
            handles.push(tokio::spawn(async move {
                node.tun_loop(routine).await;
            }));
        }

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            node.handshakes.run(&node).await;
        }));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            connection_manager::run_maintenance(node).await;
        }));

        let node = self.clone();
        handles.push(tokio::spawn(async move {
            node.lighthouse_loop().await;
        }));

        info!(
            vpn_ip = %self.my_ip,
            routines = self.settings.routines,
            cipher = self.cipher.name(),
            "canopy node is active"
        );
        handles
    }

    /// Idempotent shutdown: workers observe the flag and exit
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(vpn_ip = %self.my_ip, "canopy node shutting down");
        self.shutdown.notify_waiters();
    }

    async fn udp_loop(&self, routine: usize) {
        debug!(routine, "udp worker started");
        loop {
            tokio::select! {
                result = self.transport.recv() => match result {
                    Ok(datagram) => {
                        self.handle_outside_wire(datagram.data, datagram.from, None).await;
                    }
                    Err(e) => {
                        if self.is_closed() {
                            break;
                        }
                        warn!(error = %e, "udp receive error, retrying");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
                _ = self.shutdown_signal() => break,
            }
        }
        debug!(routine, "udp worker stopped");
    }

    async fn tun_loop(&self, routine: usize) {
        debug!(routine, "tun worker started");
        loop {
            tokio::select! {
                result = self.tun.read_packet() => match result {
                    Ok(frame) => self.handle_inside(&frame).await,
                    Err(e) => {
                        if self.is_closed() {
                            break;
                        }
                        // The device is the host interface; once it is
                        // broken there is nothing safe left to do.
                        error!(error = %e, "fatal tun device error");
                        self.raise_fatal();
                        break;
                    }
                },
                _ = self.shutdown_signal() => break,
            }
        }
        debug!(routine, "tun worker stopped");
    }

    async fn lighthouse_loop(&self) {
        let mut update = tokio::time::interval(Duration::from_secs(60));
        update.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                query = self.lighthouse.next_query() => match query {
                    Some(vpn_ip) => self.send_lighthouse_query(vpn_ip).await,
                    None => break,
                },
                _ = update.tick() => self.send_lighthouse_update().await,
                _ = self.shutdown_signal() => break,
            }
        }
    }

    async fn send_lighthouse_query(&self, vpn_ip: Ipv4Addr) {
        let msg = LighthouseMsg::HostQuery { vpn_ip };
        self.send_to_lighthouses(&msg).await;
    }

    async fn send_lighthouse_update(&self) {
        let Ok(addr) = self.transport.local_addr() else {
            return;
        };
        let msg = LighthouseMsg::HostUpdateNotify {
            endpoints: vec![addr],
        };
        self.send_to_lighthouses(&msg).await;
    }

    pub(crate) async fn send_punch_notify(&self, vpn_ip: Ipv4Addr) {
        let Ok(addr) = self.transport.local_addr() else {
            return;
        };
        let msg = LighthouseMsg::HostPunchNotify {
            vpn_ip,
            endpoints: vec![addr],
        };
        self.send_to_lighthouses(&msg).await;
    }

    async fn send_to_lighthouses(&self, msg: &LighthouseMsg) {
        let Ok(bytes) = msg.encode() else {
            return;
        };
        for lighthouse_ip in self.lighthouse.lighthouses() {
            match self.hostmap.query_by_ip(*lighthouse_ip) {
                Some(host) if host.is_established() => {
                    if let Err(e) = self
                        .send_to_host(&host, PacketType::Lighthouse, 0, &bytes)
                        .await
                    {
                        debug!(lighthouse = %lighthouse_ip, error = %e, "lighthouse send failed");
                    }
                }
                _ => self.handshakes.trigger(*lighthouse_ip),
            }
        }
    }

    /// Fire-and-forget raw datagram; transient errors are logged
    pub(crate) async fn send_raw(&self, data: &[u8], addr: std::net::SocketAddr) {
        if let Err(e) = self.transport.send_to(data, addr).await {
            if !self.is_closed() {
                debug!(%addr, error = %e, "udp send failed");
            }
        }
    }

    /// Encrypt and send one payload over an established tunnel
    pub(crate) async fn send_to_host(
        &self,
        host: &HostInfo,
        packet_type: PacketType,
        subtype: u8,
        plaintext: &[u8],
    ) -> CoreResult<()> {
        let tunnel = host
            .tunnel()
            .ok_or(CoreError::PeerNotFound(host.vpn_ip))?;
        let remote_index = host
            .remote_index()
            .ok_or(CoreError::PeerNotFound(host.vpn_ip))?;

        let counter = match tunnel.next_counter() {
            Ok(counter) => counter,
            Err(CryptoError::CounterExhausted) => {
                // The tunnel must re-key before this counter space is
                // reusable; start a fresh handshake and drop the frame.
                self.counters.counter_exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(vpn_ip = %host.vpn_ip, "send counter exhausted, re-keying tunnel");
                Box::pin(self.evict_host(host, false)).await;
                self.handshakes.trigger(host.vpn_ip);
                return Err(CryptoError::CounterExhausted.into());
            }
            Err(e) => return Err(e.into()),
        };

        let header = Header::new(packet_type, subtype, remote_index, counter);
        let header_bytes = header.encode();
        let ciphertext = tunnel.encrypt(counter, &header_bytes, plaintext)?;

        let mut wire = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        wire.extend_from_slice(&header_bytes);
        wire.extend_from_slice(&ciphertext);

        host.record_out();
        self.deliver(host, wire).await
    }

    /// Route a finished wire frame to the peer: direct when we know an
    /// endpoint, through the relay leg otherwise
    pub(crate) async fn deliver(&self, host: &HostInfo, wire: Vec<u8>) -> CoreResult<()> {
        if let Some(addr) = host.remote() {
            self.send_raw(&wire, addr).await;
            return Ok(());
        }
        if let Some(via) = host.via_relay() {
            self.send_via_relay(via, host.vpn_ip, wire).await;
            return Ok(());
        }
        Err(CoreError::PeerNotFound(host.vpn_ip))
    }

    /// Wrap a frame for the relay leg toward `target`
    pub(crate) async fn send_via_relay(&self, via: Ipv4Addr, target: Ipv4Addr, wire: Vec<u8>) {
        let Some(wire_index) = self.relay.wire_index(via, target) else {
            debug!(%via, %target, "no established relay leg, dropping frame");
            return;
        };
        let Some(via_host) = self.hostmap.query_by_ip(via) else {
            return;
        };
        let Some(addr) = via_host.remote() else {
            return;
        };

        let header = Header::new(PacketType::Relay, 0, wire_index, 0);
        let mut out = Vec::with_capacity(HEADER_LEN + wire.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(&wire);
        self.send_raw(&out, addr).await;
    }

    /// Send a relay control message over the tunnel to `to`
    pub(crate) async fn send_relay_control(&self, to: Ipv4Addr, msg: &RelayControlMsg) {
        let Ok(bytes) = bincode::serialize(msg) else {
            return;
        };
        match self.hostmap.query_by_ip(to) {
            Some(host) if host.is_established() => {
                if let Err(e) = self
                    .send_to_host(&host, PacketType::RelayControl, 0, &bytes)
                    .await
                {
                    debug!(%to, error = %e, "relay control send failed");
                }
            }
            _ => debug!(%to, "no tunnel for relay control message"),
        }
    }

    /// Ask `via` to relay our traffic toward `target`
    pub(crate) async fn request_relay(&self, via: Ipv4Addr, target: Ipv4Addr) {
        let msg = match self.relay.request(via, target) {
            RelayControlMsg::Request {
                initiator_index,
                target,
                ..
            } => RelayControlMsg::Request {
                initiator_index,
                initiator: self.my_ip,
                target,
            },
            other => other,
        };
        self.send_relay_control(via, &msg).await;
    }

    /// Probe a specific candidate endpoint directly, bypassing the
    /// relay; an authenticated reply re-roams the tunnel
    pub(crate) async fn send_probe_direct(&self, host: &HostInfo, addr: std::net::SocketAddr) {
        let Some(tunnel) = host.tunnel() else {
            return;
        };
        let Some(remote_index) = host.remote_index() else {
            return;
        };
        let Ok(counter) = tunnel.next_counter() else {
            return;
        };
        let header = Header::new(PacketType::Test, TEST_SUBTYPE_REQUEST, remote_index, counter);
        let header_bytes = header.encode();
        let Ok(ciphertext) = tunnel.encrypt(counter, &header_bytes, b"") else {
            return;
        };
        let mut wire = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        wire.extend_from_slice(&header_bytes);
        wire.extend_from_slice(&ciphertext);
        host.record_out();
        self.send_raw(&wire, addr).await;
    }

    /// Drain and transmit frames staged during a handshake
    pub(crate) async fn flush_outbox(&self, host: &HostInfo) {
        let frames = host.drain_outbox();
        if frames.is_empty() {
            return;
        }
        let count = frames.len() as u64;
        for frame in frames {
            self.send_inner_frame(host, &frame).await;
        }
        self.counters
            .outbox_flushed
            .fetch_add(count, Ordering::Relaxed);
    }

    /// Tear down one tunnel, optionally telling the peer
    pub(crate) async fn evict_host(&self, host: &HostInfo, send_close: bool) {
        if send_close && host.is_established() {
            let _ = self
                .send_to_host(host, PacketType::CloseTunnel, 0, b"")
                .await;
        }
        self.hostmap.delete(host.local_index);
        self.relay.remove_peer(host.vpn_ip);
        info!(vpn_ip = %host.vpn_ip, index = host.local_index, "tunnel closed");
    }

    /// Apply a reloaded configuration: firewall rules, recv_error
    /// policy, invalid-certificate handling and the PKI blocklist. Each
    /// piece swaps atomically; readers see old or new, never a mix.
    pub fn reload(&self, settings: &Settings) -> CoreResult<()> {
        let _guard = self.reload_lock.lock().expect("reload lock poisoned");
        settings.validate()?;

        let pki = self.pki();
        let new_firewall = Firewall::from_reload(&settings.firewall, &pki.cert, &self.firewall())?;
        *self.firewall.write().expect("firewall lock poisoned") = Arc::new(new_firewall);

        self.send_recv_error
            .store(encode_sre(settings.send_recv_error), Ordering::Relaxed);
        self.disconnect_invalid
            .store(settings.pki.disconnect_invalid, Ordering::Relaxed);

        let mut pool = pki.pool.clone();
        pool.reset_blocklist();
        for fingerprint in &settings.pki.blocklist {
            pool.blocklist_fingerprint(fingerprint);
        }
        *self.pki.write().expect("pki lock poisoned") = Arc::new(PkiState {
            cert: pki.cert.clone(),
            key: pki.key.clone(),
            pool,
        });

        info!("configuration reloaded");
        Ok(())
    }

    /// Counter snapshot plus tunnel counts
    pub fn stats(&self) -> NodeStats {
        let (tunnels, pending) = self.hostmap.len();
        NodeStats {
            auth_fail: self.counters.auth_fail.load(Ordering::Relaxed),
            replay_drop: self.counters.replay_drop.load(Ordering::Relaxed),
            parse_drop: self.counters.parse_drop.load(Ordering::Relaxed),
            fw_dropped_in: self.counters.fw_dropped_in.load(Ordering::Relaxed),
            fw_dropped_out: self.counters.fw_dropped_out.load(Ordering::Relaxed),
            recv_error_sent: self.counters.recv_error_sent.load(Ordering::Relaxed),
            recv_error_recv: self.counters.recv_error_recv.load(Ordering::Relaxed),
            relays_forwarded: self.counters.relays_forwarded.load(Ordering::Relaxed),
            relay_refused: self.counters.relay_refused.load(Ordering::Relaxed),
            outbox_flushed: self.counters.outbox_flushed.load(Ordering::Relaxed),
            counter_exhausted: self.counters.counter_exhausted.load(Ordering::Relaxed),
            handshakes_completed: self.handshakes.completed(),
            handshakes_failed: self.handshakes.failed(),
            tunnels,
            pending,
        }
    }
}
