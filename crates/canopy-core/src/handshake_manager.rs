//! Handshake manager
//!
//! Drives the per-peer handshake state machine: a bounded trigger
//! channel lets the data path demand a tunnel on first use, a 100 ms
//! timer wheel paces retries on a linear schedule, and pending frames
//! stage in the HostInfo outbox until promotion flushes them.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use canopy_network::header::{
    Header, PacketType, HANDSHAKE_SUBTYPE_STAGE1, HANDSHAKE_SUBTYPE_STAGE2,
};

use crate::config::HandshakeSettings;
use crate::error::CoreResult;
use crate::handshake::{self, HandshakeContext, InitiatorState};
use crate::hostmap::Promotion;
use crate::node::{Node, RelayContext};
use crate::timerwheel::TimerWheel;

/// First maintenance check after promotion
pub const TRUST_CHECK_AFTER: Duration = Duration::from_secs(7);

struct Pending {
    state: InitiatorState,
    stage1_payload: Vec<u8>,
    attempts: u32,
}

/// Per-node handshake driver
pub struct HandshakeManager {
    states: Mutex<HashMap<Ipv4Addr, Pending>>,
    trigger_tx: mpsc::Sender<Ipv4Addr>,
    trigger_rx: AsyncMutex<mpsc::Receiver<Ipv4Addr>>,
    wheel: Mutex<TimerWheel<Ipv4Addr>>,
    try_interval: Duration,
    retries: u32,
    dropped_triggers: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl HandshakeManager {
    pub fn new(settings: &HandshakeSettings) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(settings.trigger_buffer.max(1));
        // Wheel must cover the whole linear retry window.
        let span = settings
            .try_interval
            .saturating_mul(settings.retries * (settings.retries + 1) / 2 + 2);
        Self {
            states: Mutex::new(HashMap::new()),
            trigger_tx,
            trigger_rx: AsyncMutex::new(trigger_rx),
            wheel: Mutex::new(TimerWheel::new(Duration::from_millis(100), span)),
            try_interval: settings.try_interval,
            retries: settings.retries,
            dropped_triggers: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Demand a handshake now; safe from the packet fast path
    pub fn trigger(&self, vpn_ip: Ipv4Addr) {
        if self.trigger_tx.try_send(vpn_ip).is_err() {
            self.dropped_triggers.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn dropped_triggers(&self) -> u64 {
        self.dropped_triggers.load(Ordering::Relaxed)
    }

    /// Main loop: triggers plus the retry wheel
    pub async fn run(&self, node: &Node) {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let trigger = {
                let mut rx = self.trigger_rx.lock().await;
                tokio::select! {
                    ip = rx.recv() => match ip {
                        Some(ip) => Some(ip),
                        None => return,
                    },
                    _ = tick.tick() => None,
                    _ = node.shutdown_signal() => return,
                }
            };

            if node.is_closed() {
                return;
            }

            match trigger {
                Some(ip) => self.start(node, ip).await,
                None => {
                    let mut due = Vec::new();
                    self.wheel
                        .lock()
                        .expect("handshake wheel poisoned")
                        .advance(std::time::Instant::now(), &mut due);
                    for ip in due {
                        self.retry(node, ip).await;
                    }
                }
            }
        }
    }

    /// Begin (or join) a handshake toward `vpn_ip`
    async fn start(&self, node: &Node, vpn_ip: Ipv4Addr) {
        if vpn_ip == node.my_ip() {
            return;
        }
        if let Some(existing) = node.hostmap().query_by_ip(vpn_ip) {
            if existing.is_established() {
                return;
            }
        }

        let host = node.hostmap().add_pending(vpn_ip);

        {
            let mut states = self.states.lock().expect("handshake states poisoned");
            if states.contains_key(&vpn_ip) {
                // Already in flight; the wheel owns pacing.
                return;
            }

            let pki = node.pki();
            let ctx = HandshakeContext {
                cipher: node.cipher(),
                our_cert: &pki.cert,
                our_key: &pki.key,
                pool: &pki.pool,
            };
            let (state, stage1_payload) = match handshake::create_stage1(&ctx, host.local_index) {
                Ok(v) => v,
                Err(e) => {
                    warn!(%vpn_ip, error = %e, "could not build handshake");
                    return;
                }
            };
            states.insert(
                vpn_ip,
                Pending {
                    state,
                    stage1_payload,
                    attempts: 0,
                },
            );
        }

        debug!(%vpn_ip, index = host.local_index, "handshake queued");
        self.prepare_path(node, vpn_ip).await;
        self.send_stage1(node, vpn_ip).await;
        self.wheel
            .lock()
            .expect("handshake wheel poisoned")
            .add(vpn_ip, self.try_interval);
    }

    /// Resolve how stage-1 frames can reach the peer: lighthouse lookup
    /// and, when configured, a relay leg.
    async fn prepare_path(&self, node: &Node, vpn_ip: Ipv4Addr) {
        let Some(host) = node.hostmap().query_pending_by_ip(vpn_ip) else {
            return;
        };
        if host.remote().is_some() || !host.candidates().is_empty() {
            return;
        }

        node.lighthouse().queue_query(vpn_ip);

        if node.settings().relay.use_relays && host.via_relay().is_none() {
            for relay_ip in &node.settings().relay.relays {
                let Some(relay_host) = node.hostmap().query_by_ip(*relay_ip) else {
                    // Bring the relay tunnel up first; a later retry
                    // will find it.
                    self.trigger(*relay_ip);
                    continue;
                };
                if relay_host.is_established() {
                    host.set_via_relay(Some(*relay_ip));
                    node.request_relay(*relay_ip, vpn_ip).await;
                    break;
                }
            }
        }
    }

    async fn send_stage1(&self, node: &Node, vpn_ip: Ipv4Addr) {
        let payload = {
            let states = self.states.lock().expect("handshake states poisoned");
            let Some(pending) = states.get(&vpn_ip) else {
                return;
            };
            pending.stage1_payload.clone()
        };

        let header = Header::new(PacketType::Handshake, HANDSHAKE_SUBTYPE_STAGE1, 0, 1);
        let mut wire = Vec::with_capacity(16 + payload.len());
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&payload);

        let Some(host) = node.hostmap().query_pending_by_ip(vpn_ip) else {
            return;
        };

        if let Some(addr) = host.remote() {
            node.send_raw(&wire, addr).await;
            return;
        }
        let candidates = host.candidates();
        if !candidates.is_empty() {
            for addr in candidates {
                node.send_raw(&wire, addr).await;
            }
            return;
        }
        if let Some(via) = host.via_relay() {
            node.send_via_relay(via, vpn_ip, wire).await;
        }
    }

    async fn retry(&self, node: &Node, vpn_ip: Ipv4Addr) {
        let give_up = {
            let mut states = self.states.lock().expect("handshake states poisoned");
            let Some(pending) = states.get_mut(&vpn_ip) else {
                return; // completed or superseded
            };
            pending.attempts += 1;
            pending.attempts > self.retries
        };

        if give_up {
            self.fail(node, vpn_ip).await;
            return;
        }

        self.prepare_path(node, vpn_ip).await;
        self.send_stage1(node, vpn_ip).await;

        let attempts = {
            let states = self.states.lock().expect("handshake states poisoned");
            states.get(&vpn_ip).map(|p| p.attempts).unwrap_or(0)
        };
        // Linear schedule: attempt n waits n * try_interval.
        let delay = self.try_interval.saturating_mul(attempts + 1);
        self.wheel
            .lock()
            .expect("handshake wheel poisoned")
            .add(vpn_ip, delay);
    }

    async fn fail(&self, node: &Node, vpn_ip: Ipv4Addr) {
        self.states
            .lock()
            .expect("handshake states poisoned")
            .remove(&vpn_ip);
        self.failed.fetch_add(1, Ordering::Relaxed);

        if let Some(host) = node.hostmap().query_pending_by_ip(vpn_ip) {
            let dropped = host.drain_outbox().len();
            node.hostmap().delete(host.local_index);
            warn!(
                %vpn_ip,
                retries = self.retries,
                dropped_frames = dropped,
                "handshake retries exhausted"
            );
        }
    }

    /// Responder path: a stage-1 arrived, possibly through a relay
    pub async fn handle_stage1(
        &self,
        node: &Node,
        from: SocketAddr,
        via: Option<RelayContext>,
        payload: &[u8],
    ) -> CoreResult<()> {
        let now = unix_now();
        let pki = node.pki();
        let ctx = HandshakeContext {
            cipher: node.cipher(),
            our_cert: &pki.cert,
            our_key: &pki.key,
            pool: &pki.pool,
        };

        let validated = handshake::validate_stage1(&ctx, payload, now)?;
        let peer_ip = validated
            .peer_cert
            .primary_ip()
            .ok_or_else(|| crate::error::CoreError::Handshake("certificate has no address".into()))?;

        // An existing pending entry for this ip (our own initiation) is
        // superseded; its staged frames stay on the reused HostInfo.
        let host = node.hostmap().add_pending(peer_ip);
        self.states
            .lock()
            .expect("handshake states poisoned")
            .remove(&peer_ip);

        let outcome = validated.finish(&ctx, host.local_index)?;
        let initiator_index = outcome.initiator_index;
        let stage2_payload = outcome.stage2_payload;

        host.set_cert(std::sync::Arc::new(outcome.peer_cert));
        host.set_tunnel(std::sync::Arc::new(outcome.tunnel));
        match via {
            Some(relay) => host.set_via_relay(Some(relay.via_ip)),
            None => host.set_remote(from),
        }
        node.hostmap().set_remote_index(host.local_index, initiator_index);
        host.rules_version
            .store(node.firewall().rules_version() as u32, Ordering::Relaxed);

        let header = Header::new(
            PacketType::Handshake,
            HANDSHAKE_SUBTYPE_STAGE2,
            initiator_index,
            2,
        );
        let mut wire = Vec::with_capacity(16 + stage2_payload.len());
        wire.extend_from_slice(&header.encode());
        wire.extend_from_slice(&stage2_payload);

        match node.hostmap().promote(host.local_index) {
            Some(Promotion::Promoted { supplanted }) => {
                if let Some(old) = supplanted {
                    debug!(%peer_ip, old_index = old.local_index, "tunnel supplanted by new handshake");
                }
                match host.via_relay() {
                    Some(relay_ip) => node.send_via_relay(relay_ip, peer_ip, wire).await,
                    None => node.send_raw(&wire, from).await,
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(vpn_ip = %peer_ip, index = host.local_index, "tunnel established (responder)");
                node.flush_outbox(&host).await;
                node.schedule_check(host.local_index, TRUST_CHECK_AFTER);
            }
            Some(Promotion::KeptExisting(existing)) => {
                debug!(
                    %peer_ip,
                    kept = existing.local_index,
                    "simultaneous handshake resolved toward existing tunnel"
                );
            }
            None => {}
        }
        Ok(())
    }

    /// Initiator path: the reply to one of our stage-1 messages
    pub async fn handle_stage2(
        &self,
        node: &Node,
        header: &Header,
        from: SocketAddr,
        via: Option<RelayContext>,
        payload: &[u8],
    ) -> CoreResult<()> {
        let Some(host) = node.hostmap().query_by_local_index(header.remote_index) else {
            return Err(crate::error::CoreError::UnknownIndex(header.remote_index));
        };
        let vpn_ip = host.vpn_ip;

        let pending = {
            let mut states = self.states.lock().expect("handshake states poisoned");
            let Some(pending) = states.get(&vpn_ip) else {
                return Ok(()); // duplicate reply after completion
            };
            if pending.state.local_index != header.remote_index {
                return Ok(());
            }
            states.remove(&vpn_ip).expect("checked above")
        };

        let now = unix_now();
        let pki = node.pki();
        let ctx = HandshakeContext {
            cipher: node.cipher(),
            our_cert: &pki.cert,
            our_key: &pki.key,
            pool: &pki.pool,
        };

        let outcome = match handshake::process_stage2(&ctx, &pending.state, payload, now) {
            Ok(outcome) => outcome,
            Err(e) => {
                // Keep the pending state; a valid reply may still arrive
                // within the retry window.
                self.states
                    .lock()
                    .expect("handshake states poisoned")
                    .insert(vpn_ip, pending);
                return Err(e);
            }
        };

        if outcome.peer_cert.primary_ip() != Some(vpn_ip) {
            return Err(crate::error::CoreError::Handshake(
                "responder certificate does not own the dialed address".into(),
            ));
        }

        host.set_cert(std::sync::Arc::new(outcome.peer_cert));
        host.set_tunnel(std::sync::Arc::new(outcome.tunnel));
        if via.is_none() {
            host.set_remote(from);
        }
        node.hostmap()
            .set_remote_index(host.local_index, outcome.responder_index);
        host.rules_version
            .store(node.firewall().rules_version() as u32, Ordering::Relaxed);

        match node.hostmap().promote(host.local_index) {
            Some(Promotion::Promoted { supplanted }) => {
                if let Some(old) = supplanted {
                    debug!(%vpn_ip, old_index = old.local_index, "tunnel supplanted by new handshake");
                }
                self.completed.fetch_add(1, Ordering::Relaxed);
                info!(%vpn_ip, index = host.local_index, "tunnel established (initiator)");
                node.flush_outbox(&host).await;
                node.schedule_check(host.local_index, TRUST_CHECK_AFTER);
            }
            Some(Promotion::KeptExisting(existing)) => {
                debug!(
                    %vpn_ip,
                    kept = existing.local_index,
                    "simultaneous handshake resolved toward existing tunnel"
                );
            }
            None => {}
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
