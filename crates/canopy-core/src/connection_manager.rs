//! Connection manager
//!
//! Walks established tunnels on a 1 s timer wheel. Fresh tunnels get a
//! trust-but-verify check shortly after promotion, then settle into a
//! periodic cadence. A tunnel that only sends without hearing back gets
//! one probe; silence after the probe evicts it. Idle reaping, invalid
//! certificate eviction, rebind punching and relay-to-direct promotion
//! all ride the same wheel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use canopy_network::header::{PacketType, TEST_SUBTYPE_REQUEST};

use crate::hostmap::HostInfo;
use crate::node::Node;

/// Cadence for settled tunnels
pub const PERIODIC_CHECK: Duration = Duration::from_secs(10);

/// How often the conntrack table is purged, in wheel ticks
const CONNTRACK_PURGE_TICKS: u64 = 60;

/// Warn when the node certificate is this close to expiry
const CERT_EXPIRY_WARNING: u64 = 24 * 3600;
const CERT_WARNING_TICKS: u64 = 3600;

/// Maintenance loop; owns the tunnel timer wheel through the node
pub(crate) async fn run_maintenance(node: Arc<Node>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = node.shutdown_signal() => return,
        }
        if node.is_closed() {
            return;
        }

        ticks += 1;
        if ticks % CONNTRACK_PURGE_TICKS == 0 {
            let purged = node.firewall().purge_expired();
            if purged > 0 {
                debug!(purged, "purged expired conntrack entries");
            }
        }
        if ticks % CERT_WARNING_TICKS == 1 {
            warn_on_cert_expiry(&node);
        }

        let mut due = Vec::new();
        node.maintenance_wheel()
            .lock()
            .expect("maintenance wheel poisoned")
            .advance(std::time::Instant::now(), &mut due);
        for local_index in due {
            check_host(&node, local_index).await;
        }
    }
}

fn warn_on_cert_expiry(node: &Node) {
    let pki = node.pki();
    let now = unix_now();
    let not_after = pki.cert.details.not_after;
    if not_after > now && not_after - now < CERT_EXPIRY_WARNING {
        warn!(
            hours_left = (not_after - now) / 3600,
            "node certificate expires within 24 hours"
        );
    }
}

async fn check_host(node: &Node, local_index: u32) {
    let Some(host) = node.hostmap().query_by_local_index(local_index) else {
        return; // torn down since scheduling
    };
    if !host.is_established() {
        return;
    }

    let now = unix_now();

    // Certificate went invalid underneath the tunnel.
    if node.disconnect_invalid() {
        if let Some(cert) = host.cert() {
            if cert.expired(now) {
                info!(vpn_ip = %host.vpn_ip, "certificate is no longer valid, tearing down tunnel");
                node.evict_host(&host, true).await;
                return;
            }
        }
    }

    // Nothing moved in either direction for the inactivity window.
    let settings = node.settings();
    if settings.tunnels.drop_inactive
        && host.idle_ms() > settings.tunnels.inactivity_timeout.as_millis() as u64
    {
        debug!(vpn_ip = %host.vpn_ip, "reaping inactive tunnel");
        node.evict_host(&host, false).await;
        return;
    }

    let in_now = host.in_packets();
    let out_now = host.out_packets();
    let in_prev = host.checked_in.swap(in_now, Ordering::Relaxed);
    let out_prev = host.checked_out.swap(out_now, Ordering::Relaxed);
    let saw_in = in_now > in_prev;
    let saw_out = out_now > out_prev;

    if saw_in {
        host.probe_pending.store(false, Ordering::Relaxed);
        try_promote_direct(node, &host).await;
        node.schedule_check(local_index, PERIODIC_CHECK);
    } else if host.probe_pending.swap(false, Ordering::Relaxed) {
        // Probe went unanswered: the tunnel is dead.
        info!(vpn_ip = %host.vpn_ip, "tunnel is dead, no response to liveness probe");
        let recent_outbound = saw_out;
        node.evict_host(&host, false).await;
        if recent_outbound {
            // Traffic still wants this peer; start over.
            node.handshakes().trigger(host.vpn_ip);
        }
        return;
    } else if saw_out {
        // We talk, nobody answers: liveness unknown, probe once.
        debug!(vpn_ip = %host.vpn_ip, "tunnel liveness unknown, sending probe");
        host.probe_pending.store(true, Ordering::Relaxed);
        if let Err(e) = node
            .send_to_host(&host, PacketType::Test, TEST_SUBTYPE_REQUEST, b"")
            .await
        {
            debug!(vpn_ip = %host.vpn_ip, error = %e, "probe send failed");
        }
        node.schedule_check(local_index, PERIODIC_CHECK);
    } else {
        node.schedule_check(local_index, PERIODIC_CHECK);
    }

    // The local socket was rebound since we last looked: our NAT mapping
    // changed, ask the lighthouse to have the peer punch toward us.
    let rebind = node.transport().rebind_count();
    if host.seen_rebind_count.swap(rebind, Ordering::Relaxed) != rebind {
        debug!(vpn_ip = %host.vpn_ip, "local socket rebound, requesting punch");
        node.send_punch_notify(host.vpn_ip).await;
    }
}

/// On a relayed tunnel, periodically probe the peer's known direct
/// endpoints. A direct reply re-roams the tunnel off the relay.
async fn try_promote_direct(node: &Node, host: &HostInfo) {
    if host.via_relay().is_none() {
        return;
    }
    let in_packets = host.in_packets();
    let marker = host.promote_marker.load(Ordering::Relaxed);
    if in_packets.saturating_sub(marker) < node.settings().try_promote_every {
        return;
    }
    host.promote_marker.store(in_packets, Ordering::Relaxed);

    let candidates = host.candidates();
    if candidates.is_empty() {
        node.lighthouse().queue_query(host.vpn_ip);
        return;
    }
    debug!(vpn_ip = %host.vpn_ip, tries = candidates.len(), "probing direct path on relayed tunnel");
    for addr in candidates {
        node.send_probe_direct(host, addr).await;
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
