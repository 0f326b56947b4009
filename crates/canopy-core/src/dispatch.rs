//! Packet dispatch
//!
//! Classifies inbound UDP datagrams by their 16-byte header and drives
//! the decrypt → replay-check → firewall → TUN path; in the other
//! direction it parses TUN frames, consults the outbound firewall and
//! encrypts toward the peer, triggering handshakes on first use.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, warn};

use canopy_network::header::{
    Header, PacketType, HANDSHAKE_SUBTYPE_STAGE1, HANDSHAKE_SUBTYPE_STAGE2, TEST_SUBTYPE_REPLY,
    TEST_SUBTYPE_REQUEST,
};
use canopy_network::HEADER_LEN;

use crate::config::FirewallAction;
use crate::error::CoreResult;
use crate::firewall::{FirewallPacket, PROTO_ICMP};
use crate::hostmap::HostInfo;
use crate::lighthouse::LighthouseMsg;
use crate::node::{Node, RelayContext};
use crate::relay::{RelayAction, RelayControlMsg};

impl Node {
    /// Entry point for every received datagram. `via` is set when the
    /// frame was unwrapped from a relay leg.
    ///
    /// Returns a boxed future (rather than `async fn`) because this
    /// function and `handle_relay_data` recurse into each other; naming
    /// the future's type here breaks the otherwise-circular `Send`
    /// inference between the two.
    pub(crate) fn handle_outside_wire<'a>(
        &'a self,
        data: Vec<u8>,
        from: SocketAddr,
        via: Option<RelayContext>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let header = match Header::parse(&data) {
                Ok(header) => header,
                Err(_) => {
                    self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            match header.packet_type {
                PacketType::Handshake => {
                    let payload = &data[HEADER_LEN..];
                    let result: CoreResult<()> = match header.subtype {
                        HANDSHAKE_SUBTYPE_STAGE1 => {
                            self.handshakes().handle_stage1(self, from, via, payload).await
                        }
                        HANDSHAKE_SUBTYPE_STAGE2 => {
                            self.handshakes()
                                .handle_stage2(self, &header, from, via, payload)
                                .await
                        }
                        other => {
                            debug!(subtype = other, "unknown handshake subtype");
                            Ok(())
                        }
                    };
                    if let Err(e) = result {
                        debug!(%from, error = %e, "handshake packet rejected");
                    }
                }
                PacketType::Message => self.handle_message(&header, &data, from, via).await,
                PacketType::Test => self.handle_test(&header, &data, from, via).await,
                PacketType::Lighthouse => self.handle_lighthouse(&header, &data, from, via).await,
                PacketType::CloseTunnel => self.handle_close_tunnel(&header, &data, from, via).await,
                PacketType::RecvError => self.handle_recv_error(&header, from).await,
                PacketType::Relay => self.handle_relay_data(&header, &data, from).await,
                PacketType::RelayControl => {
                    self.handle_relay_control(&header, &data, from, via).await
                }
            }
        })
    }

    /// Look up the tunnel addressed by the header (the index field on
    /// inbound traffic is our own local index), authenticate and
    /// replay-check the payload. Updates liveness and endpoint roaming
    /// on success.
    async fn open_tunnel_packet(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) -> Option<(Arc<HostInfo>, Vec<u8>)> {
        let Some(host) = self.hostmap().query_by_local_index(header.remote_index) else {
            self.maybe_send_recv_error(from, header.remote_index, via).await;
            return None;
        };
        let tunnel = host.tunnel()?;

        let (ad, payload) = data.split_at(HEADER_LEN);
        let plaintext = match tunnel.decrypt(header.counter, ad, payload) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.counters.auth_fail.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if tunnel.replay_check(header.counter).is_err() {
            self.counters.replay_drop.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        host.record_in();

        // An authenticated packet from a new source address means the
        // peer roamed, or answered one of our direct-path probes.
        if via.is_none() {
            match host.remote() {
                Some(current) if current == from => {}
                _ => {
                    host.set_remote(from);
                    if host.via_relay().is_some() {
                        host.set_via_relay(None);
                        debug!(vpn_ip = %host.vpn_ip, %from, "tunnel promoted to direct path");
                    }
                }
            }
        }

        Some((host, plaintext))
    }

    async fn handle_message(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) {
        let Some((host, plaintext)) = self.open_tunnel_packet(header, data, from, via).await else {
            return;
        };

        let packet = match FirewallPacket::parse(&plaintext, true) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(cert) = host.cert() else {
            return;
        };

        let firewall = self.firewall();
        let pki = self.pki();
        if firewall.check(&packet, true, &cert, &pki.pool).is_err() {
            self.counters.fw_dropped_in.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(e) = self.tun().write_packet(&plaintext).await {
            if !self.is_closed() {
                warn!(error = %e, "fatal tun write error");
                self.raise_fatal();
            }
        }
    }

    async fn handle_test(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) {
        let Some((host, plaintext)) = self.open_tunnel_packet(header, data, from, via).await else {
            return;
        };
        if header.subtype == TEST_SUBTYPE_REQUEST {
            let _ = self
                .send_to_host(&host, PacketType::Test, TEST_SUBTYPE_REPLY, &plaintext)
                .await;
        }
    }

    async fn handle_lighthouse(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) {
        let Some((host, plaintext)) = self.open_tunnel_packet(header, data, from, via).await else {
            return;
        };
        let msg = match LighthouseMsg::decode(&plaintext) {
            Ok(msg) => msg,
            Err(_) => {
                self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match msg {
            LighthouseMsg::HostQueryReply { vpn_ip, endpoints } => {
                if !self.lighthouse().is_lighthouse(host.vpn_ip) {
                    return;
                }
                if let Some(pending) = self.hostmap().query_pending_by_ip(vpn_ip) {
                    pending.add_candidates(&endpoints);
                }
                if let Some(main) = self.hostmap().query_by_ip(vpn_ip) {
                    main.add_candidates(&endpoints);
                }
            }
            LighthouseMsg::HostPunchNotify { endpoints, .. } => {
                // Open our NAT toward the peer; the single byte is not a
                // valid packet and is dropped on the far side.
                for addr in endpoints {
                    self.send_raw(&[0u8], addr).await;
                }
            }
            LighthouseMsg::HostQuery { .. } | LighthouseMsg::HostUpdateNotify { .. } => {
                // We are not a lighthouse.
                debug!(vpn_ip = %host.vpn_ip, "ignoring lighthouse service message");
            }
        }
    }

    async fn handle_close_tunnel(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) {
        let Some((host, _)) = self.open_tunnel_packet(header, data, from, via).await else {
            return;
        };
        debug!(vpn_ip = %host.vpn_ip, "peer closed the tunnel");
        self.evict_host(&host, false).await;
    }

    async fn handle_recv_error(&self, header: &Header, from: SocketAddr) {
        self.counters.recv_error_recv.fetch_add(1, Ordering::Relaxed);

        // The peer echoed the index we stamped on our traffic, which is
        // its index from our perspective.
        let Some(host) = self.hostmap().query_by_remote_index(header.remote_index) else {
            return;
        };
        // Unauthenticated packet: only believe it from the endpoint we
        // are actually talking to.
        if host.remote() != Some(from) {
            return;
        }
        debug!(vpn_ip = %host.vpn_ip, "peer lost our tunnel state, re-handshaking");
        self.evict_host(&host, false).await;
        self.handshakes().trigger(host.vpn_ip);
    }

    async fn handle_relay_data(&self, header: &Header, data: &[u8], from: SocketAddr) {
        // Relay role: rewrite the outer header and pass the opaque inner
        // frame along.
        if let Some((to_ip, forward_index)) = self.relay_engine().route_for(header.remote_index) {
            let Some(dest) = self.hostmap().query_by_ip(to_ip) else {
                self.counters.relay_refused.fetch_add(1, Ordering::Relaxed);
                return;
            };
            let now = unix_now();
            let refuse = match dest.cert() {
                Some(cert) => cert.expired(now) || self.pki().pool.is_blocklisted(&cert),
                None => true,
            };
            if refuse {
                self.counters.relay_refused.fetch_add(1, Ordering::Relaxed);
                return;
            }
            let Some(addr) = dest.remote() else {
                return;
            };

            let out_header = Header::new(PacketType::Relay, 0, forward_index, 0);
            let inner = &data[HEADER_LEN..];
            let mut out = Vec::with_capacity(HEADER_LEN + inner.len());
            out.extend_from_slice(&out_header.encode());
            out.extend_from_slice(inner);
            self.counters.relays_forwarded.fetch_add(1, Ordering::Relaxed);
            self.send_raw(&out, addr).await;
            return;
        }

        // Endpoint role: unwrap our relay leg and re-enter dispatch with
        // the relay context attached.
        if let Some(leg) = self.relay_engine().terminal_for(header.remote_index) {
            let inner = data[HEADER_LEN..].to_vec();
            let context = RelayContext {
                via_ip: leg.via,
                target: leg.target,
            };
            let recurse: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> =
                Box::pin(self.handle_outside_wire(inner, from, Some(context)));
            recurse.await;
            return;
        }

        self.maybe_send_recv_error(from, header.remote_index, None).await;
    }

    async fn handle_relay_control(
        &self,
        header: &Header,
        data: &[u8],
        from: SocketAddr,
        via: Option<RelayContext>,
    ) {
        let Some((host, plaintext)) = self.open_tunnel_packet(header, data, from, via).await else {
            return;
        };
        let msg: RelayControlMsg = match bincode::deserialize(&plaintext) {
            Ok(msg) => msg,
            Err(_) => {
                self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let sender_ip = host.vpn_ip;

        match msg {
            RelayControlMsg::Request {
                initiator_index,
                initiator,
                target,
            } => {
                if initiator == sender_ip {
                    // We are being asked to relay.
                    let target_ok = self.relay_policy_allows(&host, target);
                    if !target_ok {
                        self.counters.relay_refused.fetch_add(1, Ordering::Relaxed);
                    }
                    match self.relay_engine().handle_request_at_relay(
                        sender_ip,
                        initiator_index,
                        target,
                        target_ok,
                    ) {
                        Ok(RelayAction::Send { to, msg }) => {
                            self.send_relay_control(to, &msg).await
                        }
                        Err(e) => debug!(error = %e, "relay request failed"),
                    }
                } else {
                    // A relay is asking whether it may forward someone
                    // to us.
                    let initiator_ok = self.settings().relay.use_relays;
                    let RelayAction::Send { to, msg } = self.relay_engine().handle_request_at_target(
                        sender_ip,
                        initiator_index,
                        initiator,
                        initiator_ok,
                    );
                    self.send_relay_control(to, &msg).await;
                }
            }
            RelayControlMsg::Response {
                initiator_index,
                response_index,
                ok,
            } => match self.relay_engine().handle_response(
                sender_ip,
                initiator_index,
                response_index,
                ok,
            ) {
                Ok(Some(RelayAction::Send { to, msg })) => self.send_relay_control(to, &msg).await,
                Ok(None) => {}
                Err(e) => debug!(error = %e, "relay response rejected"),
            },
        }
    }

    /// Relay policy: we must be a relay, the requester must still hold a
    /// valid certificate, and the target must be reachable with a valid
    /// certificate of its own.
    fn relay_policy_allows(&self, requester: &HostInfo, target: std::net::Ipv4Addr) -> bool {
        if !self.settings().relay.am_relay {
            return false;
        }
        let now = unix_now();
        let pool = &self.pki().pool;

        let requester_ok = requester
            .cert()
            .map(|c| !c.expired(now) && !pool.is_blocklisted(&c))
            .unwrap_or(false);
        if !requester_ok {
            return false;
        }

        match self.hostmap().query_by_ip(target) {
            Some(target_host) if target_host.is_established() => target_host
                .cert()
                .map(|c| !c.expired(now) && !pool.is_blocklisted(&c))
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn maybe_send_recv_error(
        &self,
        from: SocketAddr,
        remote_index: u32,
        via: Option<RelayContext>,
    ) {
        // Through a relay the source address is the relay itself; a
        // recv_error would mislead it.
        if via.is_some() {
            return;
        }
        if !self.send_recv_error_policy().should_send(from) {
            return;
        }
        let header = Header::new(PacketType::RecvError, 0, remote_index, 0);
        self.send_raw(&header.encode(), from).await;
        self.counters.recv_error_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// One frame read from the TUN device
    pub(crate) async fn handle_inside(&self, frame: &[u8]) {
        let packet = match FirewallPacket::parse(frame, false) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        // Ping to our own overlay address: dispatch answers directly,
        // the firewall is not consulted.
        if packet.remote_ip == self.my_ip() {
            if packet.protocol == PROTO_ICMP {
                if let Some(reply) = icmp_echo_reply(frame) {
                    let _ = self.tun().write_packet(&reply).await;
                }
            }
            return;
        }

        let dest = packet.remote_ip;
        if let Some(host) = self.hostmap().query_by_ip(dest) {
            if host.is_established() {
                self.send_inner_frame(&host, frame).await;
                return;
            }
        }

        // No tunnel yet: stage the frame and make sure a handshake is
        // moving. The trigger dedupes against in-flight state.
        let host = self.hostmap().add_pending(dest);
        host.buffer_frame(frame.to_vec());
        self.handshakes().trigger(dest);
    }

    /// Outbound firewall plus encrypt-and-send for one inner frame
    pub(crate) async fn send_inner_frame(&self, host: &HostInfo, frame: &[u8]) {
        let packet = match FirewallPacket::parse(frame, false) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        let Some(cert) = host.cert() else {
            return;
        };

        let firewall = self.firewall();
        let pki = self.pki();
        match firewall.check(&packet, false, &cert, &pki.pool) {
            Ok(()) => {
                let _ = self.send_to_host(host, PacketType::Message, 0, frame).await;
            }
            Err(FirewallAction::Drop) => {
                self.counters.fw_dropped_out.fetch_add(1, Ordering::Relaxed);
            }
            Err(FirewallAction::Reject) => {
                self.counters.fw_dropped_out.fetch_add(1, Ordering::Relaxed);
                if let Some(reject) = build_reject(frame) {
                    let _ = self.tun().write_packet(&reject).await;
                }
            }
        }
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// RFC 1071 ones-complement sum
fn inet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Turn an ICMP echo request into its reply, checksums fixed
fn icmp_echo_reply(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 20 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    if frame.len() < ihl + 8 || frame[9] != PROTO_ICMP {
        return None;
    }
    // type 8 code 0: echo request
    if frame[ihl] != 8 || frame[ihl + 1] != 0 {
        return None;
    }

    let mut reply = frame.to_vec();
    // Swap addresses
    for i in 0..4 {
        reply.swap(12 + i, 16 + i);
    }
    // Echo reply, recompute the ICMP checksum
    reply[ihl] = 0;
    reply[ihl + 2] = 0;
    reply[ihl + 3] = 0;
    let icmp_sum = inet_checksum(&reply[ihl..]);
    reply[ihl + 2..ihl + 4].copy_from_slice(&icmp_sum.to_be_bytes());
    // Recompute the header checksum
    reply[10] = 0;
    reply[11] = 0;
    let ip_sum = inet_checksum(&reply[..ihl]);
    reply[10..12].copy_from_slice(&ip_sum.to_be_bytes());
    Some(reply)
}

/// Build an ICMP administratively-prohibited reply for a rejected
/// outbound frame, delivered back through the TUN
fn build_reject(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 20 || frame[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((frame[0] & 0x0F) as usize) * 4;
    let quoted = frame.len().min(ihl + 8);
    // Do not answer ICMP errors with ICMP errors.
    if frame[9] == PROTO_ICMP && frame.len() > ihl && frame[ihl] != 8 {
        return None;
    }

    let total_len = 20 + 8 + quoted;
    let mut out = vec![0u8; total_len];
    out[0] = 0x45;
    out[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    out[8] = 64; // ttl
    out[9] = PROTO_ICMP;
    out[12..16].copy_from_slice(&frame[16..20]); // src = original dst
    out[16..20].copy_from_slice(&frame[12..16]); // dst = original src
    let ip_sum = inet_checksum(&out[..20]);
    out[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    out[20] = 3; // destination unreachable
    out[21] = 10; // administratively prohibited
    out[28..28 + quoted].copy_from_slice(&frame[..quoted]);
    let icmp_sum = inet_checksum(&out[20..]);
    out[22..24].copy_from_slice(&icmp_sum.to_be_bytes());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuleConfig, Settings};
    use crate::node::Node;
    use crate::test_support::*;
    use canopy_cert::{CaPool, Certificate, SigningKey};
    use canopy_network::{ChannelTun, UdpTransport};
    use bytes::Bytes;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    fn allow_all() -> Vec<RuleConfig> {
        vec![RuleConfig {
            proto: "any".into(),
            port: "any".into(),
            host: Some("any".into()),
            group: None,
            groups: None,
            cidr: None,
            ca_name: None,
            ca_sha: None,
            local_cidr: None,
        }]
    }

    fn open_settings() -> Settings {
        let mut settings = Settings::default();
        settings.firewall.inbound = allow_all();
        settings.firewall.outbound = allow_all();
        settings
    }

    struct TestNet {
        ca: Certificate,
        ca_key: SigningKey,
    }

    impl TestNet {
        fn new() -> Self {
            let t = now();
            let (ca, ca_key) = test_ca("net ca", vec![], t - 10, t + 3600);
            Self { ca, ca_key }
        }

        async fn node(
            &self,
            name: &str,
            ip: &str,
            settings: Settings,
        ) -> (Arc<Node>, Arc<ChannelTun>, mpsc::Receiver<Bytes>, Vec<JoinHandle<()>>) {
            let t = now();
            let (cert, dh) = test_node_cert(
                name,
                format!("{ip}/24").parse().unwrap(),
                vec![],
                &self.ca,
                &self.ca_key,
                t - 5,
                t + 1800,
            );
            let mut pool = CaPool::new();
            pool.add_ca(self.ca.clone()).unwrap();

            let transport = Arc::new(
                UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                    .await
                    .unwrap(),
            );
            let (tun, tun_rx) = ChannelTun::new(name);
            let tun = Arc::new(tun);

            let node = Node::new(
                settings,
                cert,
                dh.secret,
                pool,
                transport,
                tun.clone() as Arc<dyn canopy_network::TunDevice>,
            )
            .unwrap();
            let handles = node.run();
            (node, tun, tun_rx, handles)
        }
    }

    /// Minimal ICMP echo request frame between two overlay addresses
    fn icmp_echo_frame(src: Ipv4Addr, dst: Ipv4Addr) -> Vec<u8> {
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45;
        frame[2..4].copy_from_slice(&28u16.to_be_bytes());
        frame[8] = 64;
        frame[9] = PROTO_ICMP;
        frame[12..16].copy_from_slice(&src.octets());
        frame[16..20].copy_from_slice(&dst.octets());
        let ip_sum = inet_checksum(&frame[..20]);
        frame[10..12].copy_from_slice(&ip_sum.to_be_bytes());
        frame[20] = 8; // echo request
        frame[24..26].copy_from_slice(&0x4242u16.to_be_bytes()); // id
        let icmp_sum = inet_checksum(&frame[20..]);
        frame[22..24].copy_from_slice(&icmp_sum.to_be_bytes());
        frame
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<Bytes>) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    async fn wait_established(node: &Arc<Node>, peer: Ipv4Addr) {
        for _ in 0..200 {
            if node
                .hostmap()
                .query_by_ip(peer)
                .is_some_and(|h| h.is_established())
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("tunnel to {peer} never established");
    }

    fn seed_endpoint(node: &Arc<Node>, peer: Ipv4Addr, addr: std::net::SocketAddr) {
        let pending = node.hostmap().add_pending(peer);
        pending.add_candidates(&[addr]);
    }

    #[tokio::test]
    async fn test_two_nodes_direct_handshake_and_echo() {
        let net = TestNet::new();
        let (a, a_tun, _a_rx, _ha) = net.node("a", "10.0.0.1", open_settings()).await;
        let (b, _b_tun, mut b_rx, _hb) = net.node("b", "10.0.0.2", open_settings()).await;

        let b_ip: Ipv4Addr = "10.0.0.2".parse().unwrap();
        seed_endpoint(&a, b_ip, b.transport().local_addr().unwrap());

        // First outbound frame triggers the handshake and is flushed on
        // promotion.
        let frame = icmp_echo_frame(a.my_ip(), b_ip);
        a_tun.inject(Bytes::from(frame.clone())).await.unwrap();

        let delivered = recv_frame(&mut b_rx).await.expect("echo should arrive");
        assert_eq!(&delivered[..], &frame[..]);

        // Both sides hold a main-map entry.
        wait_established(&a, b_ip).await;
        wait_established(&b, a.my_ip()).await;

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_replayed_packet_is_dropped() {
        let net = TestNet::new();
        let (a, _a_tun, _a_rx, _ha) = net.node("a", "10.0.1.1", open_settings()).await;
        let (b, _b_tun, mut b_rx, _hb) = net.node("b", "10.0.1.2", open_settings()).await;

        let b_ip: Ipv4Addr = "10.0.1.2".parse().unwrap();
        seed_endpoint(&a, b_ip, b.transport().local_addr().unwrap());
        a.handshakes().trigger(b_ip);
        wait_established(&a, b_ip).await;

        // Craft one encrypted message and feed it to B twice.
        let host = a.hostmap().query_by_ip(b_ip).unwrap();
        let tunnel = host.tunnel().unwrap();
        let remote_index = host.remote_index().unwrap();
        let frame = icmp_echo_frame(a.my_ip(), b_ip);
        let counter = tunnel.next_counter().unwrap();
        let header = canopy_network::Header::new(PacketType::Message, 0, remote_index, counter);
        let header_bytes = header.encode();
        let ciphertext = tunnel.encrypt(counter, &header_bytes, &frame).unwrap();
        let mut wire = header_bytes.to_vec();
        wire.extend_from_slice(&ciphertext);

        let a_addr = a.transport().local_addr().unwrap();
        b.handle_outside_wire(wire.clone(), a_addr, None).await;
        let delivered = recv_frame(&mut b_rx).await.expect("first copy arrives");
        assert_eq!(&delivered[..], &frame[..]);

        let replay_before = b.stats().replay_drop;
        b.handle_outside_wire(wire, a_addr, None).await;
        assert_eq!(b.stats().replay_drop, replay_before + 1);

        // Nothing further reached the device.
        assert!(
            tokio::time::timeout(Duration::from_millis(300), b_rx.recv())
                .await
                .is_err()
        );

        a.close();
        b.close();
    }

    #[tokio::test]
    async fn test_unknown_index_provokes_recv_error() {
        let net = TestNet::new();
        let (b, _b_tun, _b_rx, _hb) = net.node("b", "10.0.2.2", open_settings()).await;

        let header = canopy_network::Header::new(PacketType::Message, 0, 0xDEAD_BEEF, 9);
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(&[0u8; 32]);

        b.handle_outside_wire(wire, "127.0.0.1:9999".parse().unwrap(), None)
            .await;
        assert_eq!(b.stats().recv_error_sent, 1);

        b.close();
    }

    #[tokio::test]
    async fn test_ping_own_overlay_ip_answered_by_dispatch() {
        let net = TestNet::new();
        // No firewall rules at all: the self-ping shortcut must not
        // consult them.
        let (a, a_tun, mut a_rx, _ha) = net.node("a", "10.0.3.1", Settings::default()).await;

        let frame = icmp_echo_frame(a.my_ip(), a.my_ip());
        a_tun.inject(Bytes::from(frame)).await.unwrap();

        let reply = recv_frame(&mut a_rx).await.expect("echo reply");
        assert_eq!(reply[20], 0); // echo reply type
        assert_eq!(&reply[12..16], &a.my_ip().octets());

        a.close();
    }

    #[tokio::test]
    async fn test_relay_forwarding_end_to_end() {
        let net = TestNet::new();

        let mut a_settings = open_settings();
        a_settings.relay.use_relays = true;
        a_settings.relay.relays = vec!["10.0.4.2".parse().unwrap()];

        let mut b_settings = open_settings();
        b_settings.relay.am_relay = true;

        let mut c_settings = open_settings();
        c_settings.relay.use_relays = true;

        let (a, a_tun, _a_rx, _ha) = net.node("a", "10.0.4.1", a_settings).await;
        let (b, _b_tun, _b_rx, _hb) = net.node("b", "10.0.4.2", b_settings).await;
        let (c, _c_tun, mut c_rx, _hc) = net.node("c", "10.0.4.3", c_settings).await;

        let b_ip: Ipv4Addr = "10.0.4.2".parse().unwrap();
        let c_ip: Ipv4Addr = "10.0.4.3".parse().unwrap();

        // A and C each know the relay's address; A has no way to reach C
        // directly.
        seed_endpoint(&a, b_ip, b.transport().local_addr().unwrap());
        a.handshakes().trigger(b_ip);
        wait_established(&a, b_ip).await;

        seed_endpoint(&c, b_ip, b.transport().local_addr().unwrap());
        c.handshakes().trigger(b_ip);
        wait_established(&c, b_ip).await;

        // First frame toward C: relay establishment, handshake through
        // the relay, then the staged frame flushes end to end.
        let frame = icmp_echo_frame(a.my_ip(), c_ip);
        a_tun.inject(Bytes::from(frame.clone())).await.unwrap();

        let delivered = recv_frame(&mut c_rx).await.expect("relayed echo arrives");
        assert_eq!(&delivered[..], &frame[..]);

        assert!(b.stats().relays_forwarded > 0);
        wait_established(&a, c_ip).await;

        a.close();
        b.close();
        c.close();
    }

    #[tokio::test]
    async fn test_firewall_blocks_inbound_without_rules() {
        let net = TestNet::new();
        let mut a_settings = Settings::default();
        a_settings.firewall.outbound = allow_all();
        // B allows nothing inbound.
        let mut b_settings = Settings::default();
        b_settings.firewall.outbound = allow_all();

        let (a, a_tun, _a_rx, _ha) = net.node("a", "10.0.5.1", a_settings).await;
        let (b, _b_tun, mut b_rx, _hb) = net.node("b", "10.0.5.2", b_settings).await;

        let b_ip: Ipv4Addr = "10.0.5.2".parse().unwrap();
        seed_endpoint(&a, b_ip, b.transport().local_addr().unwrap());

        let frame = icmp_echo_frame(a.my_ip(), b_ip);
        a_tun.inject(Bytes::from(frame)).await.unwrap();

        wait_established(&a, b_ip).await;
        // Give the frame time to cross and be dropped.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(b.stats().fw_dropped_in >= 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(200), b_rx.recv())
                .await
                .is_err()
        );

        a.close();
        b.close();
    }

    #[test]
    fn test_icmp_echo_reply_builder() {
        let frame = icmp_echo_frame("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap());
        let reply = icmp_echo_reply(&frame).unwrap();
        assert_eq!(reply[20], 0);
        assert_eq!(&reply[12..16], &[10, 0, 0, 2]);
        assert_eq!(&reply[16..20], &[10, 0, 0, 1]);
        // Non-echo frames yield nothing.
        let mut not_echo = frame.clone();
        not_echo[20] = 0;
        assert!(icmp_echo_reply(&not_echo).is_none());
    }

    #[test]
    fn test_reject_builder_quotes_original() {
        let frame = icmp_echo_frame("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap());
        let reject = build_reject(&frame).unwrap();
        assert_eq!(reject[20], 3);
        assert_eq!(reject[21], 10);
        // Quoted original header follows the ICMP header.
        assert_eq!(&reject[28..48], &frame[..20]);
        // Addressed back at the original sender.
        assert_eq!(&reject[16..20], &[10, 0, 0, 1]);
    }
}
