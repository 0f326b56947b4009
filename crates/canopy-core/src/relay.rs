//! Relay subsystem
//!
//! A relay forwards opaque tunnel frames between two peers that cannot
//! reach each other directly. Establishment is a three-party exchange:
//! the initiator asks its relay, the relay asks the target, and indexes
//! flow back so each hop can demultiplex cheaply. Data frames are never
//! decrypted at the relay; only the outer header is rewritten.
//!
//! Index spaces: relay indexes live beside tunnel indexes in the wire
//! header's remote_index field but are resolved through this engine,
//! selected by the packet type.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::RwLock;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Which side of the forwarding this record serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayRole {
    /// A peer relays traffic for this node
    ForMe,
    /// This node relays traffic for others
    ForThem,
}

/// Relay establishment state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Requested,
    Established,
}

/// Relay control message, carried encrypted over the relay tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelayControlMsg {
    /// "Forward my traffic to `target`"; `initiator_index` is the index
    /// the sender will accept relayed frames under
    Request {
        initiator_index: u32,
        initiator: Ipv4Addr,
        target: Ipv4Addr,
    },
    /// Accepts a request; `response_index` is the index the responder
    /// will accept relayed frames under
    Response {
        initiator_index: u32,
        response_index: u32,
        ok: bool,
    },
}

/// Endpoint-side record: a peer relays between me and `target`
#[derive(Debug, Clone)]
pub struct TerminalRelay {
    pub via: Ipv4Addr,
    pub target: Ipv4Addr,
    pub role: RelayRole,
    pub state: RelayState,
    pub local_index: u32,
    /// Index to put on the wire when sending through the relay
    pub remote_index: Option<u32>,
}

/// Relay-side record: one direction of a forwarding pair
#[derive(Debug, Clone)]
pub struct RelayRoute {
    /// Peer whose frames arrive under this index
    pub from: Ipv4Addr,
    /// Peer the frames are forwarded to
    pub to: Ipv4Addr,
    /// Index to stamp on forwarded frames; None until the far side
    /// answered
    pub forward_index: Option<u32>,
    pub state: RelayState,
}

/// Something the caller must send after a state transition
#[derive(Debug)]
pub enum RelayAction {
    /// Send a control message to an overlay peer
    Send { to: Ipv4Addr, msg: RelayControlMsg },
}

#[derive(Default)]
struct RelayInner {
    /// Relay node: inbound index → forwarding route
    routes: HashMap<u32, RelayRoute>,
    /// Endpoint: local index → relay leg terminating here
    terminal: HashMap<u32, TerminalRelay>,
    /// Endpoint: (via, target) → local index; one relay per pair
    by_pair: HashMap<(Ipv4Addr, Ipv4Addr), u32>,
}

/// Relay state machine, shared by endpoints and relay nodes
pub struct RelayEngine {
    inner: RwLock<RelayInner>,
    am_relay: bool,
}

impl RelayEngine {
    pub fn new(am_relay: bool) -> Self {
        Self {
            inner: RwLock::new(RelayInner::default()),
            am_relay,
        }
    }

    pub fn am_relay(&self) -> bool {
        self.am_relay
    }

    fn allocate_index(inner: &RelayInner) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let index: u32 = rng.gen();
            if index != 0
                && !inner.routes.contains_key(&index)
                && !inner.terminal.contains_key(&index)
            {
                return index;
            }
        }
    }

    /// Initiator: ask `via` to relay traffic to `target`. Returns the
    /// message to send over the existing `via` tunnel. Re-requesting an
    /// existing pair reuses its index.
    pub fn request(&self, via: Ipv4Addr, target: Ipv4Addr) -> RelayControlMsg {
        let mut inner = self.inner.write().expect("relay lock poisoned");
        let local_index = match inner.by_pair.get(&(via, target)) {
            Some(&idx) => idx,
            None => {
                let idx = Self::allocate_index(&inner);
                inner.terminal.insert(
                    idx,
                    TerminalRelay {
                        via,
                        target,
                        role: RelayRole::ForMe,
                        state: RelayState::Requested,
                        local_index: idx,
                        remote_index: None,
                    },
                );
                inner.by_pair.insert((via, target), idx);
                debug!(%via, %target, index = idx, "requesting relay");
                idx
            }
        };
        RelayControlMsg::Request {
            initiator_index: local_index,
            initiator: Ipv4Addr::UNSPECIFIED, // filled by the sender with its overlay ip
            target,
        }
    }

    /// Relay node: a peer asks us to forward to `target`.
    ///
    /// `target_ok` is the caller's policy verdict (target reachable,
    /// certificates valid). On refusal the initiator gets a negative
    /// response; on success the request is propagated to the target.
    pub fn handle_request_at_relay(
        &self,
        from: Ipv4Addr,
        initiator_index: u32,
        target: Ipv4Addr,
        target_ok: bool,
    ) -> CoreResult<RelayAction> {
        if !self.am_relay || !target_ok {
            return Ok(RelayAction::Send {
                to: from,
                msg: RelayControlMsg::Response {
                    initiator_index,
                    response_index: 0,
                    ok: false,
                },
            });
        }

        let mut inner = self.inner.write().expect("relay lock poisoned");

        // One route pair per (from, target); re-requests reuse it.
        let existing = inner.routes.iter().find_map(|(idx, r)| {
            (r.from == from && r.to == target).then_some(*idx)
        });
        let toward_target_index = if let Some(from_leg) = existing {
            let route = inner.routes.get_mut(&from_leg).expect("route exists");
            route.forward_index = None;
            route.state = RelayState::Requested;
            let target_leg = inner
                .routes
                .iter()
                .find_map(|(idx, r)| (r.from == target && r.to == from).then_some(*idx))
                .ok_or_else(|| CoreError::Relay("route pair out of sync".into()))?;
            let reverse = inner.routes.get_mut(&target_leg).expect("route exists");
            reverse.forward_index = Some(initiator_index);
            reverse.state = RelayState::Requested;
            target_leg
        } else {
            let from_leg = Self::allocate_index(&inner);
            inner.routes.insert(
                from_leg,
                RelayRoute {
                    from,
                    to: target,
                    forward_index: None,
                    state: RelayState::Requested,
                },
            );
            let target_leg = Self::allocate_index(&inner);
            inner.routes.insert(
                target_leg,
                RelayRoute {
                    from: target,
                    to: from,
                    forward_index: Some(initiator_index),
                    state: RelayState::Requested,
                },
            );
            target_leg
        };

        debug!(%from, %target, "propagating relay request to target");
        Ok(RelayAction::Send {
            to: target,
            msg: RelayControlMsg::Request {
                initiator_index: toward_target_index,
                initiator: from,
                target,
            },
        })
    }

    /// Target: a relay asks whether it may forward `initiator`'s frames
    /// to us. `initiator_ok` is the caller's policy verdict.
    pub fn handle_request_at_target(
        &self,
        via: Ipv4Addr,
        initiator_index: u32,
        initiator: Ipv4Addr,
        initiator_ok: bool,
    ) -> RelayAction {
        if !initiator_ok {
            return RelayAction::Send {
                to: via,
                msg: RelayControlMsg::Response {
                    initiator_index,
                    response_index: 0,
                    ok: false,
                },
            };
        }

        let mut inner = self.inner.write().expect("relay lock poisoned");
        let local_index = match inner.by_pair.get(&(via, initiator)) {
            Some(&idx) => {
                let record = inner.terminal.get_mut(&idx).expect("terminal exists");
                record.remote_index = Some(initiator_index);
                record.state = RelayState::Established;
                idx
            }
            None => {
                let idx = Self::allocate_index(&inner);
                inner.terminal.insert(
                    idx,
                    TerminalRelay {
                        via,
                        target: initiator,
                        role: RelayRole::ForMe,
                        state: RelayState::Established,
                        local_index: idx,
                        remote_index: Some(initiator_index),
                    },
                );
                inner.by_pair.insert((via, initiator), idx);
                idx
            }
        };

        debug!(%via, %initiator, index = local_index, "accepted relay leg");
        RelayAction::Send {
            to: via,
            msg: RelayControlMsg::Response {
                initiator_index,
                response_index: local_index,
                ok: true,
            },
        }
    }

    /// Handle a Response at either the relay (propagate to initiator) or
    /// the initiator (mark established). Returns a follow-up send for
    /// the relay case.
    pub fn handle_response(
        &self,
        from: Ipv4Addr,
        initiator_index: u32,
        response_index: u32,
        ok: bool,
    ) -> CoreResult<Option<RelayAction>> {
        let mut inner = self.inner.write().expect("relay lock poisoned");

        // Relay node: `initiator_index` names our toward-target leg,
        // whose forward_index already points back at the original
        // initiator's terminal index.
        if inner.routes.contains_key(&initiator_index) {
            let (original_initiator, echo_index) = {
                let route = inner.routes.get(&initiator_index).expect("route exists");
                if route.from != from {
                    return Err(CoreError::Relay("response from unexpected peer".into()));
                }
                (route.to, route.forward_index)
            };
            let from_leg = inner
                .routes
                .iter()
                .find_map(|(idx, r)| (r.from == original_initiator && r.to == from).then_some(*idx));

            if !ok {
                inner.routes.remove(&initiator_index);
                if let Some(from_leg) = from_leg {
                    inner.routes.remove(&from_leg);
                }
                return Ok(echo_index.map(|echo| RelayAction::Send {
                    to: original_initiator,
                    msg: RelayControlMsg::Response {
                        initiator_index: echo,
                        response_index: 0,
                        ok: false,
                    },
                }));
            }

            inner
                .routes
                .get_mut(&initiator_index)
                .expect("route exists")
                .state = RelayState::Established;

            // The initiator-to-target leg now forwards under the index
            // the target just announced.
            let from_leg =
                from_leg.ok_or_else(|| CoreError::Relay("route pair out of sync".into()))?;
            let route = inner.routes.get_mut(&from_leg).expect("route exists");
            route.forward_index = Some(response_index);
            route.state = RelayState::Established;

            let echo =
                echo_index.ok_or_else(|| CoreError::Relay("initiator index missing".into()))?;
            debug!(initiator = %original_initiator, target = %from, "relay pair established");
            return Ok(Some(RelayAction::Send {
                to: original_initiator,
                msg: RelayControlMsg::Response {
                    initiator_index: echo,
                    response_index: from_leg,
                    ok: true,
                },
            }));
        }

        // Initiator: `initiator_index` names our terminal leg.
        if let Some(record) = inner.terminal.get_mut(&initiator_index) {
            if record.via != from {
                return Err(CoreError::Relay("response from unexpected peer".into()));
            }
            if !ok {
                let key = (record.via, record.target);
                inner.terminal.remove(&initiator_index);
                inner.by_pair.remove(&key);
                return Err(CoreError::Relay("relay refused the request".into()));
            }
            record.remote_index = Some(response_index);
            record.state = RelayState::Established;
            debug!(via = %from, target = %record.target, "relay established");
            return Ok(None);
        }

        Err(CoreError::Relay(format!(
            "response for unknown relay index {initiator_index}"
        )))
    }

    /// Relay node: resolve an inbound relay-data index to the next hop
    pub fn route_for(&self, index: u32) -> Option<(Ipv4Addr, u32)> {
        let inner = self.inner.read().expect("relay lock poisoned");
        let route = inner.routes.get(&index)?;
        if route.state != RelayState::Established {
            return None;
        }
        Some((route.to, route.forward_index?))
    }

    /// Endpoint: resolve an inbound relay-data index to its leg
    pub fn terminal_for(&self, index: u32) -> Option<TerminalRelay> {
        let inner = self.inner.read().expect("relay lock poisoned");
        inner.terminal.get(&index).cloned()
    }

    /// Endpoint: the wire index for sending via `via` toward `target`,
    /// if the leg is established
    pub fn wire_index(&self, via: Ipv4Addr, target: Ipv4Addr) -> Option<u32> {
        let inner = self.inner.read().expect("relay lock poisoned");
        let idx = inner.by_pair.get(&(via, target))?;
        let record = inner.terminal.get(idx)?;
        if record.state != RelayState::Established {
            return None;
        }
        record.remote_index
    }

    /// Drop every route and leg involving `peer` (its tunnel went away)
    pub fn remove_peer(&self, peer: Ipv4Addr) {
        let mut inner = self.inner.write().expect("relay lock poisoned");
        inner.routes.retain(|_, r| r.from != peer && r.to != peer);
        let dead: Vec<u32> = inner
            .terminal
            .iter()
            .filter(|(_, t)| t.via == peer || t.target == peer)
            .map(|(idx, _)| *idx)
            .collect();
        for idx in dead {
            if let Some(t) = inner.terminal.remove(&idx) {
                inner.by_pair.remove(&(t.via, t.target));
            }
        }
    }

    /// Number of active forwarding routes, for stats
    pub fn route_count(&self) -> usize {
        self.inner.read().expect("relay lock poisoned").routes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    /// Drive the full three-party establishment in one test
    #[test]
    fn test_three_party_establishment() {
        let a_ip = ip("10.0.0.1");
        let b_ip = ip("10.0.0.2"); // relay
        let c_ip = ip("10.0.0.3");

        let a = RelayEngine::new(false);
        let b = RelayEngine::new(true);
        let c = RelayEngine::new(false);

        // A asks B
        let RelayControlMsg::Request {
            initiator_index: idx_a,
            target,
            ..
        } = a.request(b_ip, c_ip)
        else {
            panic!("expected request");
        };
        assert_eq!(target, c_ip);

        // B installs routes and forwards to C
        let RelayAction::Send { to, msg } = b
            .handle_request_at_relay(a_ip, idx_a, c_ip, true)
            .unwrap();
        assert_eq!(to, c_ip);
        let RelayControlMsg::Request {
            initiator_index: idx_bc,
            initiator,
            ..
        } = msg
        else {
            panic!("expected propagated request");
        };
        assert_eq!(initiator, a_ip);

        // C accepts
        let RelayAction::Send { to, msg } = c.handle_request_at_target(b_ip, idx_bc, a_ip, true);
        assert_eq!(to, b_ip);
        let RelayControlMsg::Response {
            initiator_index,
            response_index: idx_c,
            ok,
        } = msg
        else {
            panic!("expected response");
        };
        assert!(ok);

        // B completes the pair and answers A
        let action = b
            .handle_response(c_ip, initiator_index, idx_c, ok)
            .unwrap()
            .expect("relay forwards the response");
        let RelayAction::Send { to, msg } = action;
        assert_eq!(to, a_ip);
        let RelayControlMsg::Response {
            initiator_index,
            response_index: idx_ba,
            ok,
        } = msg
        else {
            panic!("expected response");
        };
        assert_eq!(initiator_index, idx_a);

        // A records the established leg
        a.handle_response(b_ip, initiator_index, idx_ba, ok)
            .unwrap();
        assert_eq!(a.wire_index(b_ip, c_ip), Some(idx_ba));

        // Data path: A → B under idx_ba forwards to C under idx_c
        assert_eq!(b.route_for(idx_ba), Some((c_ip, idx_c)));
        // Reverse: C → B forwards back to A under idx_a
        let (rev_to, rev_idx) = b.route_for(c.wire_index(b_ip, a_ip).unwrap()).unwrap();
        assert_eq!((rev_to, rev_idx), (a_ip, idx_a));

        // C can unwrap frames arriving under its terminal index
        let leg = c.terminal_for(idx_c).unwrap();
        assert_eq!(leg.via, b_ip);
        assert_eq!(leg.target, a_ip);
    }

    #[test]
    fn test_refusal_propagates() {
        let a = RelayEngine::new(false);
        let b = RelayEngine::new(false); // not a relay

        let RelayControlMsg::Request {
            initiator_index, ..
        } = a.request(ip("10.0.0.2"), ip("10.0.0.3"))
        else {
            panic!();
        };

        let RelayAction::Send { msg, .. } = b
            .handle_request_at_relay(ip("10.0.0.1"), initiator_index, ip("10.0.0.3"), true)
            .unwrap();
        let RelayControlMsg::Response { ok, .. } = msg else {
            panic!();
        };
        assert!(!ok);

        // Initiator drops the pending leg on refusal
        assert!(a
            .handle_response(ip("10.0.0.2"), initiator_index, 0, false)
            .is_err());
        assert_eq!(a.wire_index(ip("10.0.0.2"), ip("10.0.0.3")), None);
    }

    #[test]
    fn test_one_relay_per_pair() {
        let a = RelayEngine::new(false);
        let m1 = a.request(ip("10.0.0.2"), ip("10.0.0.3"));
        let m2 = a.request(ip("10.0.0.2"), ip("10.0.0.3"));
        let (RelayControlMsg::Request { initiator_index: i1, .. }, RelayControlMsg::Request { initiator_index: i2, .. }) = (m1, m2) else {
            panic!();
        };
        assert_eq!(i1, i2);
    }

    #[test]
    fn test_remove_peer_cleans_up() {
        let b = RelayEngine::new(true);
        b.handle_request_at_relay(ip("10.0.0.1"), 42, ip("10.0.0.3"), true)
            .unwrap();
        assert_eq!(b.route_count(), 2);
        b.remove_peer(ip("10.0.0.3"));
        assert_eq!(b.route_count(), 0);
    }
}
