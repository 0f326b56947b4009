//! Lighthouse client
//!
//! The engine consumes the lighthouse protocol: it asks where an overlay
//! address currently lives, announces its own endpoints, and requests
//! punches when NAT mappings go stale. Messages ride encrypted over the
//! node's tunnel to each lighthouse. Running a lighthouse service is
//! outside the core.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Lighthouse protocol message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LighthouseMsg {
    /// Where is this overlay address right now?
    HostQuery { vpn_ip: Ipv4Addr },
    /// Candidate endpoints for an overlay address
    HostQueryReply {
        vpn_ip: Ipv4Addr,
        endpoints: Vec<SocketAddr>,
    },
    /// My current endpoints
    HostUpdateNotify { endpoints: Vec<SocketAddr> },
    /// Ask the peer behind `vpn_ip` to punch toward these endpoints
    HostPunchNotify {
        vpn_ip: Ipv4Addr,
        endpoints: Vec<SocketAddr>,
    },
}

impl LighthouseMsg {
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| CoreError::MalformedPacket(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        bincode::deserialize(bytes).map_err(|e| CoreError::MalformedPacket(e.to_string()))
    }
}

/// Client-side lighthouse state: the configured lighthouses and a
/// bounded buffer of address lookups awaiting dispatch
pub struct LighthouseClient {
    lighthouses: Vec<Ipv4Addr>,
    query_tx: mpsc::Sender<Ipv4Addr>,
    query_rx: Mutex<mpsc::Receiver<Ipv4Addr>>,
    dropped_queries: AtomicU64,
}

impl LighthouseClient {
    pub fn new(lighthouses: Vec<Ipv4Addr>, query_buffer: usize) -> Self {
        let (query_tx, query_rx) = mpsc::channel(query_buffer.max(1));
        Self {
            lighthouses,
            query_tx,
            query_rx: Mutex::new(query_rx),
            dropped_queries: AtomicU64::new(0),
        }
    }

    pub fn lighthouses(&self) -> &[Ipv4Addr] {
        &self.lighthouses
    }

    pub fn is_lighthouse(&self, ip: Ipv4Addr) -> bool {
        self.lighthouses.contains(&ip)
    }

    /// Queue an address lookup. Returns false (and counts) when the
    /// buffer is full; the periodic handshake retry will re-queue.
    pub fn queue_query(&self, vpn_ip: Ipv4Addr) -> bool {
        match self.query_tx.try_send(vpn_ip) {
            Ok(()) => true,
            Err(_) => {
                self.dropped_queries.fetch_add(1, Ordering::Relaxed);
                debug!(%vpn_ip, "lighthouse query buffer full, dropping lookup");
                false
            }
        }
    }

    /// Next queued lookup; None once the node shuts down
    pub async fn next_query(&self) -> Option<Ipv4Addr> {
        self.query_rx.lock().await.recv().await
    }

    pub fn dropped_queries(&self) -> u64 {
        self.dropped_queries.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let msg = LighthouseMsg::HostQueryReply {
            vpn_ip: "10.0.0.7".parse().unwrap(),
            endpoints: vec!["192.0.2.1:4242".parse().unwrap()],
        };
        let decoded = LighthouseMsg::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            LighthouseMsg::HostQueryReply { vpn_ip, endpoints } => {
                assert_eq!(vpn_ip, "10.0.0.7".parse::<Ipv4Addr>().unwrap());
                assert_eq!(endpoints.len(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_buffer_bounded() {
        let client = LighthouseClient::new(vec!["10.0.0.254".parse().unwrap()], 2);

        assert!(client.queue_query("10.0.0.1".parse().unwrap()));
        assert!(client.queue_query("10.0.0.2".parse().unwrap()));
        assert!(!client.queue_query("10.0.0.3".parse().unwrap()));
        assert_eq!(client.dropped_queries(), 1);

        assert_eq!(
            client.next_query().await,
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_is_lighthouse() {
        let client = LighthouseClient::new(vec!["10.0.0.254".parse().unwrap()], 4);
        assert!(client.is_lighthouse("10.0.0.254".parse().unwrap()));
        assert!(!client.is_lighthouse("10.0.0.1".parse().unwrap()));
    }
}
