//! Overlay plumbing: rendezvous registration/discovery and peer dialing.
//!
//! Hosts announce their dialable address under `/wormhole/{nameplate}`;
//! connectors poll the same topic inside a bounded window and dial each
//! candidate. A candidate that exposes direct socket addresses is tried
//! direct-first (12 s), otherwise relay-first (20 s); either order falls
//! back to the other before giving up on that candidate.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use iroh::NodeAddr;
use tracing::{debug, info, warn};

use crate::config::{
    CHAT_ALPN, DIAL_DIRECT_TIMEOUT, DIAL_RELAY_TIMEOUT, DISCOVER_INTERVAL, DISCOVER_WINDOW,
    RZV_ALPN,
};
use crate::net::endpoint::Endpoint;
use crate::proto::wire::{
    RzvDiscover, RzvPeers, RzvRegister, FRAME_RZV_DISCOVER, FRAME_RZV_OK, FRAME_RZV_PEERS,
    FRAME_RZV_REGISTER,
};
use crate::proto::{read_frame, write_frame};

/// How a connection to a peer runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathInfo {
    /// Hole-punched or local; carries the remote socket address.
    Direct(String),
    /// Via a relay; carries the relay URL.
    Relay(String),
    /// Not yet determined.
    Unknown,
}

impl std::fmt::Display for PathInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathInfo::Direct(addr) => write!(f, "DIRECT ({addr})"),
            PathInfo::Relay(url) => write!(f, "RELAY via {url}"),
            PathInfo::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classifies the current path to a peer from the endpoint's view.
pub fn classify_path(endpoint: &Endpoint, peer: iroh::NodeId) -> PathInfo {
    use iroh::endpoint::ConnectionType;
    match endpoint.iroh().remote_info(peer) {
        Some(info) => match info.conn_type {
            ConnectionType::Direct(addr) => PathInfo::Direct(addr.to_string()),
            ConnectionType::Relay(url) => PathInfo::Relay(url.to_string()),
            ConnectionType::Mixed(addr, url) => {
                PathInfo::Direct(format!("{addr}, relay fallback {url}"))
            }
            ConnectionType::None => PathInfo::Unknown,
        },
        None => PathInfo::Unknown,
    }
}

/// Parses the opaque address strings of a control-plane bundle.
pub fn parse_node_addrs(addrs: &[String]) -> Vec<NodeAddr> {
    let mut out = Vec::new();
    for s in addrs {
        match serde_json::from_str::<NodeAddr>(s) {
            Ok(a) => out.push(a),
            Err(e) => debug!("skipping unparseable overlay addr: {e}"),
        }
    }
    out
}

/// Client handle to the rendezvous service.
pub struct RendezvousClient {
    conn: iroh::endpoint::Connection,
}

impl RendezvousClient {
    /// Dials the rendezvous service, trying each advertised address.
    pub async fn connect(endpoint: &Endpoint, addrs: &[String]) -> Result<Self> {
        let candidates = parse_node_addrs(addrs);
        if candidates.is_empty() {
            bail!("no valid rendezvous addrs");
        }
        let mut last_err = anyhow::anyhow!("no rendezvous candidates");
        for addr in candidates {
            match endpoint.connect(addr, RZV_ALPN).await {
                Ok(conn) => return Ok(Self { conn }),
                Err(e) => {
                    warn!("rendezvous dial failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err.context("connect rendezvous"))
    }

    /// Announces `me` under a topic with the given lifetime.
    pub async fn register(
        &self,
        namespace: &str,
        topic: &str,
        me: &NodeAddr,
        ttl: Duration,
    ) -> Result<()> {
        let (mut send, mut recv) = self.conn.open_bi().await.context("open rendezvous stream")?;
        let req = RzvRegister {
            namespace: namespace.to_string(),
            topic: topic.to_string(),
            addr: serde_json::to_string(me)?,
            ttl_seconds: ttl.as_secs() as i64,
        };
        write_frame(&mut send, FRAME_RZV_REGISTER, &serde_json::to_vec(&req)?).await?;
        let _ = send.finish();

        let (typ, _) = read_frame(&mut recv).await?;
        if typ != FRAME_RZV_OK {
            bail!("rendezvous register rejected (frame 0x{typ:02x})");
        }
        info!(topic = %topic, "registered on rendezvous");
        Ok(())
    }

    /// Looks up the peers currently registered under a topic.
    pub async fn discover(&self, namespace: &str, topic: &str) -> Result<Vec<NodeAddr>> {
        let (mut send, mut recv) = self.conn.open_bi().await.context("open rendezvous stream")?;
        let req = RzvDiscover {
            namespace: namespace.to_string(),
            topic: topic.to_string(),
        };
        write_frame(&mut send, FRAME_RZV_DISCOVER, &serde_json::to_vec(&req)?).await?;
        let _ = send.finish();

        let (typ, payload) = read_frame(&mut recv).await?;
        if typ != FRAME_RZV_PEERS {
            bail!("rendezvous discover rejected (frame 0x{typ:02x})");
        }
        let peers: RzvPeers = serde_json::from_slice(&payload)?;
        Ok(parse_node_addrs(&peers.addrs))
    }
}

fn direct_only(addr: &NodeAddr) -> Option<NodeAddr> {
    if addr.direct_addresses.is_empty() {
        return None;
    }
    Some(
        NodeAddr::new(addr.node_id)
            .with_direct_addresses(addr.direct_addresses.iter().copied()),
    )
}

fn relay_only(addr: &NodeAddr) -> Option<NodeAddr> {
    addr.relay_url
        .clone()
        .map(|url| NodeAddr::new(addr.node_id).with_relay_url(url))
}

/// Dials one peer, preferring the direct or the relayed route.
pub async fn dial_peer(
    endpoint: &Endpoint,
    addr: &NodeAddr,
    prefer_direct: bool,
) -> Result<iroh::endpoint::Connection> {
    let direct = direct_only(addr);
    let relay = relay_only(addr);

    let attempts: [(Option<NodeAddr>, Duration, &str); 2] = if prefer_direct {
        [
            (direct, DIAL_DIRECT_TIMEOUT, "direct"),
            (relay, DIAL_RELAY_TIMEOUT, "relay"),
        ]
    } else {
        [
            (relay, DIAL_RELAY_TIMEOUT, "relay"),
            (direct, DIAL_DIRECT_TIMEOUT, "direct"),
        ]
    };

    let mut last_err = anyhow::anyhow!("no dialable addrs for {}", addr.node_id);
    for (candidate, deadline, kind) in attempts {
        let Some(candidate) = candidate else { continue };
        debug!(peer = %addr.node_id, kind, "dialing");
        match tokio::time::timeout(deadline, endpoint.connect(candidate, CHAT_ALPN)).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = anyhow::anyhow!("{kind} dial timed out"),
        }
    }
    Err(last_err)
}

/// Polls the topic inside the discovery window and dials each candidate.
///
/// Direct is preferred whenever the discovered address exposes direct
/// socket addresses.
pub async fn discover_and_dial(
    endpoint: &Endpoint,
    rzv: &RendezvousClient,
    namespace: &str,
    topic: &str,
) -> Result<iroh::endpoint::Connection> {
    let deadline = tokio::time::Instant::now() + DISCOVER_WINDOW;
    let own_id = endpoint.device_id();
    let mut last_err = anyhow::anyhow!("no peers appeared on {topic}");

    while tokio::time::Instant::now() < deadline {
        let peers = match rzv.discover(namespace, topic).await {
            Ok(p) => p,
            Err(e) => {
                last_err = e;
                tokio::time::sleep(DISCOVER_INTERVAL).await;
                continue;
            }
        };
        for peer in peers {
            if peer.node_id == own_id {
                continue;
            }
            let prefer_direct = !peer.direct_addresses.is_empty();
            match dial_peer(endpoint, &peer, prefer_direct).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    warn!(peer = %peer.node_id, "dial failed: {e}");
                    last_err = e;
                }
            }
        }
        tokio::time::sleep(DISCOVER_INTERVAL).await;
    }
    Err(last_err.context("discovery window elapsed"))
}
