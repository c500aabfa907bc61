//! Identity and endpoint types shared across the P2P core.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use rand::RngCore;
use serde::Deserialize;

use ember_chain::Hash;

/// 32-byte node identity, generated once per process.
///
/// Learned from the `X-Node-Id` handshake header; equality is byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Fresh cryptographically random identity.
    pub fn random() -> Self {
        let mut out = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut out);
        Self(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// 64 lowercase hex characters, the handshake-header form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}…", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

/// Role a node plays in the network.
///
/// Discovery nodes are a read-only peer index: they answer `Ping` and
/// `RequestNodes` only, never broadcast, and never originate chain traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Normal,
    Discovery,
}

impl NodeType {
    pub fn as_u8(self) -> u8 {
        match self {
            NodeType::Normal => 0,
            NodeType::Discovery => 1,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NodeType::Normal),
            1 => Some(NodeType::Discovery),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeType::Normal => write!(f, "normal"),
            NodeType::Discovery => write!(f, "discovery"),
        }
    }
}

/// Where a peer's P2P server listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { ip: addr.ip(), port: addr.port() }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// What a `RequestNodes` answer says about one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub node_type: NodeType,
    pub endpoint: Endpoint,
}

/// Payload of an `Info` request or answer: the sender's view of its chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub version: u64,
    /// Sender's wall clock at encode time, microseconds since the epoch.
    pub timestamp_us: u64,
    pub height: u64,
    pub latest_block_hash: Hash,
}
