use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;

use crate::types::NodeType;

/// Admission cap for a Normal node's session registry.
pub const DEFAULT_MAX_CONNECTIONS_NORMAL: usize = 50;
/// Admission cap for a Discovery node's session registry.
pub const DEFAULT_MAX_CONNECTIONS_DISCOVERY: usize = 200;
/// Connection floor below which the discovery worker actively dials out.
pub const DEFAULT_MIN_CONNECTIONS: usize = 11;

/// Configuration for one P2P node.
///
/// Deserializable so the node binary can read it straight from YAML; every
/// field has a safe default (loopback bind, Normal role).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct P2pConfig {
    /// Local bind address for the WebSocket server.
    pub host_ip: IpAddr,
    pub host_port: u16,

    pub node_type: NodeType,

    /// Registry admission cap. `None` picks the role default (50 for Normal,
    /// 200 for Discovery).
    pub max_connections: Option<usize>,

    /// Discovery worker target floor.
    pub min_connections: usize,

    /// Endpoints dialed on startup to seed discovery.
    pub bootstrap_nodes: Vec<SocketAddr>,

    /// Passed to the chain codec for every decode.
    pub chain_id: u64,

    /// Node software version advertised in `Info` payloads.
    pub version: u64,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            host_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            host_port: 8086,
            node_type: NodeType::Normal,
            max_connections: None,
            min_connections: DEFAULT_MIN_CONNECTIONS,
            bootstrap_nodes: Vec::new(),
            chain_id: 808,
            version: 1,
        }
    }
}

impl P2pConfig {
    pub fn new(host_ip: IpAddr, host_port: u16, node_type: NodeType) -> Self {
        Self { host_ip, host_port, node_type, ..Self::default() }
    }

    /// The effective admission cap after applying the role default.
    pub fn effective_max_connections(&self) -> usize {
        self.max_connections.unwrap_or(match self.node_type {
            NodeType::Normal => DEFAULT_MAX_CONNECTIONS_NORMAL,
            NodeType::Discovery => DEFAULT_MAX_CONNECTIONS_DISCOVERY,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_default_caps() {
        let mut cfg = P2pConfig::default();
        assert_eq!(cfg.effective_max_connections(), DEFAULT_MAX_CONNECTIONS_NORMAL);
        cfg.node_type = NodeType::Discovery;
        assert_eq!(cfg.effective_max_connections(), DEFAULT_MAX_CONNECTIONS_DISCOVERY);
        cfg.max_connections = Some(2);
        assert_eq!(cfg.effective_max_connections(), 2);
    }
}
