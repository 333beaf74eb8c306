//! Node addressing.
//!
//! Every participant of a cluster is identified by a 16-bit [`NodeId`]. The transport does not
//! discover nodes on its own: a [`NodeMap`] is injected at construction and answers which socket
//! address belongs to which node.
use std::{collections::HashMap, fmt, net::SocketAddr, str::FromStr};

use thiserror::Error;

/// Identifier of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u16);

impl NodeId {
    /// Reserved id that never names a real node.
    pub const INVALID: NodeId = NodeId(0xFFFF);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

impl From<u16> for NodeId {
    fn from(value: u16) -> Self {
        NodeId(value)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeMapError {
    #[error("invalid node entry '{0}', expected ID=ADDR")]
    Malformed(String),
    #[error("invalid node id '{0}'")]
    InvalidId(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
}

/// Lookup table from node ids to network addresses.
pub trait NodeMap: Send + Sync {
    fn own_node_id(&self) -> NodeId;
    fn address(&self, node: NodeId) -> Option<SocketAddr>;
}

/// A fixed [`NodeMap`] built once at startup.
#[derive(Debug, Clone)]
pub struct StaticNodeMap {
    own: NodeId,
    nodes: HashMap<NodeId, SocketAddr>,
}

impl StaticNodeMap {
    pub fn new(own: NodeId) -> Self {
        Self {
            own,
            nodes: HashMap::new(),
        }
    }

    pub fn with_node(mut self, node: NodeId, address: SocketAddr) -> Self {
        self.insert(node, address);
        self
    }

    pub fn insert(&mut self, node: NodeId, address: SocketAddr) {
        self.nodes.insert(node, address);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeMap for StaticNodeMap {
    fn own_node_id(&self) -> NodeId {
        self.own
    }

    fn address(&self, node: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&node).copied()
    }
}

/// Parses decimal or `0x` prefixed hex ids.
impl FromStr for NodeId {
    type Err = NodeMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s.trim();
        match id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16),
            None => id.parse::<u16>(),
        }
        .map(NodeId)
        .map_err(|_| NodeMapError::InvalidId(id.to_string()))
    }
}

/// Parses `ID=ADDR` pairs, where `ID` is decimal or `0x` prefixed hex.
impl FromStr for NodeEntry {
    type Err = NodeMapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id, addr) = s
            .split_once('=')
            .ok_or_else(|| NodeMapError::Malformed(s.to_string()))?;

        let node = id.parse::<NodeId>()?;

        let address = addr
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| NodeMapError::InvalidAddress(addr.to_string()))?;

        Ok(NodeEntry { node, address })
    }
}

/// One `ID=ADDR` entry of a node table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeEntry {
    pub node: NodeId,
    pub address: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_displays_as_hex() {
        assert_eq!(NodeId(0x2a).to_string(), "0x002A");
        assert!(!NodeId::INVALID.is_valid());
    }

    #[test]
    fn parse_node_entries() {
        let entry: NodeEntry = "0x10=127.0.0.1:22221".parse().unwrap();
        assert_eq!(entry.node, NodeId(16));
        assert_eq!(entry.address, "127.0.0.1:22221".parse().unwrap());

        let entry: NodeEntry = "7=10.0.0.1:80".parse().unwrap();
        assert_eq!(entry.node, NodeId(7));
    }

    #[test]
    fn reject_malformed_entries() {
        assert_eq!(
            "127.0.0.1:80".parse::<NodeEntry>(),
            Err(NodeMapError::Malformed("127.0.0.1:80".into()))
        );
        assert_eq!(
            "x=127.0.0.1:80".parse::<NodeEntry>(),
            Err(NodeMapError::InvalidId("x".into()))
        );
        assert_eq!(
            "1=nowhere".parse::<NodeEntry>(),
            Err(NodeMapError::InvalidAddress("nowhere".into()))
        );
    }

    #[test]
    fn static_map_lookup() {
        let addr: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let map = StaticNodeMap::new(NodeId(1)).with_node(NodeId(2), addr);

        assert_eq!(map.own_node_id(), NodeId(1));
        assert_eq!(map.address(NodeId(2)), Some(addr));
        assert_eq!(map.address(NodeId(3)), None);
        assert_eq!(map.len(), 1);
    }
}
