//! Static topology description: the node directory and the administrative link set.
//!
//! A [`Directory`] is an immutable snapshot built once per topology and shared by every node
//! (and by the [`ShortestPathOracle`](crate::ShortestPathOracle)).

use std::{net::Ipv4Addr, sync::Arc};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{NodeId, Position};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("Address {0} is already assigned")]
    DuplicateAddress(Ipv4Addr),
    #[error("Link from {0} to itself")]
    SelfLink(NodeId),
    #[error("Node {0} has no addresses")]
    NoAddress(NodeId),
}

/// The role a node plays in the network, resolved when the topology is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NodeRole {
    #[default]
    Terrestrial,
    /// Root of the fan-in tree. Tolerates a larger backlog before giving up on penalties.
    Gateway,
    SatelliteRelay,
    Backhaul,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub role: NodeRole,
    pub position: Position,
    /// Interface addresses, indexed by interface. The first one is the main address.
    pub addrs: Vec<Ipv4Addr>,
}

impl NodeRecord {
    #[inline]
    pub fn main_addr(&self) -> Ipv4Addr {
        self.addrs[0]
    }
}

/// Read-only node directory: id ↔ address, interface index, position and role.
#[derive(Debug, Clone, Default)]
pub struct Directory {
    nodes: Vec<NodeRecord>,
    by_addr: FxHashMap<Ipv4Addr, (NodeId, u8)>,
}

impl Directory {
    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id.index())
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.iter()
    }

    /// Resolves any interface address of a node to its id.
    pub fn node_by_addr(&self, addr: Ipv4Addr) -> Option<NodeId> {
        self.by_addr.get(&addr).map(|(id, _)| *id)
    }

    /// Resolves an interface address to the index of that interface on its node.
    pub fn iface_index(&self, addr: Ipv4Addr) -> Option<u8> {
        self.by_addr.get(&addr).map(|(_, i)| *i)
    }

    pub fn position(&self, id: NodeId) -> Option<Position> {
        self.node(id).map(|n| n.position)
    }

    pub fn role(&self, id: NodeId) -> NodeRole {
        self.node(id).map(|n| n.role).unwrap_or_default()
    }

    /// The gateway node, if the topology has one.
    pub fn gateway(&self) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.role == NodeRole::Gateway).map(|n| n.id)
    }
}

/// Medium of an administrative link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Terrestrial,
    Satellite,
}

/// An undirected link between two nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub a: NodeId,
    pub b: NodeId,
    pub kind: LinkKind,
}

/// Builder for a topology: nodes with their addresses and the links between them.
///
/// ```
/// use std::net::Ipv4Addr;
/// use bp_routing::{LinkKind, NodeRole, Position, Topology};
///
/// let mut topology = Topology::new();
/// let (addr_a, addr_b) = (Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2));
/// let a = topology.add_node(NodeRole::Terrestrial, Position::new(0.0, 0.0), [addr_a]).unwrap();
/// let b = topology.add_node(NodeRole::Gateway, Position::new(100.0, 0.0), [addr_b]).unwrap();
/// topology.add_link(a, b, LinkKind::Terrestrial).unwrap();
///
/// let oracle = topology.oracle();
/// assert_eq!(oracle.hops(a, b, false), Some(1));
/// ```
#[derive(Debug, Clone, Default)]
pub struct Topology {
    directory: Directory,
    links: Vec<Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id. Ids are assigned densely in insertion order.
    pub fn add_node(
        &mut self,
        role: NodeRole,
        position: Position,
        addrs: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Result<NodeId, TopologyError> {
        let id = NodeId(self.directory.nodes.len() as u32);
        let addrs: Vec<_> = addrs.into_iter().collect();

        if addrs.is_empty() {
            return Err(TopologyError::NoAddress(id));
        }

        for (i, addr) in addrs.iter().enumerate() {
            // Also catches duplicates within `addrs` itself.
            if self.directory.by_addr.contains_key(addr) || addrs[..i].contains(addr) {
                return Err(TopologyError::DuplicateAddress(*addr));
            }
        }

        for (i, addr) in addrs.iter().enumerate() {
            self.directory.by_addr.insert(*addr, (id, i as u8));
        }

        self.directory.nodes.push(NodeRecord { id, role, position, addrs });

        Ok(id)
    }

    /// Adds an undirected link.
    pub fn add_link(&mut self, a: NodeId, b: NodeId, kind: LinkKind) -> Result<(), TopologyError> {
        for id in [a, b] {
            if self.directory.node(id).is_none() {
                return Err(TopologyError::UnknownNode(id));
            }
        }

        if a == b {
            return Err(TopologyError::SelfLink(a));
        }

        self.links.push(Link { a, b, kind });

        Ok(())
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Builds both shortest-path tables for the current link set.
    pub fn oracle(&self) -> crate::ShortestPathOracle {
        crate::ShortestPathOracle::build(self.directory.len(), &self.links)
    }

    /// Freezes the topology into a shared directory snapshot and oracle.
    pub fn build(self) -> (Arc<Directory>, Arc<crate::ShortestPathOracle>) {
        let oracle = self.oracle();
        (Arc::new(self.directory), Arc::new(oracle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_lookups() {
        let mut topology = Topology::new();
        let a = topology
            .add_node(
                NodeRole::Terrestrial,
                Position::new(1.0, 2.0),
                [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 1, 0, 1)],
            )
            .unwrap();
        let g = topology
            .add_node(NodeRole::Gateway, Position::default(), [Ipv4Addr::new(10, 0, 0, 2)])
            .unwrap();

        let dir = topology.directory();
        assert_eq!(dir.node_by_addr(Ipv4Addr::new(10, 1, 0, 1)), Some(a));
        assert_eq!(dir.iface_index(Ipv4Addr::new(10, 1, 0, 1)), Some(1));
        assert_eq!(dir.gateway(), Some(g));
        assert_eq!(dir.role(g), NodeRole::Gateway);
        assert_eq!(dir.position(a), Some(Position::new(1.0, 2.0)));
        assert_eq!(dir.node(a).unwrap().main_addr(), Ipv4Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn rejects_invalid_input() {
        let mut topology = Topology::new();
        let a = topology
            .add_node(NodeRole::Terrestrial, Position::default(), [Ipv4Addr::new(10, 0, 0, 1)])
            .unwrap();

        assert_eq!(
            topology.add_node(
                NodeRole::Terrestrial,
                Position::default(),
                [Ipv4Addr::new(10, 0, 0, 1)]
            ),
            Err(TopologyError::DuplicateAddress(Ipv4Addr::new(10, 0, 0, 1)))
        );
        assert_eq!(
            topology.add_node(NodeRole::Terrestrial, Position::default(), []),
            Err(TopologyError::NoAddress(NodeId(1)))
        );
        assert_eq!(topology.add_link(a, a, LinkKind::Terrestrial), Err(TopologyError::SelfLink(a)));
        assert_eq!(
            topology.add_link(a, NodeId(9), LinkKind::Terrestrial),
            Err(TopologyError::UnknownNode(NodeId(9)))
        );
    }
}
