//! All-pairs shortest hop distances, precomputed with Floyd–Warshall.
//!
//! The oracle is side information for the penalty function, not distributed protocol state. It
//! is rebuilt only when the administrative topology changes.

use std::net::Ipv4Addr;

use tracing::debug;

use crate::{
    topology::{Directory, Link, LinkKind},
    NodeId,
};

/// Distance and predecessor matrices for one link set.
#[derive(Debug, Clone)]
pub struct HopMatrix {
    n: usize,
    /// `dist[i * n + j]`, `None` if unreachable.
    dist: Vec<Option<u32>>,
    /// `pred[i * n + j]` is the node before `j` on a shortest path from `i`.
    pred: Vec<Option<NodeId>>,
}

impl HopMatrix {
    /// Runs Floyd–Warshall over `n` nodes and the given undirected edges.
    pub fn build_all_pairs(n: usize, edges: impl IntoIterator<Item = (NodeId, NodeId)>) -> Self {
        let mut dist = vec![None; n * n];
        let mut pred = vec![None; n * n];

        for i in 0..n {
            dist[i * n + i] = Some(0);
        }

        for (a, b) in edges {
            let (a, b) = (a.index(), b.index());
            if a >= n || b >= n || a == b {
                continue;
            }

            dist[a * n + b] = Some(1);
            dist[b * n + a] = Some(1);
            pred[a * n + b] = Some(NodeId(a as u32));
            pred[b * n + a] = Some(NodeId(b as u32));
        }

        for k in 0..n {
            for i in 0..n {
                let Some(ik) = dist[i * n + k] else { continue };
                for j in 0..n {
                    let Some(kj) = dist[k * n + j] else { continue };
                    let through = ik + kj;
                    if dist[i * n + j].map_or(true, |ij| through < ij) {
                        dist[i * n + j] = Some(through);
                        pred[i * n + j] = pred[k * n + j];
                    }
                }
            }
        }

        Self { n, dist, pred }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Hop distance from `src` to `dst`, `None` if unreachable or out of range.
    #[inline]
    pub fn hops(&self, src: NodeId, dst: NodeId) -> Option<u32> {
        let (i, j) = (src.index(), dst.index());
        if i >= self.n || j >= self.n {
            return None;
        }

        self.dist[i * self.n + j]
    }

    /// Reconstructs a shortest path, both endpoints included.
    pub fn path(&self, src: NodeId, dst: NodeId) -> Option<Vec<NodeId>> {
        self.hops(src, dst)?;

        let mut path = vec![dst];
        let mut current = dst;
        while current != src {
            current = self.pred[src.index() * self.n + current.index()]?;
            path.push(current);
        }

        path.reverse();
        Some(path)
    }
}

/// Two hop tables: one over terrestrial links only, one that also uses satellite links.
#[derive(Debug, Clone)]
pub struct ShortestPathOracle {
    terrestrial: HopMatrix,
    satellite: HopMatrix,
}

impl ShortestPathOracle {
    /// Builds both tables for `n` nodes.
    pub fn build(n: usize, links: &[Link]) -> Self {
        let terrestrial = HopMatrix::build_all_pairs(
            n,
            links.iter().filter(|l| l.kind == LinkKind::Terrestrial).map(|l| (l.a, l.b)),
        );
        let satellite = HopMatrix::build_all_pairs(n, links.iter().map(|l| (l.a, l.b)));

        debug!(nodes = n, links = links.len(), "Built shortest path oracle");

        Self { terrestrial, satellite }
    }

    #[inline]
    fn matrix(&self, use_sat: bool) -> &HopMatrix {
        if use_sat {
            &self.satellite
        } else {
            &self.terrestrial
        }
    }

    /// Hop distance between two nodes.
    #[inline]
    pub fn hops(&self, src: NodeId, dst: NodeId, use_sat: bool) -> Option<u32> {
        self.matrix(use_sat).hops(src, dst)
    }

    /// Hop distance between the nodes owning two interface addresses.
    pub fn hops_by_addr(
        &self,
        directory: &Directory,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        use_sat: bool,
    ) -> Option<u32> {
        let src = directory.node_by_addr(src)?;
        let dst = directory.node_by_addr(dst)?;
        self.hops(src, dst, use_sat)
    }

    pub fn path(&self, src: NodeId, dst: NodeId, use_sat: bool) -> Option<Vec<NodeId>> {
        self.matrix(use_sat).path(src, dst)
    }

    pub fn len(&self) -> usize {
        self.terrestrial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terrestrial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NodeRole, Position, Topology};

    /// 0 - 1 - 2 - 3 - 4 terrestrial line, plus a satellite shortcut 0 ~ 4, and an isolated 5.
    fn line_with_shortcut() -> Topology {
        let mut topology = Topology::new();
        for i in 0..6u8 {
            topology
                .add_node(
                    NodeRole::Terrestrial,
                    Position::new(f64::from(i) * 100.0, 0.0),
                    [Ipv4Addr::new(10, 0, 0, i + 1)],
                )
                .unwrap();
        }
        for i in 0..4 {
            topology.add_link(NodeId(i), NodeId(i + 1), LinkKind::Terrestrial).unwrap();
        }
        topology.add_link(NodeId(0), NodeId(4), LinkKind::Satellite).unwrap();
        topology
    }

    #[test]
    fn distance_properties() {
        let oracle = line_with_shortcut().oracle();
        let n = oracle.len() as u32;

        for a in 0..n {
            assert_eq!(oracle.hops(NodeId(a), NodeId(a), false), Some(0));
            assert_eq!(oracle.hops(NodeId(a), NodeId(a), true), Some(0));

            for b in 0..n {
                let (a, b) = (NodeId(a), NodeId(b));
                for sat in [false, true] {
                    assert_eq!(oracle.hops(a, b, sat), oracle.hops(b, a, sat));
                }

                match (oracle.hops(a, b, false), oracle.hops(a, b, true)) {
                    (Some(t), Some(s)) => assert!(s <= t),
                    (Some(_), None) => panic!("satellite table lost a path"),
                    _ => {}
                }
            }
        }
    }

    #[test]
    fn satellite_shortcut() {
        let oracle = line_with_shortcut().oracle();
        assert_eq!(oracle.hops(NodeId(0), NodeId(4), false), Some(4));
        assert_eq!(oracle.hops(NodeId(0), NodeId(4), true), Some(1));
        assert_eq!(oracle.hops(NodeId(1), NodeId(4), true), Some(2));
        assert_eq!(oracle.hops(NodeId(0), NodeId(5), true), None);
        assert_eq!(oracle.hops(NodeId(0), NodeId(42), true), None);
    }

    #[test]
    fn path_reconstruction() {
        let oracle = line_with_shortcut().oracle();
        assert_eq!(
            oracle.path(NodeId(0), NodeId(3), false),
            Some(vec![NodeId(0), NodeId(1), NodeId(2), NodeId(3)])
        );
        assert_eq!(oracle.path(NodeId(1), NodeId(4), true).map(|p| p.len()), Some(3));
        assert_eq!(oracle.path(NodeId(2), NodeId(2), false), Some(vec![NodeId(2)]));
        assert_eq!(oracle.path(NodeId(0), NodeId(5), false), None);
    }

    #[test]
    fn lookup_by_address() {
        let topology = line_with_shortcut();
        let oracle = topology.oracle();
        let dir = topology.directory();

        assert_eq!(
            oracle.hops_by_addr(dir, Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 3), false),
            Some(2)
        );
        assert_eq!(
            oracle.hops_by_addr(
                dir,
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(192, 168, 0, 1),
                false
            ),
            None
        );
    }
}
