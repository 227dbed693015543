//! Penalty strategies: the path-preference bias subtracted (scaled by V) from queue
//! differentials.
//!
//! A negative penalty is a reward. Strategies see the whole candidate set at once, since whether
//! a farther neighbor is penalized depends on what else is available.

use std::net::Ipv4Addr;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{
    neighbor::NeighborId, topology::Directory, IfaceId, NodeId, Position, ShortestPathOracle,
};

/// Default penalty added for sending a packet straight back to where it came from.
pub const DEFAULT_LOOP_PENALTY: f64 = 2.0;

/// A (neighbor, local interface) pair considered for forwarding.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: NeighborId,
    /// Neighbor interface address.
    pub addr: Ipv4Addr,
    pub main_addr: Ipv4Addr,
    pub node: Option<NodeId>,
    pub local_iface: IfaceId,
    pub position: Position,
    /// Neighbor backlog used for the queue differential.
    pub backlog: f64,
}

/// Everything a penalty strategy may consult for one decision.
#[derive(Debug, Clone, Copy)]
pub struct PenaltyContext<'a> {
    pub directory: &'a Directory,
    pub oracle: &'a ShortestPathOracle,
    /// The deciding node.
    pub node: Option<NodeId>,
    pub position: Position,
    pub dst: Ipv4Addr,
    /// Whether hop distances may use satellite links.
    pub use_sat: bool,
    /// The neighbor the packet was received from.
    pub prev_hop: Option<Ipv4Addr>,
    /// The local interface the packet was received on.
    pub in_iface: Option<IfaceId>,
}

impl PenaltyContext<'_> {
    pub fn dst_node(&self) -> Option<NodeId> {
        self.directory.node_by_addr(self.dst)
    }

    /// Whether forwarding to `candidate` would send the packet straight back: to the previous
    /// hop, over the interface it arrived on. Another radio towards the same node is not a loop.
    pub fn is_loop(&self, candidate: &Candidate) -> bool {
        let same_node =
            self.prev_hop.is_some_and(|p| p == candidate.addr || p == candidate.main_addr);
        same_node && self.in_iface.map_or(true, |i| i == candidate.local_iface)
    }
}

/// A pluggable penalty function.
pub trait PenaltyStrategy: Send + std::fmt::Debug {
    /// Returns one penalty per candidate, in order.
    fn penalties(&mut self, ctx: &PenaltyContext<'_>, candidates: &[Candidate]) -> Vec<f64>;

    /// Called after a max-weight decision picked `chosen`.
    fn on_decision(&mut self, _ctx: &PenaltyContext<'_>, _chosen: &Candidate) {}
}

/// Which built-in penalty strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PenaltyKind {
    #[default]
    Hop,
    Geo,
    None,
}

impl PenaltyKind {
    pub fn build(self) -> Box<dyn PenaltyStrategy> {
        match self {
            Self::Hop => Box::<HopPenalty>::default(),
            Self::Geo => Box::<GeoPenalty>::default(),
            Self::None => Box::new(NoPenalty),
        }
    }
}

/// Pure backpressure: no bias.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPenalty;

impl PenaltyStrategy for NoPenalty {
    fn penalties(&mut self, _ctx: &PenaltyContext<'_>, candidates: &[Candidate]) -> Vec<f64> {
        vec![0.0; candidates.len()]
    }
}

#[derive(Debug, Clone, Copy)]
struct Shadow {
    neighbor: Ipv4Addr,
    credit: f64,
}

/// Hop-distance penalty.
///
/// * Neighbors strictly closer to the destination (by the oracle) are rewarded.
/// * Farther neighbors are penalized in proportion to the extra hops, unless no usable closer
///   neighbor exists; a closer neighbor is unusable if it is the previous hop.
/// * Sending back to the previous hop costs [`loop_penalty`](Self::loop_penalty) on top.
/// * At a local minimum (no usable closer neighbor) the neighbor chosen last time for the same
///   destination earns a shadow credit that grows each time it is chosen again. This keeps
///   equal-distance neighbors from being alternated packet by packet.
#[derive(Debug, Clone)]
pub struct HopPenalty {
    pub reward: f64,
    pub loop_penalty: f64,
    pub shadow_step: f64,
    pub shadow_max: f64,
    shadow: FxHashMap<Ipv4Addr, Shadow>,
    /// Whether the last evaluated decision was at a local minimum.
    local_minimum: bool,
}

impl Default for HopPenalty {
    fn default() -> Self {
        Self {
            reward: 1.0,
            loop_penalty: DEFAULT_LOOP_PENALTY,
            shadow_step: 0.25,
            shadow_max: 1.0,
            shadow: FxHashMap::default(),
            local_minimum: false,
        }
    }
}

impl HopPenalty {
    /// Current shadow credit towards `dst`, and the neighbor holding it.
    pub fn shadow(&self, dst: Ipv4Addr) -> Option<(Ipv4Addr, f64)> {
        self.shadow.get(&dst).map(|s| (s.neighbor, s.credit))
    }
}

impl PenaltyStrategy for HopPenalty {
    fn penalties(&mut self, ctx: &PenaltyContext<'_>, candidates: &[Candidate]) -> Vec<f64> {
        let loops: Vec<bool> = candidates.iter().map(|c| ctx.is_loop(c)).collect();
        let loop_penalty = self.loop_penalty;
        let loop_cost = |i: usize| if loops[i] { loop_penalty } else { 0.0 };

        let (Some(dst), Some(me)) = (ctx.dst_node(), ctx.node) else {
            self.local_minimum = false;
            return (0..candidates.len()).map(loop_cost).collect();
        };

        let Some(own) = ctx.oracle.hops(me, dst, ctx.use_sat) else {
            self.local_minimum = false;
            return (0..candidates.len()).map(loop_cost).collect();
        };

        // Hop difference relative to our own distance. Unknown or disconnected neighbors count
        // as one hop farther.
        let diffs: Vec<i64> = candidates
            .iter()
            .map(|c| {
                c.node
                    .and_then(|n| ctx.oracle.hops(n, dst, ctx.use_sat))
                    .map_or(1, |h| i64::from(h) - i64::from(own))
            })
            .collect();

        let usable_closer = diffs.iter().zip(&loops).any(|(&d, &l)| d < 0 && !l);
        let shadow = if usable_closer { None } else { self.shadow.get(&ctx.dst).copied() };
        let reward = self.reward;

        let penalties = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut penalty = match diffs[i] {
                    d if d < 0 => -reward,
                    0 => 0.0,
                    d if usable_closer => reward * d as f64,
                    _ => 0.0,
                };

                penalty += loop_cost(i);

                if let Some(s) = shadow.filter(|s| s.neighbor == c.addr) {
                    penalty -= s.credit;
                }

                penalty
            })
            .collect();

        self.local_minimum = !usable_closer;
        if usable_closer {
            self.shadow.remove(&ctx.dst);
        }

        penalties
    }

    fn on_decision(&mut self, ctx: &PenaltyContext<'_>, chosen: &Candidate) {
        if !self.local_minimum {
            return;
        }

        let step = self.shadow_step;
        let max = self.shadow_max;
        let shadow =
            self.shadow.entry(ctx.dst).or_insert(Shadow { neighbor: chosen.addr, credit: 0.0 });

        if shadow.neighbor == chosen.addr {
            shadow.credit = (shadow.credit + step).min(max);
        } else {
            *shadow = Shadow { neighbor: chosen.addr, credit: step.min(max) };
        }

        trace!(
            dst = %ctx.dst,
            neighbor = %chosen.addr,
            credit = shadow.credit,
            "Updated shadow credit"
        );
    }
}

/// Geographic progress penalty: relative change in distance to the destination.
///
/// A neighbor that halves the remaining distance gets `-0.5`, one that moves the packet away
/// gets a positive penalty, capped at `1.0`.
#[derive(Debug, Clone)]
pub struct GeoPenalty {
    pub loop_penalty: f64,
}

impl Default for GeoPenalty {
    fn default() -> Self {
        Self { loop_penalty: DEFAULT_LOOP_PENALTY }
    }
}

impl PenaltyStrategy for GeoPenalty {
    fn penalties(&mut self, ctx: &PenaltyContext<'_>, candidates: &[Candidate]) -> Vec<f64> {
        let target = ctx.dst_node().and_then(|n| ctx.directory.position(n));
        let own = target.map(|t| ctx.position.distance(&t)).unwrap_or_default();

        candidates
            .iter()
            .map(|c| {
                let progress = match target {
                    Some(t) if own > 0.0 => {
                        ((c.position.distance(&t) - own) / own).clamp(-1.0, 1.0)
                    }
                    _ => 0.0,
                };

                if ctx.is_loop(c) {
                    progress + self.loop_penalty
                } else {
                    progress
                }
            })
            .collect()
    }
}
