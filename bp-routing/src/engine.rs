//! The max-weight forwarding decision.
//!
//! One engine covers every node flavor (single-radio, multi-radio, ring, grid, hybrid). What
//! differs between them is plugged in: the [`PenaltyStrategy`], the [`CandidateFilter`] deciding
//! which neighbors may carry a packet, and the [`BacklogProbe`] reading neighbor backlogs.

use std::{net::Ipv4Addr, sync::Arc, time::Instant};

use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::{
    flow::{FlowTable, Lookup},
    iface::{IfaceKind, Interfaces},
    neighbor::{NeighborId, NeighborTable, NeighborTuple},
    penalty::{Candidate, PenaltyContext, PenaltyKind, PenaltyStrategy},
    topology::Directory,
    vcontrol::VController,
    IfaceId, NodeId, PacketMeta, Position, Route, ShortestPathOracle,
};

/// No neighbor qualifies. The packet stays queued.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("No eligible next hop towards {dst}")]
pub struct Unreachable {
    pub dst: Ipv4Addr,
}

/// Whether decisions are cached per flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingPolicy {
    /// Packets of a flow follow the cached route while it is fresh.
    #[default]
    FlowAffinity,
    /// Every packet is routed from scratch.
    PerPacket,
}

/// How to choose among candidates tied at the maximum weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The flow's previous route if it is tied, else uniformly at random.
    #[default]
    FlowThenRandom,
    Random,
    /// The lowest neighbor address. Deterministic, for tests and replay.
    Lowest,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub policy: RoutingPolicy,
    pub tie_break: TieBreak,
    pub penalty: PenaltyKind,
    /// The running maximum starts here: only candidates weighing more qualify.
    pub min_weight: f64,
    /// Use per-interface backlogs on both ends (multi-radio) instead of node totals.
    pub per_interface_backlog: bool,
}

impl EngineOptions {
    pub fn with_policy(mut self, policy: RoutingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_penalty(mut self, penalty: PenaltyKind) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_min_weight(mut self, min_weight: f64) -> Self {
        self.min_weight = min_weight;
        self
    }

    pub fn with_per_interface_backlog(mut self) -> Self {
        self.per_interface_backlog = true;
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            policy: RoutingPolicy::FlowAffinity,
            tie_break: TieBreak::FlowThenRandom,
            penalty: PenaltyKind::Hop,
            min_weight: 0.0,
            per_interface_backlog: false,
        }
    }
}

/// Decides which neighbors may carry a packet.
pub trait CandidateFilter: Send + std::fmt::Debug {
    fn eligible(&self, meta: &PacketMeta, tuple: &NeighborTuple, kind: IfaceKind) -> bool;
}

/// Satellite interfaces carry satellite-flagged flows only.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficClassFilter;

impl CandidateFilter for TrafficClassFilter {
    fn eligible(&self, meta: &PacketMeta, _tuple: &NeighborTuple, kind: IfaceKind) -> bool {
        kind != IfaceKind::Satellite || meta.satellite
    }
}

/// Reads the backlog of a neighbor.
pub trait BacklogProbe: Send + std::fmt::Debug {
    /// Returns `None` if the neighbor link should not be used.
    fn backlog(&self, tuple: &NeighborTuple, per_interface: bool) -> Option<f64>;
}

/// Backlog as advertised in the neighbor's last HELLO.
#[derive(Debug, Clone, Copy, Default)]
pub struct HelloTelemetry;

impl BacklogProbe for HelloTelemetry {
    fn backlog(&self, tuple: &NeighborTuple, per_interface: bool) -> Option<f64> {
        if per_interface {
            tuple.link_backlog().map(f64::from)
        } else {
            Some(f64::from(tuple.queue_length))
        }
    }
}

/// Live backlogs shared between co-located nodes, keyed by main address.
///
/// Used by the oracle baseline, where nodes read each other's queues directly instead of
/// waiting for HELLOs.
#[derive(Debug, Clone, Default)]
pub struct BacklogBoard {
    inner: Arc<RwLock<FxHashMap<Ipv4Addr, u32>>>,
}

impl BacklogBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, node: Ipv4Addr, backlog: u32) {
        self.inner.write().insert(node, backlog);
    }

    pub fn get(&self, node: Ipv4Addr) -> Option<u32> {
        self.inner.read().get(&node).copied()
    }

    pub fn remove(&self, node: Ipv4Addr) {
        self.inner.write().remove(&node);
    }
}

/// Reads backlogs from a [`BacklogBoard`], falling back to HELLO telemetry for nodes that
/// don't publish.
#[derive(Debug, Clone, Default)]
pub struct BoardProbe {
    board: BacklogBoard,
}

impl BoardProbe {
    pub fn new(board: BacklogBoard) -> Self {
        Self { board }
    }
}

impl BacklogProbe for BoardProbe {
    fn backlog(&self, tuple: &NeighborTuple, per_interface: bool) -> Option<f64> {
        match self.board.get(tuple.main_addr) {
            Some(backlog) => Some(f64::from(backlog)),
            None => HelloTelemetry.backlog(tuple, per_interface),
        }
    }
}

/// The packet being routed and the event that triggered the decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionContext<'a> {
    pub meta: &'a PacketMeta,
    pub in_iface: Option<IfaceId>,
    pub prev_hop: Option<Ipv4Addr>,
    /// The interface holding the transmit opportunity, if any.
    pub dequeue_iface: Option<IfaceId>,
    pub now: Instant,
}

/// The node state a decision reads. Only the flow table is written.
#[derive(Debug)]
pub struct RoutingEnv<'a> {
    pub neighbors: &'a NeighborTable,
    pub flows: &'a mut FlowTable,
    pub interfaces: &'a Interfaces,
    /// Local backlog per interface.
    pub iface_backlog: &'a [usize],
    /// Local interfaces whose queue storage is congested.
    pub congested: &'a [IfaceId],
    /// Total local backlog.
    pub backlog: usize,
    pub v: &'a VController,
    pub directory: &'a Directory,
    pub oracle: &'a ShortestPathOracle,
    pub node: Option<NodeId>,
    pub position: Position,
}

impl RoutingEnv<'_> {
    #[inline]
    fn iface_backlog(&self, iface: IfaceId) -> usize {
        self.iface_backlog.get(iface.index()).copied().unwrap_or_default()
    }
}

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// The destination is a direct neighbor.
    Shortcut,
    /// A fresh cached route for the flow.
    Flow,
    /// Max-weight over `ties` candidates tied at the maximum.
    MaxWeight { ties: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub route: Route,
    pub neighbor: NeighborId,
    /// The winning weight, for max-weight decisions.
    pub weight: Option<f64>,
    pub source: DecisionSource,
}

struct Weighted {
    candidate: Candidate,
    weight: f64,
}

/// The backpressure forwarding engine.
#[derive(Debug)]
pub struct ForwardingEngine {
    options: EngineOptions,
    penalty: Box<dyn PenaltyStrategy>,
    filter: Box<dyn CandidateFilter>,
    probe: Box<dyn BacklogProbe>,
}

impl ForwardingEngine {
    /// Creates an engine with the configured penalty, the traffic-class filter and HELLO
    /// telemetry.
    pub fn new(options: EngineOptions) -> Self {
        let penalty = options.penalty.build();
        Self {
            options,
            penalty,
            filter: Box::new(TrafficClassFilter),
            probe: Box::new(HelloTelemetry),
        }
    }

    pub fn with_penalty(mut self, penalty: Box<dyn PenaltyStrategy>) -> Self {
        self.penalty = penalty;
        self
    }

    pub fn with_filter(mut self, filter: Box<dyn CandidateFilter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_probe(mut self, probe: Box<dyn BacklogProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the backlog probe in place.
    pub fn set_probe(&mut self, probe: Box<dyn BacklogProbe>) {
        self.probe = probe;
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Whether a neighbor link may carry this packet. Links on a down interface never do, so
    /// no decision names one.
    fn usable(
        &self,
        ctx: &DecisionContext<'_>,
        env: &RoutingEnv<'_>,
        tuple: &NeighborTuple,
    ) -> bool {
        env.interfaces.is_up(tuple.local_iface) &&
            env.interfaces
                .kind(tuple.local_iface)
                .is_some_and(|kind| self.filter.eligible(ctx.meta, tuple, kind))
    }

    /// A congested egress lane accepts no packets moved in from other interfaces until it drains
    /// below its low watermark. It still serves its own transmit opportunities.
    fn accepts_moves(ctx: &DecisionContext<'_>, env: &RoutingEnv<'_>, iface: IfaceId) -> bool {
        Some(iface) == ctx.dequeue_iface || !env.congested.contains(&iface)
    }

    /// Among links to the same node, prefer the dequeue interface, then the least loaded one.
    fn link_preference(
        ctx: &DecisionContext<'_>,
        env: &RoutingEnv<'_>,
        iface: IfaceId,
    ) -> (bool, usize, IfaceId) {
        (Some(iface) != ctx.dequeue_iface, env.iface_backlog(iface), iface)
    }

    /// Picks the next hop and egress interface for a packet.
    pub fn select_next_hop<R: Rng + ?Sized>(
        &mut self,
        ctx: &DecisionContext<'_>,
        env: &mut RoutingEnv<'_>,
        rng: &mut R,
    ) -> Result<Decision, Unreachable> {
        let meta = ctx.meta;
        let dst = meta.dst;

        // One-hop shortcut, independent of weights.
        let shortcut = env
            .neighbors
            .by_addr(dst, ctx.now)
            .filter(|(_, t)| self.usable(ctx, &*env, t))
            .min_by_key(|(_, t)| Self::link_preference(ctx, &*env, t.local_iface));

        if let Some((id, tuple)) = shortcut {
            let route = Route::new(tuple.iface_addr, tuple.local_iface);
            trace!(%dst, %route, "Destination is a direct neighbor");
            return Ok(Decision {
                route,
                neighbor: id,
                weight: None,
                source: DecisionSource::Shortcut,
            });
        }

        let key = meta.flow_key();
        let mut hint = None;

        if self.options.policy == RoutingPolicy::FlowAffinity {
            match env.flows.lookup(&key, meta.ttl, ctx.now) {
                Lookup::Hit(route) => {
                    let cached = env
                        .neighbors
                        .find(route.next_hop, route.out_iface)
                        .and_then(|id| env.neighbors.get(id).map(|t| (id, t)))
                        .filter(|(_, t)| {
                            env.neighbors.is_valid(t, ctx.now) &&
                                t.willing() &&
                                self.usable(ctx, &*env, t) &&
                                Self::accepts_moves(ctx, &*env, t.local_iface)
                        });

                    if let Some((id, _)) = cached {
                        trace!(%dst, %route, "Flow hit");
                        return Ok(Decision {
                            route,
                            neighbor: id,
                            weight: None,
                            source: DecisionSource::Flow,
                        });
                    }

                    trace!(%dst, %route, "Cached next hop no longer eligible");
                    env.flows.evict(&key);
                }
                Lookup::Refresh(route) => hint = Some(route),
                Lookup::Miss => {}
            }
        }

        let mut candidates = Vec::new();
        for (id, tuple) in env.neighbors.active(ctx.now) {
            if !tuple.willing() || !self.usable(ctx, env, tuple) {
                continue;
            }

            if !Self::accepts_moves(ctx, env, tuple.local_iface) {
                trace!(
                    neighbor = %tuple.iface_addr,
                    iface = %tuple.local_iface,
                    "Egress lane congested"
                );
                continue;
            }

            let per_interface = self.options.per_interface_backlog;
            let Some(backlog) = self.probe.backlog(tuple, per_interface) else {
                continue;
            };

            candidates.push(Candidate {
                id,
                addr: tuple.iface_addr,
                main_addr: tuple.main_addr,
                node: tuple.node,
                local_iface: tuple.local_iface,
                position: tuple.position,
                backlog,
            });
        }

        let pctx = PenaltyContext {
            directory: env.directory,
            oracle: env.oracle,
            node: env.node,
            position: env.position,
            dst,
            use_sat: meta.satellite,
            prev_hop: ctx.prev_hop,
            in_iface: ctx.in_iface,
        };

        let penalties = self.penalty.penalties(&pctx, &candidates);

        let mut max = self.options.min_weight;
        let mut ties: Vec<Weighted> = Vec::new();

        for (candidate, penalty) in candidates.into_iter().zip(penalties) {
            let local = (if self.options.per_interface_backlog {
                env.iface_backlog(candidate.local_iface)
            } else {
                env.backlog
            }) as f64;

            let v = env.v.value_for(candidate.local_iface, meta.ttl);
            let rate = env.interfaces.rate_mbps(candidate.local_iface);
            let weight = ((local - candidate.backlog) - v * penalty) * rate;

            trace!(
                neighbor = %candidate.addr,
                iface = %candidate.local_iface,
                local,
                backlog = candidate.backlog,
                penalty,
                v,
                weight,
                "Candidate"
            );

            if weight > max {
                max = weight;
                ties.clear();
                ties.push(Weighted { candidate, weight });
            } else if weight == max && weight > 0.0 {
                ties.push(Weighted { candidate, weight });
            }
        }

        let ties = Self::prefer_dequeue_iface(ctx, Self::collapse_links(ctx, env, ties));

        let chosen = match ties.len() {
            0 => {
                debug!(%dst, "No neighbor with positive weight");
                return Err(Unreachable { dst });
            }
            1 => 0,
            n => self.break_tie(&ties, hint, rng, n),
        };

        let Weighted { candidate, weight } = &ties[chosen];
        let weight = *weight;
        let route = Route::new(candidate.addr, candidate.local_iface);

        if self.options.policy == RoutingPolicy::FlowAffinity {
            env.flows.update(key, route, meta.ttl, ctx.now);
        }

        self.penalty.on_decision(&pctx, candidate);

        debug!(%dst, %route, weight, ties = ties.len(), "Selected next hop");

        Ok(Decision {
            route,
            neighbor: candidate.id,
            weight: Some(weight),
            source: DecisionSource::MaxWeight { ties: ties.len() },
        })
    }

    /// Collapses tied links to the same neighbor node into one.
    fn collapse_links(
        ctx: &DecisionContext<'_>,
        env: &RoutingEnv<'_>,
        ties: Vec<Weighted>,
    ) -> Vec<Weighted> {
        if ties.len() < 2 {
            return ties;
        }

        let mut by_node: FxHashMap<Ipv4Addr, usize> = FxHashMap::default();
        let mut kept: Vec<Weighted> = Vec::with_capacity(ties.len());

        for tie in ties {
            match by_node.get(&tie.candidate.main_addr) {
                Some(&idx) => {
                    let current = Self::link_preference(ctx, env, kept[idx].candidate.local_iface);
                    if Self::link_preference(ctx, env, tie.candidate.local_iface) < current {
                        kept[idx] = tie;
                    }
                }
                None => {
                    by_node.insert(tie.candidate.main_addr, kept.len());
                    kept.push(tie);
                }
            }
        }

        kept
    }

    /// Keeps only the ties on the interface holding the transmit opportunity, if there are any.
    /// Picking a tie elsewhere would spend the opportunity on moving the packet.
    fn prefer_dequeue_iface(ctx: &DecisionContext<'_>, mut ties: Vec<Weighted>) -> Vec<Weighted> {
        let Some(iface) = ctx.dequeue_iface else { return ties };

        if ties.len() > 1 && ties.iter().any(|t| t.candidate.local_iface == iface) {
            ties.retain(|t| t.candidate.local_iface == iface);
        }

        ties
    }

    fn break_tie<R: Rng + ?Sized>(
        &self,
        ties: &[Weighted],
        hint: Option<Route>,
        rng: &mut R,
        n: usize,
    ) -> usize {
        match self.options.tie_break {
            TieBreak::FlowThenRandom => hint
                .and_then(|route| {
                    ties.iter().position(|t| {
                        t.candidate.addr == route.next_hop &&
                            t.candidate.local_iface == route.out_iface
                    })
                })
                .unwrap_or_else(|| rng.gen_range(0..n)),
            TieBreak::Random => rng.gen_range(0..n),
            TieBreak::Lowest => ties
                .iter()
                .enumerate()
                .min_by_key(|(_, t)| (t.candidate.addr, t.candidate.local_iface))
                .map(|(i, _)| i)
                .unwrap_or_default(),
        }
    }
}
