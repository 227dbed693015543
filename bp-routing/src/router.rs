use std::{
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, Instant},
};

use bp_wire::{Hello, Message, MessageHeader, Packet, Willingness, MAX_REPORTED, UNREPORTED};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    engine::{BoardProbe, DecisionContext, RoutingEnv},
    BacklogAverage, BacklogBoard, Decision, Directory, EngineOptions, FlowTable, ForwardingEngine,
    HelloOutcome, HwAddr, IfaceId, IfaceKind, InterfaceConfig, Interfaces, NeighborTable, NodeId,
    NodeRole, PacketMeta, PacketQueue, Position, QueueEntry, QueueOptions, Route,
    ShortestPathOracle, Unreachable, VController, VMode, VOptions,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("No interfaces configured")]
    NoInterfaces,
    #[error("Too many interfaces: {0}")]
    TooManyInterfaces(usize),
    #[error("Unknown interface: {0}")]
    UnknownInterface(IfaceId),
}

#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub interfaces: Vec<InterfaceConfig>,
    pub willingness: Willingness,
    /// Position used when the directory doesn't know this node.
    pub position: Position,
    /// How long a neighbor stays valid without HELLOs. Also advertised as the HELLO validity.
    pub neighbor_valid_interval: Duration,
    /// How long a silent neighbor is kept before it is deleted.
    pub neighbor_hold_time: Duration,
    pub flow_idle_timeout: Duration,
    pub queue: QueueOptions,
    pub v: VOptions,
    pub engine: EngineOptions,
}

impl RouterOptions {
    /// Adds a local interface. The first one provides the node's main address.
    pub fn with_interface(mut self, config: InterfaceConfig) -> Self {
        self.interfaces.push(config);
        self
    }

    pub fn with_willingness(mut self, willingness: Willingness) -> Self {
        self.willingness = willingness;
        self
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.position = position;
        self
    }

    pub fn with_neighbor_valid_interval(mut self, interval: Duration) -> Self {
        self.neighbor_valid_interval = interval;
        self
    }

    pub fn with_flow_idle_timeout(mut self, timeout: Duration) -> Self {
        self.flow_idle_timeout = timeout;
        self
    }

    pub fn with_queue(mut self, queue: QueueOptions) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_v(mut self, v: VOptions) -> Self {
        self.v = v;
        self
    }

    pub fn with_engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            willingness: Willingness::Default,
            position: Position::default(),
            neighbor_valid_interval: Duration::from_secs(3),
            neighbor_hold_time: Duration::from_secs(60),
            flow_idle_timeout: Duration::from_secs(2),
            queue: QueueOptions::default(),
            v: VOptions::default(),
            engine: EngineOptions::default(),
        }
    }
}

/// Per-node counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub enqueued: u64,
    pub forwarded: u64,
    /// Entries moved to the head of another interface queue.
    pub moved: u64,
    /// Dequeue opportunities where no next hop qualified.
    pub held: u64,
    pub overflows: u64,
    /// Packets dropped on arrival with TTL exhausted.
    pub expired_ttl: u64,
    /// Packets dropped after sitting in the queue too long.
    pub expired_queue: u64,
    pub hellos_rx: u64,
    pub hellos_tx: u64,
    pub recoveries: u64,
}

/// Snapshot for external monitoring.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub stats: RouterStats,
    /// Current V: one value, or one per interface in per-interface mode.
    pub v: Vec<f64>,
    pub backlog: usize,
    pub iface_backlog: Vec<usize>,
    /// Overflow drops per interface, attributed to the storage backing it.
    pub iface_overflows: Vec<u64>,
    /// Interfaces whose queue lane is above its high watermark.
    pub congested: Vec<IfaceId>,
    pub avg_backlog: f64,
    pub neighbors: usize,
    pub flows: usize,
}

/// A packet leaving the node.
#[derive(Debug, Clone)]
pub struct Forwarding<P> {
    pub packet: P,
    /// Header snapshot with the TTL already decremented.
    pub meta: PacketMeta,
    pub route: Route,
    /// Link-layer address of the next hop, if known.
    pub next_hop_hw: Option<HwAddr>,
    pub src_hw: Option<HwAddr>,
    pub in_iface: Option<IfaceId>,
    /// Time spent queued on this node.
    pub sojourn: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(IfaceId),
    /// Dropped: TTL exhausted.
    Expired,
    /// Dropped: queue full.
    Overflow,
}

#[derive(Debug)]
pub enum DequeueOutcome<P> {
    /// Nothing queued on the interface.
    Idle,
    /// No next hop qualifies; the head stays queued.
    Held { dst: Ipv4Addr },
    /// The head belongs on another interface and was moved to the front of its queue.
    Moved { to: IfaceId },
    Forward(Forwarding<P>),
}

/// Results of a housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub expired_entries: usize,
    pub idle_flows: usize,
    pub stale_neighbors: usize,
    pub removed_neighbors: usize,
}

/// The routing state of one node.
#[derive(Debug)]
pub struct Router<P> {
    options: RouterOptions,
    interfaces: Interfaces,
    main_addr: Ipv4Addr,
    node: Option<NodeId>,
    role: NodeRole,
    position: Position,
    directory: Arc<Directory>,
    oracle: Arc<ShortestPathOracle>,
    queue: PacketQueue<P>,
    neighbors: NeighborTable,
    flows: FlowTable,
    v: VController,
    avg: BacklogAverage,
    engine: ForwardingEngine,
    board: Option<BacklogBoard>,
    /// Per-interface packet sequence numbers.
    packet_seq: Vec<u16>,
    msg_seq: u16,
    stats: RouterStats,
}

impl<P: Send + 'static> Router<P> {
    /// Creates a router. The node's identity, role and position are looked up in the directory
    /// by its main address.
    pub fn new(
        options: RouterOptions,
        directory: Arc<Directory>,
        oracle: Arc<ShortestPathOracle>,
    ) -> Result<Self, RouterError> {
        let n = options.interfaces.len();
        if n == 0 {
            return Err(RouterError::NoInterfaces);
        }
        if n > usize::from(u8::MAX) {
            return Err(RouterError::TooManyInterfaces(n));
        }

        let interfaces = Interfaces::new(options.interfaces.clone());
        let main_addr = interfaces.main_addr().ok_or(RouterError::NoInterfaces)?;

        let node = directory.node_by_addr(main_addr);
        let role = node.map(|id| directory.role(id)).unwrap_or_default();
        let position = node.and_then(|id| directory.position(id)).unwrap_or(options.position);

        if node.is_none() {
            warn!(%main_addr, "Node not in directory, hop penalties disabled");
        }

        let queue = PacketQueue::new(&options.queue, n);
        let neighbors = NeighborTable::new(options.neighbor_valid_interval, interfaces.satellite());
        let flows = FlowTable::new(options.flow_idle_timeout);
        let v = VController::new(&options.v, role, n);
        let avg = BacklogAverage::new(options.v.avg_weight);
        let engine = ForwardingEngine::new(options.engine.clone());

        debug!(%main_addr, ?node, ?role, ifaces = n, "Created router");

        Ok(Self {
            options,
            interfaces,
            main_addr,
            node,
            role,
            position,
            directory,
            oracle,
            queue,
            neighbors,
            flows,
            v,
            avg,
            engine,
            board: None,
            packet_seq: vec![0; n],
            msg_seq: 0,
            stats: RouterStats::default(),
        })
    }
}

impl<P> Router<P> {
    /// Replaces the forwarding engine.
    pub fn with_engine(mut self, engine: ForwardingEngine) -> Self {
        self.engine = engine;
        self
    }

    /// Publishes this node's backlog on `board` and reads neighbor backlogs from it.
    pub fn with_backlog_board(mut self, board: BacklogBoard) -> Self {
        self.engine.set_probe(Box::new(BoardProbe::new(board.clone())));
        board.publish(self.main_addr, self.queue.len() as u32);
        self.board = Some(board);
        self
    }

    #[inline]
    pub fn main_addr(&self) -> Ipv4Addr {
        self.main_addr
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn interfaces(&self) -> &Interfaces {
        &self.interfaces
    }

    pub fn neighbors(&self) -> &NeighborTable {
        &self.neighbors
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    pub fn queue(&self) -> &PacketQueue<P> {
        &self.queue
    }

    pub fn v(&self) -> &VController {
        &self.v
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Number of packets queued on `iface`.
    pub fn queue_length(&self, iface: IfaceId) -> usize {
        self.queue.iface_len(iface)
    }

    fn publish_backlog(&self) {
        if let Some(ref board) = self.board {
            board.publish(self.main_addr, self.queue.len() as u32);
        }
    }

    /// Interfaces whose queue lane is congested.
    fn congested_ifaces(&self) -> Vec<IfaceId> {
        self.interfaces.ids().filter(|&i| self.queue.congested(i)).collect()
    }

    /// The least loaded up interface that may carry `meta`.
    fn initial_iface(&self, meta: &PacketMeta) -> IfaceId {
        let eligible = |i: &IfaceId| {
            meta.satellite || self.interfaces.kind(*i) != Some(IfaceKind::Satellite)
        };

        self.interfaces
            .up_ids()
            .filter(eligible)
            .min_by_key(|&i| (self.queue.iface_len(i), i))
            .or_else(|| self.interfaces.up_ids().min_by_key(|&i| (self.queue.iface_len(i), i)))
            .unwrap_or_default()
    }

    /// Queues a packet for routing.
    ///
    /// The packet is queued on its flow's cached interface, else on the least loaded interface.
    /// Where it actually leaves is decided when an interface can transmit.
    pub fn enqueue(
        &mut self,
        packet: P,
        meta: PacketMeta,
        in_iface: Option<IfaceId>,
        prev_hop: Option<Ipv4Addr>,
        src_hw: Option<HwAddr>,
        now: Instant,
    ) -> EnqueueOutcome {
        if meta.ttl <= 1 {
            self.stats.expired_ttl += 1;
            debug!(dst = %meta.dst, ttl = meta.ttl, "TTL exhausted, dropping packet");
            return EnqueueOutcome::Expired;
        }

        let iface = self
            .flows
            .get(&meta.flow_key())
            .map(|e| e.route.out_iface)
            .filter(|&i| self.interfaces.is_up(i))
            .unwrap_or_else(|| self.initial_iface(&meta));

        let entry = QueueEntry::new(packet, meta, now)
            .with_prev_hop(prev_hop, in_iface)
            .with_src_hw(src_hw);

        if !self.queue.enqueue(entry, iface) {
            self.stats.overflows += 1;
            return EnqueueOutcome::Overflow;
        }

        self.stats.enqueued += 1;
        self.publish_backlog();

        trace!(dst = %meta.dst, %iface, len = self.queue.len(), "Queued packet");

        EnqueueOutcome::Queued(iface)
    }

    /// Routes a packet against the current node state.
    pub fn select_next_hop<R: Rng + ?Sized>(
        &mut self,
        meta: &PacketMeta,
        in_iface: Option<IfaceId>,
        prev_hop: Option<Ipv4Addr>,
        dequeue_iface: Option<IfaceId>,
        now: Instant,
        rng: &mut R,
    ) -> Result<Decision, Unreachable> {
        let ctx = DecisionContext { meta, in_iface, prev_hop, dequeue_iface, now };
        let congested = self.congested_ifaces();
        let mut env = RoutingEnv {
            neighbors: &self.neighbors,
            flows: &mut self.flows,
            interfaces: &self.interfaces,
            iface_backlog: self.queue.iface_lens(),
            congested: &congested,
            backlog: self.queue.len(),
            v: &self.v,
            directory: &self.directory,
            oracle: &self.oracle,
            node: self.node,
            position: self.position,
        };

        self.engine.select_next_hop(&ctx, &mut env, rng)
    }

    /// Handles a transmit opportunity on `iface`.
    pub fn on_dequeue_ready<R: Rng + ?Sized>(
        &mut self,
        iface: IfaceId,
        now: Instant,
        rng: &mut R,
    ) -> DequeueOutcome<P> {
        let Some(head) = self.queue.peek(iface) else {
            return DequeueOutcome::Idle;
        };

        let (meta, in_iface, prev_hop) = (head.meta, head.in_iface, head.prev_hop);

        // Decisions only ever name up interfaces.
        let decision = self.select_next_hop(&meta, in_iface, prev_hop, Some(iface), now, rng);
        let decision = match decision {
            Ok(decision) => decision,
            Err(Unreachable { dst }) => {
                self.stats.held += 1;
                trace!(%dst, %iface, "Holding packet");
                return DequeueOutcome::Held { dst };
            }
        };

        let out = decision.route.out_iface;
        let Some(mut entry) = self.queue.dequeue(iface) else {
            return DequeueOutcome::Idle;
        };

        if out != iface {
            entry.requeues += 1;
            if let Some(evicted) = self.queue.enqueue_front(entry, out) {
                self.stats.overflows += 1;
                debug!(dst = %evicted.meta.dst, %out, "Dropped tail entry to make room");
            }

            self.stats.moved += 1;
            trace!(dst = %meta.dst, from = %iface, to = %out, "Moved packet to another interface");
            return DequeueOutcome::Moved { to: out };
        }

        self.stats.forwarded += 1;
        self.publish_backlog();

        let next_hop_hw = self.neighbors.get(decision.neighbor).and_then(|t| t.hw_addr);
        let mut meta = entry.meta;
        meta.ttl = meta.ttl.saturating_sub(1);

        DequeueOutcome::Forward(Forwarding {
            sojourn: entry.sojourn(now),
            packet: entry.packet,
            meta,
            route: decision.route,
            next_hop_hw,
            src_hw: entry.src_hw,
            in_iface: entry.in_iface,
        })
    }

    /// Processes a HELLO message received on `local_iface`. HELLOs from our own interfaces are
    /// ignored and return `None`.
    pub fn on_hello(
        &mut self,
        local_iface: IfaceId,
        header: &MessageHeader,
        hello: &Hello,
        now: Instant,
    ) -> Result<Option<HelloOutcome>, RouterError> {
        if !self.interfaces.contains(local_iface) {
            return Err(RouterError::UnknownInterface(local_iface));
        }

        if self.interfaces.by_addr(hello.addr).is_some() || header.originator == self.main_addr {
            return Ok(None);
        }

        let node = self.directory.node_by_addr(hello.addr);
        let remote_iface = self.directory.iface_index(hello.addr);
        let (_, outcome) =
            self.neighbors.on_hello(local_iface, header.originator, hello, node, remote_iface, now);

        self.stats.hellos_rx += 1;

        if outcome == HelloOutcome::Recovered {
            self.stats.recoveries += 1;
            // A permanently up satellite link keeps the network connected, flows stay valid.
            if self.interfaces.satellite().is_none() {
                let flows = self.flows.len();
                debug!(neighbor = %hello.addr, flows, "Neighbor recovered, clearing flows");
                self.flows.clear();
            }
        }

        Ok(Some(outcome))
    }

    /// Records the link-layer address of a neighbor interface.
    pub fn set_neighbor_hw_addr(&mut self, iface_addr: Ipv4Addr, hw_addr: HwAddr) {
        self.neighbors.set_hw_addr(iface_addr, hw_addr);
    }

    /// Builds the HELLO packet to broadcast on `iface`. Returns `None` if the interface is down.
    pub fn build_hello(&mut self, iface: IfaceId) -> Option<Packet> {
        let addr = self.interfaces.get(iface)?.addr;
        if !self.interfaces.is_up(iface) {
            return None;
        }

        let iface_queues = self
            .interfaces
            .ids()
            .map(|i| {
                if self.interfaces.is_up(i) {
                    self.queue.iface_len(i).min(usize::from(MAX_REPORTED)) as u8
                } else {
                    UNREPORTED
                }
            })
            .collect();

        let hello = Hello {
            willingness: self.options.willingness,
            queue_length: self.queue.len().min(u32::MAX as usize) as u32,
            addr,
            x: self.position.x,
            y: self.position.y,
            iface_queues,
        };

        let seq = &mut self.packet_seq[iface.index()];
        *seq = seq.wrapping_add(1);
        let packet_seq = *seq;
        self.msg_seq = self.msg_seq.wrapping_add(1);

        self.stats.hellos_tx += 1;

        let vtime = self.options.neighbor_valid_interval;
        Some(Packet::single(packet_seq, Message::hello(self.main_addr, self.msg_seq, vtime, hello)))
    }

    /// Brings an interface up. Returns `true` if its state changed.
    pub fn set_iface_up(&mut self, iface: IfaceId) -> Result<bool, RouterError> {
        if !self.interfaces.contains(iface) {
            return Err(RouterError::UnknownInterface(iface));
        }

        let changed = self.interfaces.set_up(iface, true);
        if changed {
            debug!(%iface, "Interface up");
        }

        Ok(changed)
    }

    /// Takes an interface down: its flows are invalidated and its queued packets move to the
    /// remaining interfaces. Returns the number of packets moved.
    pub fn set_iface_down(&mut self, iface: IfaceId) -> Result<usize, RouterError> {
        if !self.interfaces.contains(iface) {
            return Err(RouterError::UnknownInterface(iface));
        }

        if !self.interfaces.set_up(iface, false) {
            return Ok(0);
        }

        let flows = self.flows.invalidate_iface(iface);

        let mut moved = 0;
        for mut entry in self.queue.drain_iface(iface) {
            let target = self.initial_iface(&entry.meta);
            if target != iface {
                entry.requeues += 1;
                moved += 1;
            }

            if !self.queue.enqueue(entry, target) {
                self.stats.overflows += 1;
            }
        }

        debug!(%iface, flows, moved, "Interface down");

        Ok(moved)
    }

    /// Recomputes V from the current local and neighbor backlogs.
    pub fn recompute_v(&mut self, now: Instant) -> Vec<f64> {
        let max_neighbor = f64::from(self.neighbors.max_backlog(now));
        self.v.update(self.queue.len() as f64, max_neighbor);

        if self.v.mode() == VMode::PerInterface {
            for iface in self.interfaces.ids() {
                let local = self.queue.iface_len(iface) as f64;
                let neighbor = f64::from(self.neighbors.max_backlog_on(iface, now));
                self.v.update_iface(iface, local, neighbor);
            }
        }

        self.v.values()
    }

    /// Adds the current backlog to the moving average and returns it.
    pub fn sample_backlog(&mut self) -> f64 {
        self.avg.sample(self.queue.len() as f64)
    }

    /// Drops expired queue entries and idle flows, and ages out silent neighbors.
    pub fn housekeeping(&mut self, now: Instant) -> Housekeeping {
        let expired = self.queue.purge_expired(now);
        self.stats.expired_queue += expired.len() as u64;
        if !expired.is_empty() {
            self.publish_backlog();
        }

        let report = Housekeeping {
            expired_entries: expired.len(),
            idle_flows: self.flows.purge_idle(now),
            stale_neighbors: self.neighbors.mark_stale(now),
            removed_neighbors: self.neighbors.cleanup(now, self.options.neighbor_hold_time),
        };

        if report != Housekeeping::default() {
            debug!(?report, "Housekeeping");
        }

        report
    }

    pub fn telemetry(&self) -> Telemetry {
        Telemetry {
            stats: self.stats,
            v: self.v.values(),
            backlog: self.queue.len(),
            iface_backlog: self.queue.iface_lens().to_vec(),
            iface_overflows: self.interfaces.ids().map(|i| self.queue.iface_overflows(i)).collect(),
            congested: self.congested_ifaces(),
            avg_backlog: self.avg.value(),
            neighbors: self.neighbors.len(),
            flows: self.flows.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{LinkKind, PenaltyKind, QueueKind, RoutingPolicy, TieBreak, Topology};

    const RATE: u64 = 10_000_000;

    fn addr(i: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, i + 1)
    }

    fn line(n: u8) -> (Arc<Directory>, Arc<ShortestPathOracle>) {
        let mut topology = Topology::new();
        for i in 0..n {
            let position = Position::new(f64::from(i) * 100.0, 0.0);
            topology.add_node(NodeRole::Terrestrial, position, [addr(i)]).unwrap();
        }
        for i in 1..u32::from(n) {
            topology.add_link(NodeId(i - 1), NodeId(i), LinkKind::Terrestrial).unwrap();
        }
        topology.build()
    }

    fn router(i: u8, topo: &(Arc<Directory>, Arc<ShortestPathOracle>)) -> Router<u32> {
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(i), RATE))
            .with_v(VOptions::default().with_qth(10.0));
        Router::new(options, Arc::clone(&topo.0), Arc::clone(&topo.1)).unwrap()
    }

    fn deliver_hello(
        from: &mut Router<u32>,
        to: &mut Router<u32>,
        now: Instant,
    ) -> Option<HelloOutcome> {
        let packet = from.build_hello(IfaceId(0)).unwrap();
        let (header, hello) = packet.hellos().next().unwrap();
        to.on_hello(IfaceId(0), header, hello, now).unwrap()
    }

    #[test]
    fn line_forwards_via_shortcut() {
        let _ = tracing_subscriber::fmt::try_init();

        let topo = line(3);
        let (mut a, mut b, mut c) = (router(0, &topo), router(1, &topo), router(2, &topo));
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        deliver_hello(&mut b, &mut a, now);
        deliver_hello(&mut a, &mut b, now);
        deliver_hello(&mut c, &mut b, now);
        deliver_hello(&mut b, &mut c, now);

        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        assert_eq!(a.enqueue(7, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(0)));

        let DequeueOutcome::Forward(fwd) = a.on_dequeue_ready(IfaceId(0), now, &mut rng) else {
            panic!("A should forward");
        };
        assert_eq!(fwd.route.next_hop, addr(1));
        assert_eq!(fwd.meta.ttl, 63);

        b.enqueue(fwd.packet, fwd.meta, Some(IfaceId(0)), Some(addr(0)), None, now);
        let DequeueOutcome::Forward(fwd) = b.on_dequeue_ready(IfaceId(0), now, &mut rng) else {
            panic!("B should forward");
        };
        assert_eq!(fwd.route, Route::new(addr(2), IfaceId(0)));
        assert_eq!(fwd.packet, 7);
        assert_eq!(b.stats().forwarded, 1);
        assert_eq!(b.queue_length(IfaceId(0)), 0);
    }

    #[test]
    fn expired_ttl_and_overflow() {
        let topo = line(2);
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_queue(QueueOptions::default().with_capacity(1));
        let mut r: Router<u32> =
            Router::new(options, Arc::clone(&topo.0), Arc::clone(&topo.1)).unwrap();
        let now = Instant::now();

        let meta = PacketMeta::udp(addr(0), 1, addr(1), 2);
        assert_eq!(r.enqueue(0, meta.with_ttl(1), None, None, None, now), EnqueueOutcome::Expired);
        assert_eq!(r.enqueue(1, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(0)));
        assert_eq!(r.enqueue(2, meta, None, None, None, now), EnqueueOutcome::Overflow);

        let t = r.telemetry();
        assert_eq!(t.stats.expired_ttl, 1);
        assert_eq!(t.stats.overflows, 1);
        assert_eq!(t.backlog, 1);
    }

    #[test]
    fn unreachable_packets_stay_queued() {
        let topo = line(3);
        let mut a = router(0, &topo);
        let mut rng = StdRng::seed_from_u64(2);
        let now = Instant::now();

        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        a.enqueue(1, meta, None, None, None, now);

        assert!(matches!(
            a.on_dequeue_ready(IfaceId(0), now, &mut rng),
            DequeueOutcome::Held { dst } if dst == addr(2)
        ));
        assert_eq!(a.queue_length(IfaceId(0)), 1);
        assert!(matches!(a.on_dequeue_ready(IfaceId(1), now, &mut rng), DequeueOutcome::Idle));
    }

    fn two_radio_router(
        topo: &(Arc<Directory>, Arc<ShortestPathOracle>),
        queue: QueueOptions,
    ) -> Router<u32> {
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_interface(InterfaceConfig::terrestrial(Ipv4Addr::new(10, 1, 0, 1), RATE))
            .with_queue(queue)
            .with_engine(EngineOptions::default().with_policy(RoutingPolicy::PerPacket));
        Router::new(options, Arc::clone(&topo.0), Arc::clone(&topo.1)).unwrap()
    }

    fn hello_from(i: u8, iface_addr: Ipv4Addr, backlog: u32) -> (MessageHeader, Hello) {
        let hello = Hello {
            willingness: Willingness::Default,
            queue_length: backlog,
            addr: iface_addr,
            x: 0.0,
            y: 0.0,
            iface_queues: vec![],
        };
        let message = Message::hello(addr(i), 1, Duration::from_secs(3), hello.clone());
        (message.header, hello)
    }

    #[test]
    fn head_moves_to_the_chosen_interface() {
        let topo = line(3);
        let mut r = two_radio_router(&topo, QueueOptions::default().with_kind(QueueKind::Grid));
        let mut rng = StdRng::seed_from_u64(3);
        let now = Instant::now();

        // Node 1 is only reachable on the second radio.
        let (header, hello) = hello_from(1, addr(1), 0);
        r.on_hello(IfaceId(1), &header, &hello, now).unwrap();

        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        assert_eq!(r.enqueue(9, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(0)));

        assert!(matches!(
            r.on_dequeue_ready(IfaceId(0), now, &mut rng),
            DequeueOutcome::Moved { to: IfaceId(1) }
        ));
        assert_eq!(r.queue_length(IfaceId(0)), 0);
        assert_eq!(r.queue_length(IfaceId(1)), 1);
        assert_eq!(r.queue().peek(IfaceId(1)).map(|e| e.requeues), Some(1));

        let DequeueOutcome::Forward(fwd) = r.on_dequeue_ready(IfaceId(1), now, &mut rng) else {
            panic!("expected forward");
        };
        assert_eq!(fwd.route, Route::new(addr(1), IfaceId(1)));
        assert_eq!(r.stats().moved, 1);
    }

    /// Diamond 0 - {1, 2} - 3.
    fn diamond() -> (Arc<Directory>, Arc<ShortestPathOracle>) {
        let mut topology = Topology::new();
        for i in 0..4 {
            let position = Position::new(f64::from(i) * 100.0, 0.0);
            topology.add_node(NodeRole::Terrestrial, position, [addr(i)]).unwrap();
        }
        for (a, b) in [(0, 1), (0, 2), (1, 3), (2, 3)] {
            topology.add_link(NodeId(a), NodeId(b), LinkKind::Terrestrial).unwrap();
        }
        topology.build()
    }

    /// A two-radio node at the left of the diamond hearing 1 on its first radio and 2 on its
    /// second, without any path bias.
    fn split_radio_router(queue: QueueOptions, backlog_1: u32, backlog_2: u32) -> Router<u32> {
        let topo = diamond();
        let engine = EngineOptions::default()
            .with_policy(RoutingPolicy::PerPacket)
            .with_tie_break(TieBreak::Random)
            .with_penalty(PenaltyKind::None);
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_interface(InterfaceConfig::terrestrial(Ipv4Addr::new(10, 1, 0, 1), RATE))
            .with_queue(queue)
            .with_engine(engine);
        let mut r = Router::new(options, topo.0, topo.1).unwrap();

        let now = Instant::now();
        let (header, hello) = hello_from(1, addr(1), backlog_1);
        r.on_hello(IfaceId(0), &header, &hello, now).unwrap();
        let (header, hello) = hello_from(2, addr(2), backlog_2);
        r.on_hello(IfaceId(1), &header, &hello, now).unwrap();
        r
    }

    #[test]
    fn ready_interface_wins_ties_between_radios() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut r = split_radio_router(QueueOptions::default(), 0, 0);
        let mut rng = StdRng::seed_from_u64(6);
        let now = Instant::now();
        let meta = PacketMeta::udp(addr(0), 1000, addr(3), 2000);

        for i in 0..100 {
            // One packet lands on each radio.
            let queued: Vec<IfaceId> = (0..2)
                .filter_map(|j| match r.enqueue(2 * i + j, meta, None, None, None, now) {
                    EnqueueOutcome::Queued(iface) => Some(iface),
                    _ => None,
                })
                .collect();
            assert_eq!(queued, vec![IfaceId(0), IfaceId(1)]);

            for iface in [IfaceId(1), IfaceId(0)] {
                let DequeueOutcome::Forward(fwd) = r.on_dequeue_ready(iface, now, &mut rng) else {
                    panic!("packet should leave on {iface}");
                };
                assert_eq!(fwd.route.out_iface, iface);
            }
        }

        assert_eq!(r.stats().moved, 0);
        assert_eq!(r.stats().forwarded, 200);
        assert!(r.queue().is_empty());
    }

    #[test]
    fn congested_grid_lane_changes_the_decision() {
        let meta = PacketMeta::udp(addr(0), 1000, addr(3), 2000);
        let grid = QueueOptions::default().with_kind(QueueKind::Grid);

        // 1 advertises the smaller backlog and is the better next hop.
        let mut plain = split_radio_router(grid.clone(), 0, 1);
        let mut hysteretic = split_radio_router(grid.with_watermarks(3, 1), 0, 1);
        let mut rng = StdRng::seed_from_u64(7);
        let now = Instant::now();

        for r in [&mut plain, &mut hysteretic] {
            // Lands 3 on the first radio and 2 on the second.
            for i in 0..5 {
                r.enqueue(i, meta, None, None, None, now);
            }
            assert_eq!(r.telemetry().iface_backlog, vec![3, 2]);
        }

        assert!(plain.telemetry().congested.is_empty());
        assert!(matches!(
            plain.on_dequeue_ready(IfaceId(1), now, &mut rng),
            DequeueOutcome::Moved { to: IfaceId(0) }
        ));

        // The first lane sits at its high watermark: nothing is moved onto it.
        assert_eq!(hysteretic.telemetry().congested, vec![IfaceId(0)]);
        let DequeueOutcome::Forward(fwd) = hysteretic.on_dequeue_ready(IfaceId(1), now, &mut rng)
        else {
            panic!("expected forward");
        };
        assert_eq!(fwd.route, Route::new(addr(2), IfaceId(1)));
        assert_eq!(hysteretic.stats().moved, 0);

        // Draining to the low watermark lifts the congestion.
        for _ in 0..2 {
            assert!(matches!(
                hysteretic.on_dequeue_ready(IfaceId(0), now, &mut rng),
                DequeueOutcome::Forward(_)
            ));
        }
        assert!(hysteretic.telemetry().congested.is_empty());
    }

    #[test]
    fn overflows_are_reported_per_interface() {
        let grid = QueueOptions::default().with_kind(QueueKind::Grid).with_capacity(2);
        let mut r = split_radio_router(grid, 0, 0);
        let now = Instant::now();
        let meta = PacketMeta::udp(addr(0), 1000, addr(3), 2000);

        for i in 0..4 {
            assert!(matches!(r.enqueue(i, meta, None, None, None, now), EnqueueOutcome::Queued(_)));
        }
        assert_eq!(r.enqueue(4, meta, None, None, None, now), EnqueueOutcome::Overflow);

        let t = r.telemetry();
        assert_eq!(t.iface_overflows, vec![1, 0]);
        assert_eq!(t.stats.overflows, 1);
    }

    #[test]
    fn interface_down_migrates_queue_and_flows() {
        let topo = line(3);
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_interface(InterfaceConfig::terrestrial(Ipv4Addr::new(10, 1, 0, 1), RATE));
        let mut r: Router<u32> =
            Router::new(options, Arc::clone(&topo.0), Arc::clone(&topo.1)).unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let now = Instant::now();

        let (header, hello) = hello_from(1, addr(1), 0);
        r.on_hello(IfaceId(0), &header, &hello, now).unwrap();

        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        // Spread over both interfaces by load.
        assert_eq!(r.enqueue(1, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(0)));
        assert_eq!(r.enqueue(2, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(1)));
        // Installs a flow on interface 0, which later packets of the flow follow.
        assert!(matches!(
            r.on_dequeue_ready(IfaceId(0), now, &mut rng),
            DequeueOutcome::Forward(_)
        ));
        assert_eq!(r.enqueue(3, meta, None, None, None, now), EnqueueOutcome::Queued(IfaceId(0)));
        assert_eq!(r.flows().len(), 1);

        assert_eq!(r.set_iface_down(IfaceId(0)), Ok(1));
        assert!(r.flows().is_empty());
        assert_eq!(r.queue_length(IfaceId(0)), 0);
        assert_eq!(r.queue_length(IfaceId(1)), 2);

        // Neighbor only reachable through the downed interface.
        assert!(matches!(
            r.on_dequeue_ready(IfaceId(1), now, &mut rng),
            DequeueOutcome::Held { .. }
        ));

        // Idempotent.
        assert_eq!(r.set_iface_down(IfaceId(0)), Ok(0));
        assert_eq!(r.set_iface_up(IfaceId(0)), Ok(true));
        assert_eq!(r.set_iface_up(IfaceId(7)), Err(RouterError::UnknownInterface(IfaceId(7))));
    }

    #[test]
    fn recovery_clears_flows() {
        let topo = line(3);
        let mut a = router(0, &topo);
        let mut b = router(1, &topo);
        let mut rng = StdRng::seed_from_u64(5);
        let now = Instant::now();

        assert_eq!(deliver_hello(&mut b, &mut a, now), Some(HelloOutcome::Created));

        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        a.enqueue(1, meta, None, None, None, now);
        assert!(matches!(
            a.on_dequeue_ready(IfaceId(0), now, &mut rng),
            DequeueOutcome::Forward(_)
        ));
        assert_eq!(a.flows().len(), 1);

        let later = now + Duration::from_secs(1);
        assert_eq!(deliver_hello(&mut b, &mut a, later), Some(HelloOutcome::Refreshed));
        assert_eq!(a.flows().len(), 1);

        let much_later = now + Duration::from_secs(10);
        assert_eq!(deliver_hello(&mut b, &mut a, much_later), Some(HelloOutcome::Recovered));
        assert!(a.flows().is_empty());
        assert_eq!(a.stats().recoveries, 1);

        // Our own HELLOs are ignored.
        let own = a.build_hello(IfaceId(0)).unwrap();
        let (header, hello) = own.hellos().next().unwrap();
        assert_eq!(a.on_hello(IfaceId(0), header, hello, now), Ok(None));
        assert_eq!(
            a.on_hello(IfaceId(3), header, hello, now),
            Err(RouterError::UnknownInterface(IfaceId(3)))
        );
    }

    #[test]
    fn hello_advertises_backlog() {
        let topo = line(2);
        let mut r = two_radio_router(&topo, QueueOptions::default().with_capacity(1000));
        let now = Instant::now();

        let meta = PacketMeta::udp(addr(0), 1000, addr(1), 2000);
        for i in 0..300 {
            r.enqueue(i, meta, None, None, None, now);
        }

        let packet = r.build_hello(IfaceId(0)).unwrap();
        let (header, hello) = packet.hellos().next().unwrap();
        assert_eq!(header.originator, addr(0));
        assert_eq!(header.ttl, 1);
        assert_eq!(hello.queue_length, 300);
        assert_eq!(hello.iface_queues, vec![150, 150]);
        assert_eq!(hello.addr, addr(0));

        r.set_iface_down(IfaceId(1)).unwrap();
        let packet = r.build_hello(IfaceId(0)).unwrap();
        let (_, hello) = packet.hellos().next().unwrap();
        assert_eq!(hello.iface_queues, vec![MAX_REPORTED, UNREPORTED]);
        assert!(r.build_hello(IfaceId(1)).is_none());

        // Sequence numbers advance per interface.
        assert_eq!(packet.seq, 2);
    }

    #[test]
    fn v_and_housekeeping() {
        let topo = line(3);
        let options = RouterOptions::default()
            .with_interface(InterfaceConfig::terrestrial(addr(0), RATE))
            .with_v(VOptions::default().with_qth(10.0))
            .with_queue(QueueOptions::default().with_max_delay(Duration::from_secs(1)));
        let mut r: Router<u32> =
            Router::new(options, Arc::clone(&topo.0), Arc::clone(&topo.1)).unwrap();
        let now = Instant::now();

        assert_eq!(r.recompute_v(now), vec![10.0]);

        let (header, hello) = hello_from(1, addr(1), 4);
        r.on_hello(IfaceId(0), &header, &hello, now).unwrap();
        let meta = PacketMeta::udp(addr(0), 1000, addr(2), 2000);
        for i in 0..2 {
            r.enqueue(i, meta, None, None, None, now);
        }

        assert_eq!(r.recompute_v(now), vec![6.0]);
        assert_eq!(r.sample_backlog(), 2.0);

        let report = r.housekeeping(now + Duration::from_secs(5));
        assert_eq!(report.expired_entries, 2);
        assert_eq!(report.stale_neighbors, 1);
        assert_eq!(report.removed_neighbors, 0);

        let report = r.housekeeping(now + Duration::from_secs(120));
        assert_eq!(report.removed_neighbors, 1);

        let t = r.telemetry();
        assert_eq!(t.stats.expired_queue, 2);
        assert_eq!(t.backlog, 0);
        assert_eq!(t.neighbors, 0);
        assert_eq!(t.v, vec![6.0]);
    }

    #[test]
    fn gateway_role_from_directory() {
        let mut topology = Topology::new();
        topology.add_node(NodeRole::Gateway, Position::new(5.0, 5.0), [addr(0)]).unwrap();
        let topo = topology.build();

        let r = router(0, &topo);
        assert_eq!(r.role(), NodeRole::Gateway);
        assert_eq!(r.v().qth(), 20.0);
        assert_eq!(r.node(), Some(NodeId(0)));
    }

    #[test]
    fn backlog_board_publishes() {
        let topo = line(2);
        let board = BacklogBoard::new();
        let mut r = router(0, &topo).with_backlog_board(board.clone());
        assert_eq!(board.get(addr(0)), Some(0));

        let meta = PacketMeta::udp(addr(0), 1000, addr(1), 2000);
        r.enqueue(1, meta, None, None, None, Instant::now());
        assert_eq!(board.get(addr(0)), Some(1));
    }

    #[test]
    fn rejects_bad_options() {
        let topo = line(1);
        let err = Router::<u32>::new(RouterOptions::default(), topo.0, topo.1);
        assert_eq!(err.err(), Some(RouterError::NoInterfaces));
    }
}
