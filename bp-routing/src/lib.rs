//! Synchronous core of the backpressure routing protocol.
//!
//! Every node owns one [`Router`]: its packet queue, neighbor table, flow table, V-controller
//! and forwarding engine. Nothing in this crate does I/O or keeps time on its own; callers pass
//! the current [`Instant`](std::time::Instant) and a random number generator into every
//! operation, so decisions are reproducible under test.
//!
//! Leaf-to-root:
//!
//! * [`PacketQueue`]: bounded per-interface queues with pluggable ordering.
//! * [`NeighborTable`]: link sensing from HELLO messages.
//! * [`ShortestPathOracle`]: all-pairs hop distances, terrestrial-only and with satellites.
//! * [`FlowTable`]: per-flow route cache with loop and staleness defenses.
//! * [`VController`]: the adaptive penalty weight V.
//! * [`ForwardingEngine`]: the max-weight decision.

mod types;
pub use types::{HwAddr, IfaceId, NodeId, Position, Route};

mod packet;
pub use packet::{FlowKey, PacketMeta};

pub mod iface;
pub use iface::{IfaceKind, InterfaceConfig, Interfaces};

pub mod topology;
pub use topology::{Directory, Link, LinkKind, NodeRecord, NodeRole, Topology, TopologyError};

mod oracle;
pub use oracle::{HopMatrix, ShortestPathOracle};

pub mod queue;
pub use queue::{PacketQueue, QueueEntry, QueueKind, QueueOptions, QueueStats};

pub mod neighbor;
pub use neighbor::{HelloOutcome, NeighborId, NeighborTable, NeighborTuple};

pub mod flow;
pub use flow::{FlowEntry, FlowTable, Lookup};

pub mod vcontrol;
pub use vcontrol::{BacklogAverage, VController, VMode, VOptions};

pub mod penalty;
pub use penalty::{GeoPenalty, HopPenalty, NoPenalty, PenaltyKind, PenaltyStrategy};

pub mod engine;
pub use engine::{
    BacklogBoard, Decision, DecisionSource, EngineOptions, ForwardingEngine, RoutingPolicy,
    TieBreak, Unreachable,
};

mod router;
pub use router::{
    DequeueOutcome, EnqueueOutcome, Forwarding, Housekeeping, Router, RouterError, RouterOptions,
    RouterStats, Telemetry,
};
