//! Link sensing: the neighbor table built from received HELLO messages.
//!
//! Tuples live in a generational slot arena. Decision code refers to them by [`NeighborId`],
//! which stops resolving once the slot is reused.

use std::{
    net::Ipv4Addr,
    time::{Duration, Instant},
};

use bp_wire::{Hello, Willingness, UNREPORTED};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::{HwAddr, IfaceId, NodeId, Position};

/// Stable handle to a neighbor tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborId {
    index: u32,
    generation: u32,
}

/// What a received HELLO did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloOutcome {
    /// First HELLO from this neighbor interface.
    Created,
    /// The neighbor was already active.
    Refreshed,
    /// The neighbor had gone stale and is active again.
    Recovered,
}

/// Link state towards one neighbor interface, as seen on one local interface.
#[derive(Debug, Clone, PartialEq)]
pub struct NeighborTuple {
    /// Address of the neighbor interface the HELLOs come from.
    pub iface_addr: Ipv4Addr,
    /// Main address of the neighbor node.
    pub main_addr: Ipv4Addr,
    /// Local interface the HELLOs are received on.
    pub local_iface: IfaceId,
    /// Index of the neighbor's interface on the neighbor node, if known.
    pub remote_iface: Option<u8>,
    /// Link-layer address, supplied by the link layer.
    pub hw_addr: Option<HwAddr>,
    pub node: Option<NodeId>,
    pub position: Position,
    /// Advertised total backlog.
    pub queue_length: u32,
    /// Backlog advertised in the previous HELLO.
    pub prev_queue_length: u32,
    /// Advertised backlog per neighbor interface, [`UNREPORTED`] when down.
    pub iface_queues: Vec<u8>,
    pub last_hello: Instant,
    pub willingness: Willingness,
}

impl NeighborTuple {
    /// Backlog advertised for the neighbor interface this tuple was learned on.
    ///
    /// Returns `None` if that interface is reported down.
    pub fn link_backlog(&self) -> Option<u32> {
        match self.remote_iface.and_then(|i| self.iface_queues.get(i as usize)) {
            Some(&UNREPORTED) => None,
            Some(&q) => Some(u32::from(q)),
            None => Some(self.queue_length),
        }
    }

    /// Whether the neighbor accepts transit traffic.
    #[inline]
    pub fn willing(&self) -> bool {
        self.willingness != Willingness::Never
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    tuple: Option<NeighborTuple>,
    /// Whether the tuple was stale the last time it was refreshed or checked.
    stale: bool,
}

/// The neighbor table of a node.
#[derive(Debug)]
pub struct NeighborTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_link: FxHashMap<(Ipv4Addr, IfaceId), NeighborId>,
    valid_interval: Duration,
    satellite: Option<IfaceId>,
}

impl NeighborTable {
    /// Creates an empty table. Tuples learned on `satellite` never go stale.
    pub fn new(valid_interval: Duration, satellite: Option<IfaceId>) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_link: FxHashMap::default(),
            valid_interval,
            satellite,
        }
    }

    pub fn valid_interval(&self) -> Duration {
        self.valid_interval
    }

    /// Number of tuples, stale ones included.
    pub fn len(&self) -> usize {
        self.by_link.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_link.is_empty()
    }

    pub fn get(&self, id: NeighborId) -> Option<&NeighborTuple> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.tuple.as_ref())
    }

    fn get_mut(&mut self, id: NeighborId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.tuple.is_some())
    }

    /// The tuple for a neighbor interface heard on a local interface.
    pub fn find(&self, iface_addr: Ipv4Addr, local_iface: IfaceId) -> Option<NeighborId> {
        self.by_link.get(&(iface_addr, local_iface)).copied()
    }

    /// Whether a tuple may be used for routing at `now`.
    pub fn is_valid(&self, tuple: &NeighborTuple, now: Instant) -> bool {
        Some(tuple.local_iface) == self.satellite ||
            now.saturating_duration_since(tuple.last_hello) <= self.valid_interval
    }

    /// Processes a HELLO received on `local_iface`.
    pub fn on_hello(
        &mut self,
        local_iface: IfaceId,
        originator: Ipv4Addr,
        hello: &Hello,
        node: Option<NodeId>,
        remote_iface: Option<u8>,
        now: Instant,
    ) -> (NeighborId, HelloOutcome) {
        let position = Position::new(hello.x, hello.y);

        if let Some(id) = self.find(hello.addr, local_iface) {
            let satellite = self.satellite;
            let valid_interval = self.valid_interval;

            if let Some(slot) = self.get_mut(id) {
                if let Some(tuple) = slot.tuple.as_mut() {
                    let was_stale = slot.stale ||
                        (Some(local_iface) != satellite &&
                            now.saturating_duration_since(tuple.last_hello) > valid_interval);

                    tuple.main_addr = originator;
                    tuple.node = node.or(tuple.node);
                    tuple.remote_iface = remote_iface.or(tuple.remote_iface);
                    tuple.position = position;
                    tuple.prev_queue_length = tuple.queue_length;
                    tuple.queue_length = hello.queue_length;
                    tuple.iface_queues.clone_from(&hello.iface_queues);
                    tuple.last_hello = now;
                    tuple.willingness = hello.willingness;
                    slot.stale = false;

                    trace!(
                        neighbor = %hello.addr,
                        %local_iface,
                        queue = hello.queue_length,
                        "Refreshed neighbor"
                    );

                    let outcome =
                        if was_stale { HelloOutcome::Recovered } else { HelloOutcome::Refreshed };
                    if was_stale {
                        debug!(neighbor = %hello.addr, %local_iface, "Neighbor recovered");
                    }

                    return (id, outcome);
                }
            }
        }

        let tuple = NeighborTuple {
            iface_addr: hello.addr,
            main_addr: originator,
            local_iface,
            remote_iface,
            hw_addr: None,
            node,
            position,
            queue_length: hello.queue_length,
            prev_queue_length: hello.queue_length,
            iface_queues: hello.iface_queues.clone(),
            last_hello: now,
            willingness: hello.willingness,
        };

        let id = self.insert(tuple);
        self.by_link.insert((hello.addr, local_iface), id);

        debug!(neighbor = %hello.addr, %originator, %local_iface, "New neighbor");

        (id, HelloOutcome::Created)
    }

    fn insert(&mut self, tuple: NeighborTuple) -> NeighborId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.tuple = Some(tuple);
            slot.stale = false;
            return NeighborId { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, tuple: Some(tuple), stale: false });
        NeighborId { index, generation: 0 }
    }

    /// Records the link-layer address of a neighbor interface on every local interface.
    pub fn set_hw_addr(&mut self, iface_addr: Ipv4Addr, hw_addr: HwAddr) {
        for slot in &mut self.slots {
            if let Some(tuple) = slot.tuple.as_mut().filter(|t| t.iface_addr == iface_addr) {
                tuple.hw_addr = Some(hw_addr);
            }
        }
    }

    /// Iterates over all tuples, stale ones included.
    pub fn iter(&self) -> impl Iterator<Item = (NeighborId, &NeighborTuple)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.tuple
                .as_ref()
                .map(|t| (NeighborId { index: index as u32, generation: slot.generation }, t))
        })
    }

    /// Iterates over the tuples that may be used for routing at `now`.
    pub fn active(&self, now: Instant) -> impl Iterator<Item = (NeighborId, &NeighborTuple)> {
        self.iter().filter(move |(_, t)| self.is_valid(t, now))
    }

    /// Valid tuples whose interface or main address is `addr`.
    pub fn by_addr(
        &self,
        addr: Ipv4Addr,
        now: Instant,
    ) -> impl Iterator<Item = (NeighborId, &NeighborTuple)> {
        self.active(now).filter(move |(_, t)| t.iface_addr == addr || t.main_addr == addr)
    }

    /// Marks tuples that went stale so the next HELLO from them reports a recovery.
    /// Returns the number of tuples newly marked.
    pub fn mark_stale(&mut self, now: Instant) -> usize {
        let mut marked = 0;
        for slot in &mut self.slots {
            let Some(tuple) = slot.tuple.as_ref() else { continue };
            if slot.stale || Some(tuple.local_iface) == self.satellite {
                continue;
            }

            if now.saturating_duration_since(tuple.last_hello) > self.valid_interval {
                slot.stale = true;
                marked += 1;
                debug!(
                    neighbor = %tuple.iface_addr,
                    local_iface = %tuple.local_iface,
                    "Neighbor expired"
                );
            }
        }

        marked
    }

    /// Deletes tuples that have not been heard from for longer than `horizon`. Returns the
    /// number of deleted tuples.
    pub fn cleanup(&mut self, now: Instant, horizon: Duration) -> usize {
        let mut removed = 0;

        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(tuple) = slot.tuple.as_ref() else { continue };
            if Some(tuple.local_iface) == self.satellite ||
                now.saturating_duration_since(tuple.last_hello) <= horizon
            {
                continue;
            }

            self.by_link.remove(&(tuple.iface_addr, tuple.local_iface));
            slot.tuple = None;
            self.free.push(index as u32);
            removed += 1;
        }

        if removed > 0 {
            debug!(removed, "Deleted expired neighbors");
        }

        removed
    }

    /// Highest backlog advertised by any valid neighbor.
    pub fn max_backlog(&self, now: Instant) -> u32 {
        self.active(now).map(|(_, t)| t.queue_length).max().unwrap_or_default()
    }

    /// Highest backlog advertised by any valid neighbor heard on `local_iface`.
    pub fn max_backlog_on(&self, local_iface: IfaceId, now: Instant) -> u32 {
        self.active(now)
            .filter(|(_, t)| t.local_iface == local_iface)
            .filter_map(|(_, t)| t.link_backlog())
            .max()
            .unwrap_or_default()
    }
}
