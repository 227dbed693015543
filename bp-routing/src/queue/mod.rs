//! Bounded per-interface packet queues with pluggable ordering.
//!
//! A [`PacketQueue`] wraps a [`Discipline`] (the storage and ordering policy) and keeps the
//! per-interface counters that feed HELLO advertisements, the penalty function and the
//! V-controller. The counters always equal the number of live entries queued on each interface.

use std::{net::Ipv4Addr, time::Duration, time::Instant};

use tracing::{debug, trace};

use crate::{HwAddr, IfaceId, PacketMeta};

mod lanes;
mod shared;

pub use lanes::{Lanes, Watermarks};
pub use shared::{Ordering, SharedQueue};

/// Default capacity of a queue (or of each lane).
pub const DEFAULT_CAPACITY: usize = 400;

/// A queued packet and the state needed to route it.
#[derive(Debug, Clone)]
pub struct QueueEntry<P> {
    /// The packet itself.
    pub packet: P,
    pub meta: PacketMeta,
    /// Link-layer source of the packet, if it was received from a neighbor.
    pub src_hw: Option<HwAddr>,
    /// Previous hop, used for loop avoidance.
    pub prev_hop: Option<Ipv4Addr>,
    /// Interface the packet arrived on.
    pub in_iface: Option<IfaceId>,
    pub enqueued_at: Instant,
    /// Number of times the packet was moved to another interface queue.
    pub requeues: u32,
    /// The interface the entry is currently queued on.
    pub iface: IfaceId,
}

impl<P> QueueEntry<P> {
    pub fn new(packet: P, meta: PacketMeta, now: Instant) -> Self {
        Self {
            packet,
            meta,
            src_hw: None,
            prev_hop: None,
            in_iface: None,
            enqueued_at: now,
            requeues: 0,
            iface: IfaceId::default(),
        }
    }

    pub fn with_prev_hop(mut self, prev_hop: Option<Ipv4Addr>, in_iface: Option<IfaceId>) -> Self {
        self.prev_hop = prev_hop;
        self.in_iface = in_iface;
        self
    }

    pub fn with_src_hw(mut self, src_hw: Option<HwAddr>) -> Self {
        self.src_hw = src_hw;
        self
    }

    /// Time spent in the queue so far.
    #[inline]
    pub fn sojourn(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.enqueued_at)
    }
}

/// Storage and ordering policy of a [`PacketQueue`].
///
/// Implementations only store entries; the [`PacketQueue`] wrapper keeps the counters. An entry's
/// [`iface`](QueueEntry::iface) is set before it is handed to the discipline.
pub trait Discipline<P>: Send {
    /// Inserts an entry. Returns it back if the target storage is full.
    fn push(&mut self, entry: QueueEntry<P>) -> Result<(), QueueEntry<P>>;

    /// Inserts an entry at the head of its interface, evicting the tail first if full.
    /// Returns the evicted entry.
    fn push_front(&mut self, entry: QueueEntry<P>) -> Option<QueueEntry<P>>;

    /// Removes the head entry of an interface.
    fn pop(&mut self, iface: IfaceId) -> Option<QueueEntry<P>>;

    fn peek(&self, iface: IfaceId) -> Option<&QueueEntry<P>>;

    /// Total number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns all entries for which `f` returns `false`.
    fn extract_if(&mut self, f: &mut dyn FnMut(&QueueEntry<P>) -> bool) -> Vec<QueueEntry<P>>;

    /// Whether the storage backing `iface` is congested. Only meaningful with hysteresis.
    fn congested(&self, _iface: IfaceId) -> bool {
        false
    }

    /// Number of entries dropped by the storage backing `iface`.
    fn overflows(&self, _iface: IfaceId) -> u64 {
        0
    }
}

/// The queueing discipline to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Shared storage, oldest entry first.
    #[default]
    Fifo,
    /// Shared storage, newest entry first.
    Lifo,
    /// Shared storage sorted by remaining TTL, lowest first.
    Edf,
    /// Two directional lanes: even interfaces (clockwise) and odd ones (counter-clockwise).
    Ring,
    /// One lane per interface with independent capacity and hysteresis.
    Grid,
}

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub kind: QueueKind,
    /// Total capacity for shared disciplines, per-lane capacity for lane disciplines.
    pub capacity: usize,
    /// Maximum sojourn time. Older entries are dropped by [`PacketQueue::purge_expired`].
    pub max_delay: Option<Duration>,
    /// Congestion watermarks for [`QueueKind::Grid`] lanes.
    pub watermarks: Option<Watermarks>,
}

impl QueueOptions {
    pub fn with_kind(mut self, kind: QueueKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_watermarks(mut self, high: usize, low: usize) -> Self {
        self.watermarks = Some(Watermarks::new(high, low));
        self
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            kind: QueueKind::Fifo,
            capacity: DEFAULT_CAPACITY,
            max_delay: Some(Duration::from_secs(30)),
            watermarks: None,
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub dequeued: u64,
    /// Entries dropped because the queue was full, including tail evictions.
    pub overflows: u64,
    /// Entries dropped because they sat in the queue longer than the maximum delay.
    pub expired: u64,
}

/// A bounded packet queue with per-interface accounting.
pub struct PacketQueue<P> {
    discipline: Box<dyn Discipline<P>>,
    iface_sizes: Vec<usize>,
    max_delay: Option<Duration>,
    stats: QueueStats,
}

impl<P> std::fmt::Debug for PacketQueue<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketQueue")
            .field("len", &self.discipline.len())
            .field("iface_sizes", &self.iface_sizes)
            .field("stats", &self.stats)
            .finish()
    }
}

impl<P: Send + 'static> PacketQueue<P> {
    /// Creates a queue for `n_ifaces` interfaces.
    pub fn new(options: &QueueOptions, n_ifaces: usize) -> Self {
        let discipline: Box<dyn Discipline<P>> = match options.kind {
            QueueKind::Fifo => Box::new(SharedQueue::new(Ordering::Fifo, options.capacity)),
            QueueKind::Lifo => Box::new(SharedQueue::new(Ordering::Lifo, options.capacity)),
            QueueKind::Edf => Box::new(SharedQueue::new(Ordering::Edf, options.capacity)),
            QueueKind::Ring => Box::new(Lanes::new(2, options.capacity, None)),
            QueueKind::Grid => {
                Box::new(Lanes::new(n_ifaces.max(1), options.capacity, options.watermarks))
            }
        };

        Self::with_discipline(discipline, n_ifaces, options.max_delay)
    }
}

impl<P> PacketQueue<P> {
    /// Creates a queue around a custom discipline.
    pub fn with_discipline(
        discipline: Box<dyn Discipline<P>>,
        n_ifaces: usize,
        max_delay: Option<Duration>,
    ) -> Self {
        Self { discipline, iface_sizes: vec![0; n_ifaces], max_delay, stats: QueueStats::default() }
    }

    fn size_mut(&mut self, iface: IfaceId) -> &mut usize {
        let idx = iface.index();
        if idx >= self.iface_sizes.len() {
            self.iface_sizes.resize(idx + 1, 0);
        }

        &mut self.iface_sizes[idx]
    }

    fn on_removed(&mut self, entry: &QueueEntry<P>) {
        let size = self.size_mut(entry.iface);
        *size = size.saturating_sub(1);
    }

    /// Enqueues an entry on `iface`. Returns `false` if it was dropped because the queue is full.
    pub fn enqueue(&mut self, mut entry: QueueEntry<P>, iface: IfaceId) -> bool {
        entry.iface = iface;

        match self.discipline.push(entry) {
            Ok(()) => {
                *self.size_mut(iface) += 1;
                self.stats.enqueued += 1;
                true
            }
            Err(entry) => {
                self.stats.overflows += 1;
                let len = self.len();
                debug!(%iface, dst = %entry.meta.dst, len, "Queue full, dropping packet");
                false
            }
        }
    }

    /// Enqueues an entry at the head of `iface`, evicting a tail entry first if the queue is
    /// full. The evicted entry is counted as an overflow drop and returned.
    pub fn enqueue_front(
        &mut self,
        mut entry: QueueEntry<P>,
        iface: IfaceId,
    ) -> Option<QueueEntry<P>> {
        entry.iface = iface;

        let evicted = self.discipline.push_front(entry);
        *self.size_mut(iface) += 1;
        self.stats.enqueued += 1;

        if let Some(ref evicted) = evicted {
            self.on_removed(evicted);
            self.stats.overflows += 1;
            debug!(%iface, evicted_iface = %evicted.iface, "Evicted tail entry to make room");
        }

        evicted
    }

    /// Removes the head entry of `iface`.
    pub fn dequeue(&mut self, iface: IfaceId) -> Option<QueueEntry<P>> {
        let entry = self.discipline.pop(iface)?;
        self.on_removed(&entry);
        self.stats.dequeued += 1;
        Some(entry)
    }

    pub fn peek(&self, iface: IfaceId) -> Option<&QueueEntry<P>> {
        self.discipline.peek(iface)
    }

    /// Total number of queued entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.discipline.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.discipline.is_empty()
    }

    /// Number of entries queued on `iface`.
    #[inline]
    pub fn iface_len(&self, iface: IfaceId) -> usize {
        self.iface_sizes.get(iface.index()).copied().unwrap_or_default()
    }

    /// Per-interface queue lengths, indexed by interface.
    pub fn iface_lens(&self) -> &[usize] {
        &self.iface_sizes
    }

    pub fn congested(&self, iface: IfaceId) -> bool {
        self.discipline.congested(iface)
    }

    /// Overflow drops attributed to the storage backing `iface`.
    pub fn iface_overflows(&self, iface: IfaceId) -> u64 {
        self.discipline.overflows(iface)
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    /// Drops every entry that has been queued longer than the maximum delay.
    pub fn purge_expired(&mut self, now: Instant) -> Vec<QueueEntry<P>> {
        let Some(max_delay) = self.max_delay else {
            return Vec::new();
        };

        let expired = self.discipline.extract_if(&mut |e| e.sojourn(now) <= max_delay);
        for entry in &expired {
            self.on_removed(entry);
        }

        if !expired.is_empty() {
            self.stats.expired += expired.len() as u64;
            trace!(count = expired.len(), "Purged expired queue entries");
        }

        expired
    }

    /// Removes and returns every entry queued on `iface`.
    pub fn drain_iface(&mut self, iface: IfaceId) -> Vec<QueueEntry<P>> {
        let drained = self.discipline.extract_if(&mut |e| e.iface != iface);
        for entry in &drained {
            self.on_removed(entry);
        }

        drained
    }
}
