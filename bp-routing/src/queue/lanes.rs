use std::collections::VecDeque;

use tracing::debug;

use super::{Discipline, QueueEntry};
use crate::IfaceId;

/// High/low watermarks for congestion hysteresis.
///
/// A lane becomes congested once it holds `high` entries and stays congested until it drains
/// to `low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub high: usize,
    pub low: usize,
}

impl Watermarks {
    pub fn new(high: usize, low: usize) -> Self {
        Self { high, low: low.min(high) }
    }
}

#[derive(Debug)]
struct Lane<P> {
    entries: VecDeque<QueueEntry<P>>,
    overflows: u64,
    congested: bool,
}

impl<P> Lane<P> {
    fn update_congestion(&mut self, watermarks: Option<Watermarks>, lane: usize) {
        let Some(Watermarks { high, low }) = watermarks else { return };

        let len = self.entries.len();
        if !self.congested && len >= high {
            self.congested = true;
            debug!(lane, len, "Lane congested");
        } else if self.congested && len <= low {
            self.congested = false;
            debug!(lane, len, "Lane recovered");
        }
    }
}

/// Independent FIFO lanes, one per interface class, each with its own capacity.
///
/// Interfaces fold onto lanes modulo the lane count: a ring node uses two lanes (clockwise on
/// even interfaces, counter-clockwise on odd ones), a grid node uses one lane per interface.
#[derive(Debug)]
pub struct Lanes<P> {
    lanes: Vec<Lane<P>>,
    capacity: usize,
    watermarks: Option<Watermarks>,
}

impl<P> Lanes<P> {
    pub fn new(n_lanes: usize, capacity: usize, watermarks: Option<Watermarks>) -> Self {
        let lanes = (0..n_lanes.max(1))
            .map(|_| Lane { entries: VecDeque::new(), overflows: 0, congested: false })
            .collect();

        Self { lanes, capacity, watermarks }
    }

    #[inline]
    fn lane_of(&self, iface: IfaceId) -> usize {
        iface.index() % self.lanes.len()
    }

    /// Number of entries stored in the lane backing `iface`.
    pub fn lane_len(&self, iface: IfaceId) -> usize {
        self.lanes[self.lane_of(iface)].entries.len()
    }
}

impl<P: Send> Discipline<P> for Lanes<P> {
    fn push(&mut self, entry: QueueEntry<P>) -> Result<(), QueueEntry<P>> {
        let idx = self.lane_of(entry.iface);
        let watermarks = self.watermarks;
        let lane = &mut self.lanes[idx];

        if lane.entries.len() >= self.capacity {
            lane.overflows += 1;
            return Err(entry);
        }

        lane.entries.push_back(entry);
        lane.update_congestion(watermarks, idx);

        Ok(())
    }

    fn push_front(&mut self, entry: QueueEntry<P>) -> Option<QueueEntry<P>> {
        let idx = self.lane_of(entry.iface);
        let watermarks = self.watermarks;
        let lane = &mut self.lanes[idx];

        let evicted = if lane.entries.len() >= self.capacity {
            lane.overflows += 1;
            lane.entries.pop_back()
        } else {
            None
        };

        lane.entries.push_front(entry);
        lane.update_congestion(watermarks, idx);

        evicted
    }

    fn pop(&mut self, iface: IfaceId) -> Option<QueueEntry<P>> {
        let idx = self.lane_of(iface);
        let watermarks = self.watermarks;
        let lane = &mut self.lanes[idx];

        let pos = lane.entries.iter().position(|e| e.iface == iface)?;
        let entry = lane.entries.remove(pos);
        lane.update_congestion(watermarks, idx);

        entry
    }

    fn peek(&self, iface: IfaceId) -> Option<&QueueEntry<P>> {
        self.lanes[self.lane_of(iface)].entries.iter().find(|e| e.iface == iface)
    }

    fn len(&self) -> usize {
        self.lanes.iter().map(|l| l.entries.len()).sum()
    }

    fn extract_if(&mut self, f: &mut dyn FnMut(&QueueEntry<P>) -> bool) -> Vec<QueueEntry<P>> {
        let mut removed = Vec::new();

        for (idx, lane) in self.lanes.iter_mut().enumerate() {
            let mut kept = VecDeque::with_capacity(lane.entries.len());
            for entry in lane.entries.drain(..) {
                if f(&entry) {
                    kept.push_back(entry);
                } else {
                    removed.push(entry);
                }
            }

            lane.entries = kept;
            lane.update_congestion(self.watermarks, idx);
        }

        removed
    }

    fn congested(&self, iface: IfaceId) -> bool {
        self.lanes[self.lane_of(iface)].congested
    }

    fn overflows(&self, iface: IfaceId) -> u64 {
        self.lanes[self.lane_of(iface)].overflows
    }
}
