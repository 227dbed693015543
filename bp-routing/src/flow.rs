use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::{FlowKey, IfaceId, Route};

/// A cached route for one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowEntry {
    pub route: Route,
    /// TTL of the packet the route was decided for.
    pub ttl: u8,
    pub decided_at: Instant,
    pub used_at: Instant,
}

/// Result of a [`FlowTable::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The cached route is valid and should be used.
    Hit(Route),
    /// The flow is active but its route is old: recompute, preferring this route among ties.
    Refresh(Route),
    Miss,
}

impl Lookup {
    /// The cached route, whether valid or due for a refresh.
    pub fn route(&self) -> Option<Route> {
        match *self {
            Self::Hit(route) | Self::Refresh(route) => Some(route),
            Self::Miss => None,
        }
    }
}

/// Per-flow next-hop cache with loop and staleness defenses.
#[derive(Debug)]
pub struct FlowTable {
    entries: FxHashMap<FlowKey, FlowEntry>,
    idle_timeout: Duration,
}

impl FlowTable {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { entries: FxHashMap::default(), idle_timeout }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Looks up the route for a flow and marks it used on a hit.
    ///
    /// A TTL different from the one the entry was installed with means the packet may be
    /// looping: the entry is evicted. So is an entry whose flow has gone idle.
    pub fn lookup(&mut self, key: &FlowKey, ttl: u8, now: Instant) -> Lookup {
        let Some(entry) = self.entries.get_mut(key) else {
            return Lookup::Miss;
        };

        if entry.ttl != ttl {
            trace!(dst = %key.dst, stored = entry.ttl, ttl, "TTL mismatch, evicting flow");
            self.entries.remove(key);
            return Lookup::Miss;
        }

        if now.saturating_duration_since(entry.used_at) > self.idle_timeout {
            trace!(dst = %key.dst, "Flow idle, evicting");
            self.entries.remove(key);
            return Lookup::Miss;
        }

        if now.saturating_duration_since(entry.decided_at) > self.idle_timeout {
            return Lookup::Refresh(entry.route);
        }

        entry.used_at = now;
        Lookup::Hit(entry.route)
    }

    /// Returns the cached entry without any validity checks.
    pub fn get(&self, key: &FlowKey) -> Option<&FlowEntry> {
        self.entries.get(key)
    }

    /// Installs or replaces the route for a flow.
    pub fn update(&mut self, key: FlowKey, route: Route, ttl: u8, now: Instant) {
        self.entries.insert(key, FlowEntry { route, ttl, decided_at: now, used_at: now });
    }

    pub fn evict(&mut self, key: &FlowKey) -> Option<FlowEntry> {
        self.entries.remove(key)
    }

    /// Drops every entry routed through `iface`. Returns the number of dropped entries.
    pub fn invalidate_iface(&mut self, iface: IfaceId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.route.out_iface != iface);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops entries whose flow has been idle for longer than the timeout.
    pub fn purge_idle(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let idle_timeout = self.idle_timeout;
        self.entries.retain(|_, e| now.saturating_duration_since(e.used_at) <= idle_timeout);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
