//! The V-controller: adaptive trade-off between the penalty bias and queue differentials.
//!
//! With empty queues V sits at its ceiling `Qth` and the hop penalty dominates, so packets take
//! short paths. As local or neighbor backlog approaches `Qth`, V drops towards zero and routing
//! degrades to pure backpressure load balancing.

use tracing::trace;

use crate::{IfaceId, NodeRole};

/// Whether V is kept per node or per local interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VMode {
    #[default]
    Scalar,
    PerInterface,
}

#[derive(Debug, Clone)]
pub struct VOptions {
    /// Backlog ceiling `Qth`.
    pub qth: f64,
    /// Multiplier applied to `Qth` on a gateway node.
    pub gateway_factor: f64,
    pub mode: VMode,
    /// Raise V towards `Qth` as the packet's TTL shrinks.
    pub ttl_escalation: bool,
    /// TTL packets start with, the reference for escalation.
    pub initial_ttl: u8,
    /// Weight of a new sample in the backlog moving average.
    pub avg_weight: f64,
}

impl VOptions {
    pub fn with_qth(mut self, qth: f64) -> Self {
        self.qth = qth;
        self
    }

    pub fn with_mode(mut self, mode: VMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_ttl_escalation(mut self, initial_ttl: u8) -> Self {
        self.ttl_escalation = true;
        self.initial_ttl = initial_ttl;
        self
    }

    pub fn with_gateway_factor(mut self, factor: f64) -> Self {
        self.gateway_factor = factor;
        self
    }
}

impl Default for VOptions {
    fn default() -> Self {
        Self {
            qth: 400.0,
            gateway_factor: 2.0,
            mode: VMode::Scalar,
            ttl_escalation: false,
            initial_ttl: 64,
            avg_weight: 0.1,
        }
    }
}

/// `clamp(qth − max(local, neighbor), 0, qth)`.
#[inline]
pub fn compute_v(qth: f64, local: f64, neighbor: f64) -> f64 {
    (qth - local.max(neighbor)).clamp(0.0, qth.max(0.0))
}

/// Holds the current V of a node (or of each of its interfaces).
#[derive(Debug, Clone)]
pub struct VController {
    qth: f64,
    mode: VMode,
    ttl_escalation: bool,
    initial_ttl: u8,
    scalar: f64,
    per_iface: Vec<f64>,
}

impl VController {
    pub fn new(options: &VOptions, role: NodeRole, n_ifaces: usize) -> Self {
        let qth = match role {
            NodeRole::Gateway => options.qth * options.gateway_factor,
            _ => options.qth,
        };

        Self {
            qth,
            mode: options.mode,
            ttl_escalation: options.ttl_escalation,
            initial_ttl: options.initial_ttl,
            scalar: qth,
            per_iface: vec![qth; n_ifaces],
        }
    }

    /// The effective ceiling, gateway factor applied.
    #[inline]
    pub fn qth(&self) -> f64 {
        self.qth
    }

    pub fn mode(&self) -> VMode {
        self.mode
    }

    /// Recomputes the node-wide V.
    pub fn update(&mut self, local: f64, max_neighbor: f64) -> f64 {
        self.scalar = compute_v(self.qth, local, max_neighbor);
        trace!(local, max_neighbor, v = self.scalar, "Recomputed V");
        self.scalar
    }

    /// Recomputes V for one interface.
    pub fn update_iface(&mut self, iface: IfaceId, local: f64, max_neighbor: f64) -> f64 {
        let v = compute_v(self.qth, local, max_neighbor);
        if let Some(slot) = self.per_iface.get_mut(iface.index()) {
            *slot = v;
        }

        trace!(%iface, local, max_neighbor, v, "Recomputed interface V");
        v
    }

    /// Current V for decisions on `iface`.
    pub fn value(&self, iface: IfaceId) -> f64 {
        match self.mode {
            VMode::Scalar => self.scalar,
            VMode::PerInterface => {
                self.per_iface.get(iface.index()).copied().unwrap_or(self.scalar)
            }
        }
    }

    /// Current V for a packet with `ttl` left, escalated if enabled.
    pub fn value_for(&self, iface: IfaceId, ttl: u8) -> f64 {
        let v = self.value(iface);
        if self.ttl_escalation {
            self.escalate(v, ttl)
        } else {
            v
        }
    }

    /// `V + (Qth − V)·(1 − ttl / initial_ttl)`, within `[V, Qth]`.
    pub fn escalate(&self, v: f64, ttl: u8) -> f64 {
        if self.initial_ttl == 0 {
            return v;
        }

        let spent = 1.0 - (f64::from(ttl) / f64::from(self.initial_ttl)).min(1.0);
        (v + (self.qth - v) * spent).clamp(0.0, self.qth)
    }

    /// All current values: one per interface in per-interface mode, else one.
    pub fn values(&self) -> Vec<f64> {
        match self.mode {
            VMode::Scalar => vec![self.scalar],
            VMode::PerInterface => self.per_iface.clone(),
        }
    }
}

/// Exponentially weighted moving average of the backlog.
#[derive(Debug, Clone, Copy)]
pub struct BacklogAverage {
    weight: f64,
    value: Option<f64>,
}

impl BacklogAverage {
    pub fn new(weight: f64) -> Self {
        Self { weight: weight.clamp(0.0, 1.0), value: None }
    }

    /// Adds a sample and returns the new average. The first sample initializes the average.
    pub fn sample(&mut self, backlog: f64) -> f64 {
        let value = match self.value {
            Some(prev) => prev + self.weight * (backlog - prev),
            None => backlog,
        };

        self.value = Some(value);
        value
    }

    pub fn value(&self) -> f64 {
        self.value.unwrap_or_default()
    }
}
