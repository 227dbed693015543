use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use bp_routing::Telemetry;

/// Statistics of a daemon. These are shared between the driver task and the handle.
#[derive(Debug, Default)]
pub struct DaemonStats {
    hellos_tx: AtomicU64,
    hellos_rx: AtomicU64,
    /// Datagrams that failed to decode.
    decode_errors: AtomicU64,
    /// HELLOs that could not be sent.
    send_errors: AtomicU64,
    /// Forwarding decisions dropped because the handle wasn't keeping up.
    forward_drops: AtomicU64,
    /// Last router snapshot, refreshed after every event.
    telemetry: RwLock<Option<Telemetry>>,
}

impl DaemonStats {
    #[inline]
    pub(crate) fn increment_hellos_tx(&self) {
        self.hellos_tx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_hellos_rx(&self) {
        self.hellos_rx.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_decode_errors(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_forward_drops(&self) {
        self.forward_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_telemetry(&self, telemetry: Telemetry) {
        *self.telemetry.write() = Some(telemetry);
    }

    #[inline]
    pub fn hellos_tx(&self) -> u64 {
        self.hellos_tx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn hellos_rx(&self) -> u64 {
        self.hellos_rx.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn forward_drops(&self) -> u64 {
        self.forward_drops.load(Ordering::Relaxed)
    }

    /// The latest router telemetry, `None` before the driver first reported.
    pub fn telemetry(&self) -> Option<Telemetry> {
        self.telemetry.read().clone()
    }

    /// Current V values.
    pub fn v(&self) -> Vec<f64> {
        self.telemetry.read().as_ref().map(|t| t.v.clone()).unwrap_or_default()
    }
}
