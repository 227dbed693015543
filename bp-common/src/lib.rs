use std::time::Duration;

use rand::Rng;

mod timer;
pub use timer::PeriodicTimer;

/// Returns a uniformly random duration in `[0, max]`.
///
/// Used to desynchronize periodic control traffic between neighbors.
pub fn jitter<R: Rng + ?Sized>(rng: &mut R, max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }

    Duration::from_nanos(rng.gen_range(0..=max.as_nanos() as u64))
}

pub mod constants {
    /// One megabit per second, in bits per second.
    pub const MBPS: u64 = 1_000_000;
}
