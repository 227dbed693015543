use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{FutureExt, Stream};
use rand::{rngs::StdRng, SeedableRng};
use tokio::time::{sleep_until, Instant, Sleep};

use crate::jitter;

/// A self-rescheduling periodic timer with optional jitter and explicit cancellation.
///
/// Each tick fires `period - jitter` after the previous deadline, where `jitter` is drawn
/// uniformly from `[0, max_jitter]`. Once [`cancel`](Self::cancel) has been called the timer
/// never fires again and the stream terminates.
pub struct PeriodicTimer {
    /// Nominal period between ticks.
    period: Duration,
    /// Upper bound of the random amount subtracted from each period.
    max_jitter: Duration,
    /// Whether the first tick fires immediately.
    immediate: bool,
    /// The pending deadline. `None` until the first poll.
    /// We need the sleep to be pinned (`Sleep` is not `Unpin`)
    sleep: Option<Pin<Box<Sleep>>>,
    rng: StdRng,
    cancelled: bool,
}

impl std::fmt::Debug for PeriodicTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTimer")
            .field("period", &self.period)
            .field("max_jitter", &self.max_jitter)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

impl PeriodicTimer {
    /// Creates a timer that first fires one period after the first poll.
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            max_jitter: Duration::ZERO,
            immediate: false,
            sleep: None,
            rng: StdRng::from_entropy(),
            cancelled: false,
        }
    }

    /// Sets the maximum jitter. Values at or above the period are clamped to half the period.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = if max_jitter >= self.period { self.period / 2 } else { max_jitter };
        self
    }

    /// Makes the first tick fire as soon as the timer is polled.
    pub fn fire_immediately(mut self) -> Self {
        self.immediate = true;
        self
    }

    /// Returns the nominal period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Cancels the timer. Pending and future ticks are discarded.
    pub fn cancel(&mut self) {
        self.cancelled = true;
        self.sleep = None;
    }

    /// Returns `true` if the timer has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Polls for the next tick. Returns `Poll::Ready(None)` once cancelled.
    pub fn poll_tick(&mut self, cx: &mut Context<'_>) -> Poll<Option<Instant>> {
        if self.cancelled {
            return Poll::Ready(None);
        }

        let Self { period, max_jitter, immediate, sleep, rng, .. } = self;

        if sleep.is_none() {
            let first = if *immediate {
                Duration::ZERO
            } else {
                period.saturating_sub(jitter(rng, *max_jitter))
            };
            *sleep = Some(Box::pin(sleep_until(Instant::now() + first)));
        }

        let Some(sleep) = sleep.as_mut() else {
            return Poll::Ready(None);
        };

        if sleep.poll_unpin(cx).is_ready() {
            let fired = sleep.deadline();
            let next = period.saturating_sub(jitter(rng, *max_jitter));

            // Reschedule relative to the deadline rather than `now` so ticks don't drift.
            let now = Instant::now();
            let deadline = if fired + next <= now { now + next } else { fired + next };
            sleep.as_mut().reset(deadline);

            return Poll::Ready(Some(fired));
        }

        Poll::Pending
    }
}

impl Stream for PeriodicTimer {
    type Item = Instant;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_tick(cx)
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_every_period() {
        let start = Instant::now();
        let mut timer = PeriodicTimer::new(Duration::from_millis(100));

        let first = timer.next().await.unwrap();
        assert_eq!(first - start, Duration::from_millis(100));

        let second = timer.next().await.unwrap();
        assert_eq!(second - first, Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_first_tick() {
        let start = Instant::now();
        let mut timer = PeriodicTimer::new(Duration::from_secs(1)).fire_immediately();

        let first = timer.next().await.unwrap();
        assert_eq!(first, start);
    }

    #[tokio::test(start_paused = true)]
    async fn jitter_shortens_period() {
        let mut timer = PeriodicTimer::new(Duration::from_millis(100))
            .with_jitter(Duration::from_millis(20))
            .fire_immediately();

        let mut prev = timer.next().await.unwrap();
        for _ in 0..20 {
            let tick = timer.next().await.unwrap();
            let gap = tick - prev;
            assert!(gap >= Duration::from_millis(80) && gap <= Duration::from_millis(100));
            prev = tick;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_terminates_stream() {
        let mut timer = PeriodicTimer::new(Duration::from_millis(10));
        timer.next().await.unwrap();

        timer.cancel();
        assert!(timer.is_cancelled());
        assert!(timer.next().await.is_none());
    }
}
