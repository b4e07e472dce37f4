//! Time sources and data-rate rules for the timeout supervisor.

use std::{
    cell::Cell,
    fmt,
    time::{Duration, Instant},
};

/// Where the connection gets "now" from.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Reads tokio's clock, so tests running with a paused runtime see
/// auto-advanced time.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Cell<Instant>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock").finish_non_exhaustive()
    }
}

/// A minimum throughput, enforced once `grace_period` has elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinDataRate {
    pub bytes_per_second: u64,
    pub grace_period: Duration,
}

impl Default for MinDataRate {
    fn default() -> Self {
        Self {
            bytes_per_second: 240,
            grace_period: Duration::from_secs(5),
        }
    }
}

impl MinDataRate {
    /// Whether `bytes` transferred over `elapsed` falls below the rate.
    /// Always false during the grace period.
    pub fn is_too_slow(&self, bytes: u64, elapsed: Duration) -> bool {
        if elapsed <= self.grace_period {
            return false;
        }
        (bytes as f64) < self.bytes_per_second as f64 * elapsed.as_secs_f64()
    }

    /// How long a write of `bytes` may take at most
    pub fn write_deadline(&self, bytes: usize) -> Duration {
        if self.bytes_per_second == 0 {
            return self.grace_period;
        }
        let at_rate = Duration::from_secs_f64(bytes as f64 / self.bytes_per_second as f64);
        at_rate.max(self.grace_period)
    }
}
