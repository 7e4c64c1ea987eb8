use std::time::{Instant, SystemTime};

/// Time source shared by the timer bridge and the packet pump.
pub trait Clock {
    /// Monotonic time used for deadlines and receipt times.
    fn now(&self) -> Instant;

    /// Wall-clock time, compared against kernel receive timestamps.
    fn wall_now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// [`Clock`] backed by [`Instant::now`] and [`SystemTime::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
