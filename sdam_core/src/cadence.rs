use std::time::Duration;

use tokio::time::Instant;

/// Schedules ticks on a fixed grid anchored at construction time.
///
/// Ticks land at `origin + n * interval`, so time spent between ticks does not
/// push later ticks back. Missed ticks are skipped rather than replayed, and a
/// tick that is due right now counts as already taken.
#[derive(Debug)]
pub struct Cadence {
    interval: Duration,
    /// `None` when the interval is too large to be represented as an instant.
    next_tick: Option<Instant>,
}

impl Cadence {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_tick: Instant::now().checked_add(interval),
        }
    }

    /// Returns how long to wait until the next tick.
    ///
    /// The first call after construction returns the full interval.
    pub fn next_tick_delay(&mut self) -> Duration {
        let next_tick = match self.next_tick {
            Some(next_tick) => next_tick,
            None => return Duration::MAX,
        };
        if self.interval.is_zero() {
            return Duration::ZERO;
        }

        let now = Instant::now();
        if now < next_tick {
            return next_tick - now;
        }

        let behind = (now - next_tick).as_nanos();
        let interval = self.interval.as_nanos();
        let ticks_to_skip = behind / interval + 1;
        let advance = ticks_to_skip.saturating_mul(interval);
        let advance = Duration::from_nanos(u64::try_from(advance).unwrap_or(u64::MAX));

        self.next_tick = next_tick.checked_add(advance);
        match self.next_tick {
            Some(next_tick) => next_tick.saturating_duration_since(now),
            None => Duration::MAX,
        }
    }
}
