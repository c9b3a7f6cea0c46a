//! Minimum wait between frames.
//!
//! A strip latches (displays) the received data once its data line stays low
//! for the reset time. Every hardware start consults a [`FrameTimingGuard`]
//! so the next frame never begins inside the previous frame's latch window.

use embassy_time::{Duration, Instant};
use portable_atomic::{AtomicU64, Ordering};

use crate::clock::TimeSource;

// `last` stores ticks + 1 so that 0 can mean "never marked".
const NEVER: u64 = 0;

// Marks and reads are floored to whole ticks, so a tick difference of `n` may
// be as little as `n - 1` ticks of real time.
const ROUNDING: Duration = Duration::from_ticks(1);

/// Records the last frame boundary and reports the remaining latch wait.
///
/// The timestamp is atomic, so a completion interrupt may [`mark`](Self::mark)
/// it while a producer polls [`remaining`](Self::remaining).
#[derive(Debug)]
pub struct FrameTimingGuard {
    last: AtomicU64,
    min_interval: Duration,
}

impl FrameTimingGuard {
    /// A guard that has never been marked, so the first frame may start at once.
    #[must_use]
    pub const fn new(min_interval: Duration) -> Self {
        Self {
            last: AtomicU64::new(NEVER),
            min_interval,
        }
    }

    /// A guard for a latch time given in microseconds.
    #[must_use]
    pub const fn from_micros(latch_us: u32) -> Self {
        Self::new(Duration::from_micros(latch_us as u64))
    }

    /// The configured minimum interval.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Record a frame boundary (completion, or start) at `now`.
    pub fn mark(&self, now: Instant) {
        self.last
            .store(now.as_ticks().saturating_add(1), Ordering::Release);
    }

    /// Forget the last boundary.
    pub fn clear(&self) {
        self.last.store(NEVER, Ordering::Release);
    }

    /// The last recorded boundary, if any.
    #[must_use]
    pub fn last(&self) -> Option<Instant> {
        match self.last.load(Ordering::Acquire) {
            NEVER => None,
            ticks => Some(Instant::from_ticks(ticks.saturating_sub(1))),
        }
    }

    /// Time left before `interval` has certainly passed since the last boundary.
    ///
    /// One tick is added to `interval` to cover the flooring of both instants.
    #[must_use]
    pub fn remaining_for(&self, now: Instant, interval: Duration) -> Duration {
        let Some(last) = self.last() else {
            return Duration::from_ticks(0);
        };
        let elapsed = now.saturating_duration_since(last);
        interval
            .checked_add(ROUNDING)
            .unwrap_or(interval)
            .checked_sub(elapsed)
            .unwrap_or(Duration::from_ticks(0))
    }

    /// Time left before the minimum interval has passed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.remaining_for(now, self.min_interval)
    }

    /// Whether a new frame may start at `now`.
    #[must_use]
    pub fn is_ready(&self, now: Instant) -> bool {
        self.remaining(now) == Duration::from_ticks(0)
    }

    /// Spin on `time` until the minimum interval has passed.
    pub fn wait<T: TimeSource + ?Sized>(&self, time: &T) {
        self.wait_for(time, self.min_interval);
    }

    /// Spin on `time` until `interval` has passed since the last boundary.
    pub fn wait_for<T: TimeSource + ?Sized>(&self, time: &T, interval: Duration) {
        let mut waited = false;
        while self.remaining_for(time.now(), interval) > Duration::from_ticks(0) {
            waited = true;
            time.pause();
        }
        if waited {
            trace!("frame guard waited {=u64} us", interval.as_micros());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarked_guard_is_ready() {
        let guard = FrameTimingGuard::from_micros(280);
        assert!(guard.is_ready(Instant::from_micros(0)));
        assert_eq!(guard.last(), None);
    }

    #[test]
    fn latch_window_is_enforced() {
        let guard = FrameTimingGuard::from_micros(280);
        guard.mark(Instant::from_micros(1_000));
        assert_eq!(guard.last(), Some(Instant::from_micros(1_000)));
        assert_eq!(
            guard.remaining(Instant::from_micros(1_100)),
            Duration::from_micros(181)
        );
        assert!(!guard.is_ready(Instant::from_micros(1_279)));
        // 1000.9 us to 1280.0 us is less than the latch
        assert!(!guard.is_ready(Instant::from_micros(1_280)));
        assert!(guard.is_ready(Instant::from_micros(1_281)));
        assert!(guard.is_ready(Instant::from_micros(5_000)));
    }

    #[test]
    fn wait_covers_the_whole_interval_in_real_time() {
        let clock = crate::sim::SimClock::new(64_000_000);
        // mark late inside a microsecond
        clock.advance(64 * 10 + 63);
        let guard = FrameTimingGuard::from_micros(50);
        guard.mark(clock.instant());
        let marked_at = clock.peek();

        guard.wait(&clock);

        assert!(clock.peek() - marked_at >= 50 * 64);
    }

    #[test]
    fn mark_at_time_zero_is_remembered() {
        let guard = FrameTimingGuard::from_micros(50);
        guard.mark(Instant::from_ticks(0));
        assert!(!guard.is_ready(Instant::from_micros(10)));
        guard.clear();
        assert!(guard.is_ready(Instant::from_micros(10)));
    }
}
