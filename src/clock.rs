//! Time source for every expiry and window computation.
//!
//! Components never read the system time directly; they are handed an
//! `Arc<dyn Clock>` so tests can drive time by hand.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const MILLIS_PER_SEC: u64 = 1_000;
pub const MILLIS_PER_MINUTE: u64 = 60 * MILLIS_PER_SEC;

/// A source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync + Debug {
    fn now_millis(&self) -> u64;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually driven clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        let _ = self
            .millis
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |m| Some(m.saturating_add(by)));
    }

    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Seconds between two millisecond timestamps, saturating at zero.
pub fn elapsed_secs(from: u64, to: u64) -> f64 {
    to.saturating_sub(from) as f64 / MILLIS_PER_SEC as f64
}

/// `now + duration` in milliseconds, saturating at `u64::MAX`.
pub fn deadline(now: u64, duration: Duration) -> u64 {
    now.saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), 3_000);

        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[test]
    fn test_elapsed_secs_saturates() {
        assert_eq!(elapsed_secs(5_000, 6_500), 1.5);
        assert_eq!(elapsed_secs(6_500, 5_000), 0.0);
    }

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(deadline(1_000, Duration::from_secs(2)), 3_000);
        assert_eq!(deadline(1_000, Duration::from_secs(u64::MAX)), u64::MAX);
        assert_eq!(deadline(u64::MAX - 1, Duration::from_millis(5)), u64::MAX);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
