//! Time sources for the sampling loop

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Time source used to rate-limit and timestamp samples
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds; only differences are meaningful
    fn now_ns(&self) -> u64;

    /// Wall-clock nanoseconds since the Unix epoch, written into sample records
    fn wall_ns(&self) -> i64;
}

/// Real clock: `Instant` for rate limiting, chrono for record timestamps
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    /// Create a new clock starting now
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn wall_ns(&self) -> i64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    }
}

/// Hand-driven clock for deterministic runs; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ns(&self, ns: u64) {
        self.now.store(ns, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn wall_ns(&self) -> i64 {
        self.now_ns() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_clock_advances() {
        let clock = MonotonicClock::new();
        let first = clock.now_ns();
        std::thread::sleep(Duration::from_millis(10));
        assert!(clock.now_ns() >= first + 10_000_000);
        assert!(clock.wall_ns() > 0);
    }

    #[test]
    fn test_manual_clock_is_shared() {
        let clock = ManualClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_millis(5));
        assert_eq!(other.now_ns(), 5_000_000);
        other.set_ns(42);
        assert_eq!(clock.now_ns(), 42);
        assert_eq!(clock.wall_ns(), 42);
    }
}
