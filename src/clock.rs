//! Loop clock — monotonic nanosecond time source
//!
//! The loop reads its clock once per tick and caches the value; every trigger
//! time, delay, period and budget in this crate is an `i64` of nanoseconds on
//! that clock. `SystemClock` wraps `Instant`, `ManualClock` is a software
//! counter for deterministic tests.
//!
//! Author: Moroya Sakamoto

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Nanoseconds per microsecond
pub const NANOS_PER_MICRO: i64 = 1_000;
/// Nanoseconds per millisecond
pub const NANOS_PER_MILLI: i64 = 1_000_000;
/// Nanoseconds per second
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Monotonic time source consumed by the loop
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds. Must never go backwards.
    fn now_nanos(&self) -> i64;
}

/// Wall-independent clock backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_nanos(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Software clock for testing
///
/// Clones share the same counter, so a test can keep one copy and hand
/// another to the loop.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock reading `start` nanoseconds
    pub fn new(start: i64) -> Self {
        Self {
            nanos: Arc::new(AtomicI64::new(start)),
        }
    }

    /// Advance time by `delta` nanoseconds (negative deltas are ignored)
    pub fn advance(&self, delta: i64) {
        if delta > 0 {
            self.nanos.fetch_add(delta, Ordering::SeqCst);
        }
    }

    /// Jump to an absolute time, never backwards
    pub fn set(&self, nanos: i64) {
        self.nanos.fetch_max(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// `n` microseconds in loop time units
pub const fn micros(n: i64) -> i64 {
    n.saturating_mul(NANOS_PER_MICRO)
}

/// `n` milliseconds in loop time units
pub const fn millis(n: i64) -> i64 {
    n.saturating_mul(NANOS_PER_MILLI)
}

/// Convert a `Duration`, saturating at `i64::MAX`
pub fn from_duration(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}

/// Convert loop time units to a `Duration`, clamping negatives to zero
pub fn to_duration(nanos: i64) -> Duration {
    Duration::from_nanos(nanos.max(0).unsigned_abs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(0);
        assert_eq!(clock.now_nanos(), 0);
        clock.advance(millis(1));
        assert_eq!(clock.now_nanos(), 1_000_000);
    }

    #[test]
    fn test_manual_clock_never_goes_back() {
        let clock = ManualClock::new(500);
        clock.set(100);
        assert_eq!(clock.now_nanos(), 500);
        clock.advance(-50);
        assert_eq!(clock.now_nanos(), 500);
        clock.set(900);
        assert_eq!(clock.now_nanos(), 900);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(0);
        let shared = clock.clone();
        clock.advance(42);
        assert_eq!(shared.now_nanos(), 42);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now_nanos();
        let b = clock.now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn test_unit_helpers() {
        assert_eq!(micros(3), 3_000);
        assert_eq!(millis(2), 2_000_000);
        assert_eq!(from_duration(Duration::from_millis(5)), millis(5));
        assert_eq!(to_duration(-10), Duration::ZERO);
        assert_eq!(to_duration(millis(7)), Duration::from_millis(7));
    }
}
