//! Tick sources for the autoflusher.
//!
//! The aggregator never reads the clock directly; it asks a [`TickSource`].
//! Production code uses [`MonotonicTicks`]; tests drive timeout behavior
//! deterministically with [`ManualTicks`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Source of monotonically meaningful timestamps in arbitrary ticks.
///
/// Tick overflow is silently ignored; at nanosecond resolution it would take
/// centuries to observe one.
pub trait TickSource: Send + Sync {
    /// Current timestamp in ticks.
    fn ticks(&self) -> u64;
}

/// Wall-clock-backed tick source (one tick = one nanosecond).
pub struct MonotonicTicks {
    start: Instant,
}

impl MonotonicTicks {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn ticks(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// Manually advanced tick source for deterministic tests.
///
/// `set` may move time backward; the aggregator only compares insertion
/// timestamps against the current reading, so tests can replay arbitrary
/// tick sequences.
pub struct ManualTicks {
    now: AtomicU64,
}

impl ManualTicks {
    pub fn new(start: u64) -> Self {
        Self { now: AtomicU64::new(start) }
    }

    /// Set the current tick value.
    pub fn set(&self, ticks: u64) {
        self.now.store(ticks, Ordering::Relaxed);
    }

    /// Advance the current tick value.
    pub fn advance(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::Relaxed);
    }
}

impl TickSource for ManualTicks {
    fn ticks(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_ticks() {
        let t = ManualTicks::new(100);
        assert_eq!(t.ticks(), 100);
        t.advance(5);
        assert_eq!(t.ticks(), 105);
        t.set(50);
        assert_eq!(t.ticks(), 50);
    }

    #[test]
    fn test_monotonic_ticks_advance() {
        let t = MonotonicTicks::new();
        let a = t.ticks();
        let b = t.ticks();
        assert!(b >= a);
    }
}
