//! Monotonic time source.
//!
//! The core never reads the wall clock directly; every rule that depends on
//! elapsed time takes an uptime from the injected clock, which tests drive
//! by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Monotonic uptime in milliseconds.
pub trait Clock: Send + Sync {
    fn uptime_ms(&self) -> u64;
}

/// Production clock: milliseconds since construction.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        ManualClock {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn uptime_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(100);
        assert_eq!(clock.uptime_ms(), 100);
        clock.advance(50);
        assert_eq!(clock.uptime_ms(), 150);
        clock.set(10);
        assert_eq!(clock.uptime_ms(), 10);
    }

    #[test]
    fn test_system_clock_monotone() {
        let clock = SystemClock::new();
        let a = clock.uptime_ms();
        let b = clock.uptime_ms();
        assert!(b >= a);
    }
}
