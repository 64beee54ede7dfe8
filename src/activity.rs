//! Server-wide activity mark for the idle watchdog.
//!
//! The original design surfaced idleness as an event-wait timeout; here
//! every accept, handshake byte and relay chunk stamps a shared mark, and
//! a watchdog task in [`crate::server`] logs the mark line once per idle
//! interval.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Millisecond-granularity record of the last observed activity.
///
/// Stored as milliseconds since construction so the hot relay path only
/// pays a relaxed atomic store.
pub struct ActivityMark {
    started: Instant,
    last_ms: AtomicU64,
}

impl ActivityMark {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let ms = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(ms, Ordering::Relaxed);
    }

    /// Time elapsed since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityMark {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_resets_idle() {
        let mark = ActivityMark::new();
        std::thread::sleep(Duration::from_millis(30));
        assert!(mark.idle_for() >= Duration::from_millis(25));
        mark.touch();
        assert!(mark.idle_for() < Duration::from_millis(25));
    }
}
