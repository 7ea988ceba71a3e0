//! Time source used to stamp callback start times.

use std::time::Instant;

/// Millisecond clock consulted when a frame is handed to a user callback.
pub trait TimeService: Send + Sync {
    /// Current time in milliseconds.
    fn now_ms(&self) -> f64;
}

/// Monotonic clock measuring milliseconds since its creation.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Start a clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeService for MonotonicClock {
    fn now_ms(&self) -> f64 {
        self.origin.elapsed().as_secs_f64() * 1000.0
    }
}
