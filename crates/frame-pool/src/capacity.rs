//! Admission capacity shared between an archive and its configuration knob.

use std::sync::atomic::{AtomicU32, Ordering};

/// Atomic admission limit read by every allocation.
///
/// Writers are configuration calls; last writer wins. A new value applies to
/// subsequent admissions only, never to frames already live.
#[derive(Debug)]
pub struct CapacityCell(AtomicU32);

impl CapacityCell {
    /// Capacity used when nothing else is configured.
    pub const DEFAULT: u32 = 16;

    /// Create a cell holding `capacity`.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self(AtomicU32::new(capacity))
    }

    /// Current admission limit.
    #[inline]
    #[must_use]
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    /// Replace the admission limit.
    #[inline]
    pub fn set(&self, capacity: u32) {
        self.0.store(capacity, Ordering::Release);
    }
}

impl Default for CapacityCell {
    fn default() -> Self {
        Self::new(Self::DEFAULT)
    }
}
