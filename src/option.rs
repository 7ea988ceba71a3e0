//! Runtime-tunable numeric options.
//!
//! A [`CaptureOption`] is the generic get/set surface a configuration layer
//! talks to. Only range and step validation matter here; the option never
//! gates on device state.
//!
//! [`FrameQueueSizeOption`] exposes an archive's admission capacity. It holds
//! the same [`CapacityCell`] the archive reads on every allocation, so a
//! successful `set` applies to the next admission check.

use std::fmt::Debug;
use std::sync::Arc;

use frame_pool::CapacityCell;
use tracing::debug;

use crate::error::{SourceError, SourceResult};

/// Tolerance used when checking that a value sits on a step boundary.
const STEP_TOLERANCE: f32 = 1e-4;

/// Declared bounds of a numeric option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OptionRange {
    /// Minimum allowed value (inclusive).
    pub min: f32,
    /// Maximum allowed value (inclusive).
    pub max: f32,
    /// Granularity; values must be `min + k * step`.
    pub step: f32,
    /// Value used when nothing else is configured.
    pub default: f32,
}

impl OptionRange {
    /// Build a range.
    #[must_use]
    pub const fn new(min: f32, max: f32, step: f32, default: f32) -> Self {
        Self {
            min,
            max,
            step,
            default,
        }
    }

    /// Whether `value` lies in `[min, max]` and on a step boundary.
    #[must_use]
    pub fn is_valid(&self, value: f32) -> bool {
        if !value.is_finite() || value < self.min || value > self.max {
            return false;
        }
        if self.step <= 0.0 {
            return true;
        }
        let steps = (value - self.min) / self.step;
        (steps - steps.round()).abs() <= STEP_TOLERANCE
    }
}

/// Range of the frame queue size option: `[0, 32]`, step 1, default 16.
pub const FRAME_QUEUE_SIZE_RANGE: OptionRange =
    OptionRange::new(0.0, 32.0, 1.0, CapacityCell::DEFAULT as f32);

/// Generic get/set interface for a tunable value.
pub trait CaptureOption: Send + Sync + Debug {
    /// Declared bounds.
    fn range(&self) -> OptionRange;

    /// Store `value`, or fail with [`SourceError::InvalidValue`] leaving the
    /// previous value in place.
    fn set(&self, value: f32) -> SourceResult<()>;

    /// Current value.
    fn query(&self) -> f32;

    /// Whether the option can currently be changed.
    fn is_enabled(&self) -> bool;

    /// Human-readable purpose.
    fn describe(&self) -> &'static str;

    /// Whether `value` would be accepted by [`set`](Self::set).
    fn is_valid(&self, value: f32) -> bool {
        self.range().is_valid(value)
    }
}

/// Admission capacity of a frame archive, exposed as an option.
#[derive(Debug)]
pub struct FrameQueueSizeOption {
    cell: Arc<CapacityCell>,
    range: OptionRange,
}

impl FrameQueueSizeOption {
    /// Option name used in errors and logs.
    pub const NAME: &'static str = "frame_queue_size";

    /// Bind the option to an archive's capacity cell.
    #[must_use]
    pub fn new(cell: Arc<CapacityCell>) -> Self {
        Self {
            cell,
            range: FRAME_QUEUE_SIZE_RANGE,
        }
    }
}

impl CaptureOption for FrameQueueSizeOption {
    fn range(&self) -> OptionRange {
        self.range
    }

    fn set(&self, value: f32) -> SourceResult<()> {
        if !self.is_valid(value) {
            return Err(SourceError::InvalidValue {
                option: Self::NAME,
                value,
                min: self.range.min,
                max: self.range.max,
                step: self.range.step,
            });
        }

        let capacity = value.round() as u32;
        self.cell.set(capacity);
        debug!(capacity, "Frame queue size updated");
        Ok(())
    }

    fn query(&self) -> f32 {
        self.cell.get() as f32
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn describe(&self) -> &'static str {
        "Max number of frames you can hold at a given time. Increasing this number will \
         reduce frame drops but increase latency, and vice versa"
    }
}
