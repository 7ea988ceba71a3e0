//! Frame source: per-kind archives plus a single replaceable callback target.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──init()──> Ready ⇄ delivering callbacks ──reset()──> Uninitialized
//! ```
//!
//! # Locking
//!
//! - The callback slot mutex protects only the target pointer. It is held
//!   to swap or read the target, never while user code runs.
//! - The archive map sits behind a `RwLock`; `alloc` takes a read lock just
//!   long enough to clone the archive `Arc`.
//! - Lock order is always callback slot, then archive map.
//! - Teardown safety comes from each archive's callback tokens, not from
//!   either lock: `reset` waits for running callbacks after both locks are
//!   released.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use frame_pool::{
    ArchiveStats, CallbackToken, CapacityCell, FrameAdditionalData, FrameArchive, FrameHandle,
    FrameKind, MetadataParserMap, Sensor,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, trace, warn};

use crate::config::SourceConfig;
use crate::error::{SourceError, SourceResult};
use crate::option::{CaptureOption, FrameQueueSizeOption};
use crate::time::{MonotonicClock, TimeService};

/// Frame kinds backed by an archive, in flush/reset order.
pub const SUPPORTED_KINDS: [FrameKind; 2] = [FrameKind::Video, FrameKind::Composite];

// =============================================================================
// Per-kind storage
// =============================================================================

/// One value per supported frame kind.
#[derive(Debug, Clone, Default)]
pub struct PerKind<T> {
    /// Value for [`FrameKind::Video`].
    pub video: T,
    /// Value for [`FrameKind::Composite`].
    pub composite: T,
}

impl<T> PerKind<T> {
    /// Build a value for every supported kind.
    pub fn from_fn(mut f: impl FnMut(FrameKind) -> T) -> Self {
        Self {
            video: f(FrameKind::Video),
            composite: f(FrameKind::Composite),
        }
    }

    /// Value for `kind`, or `None` if the kind is not supported.
    #[must_use]
    pub fn get(&self, kind: FrameKind) -> Option<&T> {
        match kind {
            FrameKind::Video => Some(&self.video),
            FrameKind::Composite => Some(&self.composite),
            FrameKind::Motion | FrameKind::Pose | FrameKind::Points => None,
        }
    }

    /// Iterate in [`SUPPORTED_KINDS`] order.
    pub fn iter(&self) -> impl Iterator<Item = (FrameKind, &T)> {
        [
            (FrameKind::Video, &self.video),
            (FrameKind::Composite, &self.composite),
        ]
        .into_iter()
    }
}

// =============================================================================
// Callback target
// =============================================================================

/// Receiver of published frames.
///
/// The callback owns the frame it is given and must eventually drop it or
/// hand it on; a frame that is never released stays live in its archive.
/// Returning `Err` or panicking is contained by the source and never reaches
/// the capture path.
pub trait FrameCallback: Send + Sync {
    /// Consume one frame.
    fn on_frame(&self, frame: FrameHandle) -> anyhow::Result<()>;
}

impl<F> FrameCallback for F
where
    F: Fn(FrameHandle) -> anyhow::Result<()> + Send + Sync,
{
    fn on_frame(&self, frame: FrameHandle) -> anyhow::Result<()> {
        self(frame)
    }
}

/// Shared pointer to a callback target.
pub type FrameCallbackPtr = Arc<dyn FrameCallback>;

/// What `invoke_callback` did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The handle was empty; nothing happened.
    Empty,
    /// No target was set; the frame was released.
    NoTarget,
    /// The target consumed the frame.
    Delivered,
    /// The target failed; the fault was logged and suppressed.
    Faulted,
}

/// Counters for frames passed to `invoke_callback`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Frames consumed by a target without fault.
    pub delivered: u64,
    /// Frames released because no target was set.
    pub without_target: u64,
    /// Callback faults caught and suppressed.
    pub callback_faults: u64,
}

/// Lifecycle state of a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// No archives; `alloc` fails with a sequencing error.
    Uninitialized,
    /// Archives exist and frames can be allocated and delivered.
    Ready,
}

// =============================================================================
// Frame source
// =============================================================================

/// Orchestrates frame allocation and delivery for one sensor.
pub struct FrameSource {
    callback: Mutex<Option<FrameCallbackPtr>>,
    archives: RwLock<Option<PerKind<Arc<FrameArchive>>>>,
    /// Admission capacity shared by every archive. Outlives init/reset so
    /// options bound before `init` keep working.
    capacity: Arc<CapacityCell>,
    sensor: RwLock<Option<Weak<dyn Sensor>>>,
    flush_timeout: Duration,
    clock: Arc<dyn TimeService>,
    delivered: AtomicU64,
    without_target: AtomicU64,
    callback_faults: AtomicU64,
}

impl FrameSource {
    /// Create an uninitialized source using a monotonic clock.
    #[must_use]
    pub fn new(config: &SourceConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Create an uninitialized source stamping callbacks with `clock`.
    #[must_use]
    pub fn with_clock(config: &SourceConfig, clock: Arc<dyn TimeService>) -> Self {
        let capacity = config.archive.capacity;
        Self {
            callback: Mutex::new(None),
            archives: RwLock::new(None),
            capacity: Arc::new(CapacityCell::new(capacity)),
            sensor: RwLock::new(None),
            flush_timeout: config.flush_timeout(),
            clock,
            delivered: AtomicU64::new(0),
            without_target: AtomicU64::new(0),
            callback_faults: AtomicU64::new(0),
        }
    }

    /// Create one archive per supported kind and become ready.
    ///
    /// `parsers` is threaded through to every frame for metadata decoding.
    ///
    /// # Errors
    ///
    /// [`SourceError::Sequencing`] if the source is already initialized.
    pub fn init(&self, parsers: Arc<MetadataParserMap>) -> SourceResult<()> {
        let _slot = self.callback.lock();
        let mut archives = self.archives.write();
        if archives.is_some() {
            return Err(SourceError::Sequencing(
                "init() called on an initialized frame source; reset() first".to_string(),
            ));
        }

        let sensor = self.sensor.read().clone();
        let created = PerKind::from_fn(|kind| {
            let archive = FrameArchive::new(
                kind,
                Arc::clone(&self.capacity),
                Some(Arc::clone(&parsers)),
            );
            if let Some(sensor) = &sensor {
                archive.set_sensor(sensor.clone());
            }
            archive
        });
        *archives = Some(created);

        info!(kinds = ?SUPPORTED_KINDS, "Frame source initialized");
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SourceState {
        if self.archives.read().is_some() {
            SourceState::Ready
        } else {
            SourceState::Uninitialized
        }
    }

    /// Allocate a frame of `kind` from its archive.
    ///
    /// Does not touch the callback slot, so it never contends with
    /// `set_callback` or `invoke_callback`.
    ///
    /// # Errors
    ///
    /// - [`SourceError::Sequencing`] before `init` or after `reset`.
    /// - [`SourceError::UnsupportedFrameKind`] for kinds without an archive.
    pub fn alloc(
        &self,
        kind: FrameKind,
        size: usize,
        additional: FrameAdditionalData,
        requires_memory: bool,
    ) -> SourceResult<FrameHandle> {
        let archive = self.archive(kind)?;
        Ok(archive.allocate(size, additional, requires_memory))
    }

    /// Replace the callback target. `None` disables delivery.
    ///
    /// The previous target is dropped after the swap, outside the lock.
    pub fn set_callback(&self, callback: Option<FrameCallbackPtr>) {
        let previous = {
            let mut slot = self.callback.lock();
            std::mem::replace(&mut *slot, callback)
        };
        debug!(
            had_previous = previous.is_some(),
            "Frame callback replaced"
        );
        drop(previous);
    }

    /// Mark a callback as running against the archive for `kind`.
    ///
    /// Hold the returned token for the whole duration of the user callback.
    ///
    /// # Errors
    ///
    /// Same as [`alloc`](Self::alloc).
    pub fn begin_callback(&self, kind: FrameKind) -> SourceResult<CallbackToken> {
        Ok(self.archive(kind)?.begin_callback())
    }

    /// Hand `frame` to the current callback target.
    ///
    /// The callback token comes from the archive that owns the frame. The
    /// target is read under the slot lock and invoked outside it, and the
    /// frame is moved out of `frame` before the call so the source cannot
    /// deliver or release it twice. Faults escaping the target are logged,
    /// counted, and suppressed.
    pub fn invoke_callback(&self, mut frame: FrameHandle) -> Delivery {
        let Some(owner) = frame.owner().map(Arc::clone) else {
            return Delivery::Empty;
        };
        let _token = owner.begin_callback();

        let (kind, frame_number) = match frame.frame() {
            Some(f) => {
                f.log_callback_start(self.clock.now_ms());
                (f.kind(), f.frame_number())
            }
            None => return Delivery::Empty,
        };

        let target = self.callback.lock().clone();
        let Some(target) = target else {
            self.without_target.fetch_add(1, Ordering::Relaxed);
            trace!(kind = kind.as_str(), frame_number, "No callback set; releasing frame");
            drop(frame);
            return Delivery::NoTarget;
        };

        let owned = frame.take();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| target.on_frame(owned)));

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(SourceError::CallbackFault(format!("{err:#}"))),
            Err(payload) => Some(SourceError::CallbackFault(panic_message(payload.as_ref()))),
        };

        match fault {
            None => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                Delivery::Delivered
            }
            Some(err) => {
                self.callback_faults.fetch_add(1, Ordering::Relaxed);
                error!(kind = kind.as_str(), frame_number, error = %err, "User callback fault suppressed");
                Delivery::Faulted
            }
        }
    }

    /// Flush every archive in [`SUPPORTED_KINDS`] order.
    ///
    /// Best-effort: an archive that still has frames out after the configured
    /// timeout is logged and skipped.
    pub fn flush(&self) {
        let Some(archives) = self.archives.read().clone() else {
            debug!("flush() on an uninitialized frame source");
            return;
        };

        for (_, archive) in archives.iter() {
            if !archive.flush(self.flush_timeout) {
                warn!(
                    kind = archive.kind().as_str(),
                    outstanding = archive.stats().outstanding,
                    timeout_ms = self.flush_timeout.as_millis(),
                    "Flush timed out with frames still held by users"
                );
            }
        }
    }

    /// Clear the callback target and tear down every archive.
    ///
    /// Blocks until callbacks already running against the archives return.
    /// Frames those callbacks hold stay valid. Must not be called from inside
    /// a frame callback.
    pub fn reset(&self) {
        let (previous, archives) = {
            let mut slot = self.callback.lock();
            let previous = slot.take();
            let archives = self.archives.write().take();
            (previous, archives)
        };
        drop(previous);

        let Some(archives) = archives else {
            debug!("reset() on an uninitialized frame source");
            return;
        };

        for (_, archive) in archives.iter() {
            archive.reset();
        }
        info!("Frame source reset");
    }

    /// Record the owning sensor on every archive, now and after future inits.
    pub fn set_sensor(&self, sensor: Weak<dyn Sensor>) {
        *self.sensor.write() = Some(sensor.clone());
        if let Some(archives) = self.archives.read().as_ref() {
            for (_, archive) in archives.iter() {
                archive.set_sensor(sensor.clone());
            }
        }
    }

    /// Option controlling the admission capacity of every archive.
    ///
    /// All archives read the same cell, so one `set` applies to each kind's
    /// next admission check.
    #[must_use]
    pub fn get_published_size_option(&self) -> Arc<dyn CaptureOption> {
        Arc::new(FrameQueueSizeOption::new(Arc::clone(&self.capacity)))
    }

    /// Bookkeeping of the archive for `kind`, if initialized and supported.
    #[must_use]
    pub fn stats(&self, kind: FrameKind) -> Option<ArchiveStats> {
        self.archives
            .read()
            .as_ref()
            .and_then(|archives| archives.get(kind))
            .map(|archive| archive.stats())
    }

    /// Delivery counters since construction.
    #[must_use]
    pub fn delivery_stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            without_target: self.without_target.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
        }
    }

    fn archive(&self, kind: FrameKind) -> SourceResult<Arc<FrameArchive>> {
        let archives = self.archives.read();
        let archives = archives.as_ref().ok_or_else(|| {
            SourceError::Sequencing(format!("{kind} frame requested before init()"))
        })?;
        archives
            .get(kind)
            .map(Arc::clone)
            .ok_or(SourceError::UnsupportedFrameKind(kind))
    }
}

impl std::fmt::Debug for FrameSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSource")
            .field("state", &self.state())
            .field("has_callback", &self.callback.lock().is_some())
            .field("delivery", &self.delivery_stats())
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "callback panicked with a non-string payload".to_string()
    }
}
