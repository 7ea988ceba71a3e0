//! Bounded, reference-counted frame archives for sensor streaming.
//!
//! One [`FrameArchive`] exists per frame kind. It hands out [`FrameHandle`]s,
//! tracks how many frames are live, and recycles released buffers so that a
//! steady capture stream stops allocating once warmed up.
//!
//! # Frame Lifecycle
//!
//! ```text
//! allocate() ──> checked out ──(last handle dropped)──> parked ──> recycled by allocate()
//!                     │                                   │
//!                     └── retain() adds handles           └── reclaimed if over capacity,
//!                                                             flushing, or reset
//! ```
//!
//! - **Checked out**: at least one [`FrameHandle`] refers to the frame. The
//!   reference count is the number of handles; a unique handle may write the
//!   payload, shared handles are read-only.
//! - **Parked**: no handle remains and the archive's own queue is the only
//!   owner. Parked frames still count as live and are the first candidates
//!   for reuse, oldest first.
//! - **Reclaimed**: storage dropped and the live count decremented.
//!
//! # Backpressure
//!
//! When an allocation finds no parked frame and the live count has reached
//! the capacity, it still proceeds and reports the event through
//! [`ArchiveStats::over_capacity`] and a `warn!`.
//! Lowering the capacity never evicts checked-out frames; the excess drains
//! as those frames are released.
//!
//! # Teardown
//!
//! Every user callback runs under a [`CallbackToken`] taken from the archive
//! that owns the frame. [`FrameArchive::reset`] waits for the token count to
//! reach zero before discarding bookkeeping, and frames still held by users
//! stay valid because their storage is shared with the handles.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frame_pool::{CapacityCell, FrameAdditionalData, FrameArchive, FrameKind};
//!
//! let archive = FrameArchive::new(FrameKind::Video, Arc::new(CapacityCell::new(4)), None);
//!
//! let mut frame = archive.allocate(1024, FrameAdditionalData::default(), true);
//! if let Some(data) = frame.data_mut() {
//!     data[0] = 42;
//! }
//! assert_eq!(archive.stats().live, 1);
//!
//! // Releasing the last handle parks the frame for reuse.
//! drop(frame);
//! assert_eq!(archive.stats().parked, 1);
//! ```

pub mod capacity;
pub mod frame;

pub use capacity::CapacityCell;
pub use frame::{Frame, FrameAdditionalData, FrameKind, MetadataParser, MetadataParserMap, Sensor};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time view of an archive's bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Admission limit at the time of the snapshot.
    pub capacity: u32,
    /// Data-bearing frames not yet reclaimed (checked out + parked).
    pub live: usize,
    /// Data-bearing frames currently referenced by at least one handle.
    pub outstanding: usize,
    /// Frames held only by the archive, ready for reuse.
    pub parked: usize,
    /// Fresh buffers allocated.
    pub allocated: u64,
    /// Allocations served by reusing a parked frame.
    pub recycled: u64,
    /// Allocations admitted while the live count was at or above capacity.
    pub over_capacity: u64,
    /// User callbacks currently running against this archive's frames.
    pub active_callbacks: usize,
}

// ============================================================================
// Frame Archive
// ============================================================================

/// Per-kind store of frames with reference counting and backpressure.
///
/// Always used behind an `Arc`; handles and callback tokens keep the archive
/// alive for as long as they exist.
pub struct FrameArchive {
    kind: FrameKind,
    capacity: Arc<CapacityCell>,
    /// Released frames in release order. Lock-free; oldest popped first.
    parked: SegQueue<Frame>,
    live: AtomicUsize,
    outstanding: AtomicUsize,
    active_callbacks: AtomicUsize,
    allocated: AtomicU64,
    recycled: AtomicU64,
    over_capacity: AtomicU64,
    /// Set while `flush()` runs: releases reclaim instead of parking.
    draining: AtomicBool,
    /// Set by `reset()`: the archive no longer parks anything.
    closed: AtomicBool,
    sensor: RwLock<Option<Weak<dyn Sensor>>>,
    parsers: Option<Arc<MetadataParserMap>>,
    /// Paired with `idle` so counter decrements never miss a waiter.
    idle_lock: Mutex<()>,
    idle: Condvar,
}

impl FrameArchive {
    /// Create an archive for `kind` admitting against `capacity`.
    ///
    /// `parsers` is the metadata parser registry handed to every frame this
    /// archive produces; the archive never inspects it.
    #[must_use]
    pub fn new(
        kind: FrameKind,
        capacity: Arc<CapacityCell>,
        parsers: Option<Arc<MetadataParserMap>>,
    ) -> Arc<Self> {
        info!(
            kind = kind.as_str(),
            capacity = capacity.get(),
            parsers = parsers.as_ref().map_or(0, |p| p.len()),
            "Creating frame archive"
        );

        Arc::new(Self {
            kind,
            capacity,
            parked: SegQueue::new(),
            live: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            active_callbacks: AtomicUsize::new(0),
            allocated: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
            over_capacity: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sensor: RwLock::new(None),
            parsers,
            idle_lock: Mutex::new(()),
            idle: Condvar::new(),
        })
    }

    /// Frame kind this archive serves.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Shared admission capacity cell.
    #[must_use]
    pub fn capacity(&self) -> &Arc<CapacityCell> {
        &self.capacity
    }

    /// Allocate a frame and return the only handle to it.
    ///
    /// Metadata-only frames (`requires_memory == false`) carry no buffer and
    /// bypass admission entirely. Data-bearing frames reuse the oldest parked
    /// frame when one exists; otherwise a fresh buffer is allocated, even
    /// when the live count has already reached capacity.
    pub fn allocate(
        self: &Arc<Self>,
        size: usize,
        additional: FrameAdditionalData,
        requires_memory: bool,
    ) -> FrameHandle {
        if self.closed.load(Ordering::Acquire) {
            warn!(kind = self.kind.as_str(), "Allocating from an archive that was reset");
        }

        if !requires_memory {
            let mut frame = Frame::new(self.kind, 0, additional, false);
            self.attach_context(&mut frame);
            return FrameHandle::wrap(Arc::clone(self), frame);
        }

        let mut frame = match self.parked.pop() {
            Some(mut frame) => {
                frame.reuse(size, additional);
                self.recycled.fetch_add(1, Ordering::Relaxed);
                frame
            }
            None => {
                let live = self.live.fetch_add(1, Ordering::AcqRel);
                let capacity = self.capacity.get();
                if live >= capacity as usize {
                    self.over_capacity.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        kind = self.kind.as_str(),
                        live = live + 1,
                        capacity,
                        "Frame archive over capacity! Frames are held longer than \
                         they are produced; admitting anyway."
                    );
                }
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Frame::new(self.kind, size, additional, true)
            }
        };

        self.attach_context(&mut frame);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        FrameHandle::wrap(Arc::clone(self), frame)
    }

    /// Mark a user callback as running against this archive's frames.
    ///
    /// The returned guard must live for the whole callback invocation; its
    /// drop (including during unwinding) ends the accounting.
    pub fn begin_callback(self: &Arc<Self>) -> CallbackToken {
        self.active_callbacks.fetch_add(1, Ordering::AcqRel);
        CallbackToken {
            archive: Arc::clone(self),
        }
    }

    /// Replace the sensor back-reference given to new frames.
    pub fn set_sensor(&self, sensor: Weak<dyn Sensor>) {
        *self.sensor.write() = Some(sensor);
    }

    /// Wait up to `timeout` for every checked-out frame to be released, then
    /// reclaim all parked frames.
    ///
    /// Allocation is not stopped. Returns `true` if no frame was still
    /// checked out when the wait ended; frames that are still out are left
    /// untouched and reclaimed whenever their holders release them.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.draining.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;

        let drained = {
            let mut guard = self.idle_lock.lock();
            loop {
                if self.outstanding.load(Ordering::Acquire) == 0 {
                    break true;
                }
                if self.idle.wait_until(&mut guard, deadline).timed_out() {
                    break self.outstanding.load(Ordering::Acquire) == 0;
                }
            }
        };

        let reclaimed = self.reclaim_parked();
        self.draining.store(false, Ordering::Release);

        debug!(
            kind = self.kind.as_str(),
            reclaimed,
            outstanding = self.outstanding.load(Ordering::Acquire),
            drained,
            "Frame archive flushed"
        );
        drained
    }

    /// Wait for all running callbacks to finish, then drop parked storage and
    /// clear the bookkeeping.
    ///
    /// Frames still held by users are not touched; they are reclaimed when
    /// released. Must not be called from inside a user callback holding a
    /// token of this archive.
    pub fn reset(&self) {
        self.closed.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);

        {
            let mut guard = self.idle_lock.lock();
            while self.active_callbacks.load(Ordering::Acquire) > 0 {
                self.idle.wait(&mut guard);
            }
        }

        let reclaimed = self.reclaim_parked();
        self.allocated.store(0, Ordering::Relaxed);
        self.recycled.store(0, Ordering::Relaxed);
        self.over_capacity.store(0, Ordering::Relaxed);
        *self.sensor.write() = None;

        info!(
            kind = self.kind.as_str(),
            reclaimed,
            still_held = self.outstanding.load(Ordering::Acquire),
            "Frame archive reset"
        );
    }

    /// Snapshot of the current bookkeeping.
    #[must_use]
    pub fn stats(&self) -> ArchiveStats {
        ArchiveStats {
            capacity: self.capacity.get(),
            live: self.live.load(Ordering::Acquire),
            outstanding: self.outstanding.load(Ordering::Acquire),
            parked: self.parked.len(),
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            over_capacity: self.over_capacity.load(Ordering::Relaxed),
            active_callbacks: self.active_callbacks.load(Ordering::Acquire),
        }
    }

    fn attach_context(&self, frame: &mut Frame) {
        frame.sensor = self.sensor.read().clone();
        frame.parsers = self.parsers.clone();
    }

    /// Take back a data-bearing frame whose last handle was dropped.
    fn release(&self, frame: Frame) {
        let reclaim = if self.closed.load(Ordering::Acquire) || self.draining.load(Ordering::Acquire)
        {
            self.live.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            let capacity = self.capacity.get() as usize;
            self.live
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                    (live > capacity).then(|| live - 1)
                })
                .is_ok()
        };

        if reclaim {
            trace!(
                kind = self.kind.as_str(),
                frame_number = frame.frame_number(),
                "Reclaiming released frame"
            );
            drop(frame);
        } else {
            self.parked.push(frame);
            // A reset that closed the archive after the check above may
            // already have drained the queue.
            fence(Ordering::SeqCst);
            if self.closed.load(Ordering::SeqCst) {
                self.reclaim_parked();
            }
        }

        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify_idle();
        }
    }

    fn reclaim_parked(&self) -> usize {
        let mut reclaimed = 0;
        while let Some(frame) = self.parked.pop() {
            drop(frame);
            self.live.fetch_sub(1, Ordering::AcqRel);
            reclaimed += 1;
        }
        reclaimed
    }

    fn end_callback(&self) {
        if self.active_callbacks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify_idle();
        }
    }

    fn notify_idle(&self) {
        let _guard = self.idle_lock.lock();
        self.idle.notify_all();
    }
}

impl fmt::Debug for FrameArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameArchive")
            .field("kind", &self.kind)
            .field("stats", &self.stats())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Callback Token
// ============================================================================

/// RAII marker for a user callback running against an archive's frames.
///
/// Created by [`FrameArchive::begin_callback`]. While any token exists,
/// [`FrameArchive::reset`] blocks.
#[must_use = "the callback is only accounted for while the token is alive"]
pub struct CallbackToken {
    archive: Arc<FrameArchive>,
}

impl CallbackToken {
    /// Archive this token is accounted against.
    #[must_use]
    pub fn archive(&self) -> &Arc<FrameArchive> {
        &self.archive
    }
}

impl Drop for CallbackToken {
    fn drop(&mut self) {
        self.archive.end_callback();
    }
}

impl fmt::Debug for CallbackToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackToken")
            .field("kind", &self.archive.kind)
            .finish()
    }
}

// ============================================================================
// Frame Handle
// ============================================================================

/// Shared storage behind every handle to one frame.
struct FrameRef {
    frame: Option<Frame>,
    archive: Arc<FrameArchive>,
}

impl Drop for FrameRef {
    fn drop(&mut self) {
        if let Some(frame) = self.frame.take() {
            if frame.requires_memory() {
                self.archive.release(frame);
            }
        }
    }
}

/// Move-only, possibly empty reference to a pooled frame.
///
/// Handles are not `Clone`: a second reference is taken explicitly with
/// [`retain`](Self::retain). Dropping a handle releases it, and the archive
/// takes the frame back once the last handle is gone.
///
/// Ownership transfer uses [`take`](Self::take) or
/// [`swap_with`](Self::swap_with), which leave the source empty so it cannot
/// deliver or release the frame a second time.
#[derive(Default)]
pub struct FrameHandle {
    inner: Option<Arc<FrameRef>>,
}

impl FrameHandle {
    fn wrap(archive: Arc<FrameArchive>, frame: Frame) -> Self {
        Self {
            inner: Some(Arc::new(FrameRef {
                frame: Some(frame),
                archive,
            })),
        }
    }

    /// A handle referring to nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this handle refers to no frame.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// The referenced frame.
    #[must_use]
    pub fn frame(&self) -> Option<&Frame> {
        self.inner.as_ref().and_then(|r| r.frame.as_ref())
    }

    /// Kind of the referenced frame.
    #[must_use]
    pub fn kind(&self) -> Option<FrameKind> {
        self.frame().map(Frame::kind)
    }

    /// Archive that owns the referenced frame.
    #[must_use]
    pub fn owner(&self) -> Option<&Arc<FrameArchive>> {
        self.inner.as_ref().map(|r| &r.archive)
    }

    /// Number of live handles to the referenced frame, 0 if empty.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Mutable payload access, only while this is the sole handle.
    #[must_use]
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.unique_frame().map(|f| f.data.as_mut_slice())
    }

    /// Mutable metadata access, only while this is the sole handle.
    #[must_use]
    pub fn additional_mut(&mut self) -> Option<&mut FrameAdditionalData> {
        self.unique_frame().map(Frame::additional_mut)
    }

    /// Take a second handle to the same frame.
    #[must_use]
    pub fn retain(&self) -> FrameHandle {
        Self {
            inner: self.inner.clone(),
        }
    }

    /// Give up this handle's reference.
    pub fn release(self) {
        drop(self);
    }

    /// Move the reference out, leaving this handle empty.
    #[must_use]
    pub fn take(&mut self) -> FrameHandle {
        std::mem::take(self)
    }

    /// Exchange the frames two handles refer to.
    pub fn swap_with(&mut self, other: &mut FrameHandle) {
        std::mem::swap(&mut self.inner, &mut other.inner);
    }

    fn unique_frame(&mut self) -> Option<&mut Frame> {
        self.inner
            .as_mut()
            .and_then(Arc::get_mut)
            .and_then(|r| r.frame.as_mut())
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.frame() {
            Some(frame) => f
                .debug_struct("FrameHandle")
                .field("frame", frame)
                .field("ref_count", &self.ref_count())
                .finish(),
            None => f.write_str("FrameHandle(empty)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    fn archive(capacity: u32) -> Arc<FrameArchive> {
        FrameArchive::new(FrameKind::Video, Arc::new(CapacityCell::new(capacity)), None)
    }

    fn numbered(frame_number: u64) -> FrameAdditionalData {
        FrameAdditionalData {
            frame_number,
            ..Default::default()
        }
    }

    #[test]
    fn test_allocate_and_release_parks_frame() {
        let archive = archive(4);

        let frame = archive.allocate(1024, numbered(1), true);
        assert_eq!(frame.ref_count(), 1);
        assert_eq!(frame.frame().map(|f| f.data().len()), Some(1024));

        let stats = archive.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.allocated, 1);

        drop(frame);
        let stats = archive.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.parked, 1);
    }

    #[test]
    fn test_parked_frames_recycled_oldest_first() {
        let archive = archive(4);

        let first = archive.allocate(64, numbered(1), true);
        let second = archive.allocate(64, numbered(2), true);
        let first_ptr = first.frame().map(|f| f.data().as_ptr());
        drop(first);
        drop(second);

        let mut reused = archive.allocate(32, numbered(3), true);
        assert_eq!(reused.frame().map(|f| f.data().as_ptr()), first_ptr);
        assert_eq!(reused.frame().map(Frame::frame_number), Some(3));
        assert_eq!(reused.data_mut().map(|d| d.len()), Some(32));

        let stats = archive.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.live, 2);
    }

    #[test]
    fn test_at_capacity_recycles_parked_instead_of_overrunning() {
        let archive = archive(2);

        let x = archive.allocate(64, numbered(1), true);
        let y = archive.allocate(64, numbered(2), true);
        drop(x);
        assert_eq!(archive.stats().live, 2);
        assert_eq!(archive.stats().parked, 1);

        let z = archive.allocate(64, numbered(3), true);
        let stats = archive.stats();
        assert_eq!(stats.recycled, 1);
        assert_eq!(stats.over_capacity, 0);
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.live, 2);
        assert_eq!(stats.parked, 0);

        // Nothing parked any more: the next admission overruns.
        let w = archive.allocate(64, numbered(4), true);
        let stats = archive.stats();
        assert_eq!(stats.over_capacity, 1);
        assert_eq!(stats.allocated, 3);
        assert_eq!(stats.live, 3);

        drop((y, z, w));
        assert_eq!(archive.stats().live, 2, "excess drained on release");
    }

    #[test]
    fn test_over_capacity_still_admits_and_counts() {
        let archive = archive(2);

        let held: Vec<_> = (0..3).map(|i| archive.allocate(16, numbered(i), true)).collect();
        assert!(held.iter().all(|h| !h.is_empty()));

        let stats = archive.stats();
        assert_eq!(stats.live, 3);
        assert_eq!(stats.over_capacity, 1);
    }

    #[test]
    fn test_zero_capacity_reclaims_on_release() {
        let archive = archive(0);

        let frame = archive.allocate(16, numbered(0), true);
        assert_eq!(archive.stats().over_capacity, 1);

        drop(frame);
        let stats = archive.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.parked, 0);
    }

    #[test]
    fn test_lowered_capacity_drains_on_release_only() {
        let archive = archive(4);
        let mut held: Vec<_> = (0..4).map(|i| archive.allocate(16, numbered(i), true)).collect();

        archive.capacity().set(1);
        assert_eq!(archive.stats().live, 4);
        assert!(held.iter().all(|h| h.frame().is_some()));

        held.pop();
        assert_eq!(archive.stats().live, 3);

        held.clear();
        let stats = archive.stats();
        assert_eq!(stats.live, 1);
        assert_eq!(stats.parked, 1);
    }

    #[test]
    fn test_metadata_only_frames_bypass_admission() {
        let archive = archive(0);

        let frame = archive.allocate(4096, numbered(5), false);
        assert!(frame.frame().is_some_and(|f| f.data().is_empty()));
        assert_eq!(archive.stats().live, 0);
        assert_eq!(archive.stats().over_capacity, 0);

        drop(frame);
        assert_eq!(archive.stats().parked, 0);
    }

    #[test]
    fn test_retain_shares_and_blocks_mutation() {
        let archive = archive(4);
        let mut frame = archive.allocate(8, numbered(1), true);
        frame.data_mut().expect("unique handle")[0] = 7;

        let mut second = frame.retain();
        assert_eq!(frame.ref_count(), 2);
        assert!(frame.data_mut().is_none());
        assert!(second.additional_mut().is_none());
        assert_eq!(second.frame().map(|f| f.data()[0]), Some(7));

        second.release();
        assert_eq!(frame.ref_count(), 1);
        assert!(frame.data_mut().is_some());
        assert_eq!(archive.stats().outstanding, 1);
    }

    #[test]
    fn test_take_and_swap_transfer_ownership() {
        let archive = archive(4);
        let mut source = archive.allocate(8, numbered(1), true);

        let mut target = FrameHandle::empty();
        target.swap_with(&mut source);
        assert!(source.is_empty());
        assert_eq!(target.kind(), Some(FrameKind::Video));

        let moved = target.take();
        assert!(target.is_empty());
        assert_eq!(moved.ref_count(), 1);
        assert_eq!(archive.stats().outstanding, 1);

        drop(source);
        drop(target);
        assert_eq!(archive.stats().outstanding, 1);
        drop(moved);
        assert_eq!(archive.stats().outstanding, 0);
    }

    #[test]
    fn test_callback_token_released_on_unwind() {
        let archive = archive(4);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let token = archive.begin_callback();
            assert!(Arc::ptr_eq(token.archive(), &archive));
            assert_eq!(token.archive().kind(), FrameKind::Video);
            assert_eq!(archive.stats().active_callbacks, 1);
            panic!("callback failure");
        }));

        assert!(result.is_err());
        assert_eq!(archive.stats().active_callbacks, 0);
    }

    #[test]
    fn test_release_racing_reset_leaves_nothing_parked() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 64;

        for _ in 0..20 {
            let archive = archive(PER_THREAD as u32 * THREADS as u32);
            let barrier = Arc::new(std::sync::Barrier::new(THREADS + 1));

            let releasers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let held: Vec<_> = (0..PER_THREAD)
                        .map(|i| archive.allocate(16, numbered(t as u64 * PER_THREAD + i), true))
                        .collect();
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        for frame in held {
                            drop(frame);
                        }
                    })
                })
                .collect();

            barrier.wait();
            archive.reset();
            for releaser in releasers {
                releaser.join().expect("releaser panicked");
            }

            let stats = archive.stats();
            assert_eq!(stats.outstanding, 0, "{stats:?}");
            assert_eq!(stats.parked, 0, "{stats:?}");
            assert_eq!(stats.live, 0, "{stats:?}");
        }
    }

    #[test]
    fn test_reset_waits_for_active_callback() {
        let archive = archive(4);
        let frame = archive.allocate(8, numbered(1), true);
        let token = archive.begin_callback();

        let (done_tx, done_rx) = mpsc::channel();
        let resetter = {
            let archive = Arc::clone(&archive);
            thread::spawn(move || {
                archive.reset();
                done_tx.send(()).ok();
            })
        };

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(frame.frame().is_some());

        drop(token);
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reset should finish once the token is released");
        resetter.join().expect("reset thread panicked");

        // The held frame survives reset and is reclaimed on release.
        assert_eq!(frame.frame().map(Frame::frame_number), Some(1));
        drop(frame);
        let stats = archive.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.parked, 0);
    }

    #[test]
    fn test_flush_waits_for_outstanding_frames() {
        let archive = archive(4);
        drop(archive.allocate(8, numbered(1), true));
        let held = archive.allocate(8, numbered(2), true);

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        assert!(archive.flush(Duration::from_secs(5)));
        releaser.join().expect("releaser panicked");

        let stats = archive.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.parked, 0);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn test_flush_times_out_without_discarding_held_frame() {
        let archive = archive(4);
        let held = archive.allocate(8, numbered(1), true);

        assert!(!archive.flush(Duration::from_millis(20)));
        assert_eq!(held.frame().map(Frame::frame_number), Some(1));
        assert_eq!(archive.stats().live, 1);

        drop(held);
        assert_eq!(archive.stats().parked, 1);
    }

    #[test]
    fn test_sensor_attached_to_new_frames() {
        struct Cam;
        impl Sensor for Cam {
            fn name(&self) -> &str {
                "cam"
            }
        }

        let archive = archive(4);
        let sensor: Arc<dyn Sensor> = Arc::new(Cam);
        archive.set_sensor(Arc::downgrade(&sensor));

        let frame = archive.allocate(8, numbered(1), true);
        let name = frame.frame().and_then(Frame::sensor).map(|s| s.name().to_string());
        assert_eq!(name.as_deref(), Some("cam"));
    }
}
