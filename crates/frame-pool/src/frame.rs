//! Frame data model shared by archives, handles and the orchestrator.
//!
//! A [`Frame`] is one captured buffer plus the metadata the producer attached
//! to it. Frames are filled through a unique [`FrameHandle`](crate::FrameHandle)
//! and are read-only once a second handle exists.
//!
//! The two collaborator traits defined here, [`Sensor`] and [`MetadataParser`],
//! are black boxes from the archive's point of view: the archive only threads
//! them through to the frames it hands out.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Sentinel stored in `callback_started` until a delivery is logged.
const CALLBACK_NOT_STARTED: u64 = u64::MAX;

/// Closed set of capture payload categories.
///
/// Only some kinds are backed by an archive in a given frame source; the
/// rest exist so that requests for them can be rejected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FrameKind {
    /// A single video image.
    Video,
    /// A bundle of several sub-frames delivered together.
    Composite,
    /// IMU / motion sample.
    Motion,
    /// 6-DoF pose sample.
    Pose,
    /// Point cloud.
    Points,
}

impl FrameKind {
    /// Every kind, in declaration order.
    pub const ALL: [FrameKind; 5] = [
        FrameKind::Video,
        FrameKind::Composite,
        FrameKind::Motion,
        FrameKind::Pose,
        FrameKind::Points,
    ];

    /// Stable lowercase name used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::Video => "video",
            FrameKind::Composite => "composite",
            FrameKind::Motion => "motion",
            FrameKind::Pose => "pose",
            FrameKind::Points => "points",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The device a frame was captured from.
///
/// Archives only keep a weak reference, so a sensor that has been torn down
/// simply stops resolving.
pub trait Sensor: Send + Sync {
    /// Human-readable sensor name.
    fn name(&self) -> &str;
}

/// Decodes one vendor metadata attribute from a frame.
pub trait MetadataParser: Send + Sync {
    /// Returns the decoded value, or `None` if the frame does not carry it.
    fn parse(&self, frame: &Frame) -> Option<i64>;
}

/// Keyed registry of metadata parsers, supplied at source init.
pub type MetadataParserMap = HashMap<String, Arc<dyn MetadataParser>>;

/// Metadata the producer attaches to a frame at allocation time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameAdditionalData {
    /// Device timestamp in milliseconds.
    pub timestamp_ms: f64,
    /// Sequence number assigned by the capture path.
    pub frame_number: u64,
    /// Host arrival time in milliseconds.
    pub system_time_ms: f64,
    /// Raw vendor metadata blob, decoded lazily by [`MetadataParser`]s.
    pub raw_metadata: Vec<u8>,
    /// Attributes the producer already decoded.
    pub parsed: BTreeMap<String, i64>,
}

/// One captured buffer and its metadata.
pub struct Frame {
    kind: FrameKind,
    additional: FrameAdditionalData,
    pub(crate) data: Vec<u8>,
    requires_memory: bool,
    /// `f64` bits of the callback start time, or [`CALLBACK_NOT_STARTED`].
    callback_started: AtomicU64,
    pub(crate) sensor: Option<Weak<dyn Sensor>>,
    pub(crate) parsers: Option<Arc<MetadataParserMap>>,
}

impl Frame {
    pub(crate) fn new(
        kind: FrameKind,
        size: usize,
        additional: FrameAdditionalData,
        requires_memory: bool,
    ) -> Self {
        let data = if requires_memory {
            vec![0u8; size]
        } else {
            Vec::new()
        };

        Self {
            kind,
            additional,
            data,
            requires_memory,
            callback_started: AtomicU64::new(CALLBACK_NOT_STARTED),
            sensor: None,
            parsers: None,
        }
    }

    /// Prepare a parked frame for its next publication.
    ///
    /// The buffer keeps its allocation; contents are zeroed.
    pub(crate) fn reuse(&mut self, size: usize, additional: FrameAdditionalData) {
        self.data.clear();
        self.data.resize(size, 0);
        self.additional = additional;
        self.callback_started
            .store(CALLBACK_NOT_STARTED, Ordering::Relaxed);
    }

    /// Payload category of this frame.
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    /// Metadata supplied by the producer.
    #[must_use]
    pub fn additional(&self) -> &FrameAdditionalData {
        &self.additional
    }

    pub(crate) fn additional_mut(&mut self) -> &mut FrameAdditionalData {
        &mut self.additional
    }

    /// Sequence number assigned by the capture path.
    #[must_use]
    pub fn frame_number(&self) -> u64 {
        self.additional.frame_number
    }

    /// Device timestamp in milliseconds.
    #[must_use]
    pub fn timestamp_ms(&self) -> f64 {
        self.additional.timestamp_ms
    }

    /// Frame payload. Empty for metadata-only frames.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether this frame carries a payload buffer.
    #[must_use]
    pub fn requires_memory(&self) -> bool {
        self.requires_memory
    }

    /// Record the time at which delivery to the user callback began.
    pub fn log_callback_start(&self, time_ms: f64) {
        self.callback_started
            .store(time_ms.to_bits(), Ordering::Release);
    }

    /// Time at which delivery to the user callback began, if it has.
    #[must_use]
    pub fn callback_started_ms(&self) -> Option<f64> {
        match self.callback_started.load(Ordering::Acquire) {
            CALLBACK_NOT_STARTED => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    /// The sensor that produced this frame, if it is still alive.
    #[must_use]
    pub fn sensor(&self) -> Option<Arc<dyn Sensor>> {
        self.sensor.as_ref().and_then(Weak::upgrade)
    }

    /// Whether `key` can be resolved for this frame.
    #[must_use]
    pub fn supports_metadata(&self, key: &str) -> bool {
        self.metadata(key).is_some()
    }

    /// Resolve a metadata attribute.
    ///
    /// Values decoded by the producer win; otherwise the parser registered
    /// under `key` is asked to decode it from the raw blob.
    #[must_use]
    pub fn metadata(&self, key: &str) -> Option<i64> {
        if let Some(value) = self.additional.parsed.get(key) {
            return Some(*value);
        }
        self.parsers
            .as_ref()
            .and_then(|parsers| parsers.get(key))
            .and_then(|parser| parser.parse(self))
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("frame_number", &self.additional.frame_number)
            .field("timestamp_ms", &self.additional.timestamp_ms)
            .field("len", &self.data.len())
            .field("requires_memory", &self.requires_memory)
            .field("callback_started_ms", &self.callback_started_ms())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FirstByte;

    impl MetadataParser for FirstByte {
        fn parse(&self, frame: &Frame) -> Option<i64> {
            frame.additional().raw_metadata.first().map(|b| i64::from(*b))
        }
    }

    struct NamedSensor(String);

    impl Sensor for NamedSensor {
        fn name(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn test_metadata_prefers_producer_values() {
        let mut additional = FrameAdditionalData {
            raw_metadata: vec![7],
            ..Default::default()
        };
        additional.parsed.insert("exposure".into(), 100);

        let mut parsers = MetadataParserMap::new();
        parsers.insert("exposure".into(), Arc::new(FirstByte) as Arc<dyn MetadataParser>);
        parsers.insert("gain".into(), Arc::new(FirstByte) as Arc<dyn MetadataParser>);

        let mut frame = Frame::new(FrameKind::Video, 4, additional, true);
        frame.parsers = Some(Arc::new(parsers));

        assert_eq!(frame.metadata("exposure"), Some(100));
        assert_eq!(frame.metadata("gain"), Some(7));
        assert!(!frame.supports_metadata("temperature"));
    }

    #[test]
    fn test_sensor_reference_is_weak() {
        let sensor: Arc<dyn Sensor> = Arc::new(NamedSensor("depth".into()));
        let mut frame = Frame::new(FrameKind::Video, 0, FrameAdditionalData::default(), false);
        frame.sensor = Some(Arc::downgrade(&sensor));

        assert_eq!(frame.sensor().map(|s| s.name().to_string()), Some("depth".into()));
        drop(sensor);
        assert!(frame.sensor().is_none());
    }

    #[test]
    fn test_reuse_zeroes_payload_and_keeps_allocation() {
        let mut frame = Frame::new(FrameKind::Video, 1024, FrameAdditionalData::default(), true);
        frame.data[0] = 42;
        frame.log_callback_start(12.5);
        let capacity = frame.data.capacity();

        frame.reuse(
            512,
            FrameAdditionalData {
                frame_number: 9,
                ..Default::default()
            },
        );

        assert_eq!(frame.data().len(), 512);
        assert_eq!(frame.data()[0], 0);
        assert_eq!(frame.data.capacity(), capacity);
        assert_eq!(frame.frame_number(), 9);
        assert_eq!(frame.callback_started_ms(), None);
    }

    #[test]
    fn test_metadata_only_frame_has_no_buffer() {
        let frame = Frame::new(FrameKind::Pose, 4096, FrameAdditionalData::default(), false);
        assert!(frame.data().is_empty());
        assert!(!frame.requires_memory());
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(FrameKind::Composite.to_string(), "composite");
        assert_eq!(FrameKind::ALL.len(), 5);
    }
}
