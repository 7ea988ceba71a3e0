//! Frame lifecycle core for a streaming sensor driver.
//!
//! A [`FrameSource`] owns one bounded [`FrameArchive`] per supported frame
//! kind and a single replaceable callback target. Producers allocate frames
//! from the archive matching the payload, fill them, and publish them with
//! [`FrameSource::invoke_callback`], which moves sole ownership into the
//! user callback. The archive admission capacity is runtime-tunable through
//! the [`FrameQueueSizeOption`] returned by
//! [`FrameSource::get_published_size_option`].
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use frame_source::{
//!     FrameAdditionalData, FrameHandle, FrameKind, FrameSource, MetadataParserMap, SourceConfig,
//! };
//!
//! let source = FrameSource::new(&SourceConfig::default());
//! source.init(Arc::new(MetadataParserMap::new()))?;
//! source.set_callback(Some(Arc::new(|frame: FrameHandle| -> anyhow::Result<()> {
//!     println!("frame #{:?}", frame.frame().map(|f| f.frame_number()));
//!     Ok(())
//! })));
//!
//! let frame = source.alloc(FrameKind::Video, 1024, FrameAdditionalData::default(), true)?;
//! source.invoke_callback(frame);
//!
//! source.flush();
//! source.reset();
//! # Ok::<(), frame_source::SourceError>(())
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod option;
pub mod source;
pub mod time;

pub use config::SourceConfig;
pub use error::{SourceError, SourceResult};
pub use frame_pool::{
    ArchiveStats, CallbackToken, CapacityCell, Frame, FrameAdditionalData, FrameArchive,
    FrameHandle, FrameKind, MetadataParser, MetadataParserMap, Sensor,
};
pub use option::{CaptureOption, FrameQueueSizeOption, OptionRange, FRAME_QUEUE_SIZE_RANGE};
pub use source::{
    Delivery, DeliveryStats, FrameCallback, FrameCallbackPtr, FrameSource, SourceState,
    SUPPORTED_KINDS,
};
pub use time::{MonotonicClock, TimeService};
