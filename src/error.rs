//! Custom error types for the frame source.
//!
//! `SourceError` is the single error type surfaced by the orchestrator and the
//! capacity option. Using `thiserror`, each variant maps to one failure class:
//!
//! - **`InvalidValue`**: a configuration input outside the option's declared
//!   range or misaligned with its step. Reported to the caller of `set`.
//! - **`UnsupportedFrameKind`**: an allocation for a kind with no archive.
//! - **`Sequencing`**: a lifecycle call out of order, such as `alloc` before
//!   `init` or a second `init` without `reset`.
//! - **`CallbackFault`**: anything escaping a user callback. This variant is
//!   only ever logged and counted; it never reaches the capture path.
//! - **`Config`**: wraps [`ConfigError`] from loading or validating settings.

use frame_pool::FrameKind;
use thiserror::Error;

use crate::config::ConfigError;

/// Convenience alias for results using the frame source error type.
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Failures surfaced by the frame source and its options.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("set({option}) failed! Given value {value} is out of range [{min}, {max}] with step {step}")]
    InvalidValue {
        option: &'static str,
        value: f32,
        min: f32,
        max: f32,
        step: f32,
    },

    #[error("Requested frame kind '{0}' is not supported")]
    UnsupportedFrameKind(FrameKind),

    #[error("Wrong API call sequence: {0}")]
    Sequencing(String),

    #[error("Exception was thrown during user callback: {0}")]
    CallbackFault(String),
}
