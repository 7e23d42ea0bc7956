//! Custom error types for the application.
//!
//! Each pipeline stage owns a small error enum so callers can tell recoverable
//! per-frame failures from fatal ones, and `DaqError` consolidates them for the
//! application edge. Using the `thiserror` crate, every stage error converts into
//! `DaqError` through `#[from]`, which keeps the `?` operator usable everywhere.
//!
//! ## Error Hierarchy
//!
//! - **`FramingError`**: Produced by the frame reader while scanning the byte stream.
//!   `Timeout` and `MarkerCorrupted` are recoverable (the session retries), while
//!   `StreamClosed`, `Cancelled` and `Io` end the session.
//! - **`DecodeError`**: A frame whose payload cannot be turned into samples. The frame
//!   is dropped and the session continues.
//! - **`ConditionError`**: A channel that cannot be conditioned. Also per-frame.
//! - **`ConfigError`**: Invalid or unreadable configuration. Always fatal at startup,
//!   before any pipeline component is constructed.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failures while locating and reading one frame from the byte stream.
#[derive(Error, Debug)]
pub enum FramingError {
    #[error("Frame not complete within {timeout_ms} ms ({received} of {expected} bytes)")]
    Timeout {
        timeout_ms: u64,
        received: usize,
        expected: usize,
    },

    #[error("Byte stream closed ({received} of {expected} payload bytes received)")]
    StreamClosed { received: usize, expected: usize },

    #[error("No start marker found in {discarded} bytes of stream data")]
    MarkerCorrupted { discarded: usize },

    #[error("Frame read cancelled by session shutdown")]
    Cancelled,

    #[error("Byte source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FramingError {
    /// Whether the session should keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MarkerCorrupted { .. })
    }
}

/// Failures while turning a frame payload into channel samples.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Frame size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Sample {index} has value {value}, above ADC maximum {adc_max}")]
    SampleOutOfRange { index: usize, value: u16, adc_max: u16 },
}

/// Failures while conditioning one channel.
#[derive(Error, Debug, PartialEq)]
pub enum ConditionError {
    #[error("Cannot condition an empty channel")]
    EmptyInput,

    #[error("Invalid {name} window: {value}")]
    InvalidWindow { name: &'static str, value: usize },

    #[error("Series of {len} samples is shorter than the {window}-sample filter window")]
    SeriesTooShort { len: usize, window: usize },

    #[error("Filter design failed: {0}")]
    Filter(String),
}

/// Invalid or unreadable configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Load(#[from] config::ConfigError),
}

impl ConfigError {
    /// Shorthand for an `InvalidParameter` error.
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Application-level error wrapping every stage error.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Condition(#[from] ConditionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}
