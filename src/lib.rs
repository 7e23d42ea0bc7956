//! Host-side acquisition and analysis for a two-sensor breathing belt.
//!
//! The sensor firmware streams fixed-size frames of raw ADC words behind a text
//! start marker. This library finds those frames in the byte stream, splits them
//! into the two sensor channels, conditions each channel and estimates the
//! breathing rate from the detected peaks.
//!
//! - [`acquisition`]: framing over any async byte source, serial and replay
//!   sources, synthetic firmware.
//! - [`data`]: decoding, conditioning, peak detection, rate and spectral
//!   estimation, report sinks.
//! - [`pipeline`]: the session loop tying the stages together.

pub mod acquisition;
pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod pipeline;
