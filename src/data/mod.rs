//! Frame decoding, signal processing and report storage.

pub mod conditioning;
pub mod decoder;
pub mod peaks;
pub mod rate;
pub mod spectrum;
pub mod storage;
