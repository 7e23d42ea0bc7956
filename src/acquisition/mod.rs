//! Byte acquisition: framing, live and recorded sources, synthetic firmware.

pub mod frame_reader;
pub mod mock;
pub mod source;

pub use frame_reader::{FrameReader, FrameReaderConfig};
pub use mock::{MockFirmware, SyntheticBreath};
pub use source::{open_replay, open_serial, ByteSource};
