//! Byte sources for the frame reader: a live serial port or a recorded stream.
//!
//! Serial support is optional. Without the `tokio_serial` feature, opening a port
//! fails with [`DaqError::FeatureNotEnabled`] and only replay is available.

use crate::config::SerialSettings;
use crate::error::{AppResult, DaqError};
use std::path::Path;
use tokio::io::AsyncRead;
use tracing::info;

/// Any byte stream the frame reader can consume.
pub type ByteSource = Box<dyn AsyncRead + Unpin + Send>;

/// Opens the configured serial port, 8N1 without flow control.
#[cfg(feature = "tokio_serial")]
pub fn open_serial(serial: &SerialSettings) -> AppResult<ByteSource> {
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(&serial.port, serial.baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
        .map_err(std::io::Error::from)?;
    info!(port = %serial.port, baud = serial.baud_rate, "Serial port opened");
    Ok(Box::new(port))
}

#[cfg(not(feature = "tokio_serial"))]
pub fn open_serial(_serial: &SerialSettings) -> AppResult<ByteSource> {
    Err(DaqError::FeatureNotEnabled("tokio_serial".to_string()))
}

/// Opens a raw recording (as written by `simulate` or captured from the port).
pub async fn open_replay(path: &Path) -> AppResult<ByteSource> {
    let file = tokio::fs::File::open(path).await.map_err(DaqError::Io)?;
    info!(path = %path.display(), "Replaying recorded stream");
    Ok(Box::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_replay_reads_file_bytes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"START\r\n\x01\x02").unwrap();

        let mut source = open_replay(file.path()).await.unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).await.unwrap();
        assert_eq!(bytes, b"START\r\n\x01\x02");
    }

    #[tokio::test]
    async fn test_missing_replay_file() {
        let result = open_replay(Path::new("/nonexistent/recording.bin")).await;
        assert!(matches!(result, Err(DaqError::Io(_))));
    }

    #[cfg(not(feature = "tokio_serial"))]
    #[test]
    fn test_serial_requires_feature() {
        let result = open_serial(&SerialSettings::default());
        assert!(matches!(result, Err(DaqError::FeatureNotEnabled(_))));
    }
}
