//! Start-marker framing over an arbitrary byte stream.
//!
//! The firmware prints a literal marker and then writes a fixed number of payload
//! bytes. [`FrameReader`] scans for the marker, drops whatever precedes it and
//! accumulates exactly `frame_size` bytes across as many partial reads as the link
//! delivers. Bytes read past the end of a frame are kept in a residual buffer and
//! are the first bytes examined by the next call.
//!
//! Every wait is bounded: the marker search by `marker_timeout`, the payload by
//! `payload_timeout` measured from the moment the marker was seen. An optional
//! `watch` channel lets the session abort a wait as soon as shutdown is requested.

use crate::data::decoder::Frame;
use crate::error::FramingError;
use bytes::{Buf, BytesMut};
use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

const READ_CHUNK: usize = 4096;

/// Framing parameters.
#[derive(Debug, Clone)]
pub struct FrameReaderConfig {
    /// Literal start-of-frame marker.
    pub marker: Vec<u8>,
    /// Payload bytes following each marker.
    pub frame_size: usize,
    pub marker_timeout: Duration,
    pub payload_timeout: Duration,
    /// Bytes discarded while searching before reporting `MarkerCorrupted`.
    pub max_preamble_bytes: usize,
}

impl FrameReaderConfig {
    /// Builds the reader configuration from validated settings.
    pub fn from_settings(frame: &crate::config::FrameSettings) -> Self {
        Self {
            marker: frame.marker_bytes(),
            frame_size: frame.frame_size(),
            marker_timeout: frame.marker_timeout(),
            payload_timeout: frame.payload_timeout(),
            max_preamble_bytes: frame.max_preamble_bytes,
        }
    }
}

/// Extracts fixed-length frames from a byte source.
pub struct FrameReader<R> {
    source: R,
    config: FrameReaderConfig,
    residual: BytesMut,
    shutdown: Option<watch::Receiver<bool>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(source: R, config: FrameReaderConfig) -> Self {
        let capacity = config.frame_size + config.marker.len() + READ_CHUNK;
        Self {
            source,
            config,
            residual: BytesMut::with_capacity(capacity),
            shutdown: None,
        }
    }

    /// Aborts pending waits once the channel carries `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn config(&self) -> &FrameReaderConfig {
        &self.config
    }

    /// Bytes received but not yet consumed by a frame.
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    /// Returns the byte source, discarding any residual bytes.
    pub fn into_inner(self) -> R {
        self.source
    }

    /// Reads the next complete frame.
    pub async fn read_frame(&mut self) -> Result<Frame, FramingError> {
        self.seek_marker().await?;

        let frame_size = self.config.frame_size;
        let deadline = Instant::now() + self.config.payload_timeout;
        while self.residual.len() < frame_size {
            match self.fill(deadline).await {
                Ok(()) => {}
                Err(FillError::Closed) => {
                    return Err(FramingError::StreamClosed {
                        received: self.residual.len(),
                        expected: frame_size,
                    })
                }
                Err(FillError::TimedOut) => {
                    return Err(FramingError::Timeout {
                        timeout_ms: duration_ms(self.config.payload_timeout),
                        received: self.residual.len(),
                        expected: frame_size,
                    })
                }
                Err(FillError::Framing(e)) => return Err(e),
            }
        }

        let payload = self.residual.split_to(frame_size).freeze();
        debug!(
            bytes = payload.len(),
            residual = self.residual.len(),
            "Frame payload received"
        );
        Ok(Frame::new(payload))
    }

    /// Consumes bytes up to and including the next marker.
    async fn seek_marker(&mut self) -> Result<(), FramingError> {
        let marker_len = self.config.marker.len();
        let deadline = Instant::now() + self.config.marker_timeout;
        let mut discarded = 0usize;

        loop {
            if let Some(pos) = find_subsequence(&self.residual, &self.config.marker) {
                discarded += pos;
                self.residual.advance(pos + marker_len);
                if discarded > 0 {
                    debug!(discarded, "Dropped bytes preceding start marker");
                }
                return Ok(());
            }

            // Keep a possible partial marker at the tail for the next read.
            let keep = marker_len.saturating_sub(1).min(self.residual.len());
            let drop = self.residual.len() - keep;
            if drop > 0 {
                self.residual.advance(drop);
                discarded += drop;
            }
            if discarded > self.config.max_preamble_bytes {
                return Err(FramingError::MarkerCorrupted { discarded });
            }

            match self.fill(deadline).await {
                Ok(()) => {}
                Err(FillError::Closed) => {
                    return Err(FramingError::StreamClosed {
                        received: 0,
                        expected: self.config.frame_size,
                    })
                }
                Err(FillError::TimedOut) => {
                    return Err(FramingError::Timeout {
                        timeout_ms: duration_ms(self.config.marker_timeout),
                        received: 0,
                        expected: self.config.frame_size,
                    })
                }
                Err(FillError::Framing(e)) => return Err(e),
            }
        }
    }

    /// Appends at least one byte to the residual buffer, or fails.
    async fn fill(&mut self, deadline: Instant) -> Result<(), FillError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let source = &mut self.source;
            let shutdown = &mut self.shutdown;

            let read = tokio::select! {
                biased;
                _ = cancelled(shutdown) => {
                    return Err(FillError::Framing(FramingError::Cancelled));
                }
                read = tokio::time::timeout_at(deadline, source.read(&mut chunk)) => read,
            };

            match read {
                Err(_elapsed) => return Err(FillError::TimedOut),
                Ok(Ok(0)) => return Err(FillError::Closed),
                Ok(Ok(n)) => {
                    trace!(bytes = n, "Read from byte source");
                    self.residual.extend_from_slice(&chunk[..n]);
                    return Ok(());
                }
                Ok(Err(e))
                    if matches!(
                        e.kind(),
                        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                    ) =>
                {
                    // Serial ports report an idle line as a read timeout.
                    if Instant::now() >= deadline {
                        return Err(FillError::TimedOut);
                    }
                    tokio::task::yield_now().await;
                }
                Ok(Err(e)) => return Err(FillError::Framing(FramingError::Io(e))),
            }
        }
    }
}

enum FillError {
    Closed,
    TimedOut,
    Framing(FramingError),
}

/// Resolves once shutdown is requested; never resolves without a live sender.
async fn cancelled(shutdown: &mut Option<watch::Receiver<bool>>) {
    match shutdown {
        Some(rx) => {
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
