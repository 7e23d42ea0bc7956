//! Session orchestration: read → decode → condition → detect → estimate → emit.
//!
//! A [`Pipeline`] is built once from validated settings and holds only immutable
//! stage configuration. Everything that changes during a session lives in
//! [`PipelineState`], created when the session starts, updated per frame, and turned
//! into a [`SessionSummary`] when it ends.
//!
//! # Data Flow
//!
//! ```text
//! FrameReader --Frame--> SampleDecoder --SampleBuffer--> ChannelConditioner (A, B)
//!     --ConditionedSeries--> PeakDetector --PeakSet--> RateEstimator --FrameReport--> mpsc
//! ```
//!
//! Reports are pushed into a bounded channel; display and storage consumers pull at
//! their own pace. Per-frame failures (timeouts, corrupted markers, decode or
//! conditioning errors) drop that frame only. A closed stream, a cancelled session
//! or a vanished consumer end the session.

use crate::acquisition::frame_reader::FrameReader;
use crate::config::{ChannelId, ChannelSettings, Settings};
use crate::data::conditioning::{ChannelConditioner, ConditionedSeries, ConditionerConfig};
use crate::data::decoder::{AdcTransfer, Frame, FrameLayout, SampleDecoder};
use crate::data::peaks::{PeakDetector, PeakSet};
use crate::data::rate::{RateEstimate, RateEstimator};
use crate::data::spectrum::{SpectralRate, SpectrumAnalyzer};
use crate::data::storage::ReportSink;
use crate::error::{ConfigError, DaqError, FramingError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

/// Default capacity of the report channel.
pub const DEFAULT_REPORT_CAPACITY: usize = 4;

/// Retry and stop rules for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// End the session after this many timeouts in a row.
    pub max_consecutive_timeouts: Option<u32>,
    /// Timeouts in a row logged at debug level before escalating to warnings.
    pub timeout_warn_threshold: u32,
    /// End the session after this many processed frames.
    pub max_frames: Option<u64>,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_timeouts: None,
            timeout_warn_threshold: 3,
            max_frames: None,
        }
    }
}

/// Analysis of one channel of one frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelReport {
    pub label: String,
    pub series: ConditionedSeries,
    pub peaks: PeakSet,
    /// Rate over the trailing window.
    pub rate: RateEstimate,
    /// Rate over the span of all peaks in the frame.
    pub all_time_rate: RateEstimate,
    pub mean_interval_bpm: Option<f64>,
    pub mean_peak_amplitude: Option<f64>,
    pub spectral: Option<SpectralRate>,
}

/// Everything produced for one successfully processed frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameReport {
    /// Frame number within the session, counting dropped frames.
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub sample_rate_hz: f64,
    pub primary: ChannelId,
    pub channel_a: ChannelReport,
    pub channel_b: ChannelReport,
}

impl FrameReport {
    /// Headline rate, taken from the primary channel.
    pub fn rate(&self) -> &RateEstimate {
        &self.primary_channel().rate
    }

    pub fn primary_channel(&self) -> &ChannelReport {
        match self.primary {
            ChannelId::A => &self.channel_a,
            ChannelId::B => &self.channel_b,
        }
    }

    /// Compact view without the sample series.
    pub fn summary(&self) -> FrameSummary {
        FrameSummary {
            sequence: self.sequence,
            received_at: self.received_at,
            rate: *self.rate(),
            channels: [&self.channel_a, &self.channel_b]
                .into_iter()
                .map(|c| ChannelSummary {
                    label: c.label.clone(),
                    peak_count: c.peaks.len(),
                    rate: c.rate,
                    all_time_rate: c.all_time_rate,
                    mean_interval_bpm: c.mean_interval_bpm,
                    mean_peak_amplitude: c.mean_peak_amplitude,
                    spectral_bpm: c.spectral.map(|s| s.bpm),
                })
                .collect(),
        }
    }
}

/// Serializable per-frame summary (JSON lines output).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameSummary {
    pub sequence: u64,
    pub received_at: DateTime<Utc>,
    pub rate: RateEstimate,
    pub channels: Vec<ChannelSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSummary {
    pub label: String,
    pub peak_count: usize,
    pub rate: RateEstimate,
    pub all_time_rate: RateEstimate,
    pub mean_interval_bpm: Option<f64>,
    pub mean_peak_amplitude: Option<f64>,
    pub spectral_bpm: Option<f64>,
}

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionEnd {
    /// The frame limit was reached.
    Completed,
    /// The byte source ended.
    StreamClosed,
    /// Shutdown was requested.
    Cancelled,
    /// Too many timeouts in a row.
    TimeoutLimit,
    /// Nobody is receiving reports any more.
    ConsumerClosed,
    /// Unrecoverable byte source failure.
    Failed(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::StreamClosed => write!(f, "stream closed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::TimeoutLimit => write!(f, "timeout limit reached"),
            Self::ConsumerClosed => write!(f, "consumer closed"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Counters at the end of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    pub frames_processed: u64,
    pub frames_dropped: u64,
    pub timeouts: u64,
    pub corrupted_markers: u64,
    pub end: SessionEnd,
}

/// Mutable per-session bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    frames_received: u64,
    frames_processed: u64,
    frames_dropped: u64,
    consecutive_timeouts: u32,
    total_timeouts: u64,
    corrupted_markers: u64,
}

impl PipelineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    fn next_sequence(&mut self) -> u64 {
        self.frames_received += 1;
        self.frames_received
    }

    fn record_timeout(&mut self) -> u32 {
        self.consecutive_timeouts += 1;
        self.total_timeouts += 1;
        self.consecutive_timeouts
    }

    /// Ends the session.
    pub fn finish(self, end: SessionEnd) -> SessionSummary {
        SessionSummary {
            frames_processed: self.frames_processed,
            frames_dropped: self.frames_dropped,
            timeouts: self.total_timeouts,
            corrupted_markers: self.corrupted_markers,
            end,
        }
    }
}

/// Immutable stage configuration for a session.
#[derive(Debug, Clone)]
pub struct Pipeline {
    decoder: SampleDecoder,
    conditioners: [ChannelConditioner; 2],
    labels: [String; 2],
    detector: PeakDetector,
    estimator: RateEstimator,
    spectrum: SpectrumAnalyzer,
    primary: ChannelId,
    policy: SessionPolicy,
}

impl Pipeline {
    /// Validates the settings and builds every stage; nothing is built on error.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        settings.validate()?;

        let transfer = AdcTransfer::from_settings(&settings.adc);
        let rate = &settings.rate;
        let conditioner = |channel: &ChannelSettings| {
            ChannelConditioner::new(ConditionerConfig::from_settings(
                transfer,
                channel,
                &settings.conditioning,
                rate.sample_rate_hz,
            ))
            .map_err(|e| ConfigError::invalid("conditioning", e.to_string()))
        };
        let conditioners = [
            conditioner(&settings.channels.a)?,
            conditioner(&settings.channels.b)?,
        ];

        let samples = settings.frame.samples_per_channel;
        Ok(Self {
            decoder: SampleDecoder::new(FrameLayout::from_settings(&settings.frame), transfer.adc_max),
            conditioners,
            labels: [
                settings.channels.a.label.clone(),
                settings.channels.b.label.clone(),
            ],
            detector: PeakDetector::new(
                settings.peaks.min_prominence,
                settings.peaks.min_spacing_samples,
            )?,
            estimator: RateEstimator::new(rate.sample_rate_hz, rate.window_sec),
            spectrum: SpectrumAnalyzer::new(
                rate.sample_rate_hz,
                rate.spectral_min_hz,
                rate.spectral_max_hz,
                samples,
            ),
            primary: rate.primary_channel,
            policy: SessionPolicy {
                max_consecutive_timeouts: settings.session.max_consecutive_timeouts,
                timeout_warn_threshold: settings.session.timeout_warn_threshold,
                max_frames: settings.session.max_frames,
            },
        })
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn decoder(&self) -> &SampleDecoder {
        &self.decoder
    }

    /// Runs decode and analysis on one frame. The frame is discarded on error.
    pub fn process_frame(
        &self,
        frame: &Frame,
        state: &mut PipelineState,
    ) -> Result<FrameReport, DaqError> {
        let sequence = state.next_sequence();
        let result = self.analyze(frame, sequence);
        match &result {
            Ok(_) => state.frames_processed += 1,
            Err(_) => state.frames_dropped += 1,
        }
        result
    }

    fn analyze(&self, frame: &Frame, sequence: u64) -> Result<FrameReport, DaqError> {
        let received_at = Utc::now();
        let samples = self.decoder.decode(frame)?;
        let channel_a = self.analyze_channel(0, samples.channel_a())?;
        let channel_b = self.analyze_channel(1, samples.channel_b())?;

        Ok(FrameReport {
            sequence,
            received_at,
            sample_rate_hz: self.estimator.sample_rate_hz(),
            primary: self.primary,
            channel_a,
            channel_b,
        })
    }

    fn analyze_channel(&self, channel: usize, raw: &[u16]) -> Result<ChannelReport, DaqError> {
        let series = self.conditioners[channel].condition(raw)?;
        let peaks = self.detector.detect(&series.values);
        Ok(ChannelReport {
            label: self.labels[channel].clone(),
            rate: self.estimator.estimate(&peaks, series.len()),
            all_time_rate: self.estimator.estimate_all_time(&peaks),
            mean_interval_bpm: self.estimator.mean_interval_bpm(&peaks),
            mean_peak_amplitude: peaks.mean_amplitude(),
            spectral: self.spectrum.dominant(&series.values),
            series,
            peaks,
        })
    }

    /// Drives one session until the stream ends, the policy stops it, or shutdown.
    pub async fn run<R>(
        &self,
        reader: &mut FrameReader<R>,
        reports: mpsc::Sender<FrameReport>,
    ) -> SessionSummary
    where
        R: AsyncRead + Unpin,
    {
        let mut state = PipelineState::new();
        info!(
            frame_size = reader.config().frame_size,
            "Session started, waiting for frames"
        );

        let end = loop {
            if let Some(limit) = self.policy.max_frames {
                if state.frames_processed >= limit {
                    break SessionEnd::Completed;
                }
            }

            let frame = match reader.read_frame().await {
                Ok(frame) => frame,
                Err(e) if e.is_recoverable() => match self.recover(&e, &mut state) {
                    Some(end) => break end,
                    None => continue,
                },
                Err(e) => break Self::session_end(e),
            };
            state.consecutive_timeouts = 0;

            let report = match self.process_frame(&frame, &mut state) {
                Ok(report) => report,
                Err(e) => {
                    warn!(error = %e, dropped = state.frames_dropped, "Frame discarded");
                    continue;
                }
            };

            info!(
                frame = report.sequence,
                bpm = ?report.rate().bpm(),
                peaks_a = report.channel_a.peaks.len(),
                peaks_b = report.channel_b.peaks.len(),
                "Frame processed"
            );

            if reports.send(report).await.is_err() {
                break SessionEnd::ConsumerClosed;
            }
        };

        let summary = state.finish(end);
        info!(
            processed = summary.frames_processed,
            dropped = summary.frames_dropped,
            timeouts = summary.timeouts,
            end = %summary.end,
            "Session ended"
        );
        summary
    }

    /// Bookkeeping for a dropped frame; `Some` when the policy ends the session.
    fn recover(&self, err: &FramingError, state: &mut PipelineState) -> Option<SessionEnd> {
        match *err {
            FramingError::Timeout {
                timeout_ms,
                received,
                expected,
            } => {
                let consecutive = state.record_timeout();
                if consecutive > self.policy.timeout_warn_threshold {
                    warn!(
                        consecutive,
                        timeout_ms,
                        received,
                        expected,
                        "Repeated frame timeouts; is the sensor connected?"
                    );
                } else {
                    debug!(consecutive, timeout_ms, received, expected, "Frame timeout");
                }
                self.policy
                    .max_consecutive_timeouts
                    .filter(|&limit| consecutive >= limit)
                    .map(|_| SessionEnd::TimeoutLimit)
            }
            FramingError::MarkerCorrupted { discarded } => {
                state.corrupted_markers += 1;
                warn!(discarded, "Start marker not found, resynchronizing");
                None
            }
            _ => None,
        }
    }

    fn session_end(err: FramingError) -> SessionEnd {
        match err {
            FramingError::StreamClosed { received, expected } => {
                if received > 0 {
                    warn!(received, expected, "Stream closed inside a frame");
                }
                SessionEnd::StreamClosed
            }
            FramingError::Cancelled => SessionEnd::Cancelled,
            other => {
                error!(error = %other, "Byte source failed");
                SessionEnd::Failed(other.to_string())
            }
        }
    }
}

/// Runs a session on its own task and returns the report stream.
pub fn spawn_session<R>(
    pipeline: Pipeline,
    mut reader: FrameReader<R>,
    capacity: usize,
) -> (JoinHandle<SessionSummary>, ReceiverStream<FrameReport>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(async move { pipeline.run(&mut reader, tx).await });
    (handle, ReceiverStream::new(rx))
}

/// Hands every report to every sink. On the first sink failure the session is told
/// to stop, so a live reader does not sit out its marker timeout, and `false` is
/// returned.
pub async fn forward_reports(
    mut reports: ReceiverStream<FrameReport>,
    sinks: &mut [Box<dyn ReportSink>],
    stop: &watch::Sender<bool>,
) -> bool {
    while let Some(report) = reports.next().await {
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.write(&report).await {
                error!(error = ?e, frame = report.sequence, "Report sink failed, stopping session");
                let _ = stop.send(true);
                return false;
            }
        }
    }
    true
}
