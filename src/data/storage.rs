//! Report sinks with clean feature flag handling.
use crate::pipeline::FrameReport;
#[cfg(not(feature = "storage_csv"))]
use crate::error::DaqError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io::Write;

/// Destination for processed frames.
#[async_trait]
pub trait ReportSink: Send {
    async fn init(&mut self) -> Result<()>;
    async fn write(&mut self, report: &FrameReport) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// Column names of the per-sample CSV output.
pub const CSV_HEADER: [&str; 8] = [
    "timestamp",
    "frame",
    "sample",
    "voltage_a",
    "voltage_b",
    "conditioned_a",
    "conditioned_b",
    "bpm",
];

// ============================================================================
// CSV Writer
// ============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use chrono::Duration;
    use std::fs::File;
    use std::path::PathBuf;

    /// One row per sample, both channels side by side.
    pub struct CsvWriter {
        path: PathBuf,
        writer: Option<csv::Writer<File>>,
        rows: u64,
    }

    impl CsvWriter {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                writer: None,
                rows: 0,
            }
        }

        pub fn rows_written(&self) -> u64 {
            self.rows
        }
    }

    #[async_trait]
    impl ReportSink for CsvWriter {
        async fn init(&mut self) -> Result<()> {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory at {:?}", parent)
                })?;
            }
            let mut writer = csv::Writer::from_path(&self.path)
                .with_context(|| format!("Failed to create CSV file at {:?}", self.path))?;
            writer
                .write_record(CSV_HEADER)
                .context("Failed to write CSV header")?;
            self.writer = Some(writer);
            tracing::info!(path = %self.path.display(), "CSV writer initialized");
            Ok(())
        }

        async fn write(&mut self, report: &FrameReport) -> Result<()> {
            let Some(writer) = self.writer.as_mut() else {
                anyhow::bail!("CSV writer used before init");
            };

            let bpm = report
                .rate()
                .bpm()
                .map_or(String::new(), |bpm| format!("{:.3}", bpm));
            let a = &report.channel_a.series;
            let b = &report.channel_b.series;
            let sample_us = 1e6 / report.sample_rate_hz;

            for i in 0..a.len().min(b.len()) {
                let offset = Duration::microseconds((i as f64 * sample_us).round() as i64);
                writer
                    .write_record(&[
                        (report.received_at + offset).to_rfc3339(),
                        report.sequence.to_string(),
                        i.to_string(),
                        format!("{:.6}", a.voltages[i]),
                        format!("{:.6}", b.voltages[i]),
                        format!("{:.6}", a.values[i]),
                        format!("{:.6}", b.values[i]),
                        bpm.clone(),
                    ])
                    .context("Failed to write sample to CSV file")?;
                self.rows += 1;
            }
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            if let Some(mut writer) = self.writer.take() {
                writer.flush().context("Failed to flush CSV writer")?;
            }
            tracing::info!(rows = self.rows, "CSV writer shut down");
            Ok(())
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use std::path::PathBuf;

    pub struct CsvWriter;

    impl CsvWriter {
        pub fn new(_path: impl Into<PathBuf>) -> Self {
            Self
        }

        pub fn rows_written(&self) -> u64 {
            0
        }
    }

    #[async_trait]
    impl ReportSink for CsvWriter {
        async fn init(&mut self) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn write(&mut self, _report: &FrameReport) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }

        async fn shutdown(&mut self) -> Result<()> {
            Err(DaqError::FeatureNotEnabled("storage_csv".to_string()).into())
        }
    }
}

#[cfg(feature = "storage_csv")]
pub use csv_enabled::CsvWriter;
#[cfg(not(feature = "storage_csv"))]
pub use csv_disabled::CsvWriter;

// ============================================================================
// JSON lines
// ============================================================================

/// Writes one JSON summary per frame, without the sample series.
pub struct JsonLinesWriter<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[async_trait]
impl<W: Write + Send> ReportSink for JsonLinesWriter<W> {
    async fn init(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, report: &FrameReport) -> Result<()> {
        serde_json::to_writer(&mut self.out, &report.summary())
            .context("Failed to serialize frame summary")?;
        self.out
            .write_all(b"\n")
            .context("Failed to write frame summary")?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush JSON output")
    }
}
