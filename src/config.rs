//! Application settings.
//!
//! Settings are layered with the `config` crate: compiled-in defaults first, then an
//! optional TOML file, then `BREATH_DAQ__SECTION__KEY` environment variables. The
//! merged result is validated once, before any pipeline component is built, so an
//! invalid value fails the process at startup instead of mid-session.
//!
//! The defaults describe the reference firmware: a `START\r\n` marker followed by
//! 3000 interleaved little-endian 12-bit samples per channel.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Bytes per transmitted sample (16-bit words).
pub const BYTES_PER_SAMPLE: usize = 2;

/// The pipeline always decodes exactly two channels (A and B).
pub const CHANNEL_COUNT: usize = 2;

/// Prefix for environment variable overrides.
pub const ENV_PREFIX: &str = "BREATH_DAQ";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Logging and process-wide options.
    pub application: ApplicationSettings,
    /// Serial link to the acquisition board.
    pub serial: SerialSettings,
    /// Framing contract with the firmware.
    pub frame: FrameSettings,
    /// ADC transfer function.
    pub adc: AdcSettings,
    /// Per-channel roles.
    pub channels: ChannelsSettings,
    /// Bias removal and smoothing.
    pub conditioning: ConditioningSettings,
    /// Breath (peak) detection.
    pub peaks: PeakSettings,
    /// Rate estimation.
    pub rate: RateSettings,
    /// Session retry and stop policy.
    pub session: SessionSettings,
    /// Output persistence.
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Port path (e.g., "/dev/ttyACM0", "COM3").
    pub port: String,
    /// Baud rate.
    pub baud_rate: u32,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
        }
    }
}

/// Byte order of each 16-bit sample word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

/// How the two channels are arranged inside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleLayout {
    /// A0, B0, A1, B1, ...
    Interleaved,
    /// A0..An followed by B0..Bn.
    Block,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameSettings {
    /// Literal start-of-frame marker; `\r` and `\n` escapes are honoured.
    pub marker: String,
    pub samples_per_channel: usize,
    pub channel_count: usize,
    pub byte_order: ByteOrder,
    pub layout: SampleLayout,
    /// Maximum wait for the marker to appear.
    pub marker_timeout_ms: u64,
    /// Maximum wait for the payload once the marker was seen.
    pub payload_timeout_ms: u64,
    /// Garbage tolerated before a marker is declared corrupted.
    pub max_preamble_bytes: usize,
    /// Payload size the firmware is built to send, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_frame_size: Option<usize>,
}

impl Default for FrameSettings {
    fn default() -> Self {
        Self {
            marker: "START\r\n".to_string(),
            samples_per_channel: 3000,
            channel_count: CHANNEL_COUNT,
            byte_order: ByteOrder::Little,
            layout: SampleLayout::Interleaved,
            marker_timeout_ms: 90_000,
            payload_timeout_ms: 5_000,
            max_preamble_bytes: 64 * 1024,
            firmware_frame_size: None,
        }
    }
}

impl FrameSettings {
    /// Payload length in bytes.
    pub fn frame_size(&self) -> usize {
        self.samples_per_channel * self.channel_count * BYTES_PER_SAMPLE
    }

    /// Marker bytes with `\r`, `\n` and `\t` escapes expanded.
    pub fn marker_bytes(&self) -> Vec<u8> {
        self.marker
            .replace("\\r", "\r")
            .replace("\\n", "\n")
            .replace("\\t", "\t")
            .into_bytes()
    }

    pub fn marker_timeout(&self) -> Duration {
        Duration::from_millis(self.marker_timeout_ms)
    }

    pub fn payload_timeout(&self) -> Duration {
        Duration::from_millis(self.payload_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdcSettings {
    /// Reference voltage in volts.
    pub v_ref: f64,
    /// Full-scale ADC code (4095 for 12-bit).
    pub adc_max: u16,
}

impl Default for AdcSettings {
    fn default() -> Self {
        Self {
            v_ref: 3.3,
            adc_max: 4095,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Human-readable sensor name.
    pub label: String,
    /// Reflect the voltage (`v_ref - v`) for sensors that fall as the signal rises.
    pub invert: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            label: "channel".to_string(),
            invert: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsSettings {
    pub a: ChannelSettings,
    pub b: ChannelSettings,
}

impl Default for ChannelsSettings {
    fn default() -> Self {
        Self {
            a: ChannelSettings {
                label: "pressure".to_string(),
                invert: false,
            },
            b: ChannelSettings {
                label: "rubber".to_string(),
                invert: true,
            },
        }
    }
}

/// Which baseline is subtracted from a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BiasMode {
    /// Mean of the whole frame.
    Full,
    /// Mean of the trailing `bias_window` samples.
    Trailing,
}

/// Smoothing filter applied after bias removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmoothingKind {
    MovingAverage,
    Butterworth,
    SavitzkyGolay,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditioningSettings {
    pub bias_mode: BiasMode,
    pub bias_window: usize,
    pub smoothing: SmoothingKind,
    pub moving_average_window: usize,
    pub butterworth_cutoff_hz: f64,
    pub butterworth_order: usize,
    /// Odd number of samples fitted per Savitzky-Golay window.
    pub savgol_window: usize,
    pub savgol_polyorder: usize,
}

impl Default for ConditioningSettings {
    fn default() -> Self {
        Self {
            bias_mode: BiasMode::Full,
            bias_window: 500,
            smoothing: SmoothingKind::MovingAverage,
            moving_average_window: 20,
            butterworth_cutoff_hz: 0.6,
            butterworth_order: 4,
            savgol_window: 101,
            savgol_polyorder: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakSettings {
    /// Minimum prominence in volts.
    pub min_prominence: f64,
    /// Minimum distance between breaths in samples.
    pub min_spacing_samples: usize,
}

impl Default for PeakSettings {
    fn default() -> Self {
        Self {
            min_prominence: 0.1,
            min_spacing_samples: 40,
        }
    }
}

/// Channel whose rate is reported as the frame's headline BPM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    A,
    B,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateSettings {
    /// Per-channel sample rate.
    pub sample_rate_hz: f64,
    /// Trailing window used for the headline estimate.
    pub window_sec: f64,
    pub primary_channel: ChannelId,
    /// Breathing band searched by the spectral cross-check.
    pub spectral_min_hz: f64,
    pub spectral_max_hz: f64,
}

impl Default for RateSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: 50.0,
            window_sec: 30.0,
            primary_channel: ChannelId::A,
            spectral_min_hz: 0.1,
            spectral_max_hz: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// End the session after this many timeouts in a row; unlimited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_consecutive_timeouts: Option<u32>,
    /// Consecutive timeouts tolerated before they are logged as warnings.
    pub timeout_warn_threshold: u32,
    /// Stop after this many processed frames; unlimited when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frames: Option<u64>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_consecutive_timeouts: None,
            timeout_warn_threshold: 3,
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// CSV output file; no CSV is written when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub csv_path: Option<String>,
}

impl Settings {
    /// Loads defaults, then the optional TOML file, then environment overrides,
    /// and validates the result.
    pub fn new(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let settings: Settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parses settings from a TOML string on top of the defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let settings: Settings = config::Config::builder()
            .add_source(config::Config::try_from(&Settings::default())?)
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Renders the settings as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::invalid("settings", e.to_string()))
    }

    /// Checks every parameter the pipeline depends on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let frame = &self.frame;
        if frame.marker_bytes().is_empty() {
            return Err(ConfigError::invalid("frame.marker", "must not be empty"));
        }
        if frame.samples_per_channel == 0 {
            return Err(ConfigError::invalid(
                "frame.samples_per_channel",
                "must be at least 1",
            ));
        }
        if frame.channel_count != CHANNEL_COUNT {
            return Err(ConfigError::invalid(
                "frame.channel_count",
                format!("only {} channels are supported", CHANNEL_COUNT),
            ));
        }
        if frame.marker_timeout_ms == 0 || frame.payload_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "frame.payload_timeout_ms",
                "timeouts must be positive",
            ));
        }
        if let Some(firmware) = frame.firmware_frame_size {
            if firmware != frame.frame_size() {
                return Err(ConfigError::invalid(
                    "frame.firmware_frame_size",
                    format!(
                        "firmware sends {} bytes but the configured layout expects {}",
                        firmware,
                        frame.frame_size()
                    ),
                ));
            }
        }

        if !(self.adc.v_ref.is_finite() && self.adc.v_ref > 0.0) {
            return Err(ConfigError::invalid("adc.v_ref", "must be a positive voltage"));
        }
        if self.adc.adc_max == 0 {
            return Err(ConfigError::invalid("adc.adc_max", "must be at least 1"));
        }

        let cond = &self.conditioning;
        if cond.moving_average_window == 0 {
            return Err(ConfigError::invalid(
                "conditioning.moving_average_window",
                "must be at least 1",
            ));
        }
        if cond.bias_mode == BiasMode::Trailing && cond.bias_window == 0 {
            return Err(ConfigError::invalid(
                "conditioning.bias_window",
                "must be at least 1",
            ));
        }
        if cond.smoothing == SmoothingKind::Butterworth {
            let nyquist = self.rate.sample_rate_hz / 2.0;
            if !(cond.butterworth_cutoff_hz > 0.0 && cond.butterworth_cutoff_hz < nyquist) {
                return Err(ConfigError::invalid(
                    "conditioning.butterworth_cutoff_hz",
                    format!("must lie in (0, {}) Hz", nyquist),
                ));
            }
            if cond.butterworth_order == 0 || cond.butterworth_order % 2 != 0 {
                return Err(ConfigError::invalid(
                    "conditioning.butterworth_order",
                    "must be a positive even number",
                ));
            }
        }
        if cond.smoothing == SmoothingKind::SavitzkyGolay {
            if cond.savgol_window % 2 == 0 {
                return Err(ConfigError::invalid(
                    "conditioning.savgol_window",
                    "must be odd",
                ));
            }
            if cond.savgol_polyorder >= cond.savgol_window {
                return Err(ConfigError::invalid(
                    "conditioning.savgol_polyorder",
                    "must be less than savgol_window",
                ));
            }
            if frame.samples_per_channel < cond.savgol_window {
                return Err(ConfigError::invalid(
                    "conditioning.savgol_window",
                    format!(
                        "exceeds the {} samples of a frame",
                        frame.samples_per_channel
                    ),
                ));
            }
        }

        if !(self.peaks.min_prominence.is_finite() && self.peaks.min_prominence >= 0.0) {
            return Err(ConfigError::invalid(
                "peaks.min_prominence",
                "must be a non-negative voltage",
            ));
        }
        if self.peaks.min_spacing_samples == 0 {
            return Err(ConfigError::invalid(
                "peaks.min_spacing_samples",
                "must be at least 1",
            ));
        }

        let rate = &self.rate;
        if !(rate.sample_rate_hz.is_finite() && rate.sample_rate_hz > 0.0) {
            return Err(ConfigError::invalid(
                "rate.sample_rate_hz",
                "must be positive",
            ));
        }
        if !(rate.window_sec.is_finite() && rate.window_sec > 0.0) {
            return Err(ConfigError::invalid("rate.window_sec", "must be positive"));
        }
        if !(rate.spectral_min_hz >= 0.0 && rate.spectral_min_hz < rate.spectral_max_hz) {
            return Err(ConfigError::invalid(
                "rate.spectral_min_hz",
                "spectral band must satisfy 0 <= min < max",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.frame.frame_size(), 12_000);
        assert_eq!(settings.frame.marker_bytes(), b"START\r\n".to_vec());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [frame]
            samples_per_channel = 100
            layout = "block"
            byte_order = "big"

            [channels.b]
            invert = false

            [session]
            max_consecutive_timeouts = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.frame.samples_per_channel, 100);
        assert_eq!(settings.frame.layout, SampleLayout::Block);
        assert_eq!(settings.frame.byte_order, ByteOrder::Big);
        assert!(!settings.channels.b.invert);
        assert_eq!(settings.channels.b.label, "rubber");
        assert_eq!(settings.session.max_consecutive_timeouts, Some(5));
        assert_eq!(settings.adc.adc_max, 4095);
    }

    #[test]
    fn test_escaped_marker_in_file() {
        let settings = Settings::from_toml_str(
            r#"
            [frame]
            marker = 'BEGIN\r\n'
            "#,
        )
        .unwrap();
        assert_eq!(settings.frame.marker_bytes(), b"BEGIN\r\n".to_vec());
    }

    #[test]
    fn test_zero_spacing_rejected() {
        let mut settings = Settings::default();
        settings.peaks.min_spacing_samples = 0;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("peaks.min_spacing_samples"));
    }

    #[test]
    fn test_firmware_frame_size_must_match_layout() {
        let mut settings = Settings::default();
        settings.frame.firmware_frame_size = Some(6000);
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::InvalidParameter { .. })
        ));

        settings.frame.firmware_frame_size = Some(12_000);
        settings.validate().unwrap();
    }

    #[test]
    fn test_butterworth_cutoff_below_nyquist() {
        let mut settings = Settings::default();
        settings.conditioning.smoothing = SmoothingKind::Butterworth;
        settings.conditioning.butterworth_cutoff_hz = 30.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_savitzky_golay_parameters() {
        let mut settings = Settings::from_toml_str(
            r#"
            [conditioning]
            smoothing = "savitzky_golay"
            "#,
        )
        .unwrap();
        assert_eq!(settings.conditioning.smoothing, SmoothingKind::SavitzkyGolay);
        assert_eq!(settings.conditioning.savgol_window, 101);
        assert_eq!(settings.conditioning.savgol_polyorder, 3);
        settings.validate().unwrap();

        settings.conditioning.savgol_window = 100;
        assert!(settings.validate().is_err());

        settings.conditioning.savgol_window = 5;
        settings.conditioning.savgol_polyorder = 5;
        assert!(settings.validate().is_err());

        settings.conditioning.savgol_polyorder = 2;
        settings.frame.samples_per_channel = 4;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("conditioning.savgol_window"));
    }

    #[test]
    fn test_marker_wait_outlasts_one_acquisition() {
        let settings = Settings::default();
        let acquisition_ms =
            settings.frame.samples_per_channel as f64 / settings.rate.sample_rate_hz * 1000.0;
        assert!(settings.frame.marker_timeout_ms as f64 > acquisition_ms);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let settings = Settings::default();
        let text = settings.to_toml().unwrap();
        let parsed = Settings::from_toml_str(&text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Settings::new(Some(Path::new("/nonexistent/breath_daq.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }
}
