//! Synthetic sensor firmware producing framed byte streams.
//!
//! The generator mimics the two-sensor belt: channel A follows the breathing
//! waveform directly, channel B (the rubber band) reads inverted around the ADC
//! reference. Noise comes from a seeded RNG so recordings are reproducible.

use crate::config::Settings;
use crate::data::decoder::{AdcTransfer, Frame, FrameLayout, SampleBuffer};
use crate::error::DecodeError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Parameters of the simulated breathing signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticBreath {
    /// Breaths per minute.
    pub bpm: f64,
    /// Peak-to-peak amplitude in volts.
    pub amplitude_v: f64,
    /// Uniform noise half-width in volts.
    pub noise_v: f64,
    /// Baseline drift in volts per second.
    pub drift_v_per_sec: f64,
    /// Resting level in volts.
    pub baseline_v: f64,
}

impl Default for SyntheticBreath {
    fn default() -> Self {
        Self {
            bpm: 15.0,
            amplitude_v: 0.8,
            noise_v: 0.01,
            drift_v_per_sec: 0.0,
            baseline_v: 1.65,
        }
    }
}

/// Emits marker-prefixed frames as the sensor firmware would.
pub struct MockFirmware {
    layout: FrameLayout,
    transfer: AdcTransfer,
    marker: Vec<u8>,
    sample_rate_hz: f64,
    breath: SyntheticBreath,
    preamble: Vec<u8>,
    rng: StdRng,
    clock: u64,
}

impl MockFirmware {
    pub fn from_settings(settings: &Settings, breath: SyntheticBreath, seed: u64) -> Self {
        Self {
            layout: FrameLayout::from_settings(&settings.frame),
            transfer: AdcTransfer::from_settings(&settings.adc),
            marker: settings.frame.marker_bytes(),
            sample_rate_hz: settings.rate.sample_rate_hz,
            breath,
            preamble: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            clock: 0,
        }
    }

    /// Bytes written before every marker, like boot or debug output.
    pub fn with_preamble(mut self, preamble: impl Into<Vec<u8>>) -> Self {
        self.preamble = preamble.into();
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Samples for the next frame; the waveform continues across frames.
    pub fn next_samples(&mut self) -> SampleBuffer {
        let n = self.layout.samples_per_channel;
        let mut a = Vec::with_capacity(n);
        let mut b = Vec::with_capacity(n);
        let freq = self.breath.bpm / 60.0;

        for _ in 0..n {
            let t = self.clock as f64 / self.sample_rate_hz;
            self.clock += 1;

            let wave = 0.5 * self.breath.amplitude_v * (2.0 * PI * freq * t).sin();
            let level = self.breath.baseline_v + self.breath.drift_v_per_sec * t;
            let noise_a = self.rng.gen_range(-1.0..=1.0) * self.breath.noise_v;
            let noise_b = self.rng.gen_range(-1.0..=1.0) * self.breath.noise_v;

            a.push(self.quantize(level + wave + noise_a));
            b.push(self.quantize(self.transfer.v_ref - (level + wave) + noise_b));
        }

        SampleBuffer { channel_a: a, channel_b: b }
    }

    pub fn next_frame(&mut self) -> Result<Frame, DecodeError> {
        let samples = self.next_samples();
        self.layout.encode(&samples)
    }

    /// Preamble, marker and payload of the next frame.
    pub fn next_record(&mut self) -> Result<Vec<u8>, DecodeError> {
        let frame = self.next_frame()?;
        let mut out = Vec::with_capacity(self.preamble.len() + self.marker.len() + frame.len());
        out.extend_from_slice(&self.preamble);
        out.extend_from_slice(&self.marker);
        out.extend_from_slice(frame.as_bytes());
        Ok(out)
    }

    /// A contiguous stream of `frames` records.
    pub fn recording(&mut self, frames: usize) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        for _ in 0..frames {
            out.extend(self.next_record()?);
        }
        Ok(out)
    }

    fn quantize(&self, volts: f64) -> u16 {
        let max = f64::from(self.transfer.adc_max);
        (volts / self.transfer.v_ref * max).round().clamp(0.0, max) as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::decoder::SampleDecoder;

    fn small_settings() -> Settings {
        let mut settings = Settings::default();
        settings.frame.samples_per_channel = 500;
        settings
    }

    #[test]
    fn test_record_layout() {
        let settings = small_settings();
        let mut firmware = MockFirmware::from_settings(&settings, SyntheticBreath::default(), 1)
            .with_preamble(b"boot ok\n".to_vec());
        let record = firmware.next_record().unwrap();

        assert!(record.starts_with(b"boot ok\nSTART\r\n"));
        assert_eq!(record.len(), 8 + 7 + settings.frame.frame_size());
    }

    #[test]
    fn test_same_seed_same_stream() {
        let settings = small_settings();
        let breath = SyntheticBreath {
            noise_v: 0.05,
            ..SyntheticBreath::default()
        };
        let first = MockFirmware::from_settings(&settings, breath, 7)
            .recording(2)
            .unwrap();
        let second = MockFirmware::from_settings(&settings, breath, 7)
            .recording(2)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_channel_b_is_inverted() {
        let settings = small_settings();
        let breath = SyntheticBreath {
            noise_v: 0.0,
            ..SyntheticBreath::default()
        };
        let mut firmware = MockFirmware::from_settings(&settings, breath, 0);
        let frame = firmware.next_frame().unwrap();
        let samples = SampleDecoder::new(*firmware.layout(), 4095)
            .decode(&frame)
            .unwrap();

        // A quarter period into a 15 BPM breath (1 s at 50 Hz): A at its top, B at its bottom.
        let top = 50;
        assert!(samples.channel_a()[top] > samples.channel_a()[0]);
        assert!(samples.channel_b()[top] < samples.channel_b()[0]);
        for (a, b) in samples.channel_a().iter().zip(samples.channel_b()) {
            assert!((i32::from(*a) + i32::from(*b) - 4095).abs() <= 1);
        }
    }

    #[test]
    fn test_saturates_instead_of_wrapping() {
        let settings = small_settings();
        let breath = SyntheticBreath {
            amplitude_v: 10.0,
            noise_v: 0.0,
            ..SyntheticBreath::default()
        };
        let samples = MockFirmware::from_settings(&settings, breath, 0).next_samples();
        assert!(samples.channel_a().iter().all(|&v| v <= 4095));
        assert!(samples.channel_a().contains(&4095));
        assert!(samples.channel_a().contains(&0));
    }
}
