//! Spectral cross-check of the breathing rate.
//!
//! A Hann-windowed FFT of a conditioned channel gives the dominant frequency inside
//! the breathing band. It is independent of peak counting, so a large disagreement
//! between the two is a hint that the detector thresholds do not suit the subject.

use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::sync::Arc;

/// Dominant in-band frequency of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpectralRate {
    pub frequency_hz: f64,
    pub bpm: f64,
    /// Linear magnitude of the winning bin.
    pub magnitude: f64,
}

/// Plans FFTs for one series length and band.
#[derive(Clone)]
pub struct SpectrumAnalyzer {
    sample_rate_hz: f64,
    min_hz: f64,
    max_hz: f64,
    window_size: usize,
    fft: Arc<dyn Fft<f64>>,
    hann_window: Vec<f64>,
}

impl std::fmt::Debug for SpectrumAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyzer")
            .field("sample_rate_hz", &self.sample_rate_hz)
            .field("min_hz", &self.min_hz)
            .field("max_hz", &self.max_hz)
            .field("window_size", &self.window_size)
            .finish()
    }
}

impl SpectrumAnalyzer {
    pub fn new(sample_rate_hz: f64, min_hz: f64, max_hz: f64, window_size: usize) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window_size.max(1));

        let mut hann_window = Vec::with_capacity(window_size);
        if window_size > 1 {
            for i in 0..window_size {
                // Hann window formula
                let val = 0.5
                    * (1.0
                        - (2.0 * std::f64::consts::PI * i as f64 / (window_size - 1) as f64)
                            .cos());
                hann_window.push(val);
            }
        }

        Self {
            sample_rate_hz,
            min_hz,
            max_hz,
            window_size,
            fft,
            hann_window,
        }
    }

    /// Strongest bin within the band, or `None` when the series does not match the
    /// planned length, is too short, or carries no in-band energy.
    pub fn dominant(&self, series: &[f64]) -> Option<SpectralRate> {
        if series.len() != self.window_size || self.window_size < 4 {
            return None;
        }

        let mean = series.iter().sum::<f64>() / series.len() as f64;
        let mut buffer: Vec<Complex<f64>> = series
            .iter()
            .zip(&self.hann_window)
            .map(|(&val, &win)| Complex::new((val - mean) * win, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let resolution = self.sample_rate_hz / self.window_size as f64;
        let (bin, magnitude) = buffer
            .iter()
            .enumerate()
            .take(self.window_size / 2)
            .skip(1)
            .filter(|(i, _)| {
                let f = *i as f64 * resolution;
                f >= self.min_hz && f <= self.max_hz
            })
            .map(|(i, c)| (i, c.norm() * 2.0 / self.window_size as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1))?;

        if magnitude <= 1e-12 {
            return None;
        }

        let frequency_hz = bin as f64 * resolution;
        Some(SpectralRate {
            frequency_hz,
            bpm: frequency_hz * 60.0,
            magnitude,
        })
    }
}
