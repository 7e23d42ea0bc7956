//! Per-channel signal conditioning.
//!
//! Raw ADC words go through a fixed chain: voltage conversion, optional inversion,
//! bias removal, smoothing. Every stage keeps the series length, so sample `i` of the
//! output lines up with sample `i` of the frame.
//!
//! The moving average is causal: sample `i` is the mean of the trailing `W` samples,
//! with a shrinking window for the first `W - 1` samples. The Butterworth option runs
//! the cascaded low-pass forward and then backward over the frame, cancelling its
//! phase delay. The Savitzky-Golay option fits a least-squares polynomial to each
//! centred window; the first and last half-windows take their values from the fit
//! of the outermost full window.

use crate::config::{BiasMode, ChannelSettings, ConditioningSettings, SmoothingKind};
use crate::data::decoder::AdcTransfer;
use crate::error::ConditionError;
use biquad::{Biquad, Coefficients, DirectForm2Transposed, Hertz, Type};
use serde::Serialize;
use std::f64::consts::PI;

/// Baseline subtracted from each sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BiasRemoval {
    /// Mean of the whole series.
    FullMean,
    /// Mean of the trailing `window` samples, shrinking at the start.
    Trailing { window: usize },
}

/// Smoothing applied after bias removal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Smoothing {
    /// Trailing moving average over `window` samples; `window == 1` is a no-op.
    MovingAverage { window: usize },
    /// Zero-phase Butterworth low-pass of even `order`.
    Butterworth {
        cutoff_hz: f64,
        order: usize,
        sample_rate_hz: f64,
    },
    /// Centred least-squares polynomial fit over an odd `window`.
    SavitzkyGolay { window: usize, polyorder: usize },
}

/// Conditioning parameters for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionerConfig {
    pub transfer: AdcTransfer,
    pub invert: bool,
    pub bias: BiasRemoval,
    pub smoothing: Smoothing,
}

impl ConditionerConfig {
    pub fn from_settings(
        transfer: AdcTransfer,
        channel: &ChannelSettings,
        conditioning: &ConditioningSettings,
        sample_rate_hz: f64,
    ) -> Self {
        let bias = match conditioning.bias_mode {
            BiasMode::Full => BiasRemoval::FullMean,
            BiasMode::Trailing => BiasRemoval::Trailing {
                window: conditioning.bias_window,
            },
        };
        let smoothing = match conditioning.smoothing {
            SmoothingKind::MovingAverage => Smoothing::MovingAverage {
                window: conditioning.moving_average_window,
            },
            SmoothingKind::Butterworth => Smoothing::Butterworth {
                cutoff_hz: conditioning.butterworth_cutoff_hz,
                order: conditioning.butterworth_order,
                sample_rate_hz,
            },
            SmoothingKind::SavitzkyGolay => Smoothing::SavitzkyGolay {
                window: conditioning.savgol_window,
                polyorder: conditioning.savgol_polyorder,
            },
        };
        Self {
            transfer,
            invert: channel.invert,
            bias,
            smoothing,
        }
    }
}

/// A conditioned channel. `voltages` holds the (possibly inverted) input in volts,
/// `values` the bias-free smoothed waveform used for detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionedSeries {
    pub voltages: Vec<f64>,
    pub values: Vec<f64>,
}

impl ConditionedSeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Conditions raw channels with a fixed configuration.
#[derive(Debug, Clone)]
pub struct ChannelConditioner {
    config: ConditionerConfig,
    sections: Vec<Coefficients<f64>>,
}

impl ChannelConditioner {
    pub fn new(config: ConditionerConfig) -> Result<Self, ConditionError> {
        if let BiasRemoval::Trailing { window: 0 } = config.bias {
            return Err(ConditionError::InvalidWindow {
                name: "bias",
                value: 0,
            });
        }
        let sections = match config.smoothing {
            Smoothing::MovingAverage { window: 0 } => {
                return Err(ConditionError::InvalidWindow {
                    name: "moving average",
                    value: 0,
                })
            }
            Smoothing::MovingAverage { .. } => Vec::new(),
            Smoothing::Butterworth {
                cutoff_hz,
                order,
                sample_rate_hz,
            } => butterworth_sections(cutoff_hz, order, sample_rate_hz)?,
            Smoothing::SavitzkyGolay { window, polyorder } => {
                savgol_check(window, polyorder)?;
                Vec::new()
            }
        };
        Ok(Self { config, sections })
    }

    pub fn config(&self) -> &ConditionerConfig {
        &self.config
    }

    /// Runs the full chain on one raw channel.
    pub fn condition(&self, raw: &[u16]) -> Result<ConditionedSeries, ConditionError> {
        if raw.is_empty() {
            return Err(ConditionError::EmptyInput);
        }

        let transfer = &self.config.transfer;
        let mut voltages = transfer.convert(raw);
        if self.config.invert {
            voltages.iter_mut().for_each(|v| *v = transfer.v_ref - *v);
        }

        let centered = match self.config.bias {
            BiasRemoval::FullMean => {
                let mean = voltages.iter().sum::<f64>() / voltages.len() as f64;
                voltages.iter().map(|v| v - mean).collect()
            }
            BiasRemoval::Trailing { window } => {
                let baseline = moving_average(&voltages, window);
                voltages
                    .iter()
                    .zip(&baseline)
                    .map(|(v, b)| v - b)
                    .collect::<Vec<_>>()
            }
        };

        let values = match self.config.smoothing {
            Smoothing::MovingAverage { window } => moving_average(&centered, window),
            Smoothing::Butterworth { .. } => self.filtfilt(&centered),
            Smoothing::SavitzkyGolay { window, polyorder } => {
                savitzky_golay(&centered, window, polyorder)?
            }
        };

        Ok(ConditionedSeries { voltages, values })
    }

    fn filtfilt(&self, input: &[f64]) -> Vec<f64> {
        let mut data = input.to_vec();
        for _ in 0..2 {
            for coeffs in &self.sections {
                let mut filter = DirectForm2Transposed::<f64>::new(*coeffs);
                data.iter_mut().for_each(|x| *x = filter.run(*x));
            }
            data.reverse();
        }
        data
    }
}

/// Trailing mean over `window` samples; the first `window - 1` outputs average
/// whatever samples exist so far.
pub fn moving_average(input: &[f64], window: usize) -> Vec<f64> {
    let window = window.max(1);
    let mut out = Vec::with_capacity(input.len());
    let mut sum = 0.0;
    for (i, &x) in input.iter().enumerate() {
        sum += x;
        if i >= window {
            sum -= input[i - window];
        }
        let count = (i + 1).min(window);
        out.push(sum / count as f64);
    }
    out
}

/// Savitzky-Golay smoothing with the edges taken from the outermost window fits.
///
/// Fails when `window` is even, `polyorder >= window`, or the series is shorter
/// than the window.
pub fn savitzky_golay(
    input: &[f64],
    window: usize,
    polyorder: usize,
) -> Result<Vec<f64>, ConditionError> {
    savgol_check(window, polyorder)?;
    let n = input.len();
    if n < window {
        return Err(ConditionError::SeriesTooShort { len: n, window });
    }

    let half = window / 2;
    let rows = savgol_rows(window, polyorder)?;
    let fit = |row: &[f64], start: usize| -> f64 {
        row.iter()
            .zip(&input[start..start + window])
            .map(|(h, x)| h * x)
            .sum()
    };

    let last_start = n - window;
    Ok((0..n)
        .map(|i| {
            if i < half {
                fit(&rows[i], 0)
            } else if i >= last_start + half {
                fit(&rows[i - last_start], last_start)
            } else {
                fit(&rows[half], i - half)
            }
        })
        .collect())
}

fn savgol_check(window: usize, polyorder: usize) -> Result<(), ConditionError> {
    if window % 2 == 0 {
        return Err(ConditionError::InvalidWindow {
            name: "Savitzky-Golay",
            value: window,
        });
    }
    if polyorder >= window {
        return Err(ConditionError::Filter(format!(
            "Savitzky-Golay polyorder {} must be less than the window {}",
            polyorder, window
        )));
    }
    Ok(())
}

/// Rows of the least-squares projection `A (AᵀA)⁻¹ Aᵀ` for one window.
///
/// Row `r` maps the window's samples to the fitted polynomial's value at
/// position `r`. Positions are scaled to `[-1, 1]` to keep `AᵀA` well conditioned.
fn savgol_rows(window: usize, polyorder: usize) -> Result<Vec<Vec<f64>>, ConditionError> {
    let half = (window / 2).max(1) as f64;
    let terms = polyorder + 1;
    let basis: Vec<Vec<f64>> = (0..window)
        .map(|j| {
            let t = (j as f64 - (window / 2) as f64) / half;
            (0..terms).map(|k| t.powi(k as i32)).collect()
        })
        .collect();

    let mut gram = vec![vec![0.0; terms]; terms];
    for a in &basis {
        for (r, gram_row) in gram.iter_mut().enumerate() {
            for (c, g) in gram_row.iter_mut().enumerate() {
                *g += a[r] * a[c];
            }
        }
    }

    basis
        .iter()
        .map(|a_r| -> Result<Vec<f64>, ConditionError> {
            let coeffs = solve(gram.clone(), a_r.clone())?;
            Ok(basis
                .iter()
                .map(|a_j| coeffs.iter().zip(a_j).map(|(c, a)| c * a).sum())
                .collect())
        })
        .collect()
}

/// Gaussian elimination with partial pivoting on a small dense system.
fn solve(mut m: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Result<Vec<f64>, ConditionError> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&a, &b| m[a][col].abs().total_cmp(&m[b][col].abs()))
            .unwrap_or(col);
        if m[pivot][col].abs() < 1e-12 {
            return Err(ConditionError::Filter(
                "Savitzky-Golay fit is singular".to_string(),
            ));
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..n {
            let factor = m[row][col] / m[col][col];
            for k in col..n {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| m[row][k] * x[k]).sum();
        x[row] = (rhs[row] - tail) / m[row][row];
    }
    Ok(x)
}

fn butterworth_sections(
    cutoff_hz: f64,
    order: usize,
    sample_rate_hz: f64,
) -> Result<Vec<Coefficients<f64>>, ConditionError> {
    if order == 0 || order % 2 != 0 {
        return Err(ConditionError::Filter(format!(
            "Butterworth order must be a positive even number, got {}",
            order
        )));
    }
    let fs = Hertz::<f64>::from_hz(sample_rate_hz)
        .map_err(|e| ConditionError::Filter(format!("{:?}", e)))?;
    let f0 = Hertz::<f64>::from_hz(cutoff_hz)
        .map_err(|e| ConditionError::Filter(format!("{:?}", e)))?;

    (0..order / 2)
        .map(|k| {
            let q = 1.0 / (2.0 * ((2 * k + 1) as f64 * PI / (2 * order) as f64).sin());
            Coefficients::<f64>::from_params(Type::LowPass, fs, f0, q)
                .map_err(|e| ConditionError::Filter(format!("{:?}", e)))
        })
        .collect()
}
