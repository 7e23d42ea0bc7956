//! Breaths-per-minute estimation from detected peaks.

use crate::data::peaks::PeakSet;
use serde::Serialize;

/// Rate over a time window, or the reason none could be computed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RateEstimate {
    Rate {
        bpm: f64,
        window_sec: f64,
        peak_count: usize,
    },
    /// Fewer than two peaks fell inside the window.
    InsufficientData { window_sec: f64, peak_count: usize },
}

impl RateEstimate {
    pub fn bpm(&self) -> Option<f64> {
        match self {
            Self::Rate { bpm, .. } => Some(*bpm),
            Self::InsufficientData { .. } => None,
        }
    }

    pub fn window_sec(&self) -> f64 {
        match self {
            Self::Rate { window_sec, .. } | Self::InsufficientData { window_sec, .. } => {
                *window_sec
            }
        }
    }

    pub fn peak_count(&self) -> usize {
        match self {
            Self::Rate { peak_count, .. } | Self::InsufficientData { peak_count, .. } => {
                *peak_count
            }
        }
    }

    fn from_count(peak_count: usize, window_sec: f64) -> Self {
        if peak_count >= 2 && window_sec > 0.0 {
            Self::Rate {
                bpm: (peak_count - 1) as f64 / window_sec * 60.0,
                window_sec,
                peak_count,
            }
        } else {
            Self::InsufficientData {
                window_sec,
                peak_count,
            }
        }
    }
}

/// Converts peak indices to a breathing rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateEstimator {
    sample_rate_hz: f64,
    window_sec: f64,
}

impl RateEstimator {
    pub fn new(sample_rate_hz: f64, window_sec: f64) -> Self {
        Self {
            sample_rate_hz,
            window_sec,
        }
    }

    pub fn sample_rate_hz(&self) -> f64 {
        self.sample_rate_hz
    }

    /// Peak time in seconds from the start of the series.
    pub fn timestamp(&self, index: usize) -> f64 {
        index as f64 / self.sample_rate_hz
    }

    /// Rate over the trailing window of a series `series_len` samples long:
    /// `(count - 1) / window_sec * 60` for the peaks inside the window.
    pub fn estimate(&self, peaks: &PeakSet, series_len: usize) -> RateEstimate {
        let end = self.timestamp(series_len.saturating_sub(1));
        let start = end - self.window_sec;
        let count = peaks
            .peaks()
            .iter()
            .filter(|p| self.timestamp(p.index) >= start)
            .count();
        RateEstimate::from_count(count, self.window_sec)
    }

    /// Rate over the span from the first to the last peak.
    pub fn estimate_all_time(&self, peaks: &PeakSet) -> RateEstimate {
        let span = match (peaks.peaks().first(), peaks.peaks().last()) {
            (Some(first), Some(last)) => self.timestamp(last.index) - self.timestamp(first.index),
            _ => 0.0,
        };
        RateEstimate::from_count(peaks.len(), span)
    }

    /// Mean of the instantaneous rates `60 / Δt` between consecutive peaks.
    pub fn mean_interval_bpm(&self, peaks: &PeakSet) -> Option<f64> {
        let rates: Vec<f64> = peaks
            .peaks()
            .windows(2)
            .map(|w| self.timestamp(w[1].index) - self.timestamp(w[0].index))
            .filter(|dt| *dt > 0.0)
            .map(|dt| 60.0 / dt)
            .collect();
        if rates.is_empty() {
            return None;
        }
        Some(rates.iter().sum::<f64>() / rates.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::peaks::Peak;

    fn peaks_at(indices: &[usize]) -> PeakSet {
        PeakSet::new(
            indices
                .iter()
                .map(|&index| Peak {
                    index,
                    amplitude: 1.0,
                    prominence: 1.0,
                })
                .collect(),
        )
    }

    #[test]
    fn test_all_time_three_peaks_two_seconds() {
        let estimator = RateEstimator::new(50.0, 30.0);
        let estimate = estimator.estimate_all_time(&peaks_at(&[0, 50, 100]));
        assert_eq!(
            estimate,
            RateEstimate::Rate {
                bpm: 60.0,
                window_sec: 2.0,
                peak_count: 3
            }
        );
    }

    #[test]
    fn test_trailing_window_counts_recent_peaks() {
        let estimator = RateEstimator::new(50.0, 10.0);
        // 60 s series, a breath every 4 s; the last 10 s hold breaths at 52, 56.
        let indices: Vec<usize> = (0..15).map(|k| k * 200).collect();
        let estimate = estimator.estimate(&peaks_at(&indices), 3000);
        assert_eq!(estimate.peak_count(), 2);
        assert_eq!(estimate.bpm(), Some(6.0));
        assert_eq!(estimate.window_sec(), 10.0);
    }

    #[test]
    fn test_insufficient_data() {
        let estimator = RateEstimator::new(50.0, 10.0);
        let estimate = estimator.estimate(&peaks_at(&[2900]), 3000);
        assert_eq!(
            estimate,
            RateEstimate::InsufficientData {
                window_sec: 10.0,
                peak_count: 1
            }
        );
        assert_eq!(estimator.estimate_all_time(&PeakSet::default()).bpm(), None);
        assert_eq!(estimator.estimate_all_time(&peaks_at(&[10])).bpm(), None);
    }

    #[test]
    fn test_mean_interval() {
        let estimator = RateEstimator::new(50.0, 30.0);
        // Intervals of 4 s and 2 s: 15 and 30 BPM.
        let bpm = estimator.mean_interval_bpm(&peaks_at(&[0, 200, 300])).unwrap();
        assert!((bpm - 22.5).abs() < 1e-9);
        assert_eq!(estimator.mean_interval_bpm(&peaks_at(&[5])), None);
    }

    #[test]
    fn test_estimate_is_non_negative() {
        let estimator = RateEstimator::new(50.0, 30.0);
        let estimate = estimator.estimate(&peaks_at(&[100, 400, 900]), 1000);
        assert!(estimate.bpm().unwrap() >= 0.0);
    }
}
