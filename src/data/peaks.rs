//! Breath detection by prominence- and spacing-filtered local maxima.
//!
//! Candidates are samples higher than both neighbours. A flat-topped maximum
//! (equal consecutive samples flanked by lower ones) yields a single candidate at
//! the middle of the plateau. A boundary sample qualifies only when the single step
//! down to its neighbour is itself at least `min_prominence`, so drift and the
//! partial breath at either end of a frame are not reported.
//!
//! Two filters then run in order:
//!
//! 1. **Prominence**: from each candidate, search outward on each side until the
//!    series rises above the candidate or the series ends; the lowest sample passed
//!    is that side's minimum. The candidate survives when its height above the lower
//!    of the two minima is at least `min_prominence`. Noise ripples near a breath top
//!    pass this filter with the breath's own prominence and are removed by spacing.
//! 2. **Spacing**: consecutive survivors closer than `min_spacing` samples are
//!    resolved in favour of the larger amplitude; on equal amplitude the earlier
//!    one is kept. The result satisfies the spacing invariant for every pair.

use crate::error::ConfigError;
use serde::Serialize;

/// One detected breath.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Peak {
    /// Sample index in the conditioned series.
    pub index: usize,
    /// Conditioned value at the peak, in volts.
    pub amplitude: f64,
    /// Height above the lower neighbouring minimum, in volts.
    pub prominence: f64,
}

/// Peaks in strictly increasing index order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PeakSet {
    peaks: Vec<Peak>,
}

impl PeakSet {
    pub fn new(mut peaks: Vec<Peak>) -> Self {
        peaks.sort_by_key(|p| p.index);
        peaks.dedup_by_key(|p| p.index);
        Self { peaks }
    }

    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    pub fn indices(&self) -> Vec<usize> {
        self.peaks.iter().map(|p| p.index).collect()
    }

    pub fn len(&self) -> usize {
        self.peaks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peaks.is_empty()
    }

    /// Mean peak amplitude, if any peak was found.
    pub fn mean_amplitude(&self) -> Option<f64> {
        if self.peaks.is_empty() {
            return None;
        }
        Some(self.peaks.iter().map(|p| p.amplitude).sum::<f64>() / self.peaks.len() as f64)
    }
}

/// Finds breath peaks in conditioned series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakDetector {
    min_prominence: f64,
    min_spacing: usize,
}

impl PeakDetector {
    /// `min_spacing` must be at least one sample.
    pub fn new(min_prominence: f64, min_spacing: usize) -> Result<Self, ConfigError> {
        if min_spacing == 0 {
            return Err(ConfigError::invalid(
                "peaks.min_spacing_samples",
                "must be at least 1",
            ));
        }
        if !(min_prominence.is_finite() && min_prominence >= 0.0) {
            return Err(ConfigError::invalid(
                "peaks.min_prominence",
                "must be a finite non-negative voltage",
            ));
        }
        Ok(Self {
            min_prominence,
            min_spacing,
        })
    }

    pub fn min_prominence(&self) -> f64 {
        self.min_prominence
    }

    pub fn min_spacing(&self) -> usize {
        self.min_spacing
    }

    /// Series shorter than three samples produce an empty set.
    pub fn detect(&self, series: &[f64]) -> PeakSet {
        if series.len() < 3 {
            return PeakSet::default();
        }

        let candidates: Vec<Peak> = local_maxima(series, self.min_prominence)
            .into_iter()
            .filter_map(|index| {
                let prominence = prominence(series, index);
                (prominence >= self.min_prominence).then_some(Peak {
                    index,
                    amplitude: series[index],
                    prominence,
                })
            })
            .collect();

        self.enforce_spacing(PeakSet { peaks: candidates })
    }

    /// Drops peaks closer than `min_spacing` to a larger neighbour. Idempotent.
    pub fn enforce_spacing(&self, peaks: PeakSet) -> PeakSet {
        let mut kept: Vec<Peak> = Vec::with_capacity(peaks.len());
        for peak in peaks.peaks {
            let mut keep_new = true;
            while let Some(last) = kept.last() {
                if peak.index - last.index >= self.min_spacing {
                    break;
                }
                if peak.amplitude > last.amplitude {
                    kept.pop();
                } else {
                    keep_new = false;
                    break;
                }
            }
            if keep_new {
                kept.push(peak);
            }
        }
        PeakSet { peaks: kept }
    }
}

/// Indices of strict local maxima, plateaus collapsed to their midpoint.
///
/// A run touching either end of the series counts only when it stands at least
/// `min_edge_step` above its one neighbour.
fn local_maxima(x: &[f64], min_edge_step: f64) -> Vec<usize> {
    let n = x.len();
    let mut out = Vec::new();
    let mut i = 0;
    while i < n {
        // Extent of the run of equal values starting at i.
        let mut end = i;
        while end + 1 < n && x[end + 1] == x[i] {
            end += 1;
        }
        let is_candidate = match (i.checked_sub(1), (end + 1 < n).then_some(end + 1)) {
            (Some(before), Some(after)) => x[before] < x[i] && x[after] < x[i],
            (None, Some(after)) => x[i] - x[after] >= min_edge_step && x[after] < x[i],
            (Some(before), None) => x[i] - x[before] >= min_edge_step && x[before] < x[i],
            (None, None) => false,
        };
        if is_candidate {
            out.push((i + end) / 2);
        }
        i = end + 1;
    }
    out
}

/// Height of `x[peak]` above the lower of the minima found searching outward.
fn prominence(x: &[f64], peak: usize) -> f64 {
    let top = x[peak];
    let left = side_minimum(x[..peak].iter().rev(), top);
    let right = side_minimum(x[peak + 1..].iter(), top);

    match (left, right) {
        (Some(l), Some(r)) => top - l.min(r),
        (Some(base), None) | (None, Some(base)) => top - base,
        (None, None) => 0.0,
    }
}

/// Lowest sample before the series first rises above `top`.
fn side_minimum<'a>(side: impl Iterator<Item = &'a f64>, top: f64) -> Option<f64> {
    side.take_while(|&&v| v <= top).copied().reduce(f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn sine(period: usize, peak_to_peak: f64, cycles: usize) -> Vec<f64> {
        (0..period * cycles)
            .map(|i| 0.5 * peak_to_peak * (2.0 * PI * (i as f64 + 0.3) / period as f64).sin())
            .collect()
    }

    #[test]
    fn test_one_peak_per_period() {
        let series = sine(50, 1.0, 6);
        let detector = PeakDetector::new(0.5, 25).unwrap();
        let peaks = detector.detect(&series);
        assert_eq!(peaks.len(), 6);
        let idx = peaks.indices();
        assert!(idx.windows(2).all(|w| w[1] - w[0] == 50));
    }

    #[test]
    fn test_prominence_at_or_above_amplitude_finds_nothing() {
        let series = sine(50, 1.0, 6);
        assert!(PeakDetector::new(1.0, 25).unwrap().detect(&series).is_empty());
        assert!(PeakDetector::new(1.5, 25).unwrap().detect(&series).is_empty());
    }

    #[test]
    fn test_square_wave_scenario() {
        let series: Vec<f64> = (0..100)
            .map(|i| if i % 2 == 0 { -1.65 } else { 1.65 })
            .collect();
        let peaks = PeakDetector::new(3.0, 1).unwrap().detect(&series);
        assert_eq!(peaks.len(), 50);
        assert_eq!(peaks.indices().first(), Some(&1));
        assert_eq!(peaks.indices().last(), Some(&99));
    }

    #[test]
    fn test_square_wave_cliff_at_end_is_kept() {
        let series = vec![-1.65, 1.65, -1.65, 1.65];
        let peaks = PeakDetector::new(3.0, 1).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![1, 3]);
    }

    #[test]
    fn test_monotonic_ramp_has_no_peaks() {
        let ramp: Vec<f64> = (0..100).map(|i| i as f64 * 0.01).collect();
        assert!(PeakDetector::new(0.1, 40).unwrap().detect(&ramp).is_empty());

        let falling: Vec<f64> = ramp.iter().rev().copied().collect();
        assert!(PeakDetector::new(0.1, 40).unwrap().detect(&falling).is_empty());
    }

    #[test]
    fn test_frame_starting_at_crest_reports_interior_breaths_only() {
        // Starts just past a crest and ends just before one.
        let series: Vec<f64> = (0..300)
            .map(|i| 0.5 * (2.0 * PI * (i as f64 + 0.3) / 50.0).cos())
            .collect();
        let peaks = PeakDetector::new(0.5, 25).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![50, 100, 150, 200, 250]);
    }

    #[test]
    fn test_falling_start_and_rising_end_are_not_peaks() {
        let series = vec![0.9, 0.7, 0.3, 0.0, 0.5, 1.0, 0.4, 0.0, 0.3, 0.6];
        let peaks = PeakDetector::new(0.5, 1).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![5]);
    }

    #[test]
    fn test_short_series_is_empty() {
        let detector = PeakDetector::new(0.0, 1).unwrap();
        assert!(detector.detect(&[]).is_empty());
        assert!(detector.detect(&[1.0, 2.0]).is_empty());
    }

    #[test]
    fn test_zero_spacing_rejected() {
        assert!(matches!(
            PeakDetector::new(0.1, 0),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_spacing_keeps_larger_amplitude() {
        let series = vec![0.0, 1.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.5, 0.0];
        let peaks = PeakDetector::new(0.5, 3).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![3, 8]);
    }

    #[test]
    fn test_spacing_tie_keeps_earlier() {
        let series = vec![0.0, 1.0, 0.0, 1.0, 0.0];
        let peaks = PeakDetector::new(0.5, 3).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![1]);
    }

    #[test]
    fn test_spacing_filter_is_idempotent() {
        let series: Vec<f64> = (0..300)
            .map(|i| (i as f64 * 0.37).sin() + 0.4 * (i as f64 * 1.9).cos())
            .collect();
        let detector = PeakDetector::new(0.05, 12).unwrap();
        let once = detector.detect(&series);
        let twice = detector.enforce_spacing(once.clone());
        assert_eq!(once, twice);
        assert!(once.indices().windows(2).all(|w| w[1] - w[0] >= 12));
    }

    #[test]
    fn test_ripple_near_breath_absorbed_by_spacing() {
        // A ripple on the rising edge is its own local maximum; spacing folds it
        // into the breath that follows.
        let series = vec![0.0, 0.2, 0.4, 0.45, 0.43, 0.6, 0.8, 1.0, 0.5, 0.0];
        let loose = PeakDetector::new(0.3, 1).unwrap().detect(&series);
        assert_eq!(loose.indices(), vec![3, 7]);

        let spaced = PeakDetector::new(0.3, 5).unwrap().detect(&series);
        assert_eq!(spaced.indices(), vec![7]);
    }

    #[test]
    fn test_plateau_reported_once() {
        let series = vec![0.0, 1.0, 1.0, 1.0, 0.0, 0.0];
        let peaks = PeakDetector::new(0.5, 1).unwrap().detect(&series);
        assert_eq!(peaks.indices(), vec![2]);
        assert_eq!(peaks.peaks()[0].prominence, 1.0);
    }

    #[test]
    fn test_mean_amplitude() {
        let series = vec![0.0, 1.0, 0.0, 3.0, 0.0];
        let peaks = PeakDetector::new(0.5, 1).unwrap().detect(&series);
        assert_eq!(peaks.mean_amplitude(), Some(2.0));
        assert_eq!(PeakSet::default().mean_amplitude(), None);
    }
}
