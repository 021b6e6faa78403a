//! Shared numeric helpers
//!
//! - [`OnlineStats`]: Welford's online mean/variance accumulator
//! - [`sample_std_dev`]: Bessel-corrected standard deviation over a slice
//! - [`percentile`]: nearest-rank (ceiling) percentile
//! - [`summarize`]: count/min/max/mean/stdev/p95 in one pass plus a sort
//!
//! The percentile is deliberately nearest-rank, not linear interpolation:
//! `index = ceil(p * n) - 1`, clamped to `[0, n - 1]`.

use serde::{Deserialize, Serialize};

/// Percentile reported in every window summary.
pub const SUMMARY_PERCENTILE: f64 = 0.95;

// ============================================================================
// Online statistics
// ============================================================================

/// Running count, mean and sum of squared deviations (M2).
///
/// `variance = m2 / (count - 1)` for `count > 1`, else `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl OnlineStats {
    pub const fn new() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
        }
    }

    /// Fold one sample into the running statistics (Welford).
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;
    }

    pub const fn count(&self) -> u64 {
        self.count
    }

    pub const fn mean(&self) -> f64 {
        self.mean
    }

    pub fn variance(&self) -> f64 {
        if self.count > 1 {
            self.m2 / (self.count - 1) as f64
        } else {
            0.0
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Absolute z-score of `value` against the current mean/stdev.
    ///
    /// Returns `None` when the standard deviation is not above `min_std`.
    pub fn z_score(&self, value: f64, min_std: f64) -> Option<f64> {
        let std = self.std_dev();
        (std > min_std).then(|| (value - self.mean).abs() / std)
    }
}

// ============================================================================
// Slice helpers
// ============================================================================

/// Arithmetic mean, `0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation with Bessel's correction; `0` for `n <= 1`.
pub fn sample_std_dev(values: &[f64]) -> f64 {
    if values.len() <= 1 {
        return 0.0;
    }
    let m = mean(values);
    let sum_sq: f64 = values.iter().map(|v| (v - m) * (v - m)).sum();
    (sum_sq / (values.len() - 1) as f64).sqrt()
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    let rank = (p * n as f64).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}

/// Nearest-rank percentile (`p` in `[0, 1]`); `0` for an empty slice.
///
/// `percentile(&[1, 2, 3, 4, 5, 100], 0.95) == 100` because
/// `ceil(0.95 * 6) - 1 = 5`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

/// Descriptive statistics over one window of values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub p95: f64,
}

/// Summarize a set of values; `None` when empty.
pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    Some(Summary {
        count: sorted.len() as u64,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        mean: mean(&sorted),
        std_dev: sample_std_dev(&sorted),
        p95: percentile_sorted(&sorted, SUMMARY_PERCENTILE),
    })
}

// ============================================================================
// Tests
// ============================================================================
