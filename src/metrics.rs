//! Inequality metrics over per-cluster distributions.
//!
//! The Gini coefficient uses the sorted-sum form:
//!
//! ```text
//! gini = (2 · Σ i·s[i]) / (n · Σ s) − (n + 1) / n      (s sorted ascending, i from 1)
//! ```
//!
//! Empty input and all-zero input are defined as perfectly equal (gini = 0).
//! Flatness is always `1 − gini`, computed from the same clamped value so the
//! complement holds exactly.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Gini coefficient of a distribution of non-negative values, in `[0, 1]`.
///
/// Negative and non-finite entries are treated as zero.
pub fn gini_coefficient(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted: Vec<f64> = values
        .iter()
        .map(|&v| if v.is_finite() && v > 0.0 { v } else { 0.0 })
        .collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let total: f64 = sorted.iter().sum();
    if total <= 0.0 {
        return 0.0;
    }

    let n = sorted.len() as f64;
    let weighted: f64 = sorted
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64 + 1.0) * v)
        .sum();

    let gini = (2.0 * weighted) / (n * total) - (n + 1.0) / n;
    gini.clamp(0.0, 1.0)
}

/// Flatness score: `1 − gini`. Higher means more balanced.
pub fn flatness_score(values: &[f64]) -> f64 {
    1.0 - gini_coefficient(values)
}

/// Aggregate metrics attached to every waveform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformMetrics {
    pub gini_coefficient: f64,
    pub flatness_score: f64,
    /// Arithmetic mean of the input values.
    pub avg_amplitude: f64,
}

impl WaveformMetrics {
    /// Compute the metric triple over one value per cluster.
    ///
    /// An empty input yields gini 0 and an average amplitude of 1.0 (a
    /// waveform with no peaks is trivially "fully selected").
    pub fn from_values(values: &[f64]) -> Self {
        let gini = gini_coefficient(values);
        let avg_amplitude = if values.is_empty() {
            1.0
        } else {
            let finite: f64 = values.iter().filter(|v| v.is_finite()).sum();
            finite / values.len() as f64
        };
        Self {
            gini_coefficient: gini,
            flatness_score: 1.0 - gini,
            avg_amplitude,
        }
    }
}

impl Default for WaveformMetrics {
    fn default() -> Self {
        Self::from_values(&[])
    }
}

/// Selection ratio of one peak: `count / sample_count`, or 1.0 for an empty cluster.
pub fn selection_ratio(count: usize, sample_count: usize) -> f64 {
    if sample_count == 0 {
        1.0
    } else {
        count as f64 / sample_count as f64
    }
}
