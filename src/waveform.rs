//! Waveform model: one peak per cluster, laid out along a single axis.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::aggregate::ClusterSummary;
use crate::metrics::{selection_ratio, WaveformMetrics};
use crate::oracle::{ClusterId, NOISE};

pub const MIN_WEIGHT: f64 = 0.01;
pub const MAX_WEIGHT: f64 = 2.0;
pub const DEFAULT_WEIGHT: f64 = 1.0;

pub const NOISE_LABEL: &str = "Uncategorized";

/// Advisor-supplied prose for one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescription {
    pub label: String,
    pub summary: String,
}

impl ClusterDescription {
    /// Deterministic label used whenever the advisor has nothing to say.
    pub fn placeholder(id: ClusterId) -> Self {
        let label = if id == NOISE {
            NOISE_LABEL.to_string()
        } else {
            format!("Cluster {id}")
        };
        Self {
            label,
            summary: String::new(),
        }
    }
}

/// A cluster's representation within one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peak {
    pub id: ClusterId,
    /// Layout position in `[0, 1]`.
    pub x: f64,
    /// Rows originally in the cluster.
    pub sample_count: usize,
    /// Selected count in base/user layers, suggested count in the AI layer.
    pub selected_count: usize,
    pub weight: f64,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub reasoning: String,
    pub spread: f64,
    pub color: String,
    #[serde(default)]
    pub samples: Vec<String>,
}

impl Peak {
    pub fn selection_ratio(&self) -> f64 {
        selection_ratio(self.selected_count, self.sample_count)
    }

    /// `count × weight`: how much of the output this cluster contributes.
    pub fn effective_size(&self) -> f64 {
        self.selected_count as f64 * self.weight
    }
}

/// All peaks of one layer plus aggregate metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waveform {
    /// Sorted by `x`, ties broken by cluster id.
    pub peaks: Vec<Peak>,
    pub total_points: usize,
    /// Metrics over per-peak selection ratios.
    pub metrics: WaveformMetrics,
    /// Metrics over per-peak effective sizes.
    pub representation: WaveformMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

impl Waveform {
    pub fn peak(&self, id: ClusterId) -> Option<&Peak> {
        self.peaks.iter().find(|p| p.id == id)
    }

    pub fn peak_mut(&mut self, id: ClusterId) -> Option<&mut Peak> {
        self.peaks.iter_mut().find(|p| p.id == id)
    }

    pub fn cluster_ids(&self) -> impl Iterator<Item = ClusterId> + '_ {
        self.peaks.iter().map(|p| p.id)
    }

    pub fn selection_metrics(&self) -> WaveformMetrics {
        let ratios: Vec<f64> = self.peaks.iter().map(Peak::selection_ratio).collect();
        WaveformMetrics::from_values(&ratios)
    }

    pub fn representation_metrics(&self) -> WaveformMetrics {
        let sizes: Vec<f64> = self.peaks.iter().map(Peak::effective_size).collect();
        WaveformMetrics::from_values(&sizes)
    }

    /// Refresh both metric triples from the current peaks.
    pub fn recompute_metrics(&mut self) {
        self.metrics = self.selection_metrics();
        self.representation = self.representation_metrics();
    }

    /// Sum of selected counts across peaks.
    pub fn selected_total(&self) -> usize {
        self.peaks.iter().map(|p| p.selected_count).sum()
    }
}

/// Assemble the initial waveform: every row selected, weight 1.0.
///
/// `positions[i]` is the layout position of `summaries[i]`. Clusters without
/// an entry in `descriptions` get the placeholder label.
pub fn build_waveform(
    summaries: &[ClusterSummary],
    positions: &[f64],
    descriptions: &HashMap<ClusterId, ClusterDescription>,
) -> Waveform {
    let mut peaks: Vec<Peak> = summaries
        .iter()
        .zip(positions)
        .map(|(summary, &x)| {
            let description = descriptions
                .get(&summary.id)
                .cloned()
                .unwrap_or_else(|| ClusterDescription::placeholder(summary.id));
            Peak {
                id: summary.id,
                x: if x.is_finite() { x } else { 0.5 },
                sample_count: summary.sample_count,
                selected_count: summary.sample_count,
                weight: DEFAULT_WEIGHT,
                label: description.label,
                description: description.summary,
                reasoning: String::new(),
                spread: summary.spread,
                color: String::new(),
                samples: summary.exemplars.clone(),
            }
        })
        .collect();

    peaks.sort_by(|a, b| {
        a.x.partial_cmp(&b.x)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let n = peaks.len();
    for (i, peak) in peaks.iter_mut().enumerate() {
        peak.color = rainbow_color(i, n);
    }

    let mut waveform = Waveform {
        peaks,
        total_points: summaries.iter().map(|s| s.sample_count).sum(),
        metrics: WaveformMetrics::default(),
        representation: WaveformMetrics::default(),
        strategy: None,
    };
    waveform.recompute_metrics();
    waveform
}

/// Hex colour from an HSL rainbow (saturation 70%, lightness 60%) by layout index.
pub fn rainbow_color(index: usize, total: usize) -> String {
    let hue = (index as f64 / total.max(1) as f64) * 360.0;
    let h = hue / 60.0;
    let c = 0.7 * 0.8;
    let x = c * (1.0 - ((h % 2.0) - 1.0).abs());
    let m = 0.6 - c / 2.0;

    let (r, g, b) = match h {
        h if h < 1.0 => (c, x, 0.0),
        h if h < 2.0 => (x, c, 0.0),
        h if h < 3.0 => (0.0, c, x),
        h if h < 4.0 => (0.0, x, c),
        h if h < 5.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let byte = |v: f64| ((v + m) * 255.0) as u8;
    format!("#{:02x}{:02x}{:02x}", byte(r), byte(g), byte(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(id: ClusterId, size: usize) -> ClusterSummary {
        ClusterSummary {
            id,
            sample_count: size,
            centroid: vec![0.0],
            spread: 0.1,
            exemplars: vec![format!("example of {id}")],
            members: (0..size).collect(),
        }
    }

    #[test]
    fn build_sorts_by_position_then_id() {
        let summaries = vec![summary(0, 60), summary(1, 30), summary(2, 10)];
        let wf = build_waveform(&summaries, &[0.9, 0.1, 0.1], &HashMap::new());

        let ids: Vec<ClusterId> = wf.peaks.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2, 0]);
        assert_eq!(wf.total_points, 100);
        assert_eq!(wf.peaks[0].label, "Cluster 1");
        assert!(wf.peaks.iter().all(|p| p.selected_count == p.sample_count));
        assert!(wf.peaks.iter().all(|p| p.weight == DEFAULT_WEIGHT));
    }

    #[test]
    fn fresh_waveform_metrics() {
        let summaries = vec![summary(0, 60), summary(1, 30), summary(2, 10)];
        let wf = build_waveform(&summaries, &[0.0, 0.5, 1.0], &HashMap::new());

        assert_eq!(wf.metrics.gini_coefficient, 0.0);
        assert_eq!(wf.metrics.avg_amplitude, 1.0);
        assert!((wf.representation.gini_coefficient - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(
            wf.representation.flatness_score,
            1.0 - wf.representation.gini_coefficient
        );
    }

    #[test]
    fn descriptions_and_noise_label() {
        let summaries = vec![summary(NOISE, 4), summary(3, 8)];
        let mut descriptions = HashMap::new();
        descriptions.insert(
            3,
            ClusterDescription {
                label: "Recipes".into(),
                summary: "Cooking instructions".into(),
            },
        );
        let wf = build_waveform(&summaries, &[0.0, 1.0], &descriptions);
        assert_eq!(wf.peak(NOISE).unwrap().label, NOISE_LABEL);
        assert_eq!(wf.peak(3).unwrap().label, "Recipes");
        assert_eq!(wf.peak(3).unwrap().description, "Cooking instructions");
    }

    #[test]
    fn empty_cluster_ratio_is_one() {
        let mut wf = build_waveform(&[summary(0, 5)], &[0.5], &HashMap::new());
        wf.peaks[0].sample_count = 0;
        wf.peaks[0].selected_count = 0;
        assert_eq!(wf.selection_metrics().avg_amplitude, 1.0);
    }

    #[test]
    fn rainbow_starts_red_and_is_hex() {
        // Hue 0: r = 0.56 + 0.32, g = b = 0.32.
        assert_eq!(rainbow_color(0, 3), "#e05151");
        for i in 0..7 {
            let c = rainbow_color(i, 7);
            assert_eq!(c.len(), 7);
            assert!(c.starts_with('#'));
        }
    }

    #[test]
    fn serializes_camel_case() {
        let wf = build_waveform(&[summary(0, 2)], &[0.5], &HashMap::new());
        let json = serde_json::to_value(&wf).unwrap();
        assert_eq!(json["peaks"][0]["selectedCount"], 2);
        assert_eq!(json["totalPoints"], 2);
        assert!(json["metrics"]["flatnessScore"].is_number());
        assert!(json.get("strategy").is_none());
    }
}
