//! Tri-layer balance state: `base` (immutable), `user` (adjusted), `ai` (suggested).
//!
//! Every mutation either applies fully or leaves the state untouched.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::advisor::AdvisorReply;
use crate::metrics::{selection_ratio, WaveformMetrics};
use crate::oracle::ClusterId;
use crate::waveform::{Waveform, DEFAULT_WEIGHT, MAX_WEIGHT, MIN_WEIGHT};

// =============================================================================
// Adjustments
// =============================================================================

/// One entry of an Adjust request. Omitted fields keep their current value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Adjustment {
    #[serde(alias = "id")]
    pub cluster_id: ClusterId,
    #[serde(default, alias = "newCount", skip_serializing_if = "Option::is_none")]
    pub count: Option<i64>,
    #[serde(default, alias = "newWeight", skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl Adjustment {
    pub fn count(cluster_id: ClusterId, count: i64) -> Self {
        Self {
            cluster_id,
            count: Some(count),
            weight: None,
        }
    }

    pub fn weight(cluster_id: ClusterId, weight: f64) -> Self {
        Self {
            cluster_id,
            count: None,
            weight: Some(weight),
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = Some(weight);
        self
    }
}

/// Rejected Adjust request. Nothing was applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdjustError {
    #[error("unknown cluster {cluster_id}")]
    UnknownCluster { cluster_id: ClusterId },

    #[error("count {count} for cluster {cluster_id} is outside [0, {max}]")]
    CountOutOfRange {
        cluster_id: ClusterId,
        count: i64,
        max: usize,
    },

    #[error("weight {weight} for cluster {cluster_id} is outside [{min}, {max}]")]
    WeightOutOfRange {
        cluster_id: ClusterId,
        weight: f64,
        min: f64,
        max: f64,
    },
}

impl AdjustError {
    pub fn cluster_id(&self) -> ClusterId {
        match self {
            Self::UnknownCluster { cluster_id }
            | Self::CountOutOfRange { cluster_id, .. }
            | Self::WeightOutOfRange { cluster_id, .. } => *cluster_id,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Outcome of merging an advisor reply into the AI layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiMergeReport {
    /// Clusters whose count or weight had to be clamped into range.
    pub clamped: Vec<ClusterId>,
    /// Suggestions naming clusters that do not exist.
    pub ignored: Vec<ClusterId>,
    /// Clusters the reply did not mention (left at defaults).
    pub defaulted: Vec<ClusterId>,
}

/// Read-only view of all three layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WaveformSnapshot {
    pub base: Waveform,
    pub user: Waveform,
    pub ai: Option<Waveform>,
    /// Selection-ratio metrics of the user layer against base sample counts.
    pub metrics: WaveformMetrics,
    /// Effective-size metrics of the user layer.
    pub representation: WaveformMetrics,
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceState {
    base: Waveform,
    user: Waveform,
    ai: Option<Waveform>,
}

impl BalanceState {
    /// Seed `base` and `user` from a freshly built waveform.
    pub fn new(base: Waveform) -> Self {
        let mut user = base.clone();
        for peak in &mut user.peaks {
            peak.selected_count = peak.sample_count;
            peak.weight = DEFAULT_WEIGHT;
        }
        user.recompute_metrics();
        Self {
            base,
            user,
            ai: None,
        }
    }

    pub fn base(&self) -> &Waveform {
        &self.base
    }

    pub fn user(&self) -> &Waveform {
        &self.user
    }

    pub fn ai(&self) -> Option<&Waveform> {
        self.ai.as_ref()
    }

    fn sample_count(&self, id: ClusterId) -> Option<usize> {
        self.base.peak(id).map(|p| p.sample_count)
    }

    /// Validate every entry, then apply them in order (last entry wins on duplicates).
    pub fn adjust(&mut self, adjustments: &[Adjustment]) -> Result<(), AdjustError> {
        for adj in adjustments {
            let max = self
                .sample_count(adj.cluster_id)
                .filter(|_| self.user.peak(adj.cluster_id).is_some())
                .ok_or(AdjustError::UnknownCluster {
                    cluster_id: adj.cluster_id,
                })?;

            if let Some(count) = adj.count {
                if count < 0 || count as u64 > max as u64 {
                    return Err(AdjustError::CountOutOfRange {
                        cluster_id: adj.cluster_id,
                        count,
                        max,
                    });
                }
            }
            if let Some(weight) = adj.weight {
                if !(MIN_WEIGHT..=MAX_WEIGHT).contains(&weight) {
                    return Err(AdjustError::WeightOutOfRange {
                        cluster_id: adj.cluster_id,
                        weight,
                        min: MIN_WEIGHT,
                        max: MAX_WEIGHT,
                    });
                }
            }
        }

        for adj in adjustments {
            // Presence checked above.
            let Some(peak) = self.user.peak_mut(adj.cluster_id) else {
                continue;
            };
            if let Some(count) = adj.count {
                peak.selected_count = count as usize;
            }
            if let Some(weight) = adj.weight {
                peak.weight = weight;
            }
        }
        self.user.recompute_metrics();
        debug!(entries = adjustments.len(), "applied user adjustments");
        Ok(())
    }

    /// Build a fresh AI layer from `reply` and swap it in wholesale.
    ///
    /// Clusters the reply omits get `sample_count` and weight 1.0, never the
    /// previous AI values. Out-of-range numbers are clamped.
    pub fn replace_ai(&mut self, reply: &AdvisorReply) -> AiMergeReport {
        let mut ai = self.base.clone();
        for peak in &mut ai.peaks {
            peak.selected_count = peak.sample_count;
            peak.weight = DEFAULT_WEIGHT;
            peak.reasoning.clear();
        }

        let mut report = AiMergeReport::default();
        let mut addressed: HashSet<ClusterId> = HashSet::new();

        for s in &reply.suggestions {
            let Some(peak) = ai.peak_mut(s.cluster_id) else {
                warn!(cluster_id = s.cluster_id, "advisor suggested an unknown cluster");
                report.ignored.push(s.cluster_id);
                continue;
            };

            let max = peak.sample_count as i64;
            let count = s.suggested_count.clamp(0, max);
            let weight = s.suggested_weight.clamp(MIN_WEIGHT, MAX_WEIGHT);
            if count != s.suggested_count || weight != s.suggested_weight {
                warn!(
                    cluster_id = s.cluster_id,
                    suggested_count = s.suggested_count,
                    suggested_weight = s.suggested_weight,
                    "clamped advisor suggestion"
                );
                if !report.clamped.contains(&s.cluster_id) {
                    report.clamped.push(s.cluster_id);
                }
            }

            peak.selected_count = count as usize;
            peak.weight = weight;
            peak.reasoning = s.reasoning.clone();
            if let Some(label) = &s.label {
                peak.label = label.clone();
            }
            addressed.insert(s.cluster_id);
        }

        report.defaulted = ai
            .cluster_ids()
            .filter(|id| !addressed.contains(id))
            .collect();

        ai.strategy = Some(reply.overall_strategy.clone());
        ai.recompute_metrics();
        self.ai = Some(ai);
        report
    }

    /// User-layer metrics against base sample counts, computed on every call.
    pub fn user_metrics(&self) -> WaveformMetrics {
        let ratios: Vec<f64> = self
            .user
            .peaks
            .iter()
            .map(|p| selection_ratio(p.selected_count, self.sample_count(p.id).unwrap_or(0)))
            .collect();
        WaveformMetrics::from_values(&ratios)
    }

    pub fn snapshot(&self) -> WaveformSnapshot {
        WaveformSnapshot {
            base: self.base.clone(),
            user: self.user.clone(),
            ai: self.ai.clone(),
            metrics: self.user_metrics(),
            representation: self.user.representation_metrics(),
            strategy: self.ai.as_ref().and_then(|w| w.strategy.clone()),
        }
    }

    /// `(cluster id, count, weight)` per user-layer peak.
    pub fn user_selection(&self) -> Vec<(ClusterId, usize, f64)> {
        self.user
            .peaks
            .iter()
            .map(|p| (p.id, p.selected_count, p.weight))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::Suggestion;
    use crate::aggregate::ClusterSummary;
    use crate::waveform::build_waveform;
    use std::collections::HashMap;

    fn state() -> BalanceState {
        let summaries: Vec<ClusterSummary> = [(0, 60), (1, 30), (2, 10)]
            .into_iter()
            .map(|(id, n)| ClusterSummary {
                id,
                sample_count: n,
                centroid: vec![id as f64],
                spread: 0.0,
                exemplars: vec![],
                members: vec![],
            })
            .collect();
        BalanceState::new(build_waveform(&summaries, &[0.0, 0.5, 1.0], &HashMap::new()))
    }

    fn suggestion(id: ClusterId, count: i64, weight: f64) -> Suggestion {
        Suggestion {
            cluster_id: id,
            suggested_count: count,
            suggested_weight: weight,
            reasoning: format!("because {id}"),
            label: None,
        }
    }

    #[test]
    fn new_state_has_equal_independent_layers() {
        let s = state();
        assert_eq!(s.base(), s.user());
        assert!(s.ai().is_none());
    }

    #[test]
    fn adjust_updates_only_user_and_recomputes() {
        let mut s = state();
        s.adjust(&[Adjustment::count(0, 30)]).unwrap();

        assert_eq!(s.user().peak(0).unwrap().selected_count, 30);
        assert_eq!(s.base().peak(0).unwrap().selected_count, 60);

        let m = s.user_metrics();
        assert!((m.avg_amplitude - 2.5 / 3.0).abs() < 1e-12);
        assert!(m.gini_coefficient > 0.0);
        assert_eq!(m.flatness_score, 1.0 - m.gini_coefficient);
        assert_eq!(s.user().metrics, m);
    }

    #[test]
    fn adjust_partial_fields_keep_prior_values() {
        let mut s = state();
        s.adjust(&[Adjustment::count(1, 12).with_weight(1.5)])
            .unwrap();
        s.adjust(&[Adjustment::weight(1, 0.5)]).unwrap();
        let p = s.user().peak(1).unwrap();
        assert_eq!(p.selected_count, 12);
        assert_eq!(p.weight, 0.5);
    }

    #[test]
    fn adjust_is_atomic() {
        let mut s = state();
        let before = s.clone();
        let err = s
            .adjust(&[Adjustment::count(0, 10), Adjustment::count(2, 11)])
            .unwrap_err();
        assert_eq!(
            err,
            AdjustError::CountOutOfRange {
                cluster_id: 2,
                count: 11,
                max: 10
            }
        );
        assert_eq!(s, before);
    }

    #[test]
    fn adjust_rejects_unknown_negative_and_bad_weight() {
        let mut s = state();
        assert_eq!(
            s.adjust(&[Adjustment::count(9, 1)]).unwrap_err(),
            AdjustError::UnknownCluster { cluster_id: 9 }
        );
        assert!(matches!(
            s.adjust(&[Adjustment::count(0, -1)]),
            Err(AdjustError::CountOutOfRange { count: -1, .. })
        ));
        assert!(matches!(
            s.adjust(&[Adjustment::weight(1, 2.5)]),
            Err(AdjustError::WeightOutOfRange { cluster_id: 1, .. })
        ));
        assert!(matches!(
            s.adjust(&[Adjustment::weight(1, f64::NAN)]),
            Err(AdjustError::WeightOutOfRange { .. })
        ));
        assert_eq!(s.user(), s.base());
    }

    #[test]
    fn adjust_duplicates_last_wins() {
        let mut s = state();
        s.adjust(&[Adjustment::count(0, 5), Adjustment::count(0, 7)])
            .unwrap();
        assert_eq!(s.user().peak(0).unwrap().selected_count, 7);
    }

    #[test]
    fn replace_ai_discards_previous_layer() {
        let mut s = state();
        s.replace_ai(&AdvisorReply {
            suggestions: vec![suggestion(0, 20, 0.5), suggestion(1, 25, 1.2)],
            overall_strategy: "first".into(),
        });
        let report = s.replace_ai(&AdvisorReply {
            suggestions: vec![suggestion(0, 40, 0.8)],
            overall_strategy: "second".into(),
        });

        let ai = s.ai().unwrap();
        assert_eq!(ai.peak(0).unwrap().selected_count, 40);
        assert_eq!(ai.peak(0).unwrap().weight, 0.8);
        // Cluster 1 was omitted: defaults, not the first reply's values.
        assert_eq!(ai.peak(1).unwrap().selected_count, 30);
        assert_eq!(ai.peak(1).unwrap().weight, 1.0);
        assert_eq!(ai.peak(1).unwrap().reasoning, "");
        assert_eq!(ai.strategy.as_deref(), Some("second"));
        assert_eq!(report.defaulted, vec![1, 2]);
        assert_eq!(s.snapshot().strategy.as_deref(), Some("second"));
    }

    #[test]
    fn replace_ai_clamps_and_ignores() {
        let mut s = state();
        let report = s.replace_ai(&AdvisorReply {
            suggestions: vec![
                suggestion(2, 500, 5.0),
                suggestion(1, -3, 0.0),
                suggestion(42, 1, 1.0),
            ],
            overall_strategy: "x".into(),
        });
        let ai = s.ai().unwrap();
        assert_eq!(ai.peak(2).unwrap().selected_count, 10);
        assert_eq!(ai.peak(2).unwrap().weight, MAX_WEIGHT);
        assert_eq!(ai.peak(1).unwrap().selected_count, 0);
        assert_eq!(ai.peak(1).unwrap().weight, MIN_WEIGHT);
        assert_eq!(report.clamped, vec![2, 1]);
        assert_eq!(report.ignored, vec![42]);
        // User layer is never touched by the advisor.
        assert_eq!(s.user(), s.base());
    }

    #[test]
    fn snapshot_metrics_follow_user_layer() {
        let mut s = state();
        s.adjust(&[Adjustment::count(0, 30)]).unwrap();
        let snap = s.snapshot();
        assert!((snap.metrics.avg_amplitude - 0.8333333333333334).abs() < 1e-9);
        assert_eq!(snap.metrics, s.user_metrics());
        assert!(snap.ai.is_none());
        assert!(snap.strategy.is_none());
    }
}
