//! Advisor context: the structured view of a session sent with every request.

use serde::Serialize;

use crate::oracle::ClusterId;
use crate::session::state::BalanceState;

/// Exemplars per cluster included in the context.
const CONTEXT_SAMPLES: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterContext {
    pub id: ClusterId,
    pub label: String,
    pub x: f64,
    pub sample_count: usize,
    pub user_count: usize,
    pub user_weight: f64,
    /// Previous AI suggestion, for continuity.
    pub previous_ai: Option<(usize, f64)>,
    pub samples: Vec<String>,
}

impl ClusterContext {
    pub fn user_ratio(&self) -> f64 {
        crate::metrics::selection_ratio(self.user_count, self.sample_count)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorContext {
    pub total_rows: usize,
    pub columns: Vec<String>,
    pub clusters: Vec<ClusterContext>,
    pub previous_strategy: Option<String>,
    pub user_request: Option<String>,
}

impl AdvisorContext {
    /// Build from base sizes, current user selection and the prior AI layer.
    pub fn from_state(state: &BalanceState, columns: &[String], request: Option<&str>) -> Self {
        let clusters = state
            .base()
            .peaks
            .iter()
            .map(|base| {
                let user = state.user().peak(base.id);
                let previous_ai = state
                    .ai()
                    .and_then(|ai| ai.peak(base.id))
                    .map(|p| (p.selected_count, p.weight));
                ClusterContext {
                    id: base.id,
                    label: base.label.clone(),
                    x: base.x,
                    sample_count: base.sample_count,
                    user_count: user.map_or(base.sample_count, |p| p.selected_count),
                    user_weight: user.map_or(1.0, |p| p.weight),
                    previous_ai,
                    samples: base.samples.iter().take(CONTEXT_SAMPLES).cloned().collect(),
                }
            })
            .collect();

        Self {
            total_rows: state.base().total_points,
            columns: columns.to_vec(),
            clusters,
            previous_strategy: state.ai().and_then(|ai| ai.strategy.clone()),
            user_request: request
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        }
    }

    /// Plain-text rendering used inside prompts.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Dataset overview:\n");
        out.push_str(&format!("- Total rows: {}\n", self.total_rows));
        out.push_str(&format!("- Clusters: {}\n", self.clusters.len()));
        if !self.columns.is_empty() {
            out.push_str(&format!("- Columns: {}\n", self.columns.join(", ")));
        }
        if let Some(strategy) = &self.previous_strategy {
            out.push_str(&format!("- Previous strategy: {strategy}\n"));
        }

        out.push_str("\nClusters (current state):\n");
        for c in &self.clusters {
            out.push_str(&format!("\nCluster {} - {}:\n", c.id, c.label));
            out.push_str(&format!("  - Original size: {} rows\n", c.sample_count));
            if let Some((count, weight)) = c.previous_ai {
                out.push_str(&format!(
                    "  - Previous AI suggestion: {count} rows, weight {weight:.2}x\n"
                ));
            }
            out.push_str(&format!(
                "  - User selection: {} rows ({:.1}%), weight {:.2}x\n",
                c.user_count,
                c.user_ratio() * 100.0,
                c.user_weight
            ));
            out.push_str(&format!("  - Position: {:.0}% along the layout\n", c.x * 100.0));
            if !c.samples.is_empty() {
                out.push_str(&format!("  - Examples: {}\n", c.samples.join(" | ")));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advisor::{AdvisorReply, Suggestion};
    use crate::aggregate::ClusterSummary;
    use crate::session::state::Adjustment;
    use crate::waveform::build_waveform;
    use std::collections::HashMap;

    fn state() -> BalanceState {
        let summaries = vec![
            ClusterSummary {
                id: 0,
                sample_count: 8,
                centroid: vec![0.0],
                spread: 0.0,
                exemplars: vec!["a".into(), "b".into(), "c".into(), "d".into()],
                members: vec![],
            },
            ClusterSummary {
                id: 5,
                sample_count: 2,
                centroid: vec![1.0],
                spread: 0.0,
                exemplars: vec!["z".into()],
                members: vec![],
            },
        ];
        BalanceState::new(build_waveform(&summaries, &[0.0, 1.0], &HashMap::new()))
    }

    #[test]
    fn context_carries_all_three_layers() {
        let mut s = state();
        s.adjust(&[Adjustment::count(0, 4)]).unwrap();
        s.replace_ai(&AdvisorReply {
            suggestions: vec![Suggestion {
                cluster_id: 5,
                suggested_count: 2,
                suggested_weight: 1.8,
                reasoning: "rare".into(),
                label: None,
            }],
            overall_strategy: "boost the tail".into(),
        });

        let ctx = AdvisorContext::from_state(&s, &["text".into()], Some("  "));
        assert_eq!(ctx.total_rows, 10);
        assert_eq!(ctx.clusters[0].user_count, 4);
        assert_eq!(ctx.clusters[0].samples.len(), 3);
        assert_eq!(ctx.clusters[1].previous_ai, Some((2, 1.8)));
        assert_eq!(ctx.previous_strategy.as_deref(), Some("boost the tail"));
        assert!(ctx.user_request.is_none());

        let text = ctx.render();
        assert!(text.contains("Cluster 0 - Cluster 0"));
        assert!(text.contains("User selection: 4 rows (50.0%)"));
        assert!(text.contains("Previous AI suggestion: 2 rows, weight 1.80x"));
    }
}
