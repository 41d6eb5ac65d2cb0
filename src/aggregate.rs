//! Cluster aggregation: per-cluster size, centroid, spread and exemplars.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::distance::{cosine_distance, euclidean, widen};
use crate::oracle::{ClusterId, NOISE};

/// What to do with rows the assigner labelled [`NOISE`].
///
/// Every policy keeps the rows, so the cluster sizes always sum to the row count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "kind", content = "cluster")]
pub enum NoisePolicy {
    /// Noise rows form their own cluster with id `-1`.
    #[default]
    OwnCluster,
    /// Noise rows are relabelled to the given cluster id.
    FoldInto(ClusterId),
}

impl NoisePolicy {
    /// Apply the policy to a raw assignment vector.
    pub fn apply(&self, ids: &[ClusterId]) -> Vec<ClusterId> {
        match *self {
            NoisePolicy::OwnCluster => ids.to_vec(),
            NoisePolicy::FoldInto(target) => ids
                .iter()
                .map(|&id| if id == NOISE { target } else { id })
                .collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("{rows} rows but {assignments} cluster assignments")]
    AssignmentLength { rows: usize, assignments: usize },

    #[error("{rows} rows but {embeddings} embeddings")]
    EmbeddingLength { rows: usize, embeddings: usize },

    #[error("embedding at row {row} has dimension {got}, expected {expected}")]
    Dimension {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("no rows to aggregate")]
    Empty,
}

/// Per-cluster statistics computed once per dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: ClusterId,
    pub sample_count: usize,
    #[serde(skip)]
    pub centroid: Vec<f64>,
    /// Population std-dev of member distances to the centroid.
    pub spread: f64,
    /// Texts of the rows nearest the centroid by cosine distance.
    pub exemplars: Vec<String>,
    /// Original row indices of the members, ascending.
    #[serde(skip)]
    pub members: Vec<usize>,
}

impl ClusterSummary {
    pub fn is_noise(&self) -> bool {
        self.id == NOISE
    }
}

/// Group rows by cluster id and compute summaries, ordered by cluster id.
///
/// `texts[i]`, `embeddings[i]` and `ids[i]` describe row `i`. `ids` must
/// already have the noise policy applied.
pub fn aggregate(
    texts: &[String],
    embeddings: &[Vec<f32>],
    ids: &[ClusterId],
    exemplar_count: usize,
) -> Result<Vec<ClusterSummary>, AggregateError> {
    if texts.is_empty() {
        return Err(AggregateError::Empty);
    }
    if ids.len() != texts.len() {
        return Err(AggregateError::AssignmentLength {
            rows: texts.len(),
            assignments: ids.len(),
        });
    }
    if embeddings.len() != texts.len() {
        return Err(AggregateError::EmbeddingLength {
            rows: texts.len(),
            embeddings: embeddings.len(),
        });
    }
    let dim = embeddings[0].len();
    if let Some((row, v)) = embeddings.iter().enumerate().find(|(_, v)| v.len() != dim) {
        return Err(AggregateError::Dimension {
            row,
            expected: dim,
            got: v.len(),
        });
    }

    let mut groups: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
    for (row, &id) in ids.iter().enumerate() {
        groups.entry(id).or_default().push(row);
    }

    let mut summaries = Vec::with_capacity(groups.len());
    for (id, members) in groups {
        if members.is_empty() {
            warn!(cluster_id = id, "skipping empty cluster");
            continue;
        }
        let vectors: Vec<Vec<f64>> = members.iter().map(|&r| widen(&embeddings[r])).collect();
        let centroid = mean(&vectors, dim);
        let spread = distance_spread(&vectors, &centroid);
        let exemplars = nearest_exemplars(&members, &vectors, &centroid, exemplar_count)
            .into_iter()
            .map(|r| texts[r].clone())
            .collect();

        debug!(
            cluster_id = id,
            size = members.len(),
            spread,
            "aggregated cluster"
        );
        summaries.push(ClusterSummary {
            id,
            sample_count: members.len(),
            centroid,
            spread,
            exemplars,
            members,
        });
    }
    Ok(summaries)
}

fn mean(vectors: &[Vec<f64>], dim: usize) -> Vec<f64> {
    let mut sum = vec![0.0; dim];
    for v in vectors {
        for (s, x) in sum.iter_mut().zip(v) {
            *s += x;
        }
    }
    let n = vectors.len().max(1) as f64;
    sum.into_iter().map(|s| s / n).collect()
}

fn distance_spread(vectors: &[Vec<f64>], centroid: &[f64]) -> f64 {
    let dists: Vec<f64> = vectors.iter().map(|v| euclidean(v, centroid)).collect();
    let n = dists.len() as f64;
    let mu = dists.iter().sum::<f64>() / n;
    (dists.iter().map(|d| (d - mu) * (d - mu)).sum::<f64>() / n).sqrt()
}

/// Row indices of the `k` members nearest the centroid, nearest first.
/// Small clusters return every member in original order.
fn nearest_exemplars(
    members: &[usize],
    vectors: &[Vec<f64>],
    centroid: &[f64],
    k: usize,
) -> Vec<usize> {
    if members.len() <= k {
        return members.to_vec();
    }
    let mut ranked: Vec<(usize, f64)> = members
        .iter()
        .zip(vectors)
        .map(|(&row, v)| (row, cosine_distance(v, centroid)))
        .collect();
    // Stable sort keeps original order among equal distances.
    ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    ranked.into_iter().take(k).map(|(row, _)| row).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("row {i}")).collect()
    }

    #[test]
    fn sizes_sum_to_row_count_with_noise_kept() {
        let ids = vec![0, 1, NOISE, 0, 1, 0, NOISE];
        let emb: Vec<Vec<f32>> = (0..7).map(|i| vec![i as f32, 1.0]).collect();
        let out = aggregate(&texts(7), &emb, &ids, 5).unwrap();

        let total: usize = out.iter().map(|c| c.sample_count).sum();
        assert_eq!(total, 7);
        assert_eq!(out.iter().map(|c| c.id).collect::<Vec<_>>(), vec![-1, 0, 1]);
        assert!(out[0].is_noise());
        assert_eq!(out[1].members, vec![0, 3, 5]);
    }

    #[test]
    fn fold_policy_relabels_noise() {
        let ids = vec![0, NOISE, 2, NOISE];
        assert_eq!(NoisePolicy::FoldInto(0).apply(&ids), vec![0, 0, 2, 0]);
        assert_eq!(NoisePolicy::OwnCluster.apply(&ids), ids);
    }

    #[test]
    fn centroid_and_spread() {
        // Distances to centroid (1, 0): 1, 1 → spread 0.
        let emb = vec![vec![0.0f32, 0.0], vec![2.0, 0.0]];
        let out = aggregate(&texts(2), &emb, &[4, 4], 5).unwrap();
        assert_eq!(out[0].centroid, vec![1.0, 0.0]);
        assert!(out[0].spread.abs() < 1e-12);

        // Distances to centroid (0, 0): 0, 2, 2 → std = sqrt(8/9).
        let emb = vec![vec![0.0f32, 0.0], vec![2.0, 0.0], vec![-2.0, 0.0]];
        let out = aggregate(&texts(3), &emb, &[1, 1, 1], 5).unwrap();
        assert!((out[0].spread - (8.0f64 / 9.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn exemplars_are_nearest_by_cosine() {
        // Centroid points roughly along +x; rows 1 and 3 are exactly on it.
        let emb = vec![
            vec![0.0f32, 1.0],
            vec![1.0, 0.0],
            vec![0.7, 0.7],
            vec![3.0, 0.0],
            vec![1.0, -0.2],
            vec![2.0, 0.1],
        ];
        let out = aggregate(&texts(6), &emb, &[0; 6], 2).unwrap();
        let ex = &out[0].exemplars;
        assert_eq!(ex.len(), 2);
        assert!(ex.contains(&"row 5".to_string()) || ex.contains(&"row 1".to_string()));
        assert!(!ex.contains(&"row 0".to_string()));
    }

    #[test]
    fn small_cluster_returns_all_members_in_order() {
        let emb = vec![vec![1.0f32, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]];
        let out = aggregate(&texts(3), &emb, &[7, 7, 7], 5).unwrap();
        assert_eq!(out[0].exemplars, vec!["row 0", "row 1", "row 2"]);
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let emb = vec![vec![1.0f32]; 3];
        assert!(matches!(
            aggregate(&texts(3), &emb, &[0, 0], 5),
            Err(AggregateError::AssignmentLength {
                rows: 3,
                assignments: 2
            })
        ));
        assert!(matches!(
            aggregate(&texts(0), &[], &[], 5),
            Err(AggregateError::Empty)
        ));
    }
}
