//! Cluster assignment providers.
//!
//! Two strategies sit behind [`ClusterAssigner`]:
//!
//! - [`KMeansAssigner`]: centroid-based, every row gets a cluster.
//! - [`DbscanAssigner`]: density-based over cosine distance, may emit [`NOISE`].
//!
//! Both are CPU-bound and run on the blocking pool so other sessions keep
//! making progress while a large dataset is clustered.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distance::{cosine_distance, euclidean_squared, l2_normalize, widen};
use crate::oracle::{ClusterAssigner, ClusterId, OracleError, NOISE};

/// Which clustering strategy to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ClusterAlgorithm {
    #[default]
    Kmeans,
    Dbscan,
}

// =============================================================================
// K-MEANS
// =============================================================================

/// Lloyd's k-means on L2-normalized vectors with deterministic seeding.
#[derive(Debug, Clone)]
pub struct KMeansAssigner {
    /// Fixed k. `None` picks `clamp(round(sqrt(n / 2)), 2, 12)`.
    pub k: Option<usize>,
    pub max_iters: usize,
}

impl Default for KMeansAssigner {
    fn default() -> Self {
        Self {
            k: None,
            max_iters: 100,
        }
    }
}

impl KMeansAssigner {
    pub fn new(k: Option<usize>, max_iters: usize) -> Self {
        Self { k, max_iters }
    }

    pub fn auto_k(n: usize) -> usize {
        let k = ((n as f64 / 2.0).sqrt()).round() as usize;
        k.clamp(2, 12)
    }

    /// Synchronous core, exposed for tests and callers already off the runtime.
    pub fn assign_blocking(&self, vectors: &[Vec<f32>]) -> Result<Vec<ClusterId>, OracleError> {
        if vectors.is_empty() {
            return Err(OracleError::Clustering("no vectors to cluster".into()));
        }
        let points: Vec<Vec<f64>> = vectors
            .iter()
            .map(|v| {
                let mut w = widen(v);
                l2_normalize(&mut w);
                w
            })
            .collect();

        let k = self.k.unwrap_or_else(|| Self::auto_k(points.len()));
        if k == 0 {
            return Err(OracleError::Clustering("k must be at least 1".into()));
        }
        let k = k.min(points.len());

        let mut centroids = farthest_point_seeds(&points, k);
        let mut assignments = vec![0usize; points.len()];

        for iter in 0..self.max_iters.max(1) {
            let mut changed = false;
            for (i, p) in points.iter().enumerate() {
                let nearest = nearest_centroid(p, &centroids);
                if nearest != assignments[i] {
                    assignments[i] = nearest;
                    changed = true;
                }
            }
            if !changed && iter > 0 {
                debug!(iterations = iter, k, "k-means converged");
                break;
            }
            centroids = recompute_centroids(&points, &assignments, &centroids);
        }

        Ok(relabel_by_size(&assignments))
    }
}

#[async_trait::async_trait]
impl ClusterAssigner for KMeansAssigner {
    async fn assign(&self, vectors: &[Vec<f32>]) -> Result<Vec<ClusterId>, OracleError> {
        let this = self.clone();
        let vectors = vectors.to_vec();
        tokio::task::spawn_blocking(move || this.assign_blocking(&vectors)).await?
    }

    fn name(&self) -> &str {
        "kmeans"
    }
}

/// Deterministic k-means++ approximation: start at row 0, then repeatedly take
/// the point farthest from every chosen seed.
fn farthest_point_seeds(points: &[Vec<f64>], k: usize) -> Vec<Vec<f64>> {
    let mut seeds = vec![points[0].clone()];
    let mut min_dist = vec![f64::MAX; points.len()];

    while seeds.len() < k {
        let Some(last) = seeds.last() else { break };
        for (i, p) in points.iter().enumerate() {
            let d = euclidean_squared(p, last);
            if d < min_dist[i] {
                min_dist[i] = d;
            }
        }
        let (idx, best) = min_dist
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .map(|(i, d)| (i, *d))
            .unwrap_or((0, 0.0));
        if best <= 1e-12 {
            // Fewer distinct points than k.
            break;
        }
        seeds.push(points[idx].clone());
    }
    seeds
}

fn nearest_centroid(p: &[f64], centroids: &[Vec<f64>]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, euclidean_squared(p, c)))
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn recompute_centroids(
    points: &[Vec<f64>],
    assignments: &[usize],
    previous: &[Vec<f64>],
) -> Vec<Vec<f64>> {
    let dim = points[0].len();
    let mut sums = vec![vec![0.0; dim]; previous.len()];
    let mut counts = vec![0usize; previous.len()];
    for (p, &c) in points.iter().zip(assignments) {
        counts[c] += 1;
        for (s, x) in sums[c].iter_mut().zip(p) {
            *s += x;
        }
    }
    sums.into_iter()
        .zip(counts)
        .zip(previous)
        .map(|((mut sum, count), prev)| {
            if count == 0 {
                // Empty cluster keeps its old centroid.
                return prev.clone();
            }
            for s in sum.iter_mut() {
                *s /= count as f64;
            }
            sum
        })
        .collect()
}

/// Renumber clusters so id 0 is the largest, ties broken by first appearance.
fn relabel_by_size(assignments: &[usize]) -> Vec<ClusterId> {
    let k = assignments.iter().copied().max().map_or(0, |m| m + 1);
    let mut counts = vec![0usize; k];
    let mut first_seen = vec![usize::MAX; k];
    for (row, &c) in assignments.iter().enumerate() {
        counts[c] += 1;
        if first_seen[c] == usize::MAX {
            first_seen[c] = row;
        }
    }
    let mut order: Vec<usize> = (0..k).filter(|&c| counts[c] > 0).collect();
    order.sort_by(|&a, &b| counts[b].cmp(&counts[a]).then(first_seen[a].cmp(&first_seen[b])));

    let mut mapping = vec![0 as ClusterId; k];
    for (new_id, &old) in order.iter().enumerate() {
        mapping[old] = new_id as ClusterId;
    }
    assignments.iter().map(|&c| mapping[c]).collect()
}

// =============================================================================
// DBSCAN
// =============================================================================

/// DBSCAN over cosine distance.
#[derive(Debug, Clone)]
pub struct DbscanAssigner {
    /// Neighbourhood radius. `None` estimates it from the k-distance curve.
    pub eps: Option<f64>,
    pub min_samples: usize,
}

impl Default for DbscanAssigner {
    fn default() -> Self {
        Self {
            eps: None,
            min_samples: 5,
        }
    }
}

const DEFAULT_EPS: f64 = 0.5;
const MIN_EPS: f64 = 0.1;

impl DbscanAssigner {
    pub fn new(eps: Option<f64>, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    /// 90th percentile of each point's k-th nearest neighbour distance,
    /// floored at 0.1. Falls back to 0.5 when no point has k neighbours.
    pub fn estimate_eps(distances: &[Vec<f64>], k: usize) -> f64 {
        let k = k.max(1);
        let mut k_distances: Vec<f64> = distances
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let mut others: Vec<f64> = row
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .map(|(_, d)| *d)
                    .collect();
                if others.len() < k {
                    return None;
                }
                others.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
                Some(others[k - 1])
            })
            .collect();

        if k_distances.is_empty() {
            return DEFAULT_EPS;
        }
        k_distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let eps = percentile(&k_distances, 0.9);
        if eps <= 0.0 {
            return DEFAULT_EPS;
        }
        eps.max(MIN_EPS)
    }

    pub fn assign_blocking(&self, vectors: &[Vec<f32>]) -> Result<Vec<ClusterId>, OracleError> {
        if vectors.is_empty() {
            return Err(OracleError::Clustering("no vectors to cluster".into()));
        }
        if self.min_samples == 0 {
            return Err(OracleError::Clustering("min_samples must be at least 1".into()));
        }

        let points: Vec<Vec<f64>> = vectors.iter().map(|v| widen(v)).collect();
        let n = points.len();
        let distances: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| cosine_distance(&points[i], &points[j])).collect())
            .collect();

        let eps = self
            .eps
            .unwrap_or_else(|| Self::estimate_eps(&distances, self.min_samples));
        debug!(eps, min_samples = self.min_samples, "dbscan parameters");

        // Neighbourhoods include the point itself, as sklearn does.
        let neighbours: Vec<Vec<usize>> = distances
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .filter(|(_, d)| **d <= eps)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();

        let mut labels: Vec<Option<ClusterId>> = vec![None; n];
        let mut next_id: ClusterId = 0;

        for i in 0..n {
            if labels[i].is_some() {
                continue;
            }
            if neighbours[i].len() < self.min_samples {
                labels[i] = Some(NOISE);
                continue;
            }

            let id = next_id;
            next_id += 1;
            labels[i] = Some(id);

            let mut queue: Vec<usize> = neighbours[i].clone();
            while let Some(j) = queue.pop() {
                match labels[j] {
                    Some(NOISE) => labels[j] = Some(id),
                    Some(_) => continue,
                    None => {
                        labels[j] = Some(id);
                        if neighbours[j].len() >= self.min_samples {
                            queue.extend(neighbours[j].iter().copied());
                        }
                    }
                }
            }
        }

        Ok(labels.into_iter().map(|l| l.unwrap_or(NOISE)).collect())
    }
}

#[async_trait::async_trait]
impl ClusterAssigner for DbscanAssigner {
    async fn assign(&self, vectors: &[Vec<f32>]) -> Result<Vec<ClusterId>, OracleError> {
        let this = self.clone();
        let vectors = vectors.to_vec();
        tokio::task::spawn_blocking(move || this.assign_blocking(&vectors)).await?
    }

    fn name(&self) -> &str {
        "dbscan"
    }
}

/// Linear-interpolated percentile of an ascending slice.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    let frac = pos - lo as f64;
    sorted[lo] + (sorted[hi] - sorted[lo]) * frac
}
