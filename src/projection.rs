//! 1-D layout projection of cluster centroids.
//!
//! [`project_to_1d`] owns the normalization and degenerate-case rules; the
//! actual nonlinear reduction is a [`Reducer1D`]. The default reducer is a
//! small Isomap: kNN graph, Floyd-Warshall geodesics, then classical MDS on
//! the geodesic matrix via `nalgebra::SymmetricEigen`.

use std::cmp::Ordering;

use nalgebra::linalg::SymmetricEigen;
use nalgebra::DMatrix;
use thiserror::Error;
use tracing::warn;

use crate::distance::euclidean;
use crate::oracle::{OracleError, Reducer1D};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("reducer returned {got} positions for {expected} centroids")]
    LengthMismatch { expected: usize, got: usize },

    #[error(transparent)]
    Reducer(#[from] OracleError),
}

/// Map centroids to positions in `[0, 1]`.
///
/// - 1 centroid → `[0.5]`
/// - 2 centroids → `[0.0, 1.0]` (the reducer is not called)
/// - finite raw values all equal → `linspace(0, 1, k)`
/// - NaN raw value → 0.5 for that cluster
pub fn project_to_1d(
    centroids: &[Vec<f64>],
    reducer: &dyn Reducer1D,
) -> Result<Vec<f64>, ProjectionError> {
    match centroids.len() {
        0 => return Ok(Vec::new()),
        1 => return Ok(vec![0.5]),
        2 => return Ok(vec![0.0, 1.0]),
        _ => {}
    }

    let raw = reducer.reduce(centroids)?;
    if raw.len() != centroids.len() {
        return Err(ProjectionError::LengthMismatch {
            expected: centroids.len(),
            got: raw.len(),
        });
    }
    Ok(normalize_positions(&raw))
}

/// Min-max scaling over the finite raw values, with the degenerate fallbacks.
pub fn normalize_positions(raw: &[f64]) -> Vec<f64> {
    let k = raw.len();
    let finite = raw.iter().copied().filter(|v| v.is_finite());
    let (min, max) = finite.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    let collapsed = !(max - min).is_normal();

    if collapsed {
        warn!(clusters = k, "1-D reduction collapsed; using even spacing");
    }

    raw.iter()
        .enumerate()
        .map(|(i, &v)| {
            if v.is_nan() {
                0.5
            } else if collapsed {
                linspace_at(i, k)
            } else {
                ((v - min) / (max - min)).clamp(0.0, 1.0)
            }
        })
        .collect()
}

fn linspace_at(i: usize, k: usize) -> f64 {
    if k <= 1 {
        0.5
    } else {
        i as f64 / (k - 1) as f64
    }
}

// =============================================================================
// ISOMAP
// =============================================================================

/// Isomap into one dimension.
#[derive(Debug, Clone)]
pub struct IsomapReducer {
    pub n_neighbors: usize,
}

impl Default for IsomapReducer {
    fn default() -> Self {
        Self { n_neighbors: 15 }
    }
}

impl IsomapReducer {
    pub fn new(n_neighbors: usize) -> Self {
        Self {
            n_neighbors: n_neighbors.max(1),
        }
    }

    /// Geodesic distances over the symmetric kNN graph. Pairs left
    /// disconnected fall back to their straight-line distance.
    fn geodesics(&self, points: &[Vec<f64>]) -> DMatrix<f64> {
        let n = points.len();
        let direct = DMatrix::from_fn(n, n, |i, j| euclidean(&points[i], &points[j]));
        let nn = self.n_neighbors.min(n - 1).max(1);

        let mut graph = DMatrix::from_element(n, n, f64::INFINITY);
        for i in 0..n {
            graph[(i, i)] = 0.0;
            let mut order: Vec<usize> = (0..n).filter(|&j| j != i).collect();
            order.sort_by(|&a, &b| {
                direct[(i, a)]
                    .partial_cmp(&direct[(i, b)])
                    .unwrap_or(Ordering::Equal)
            });
            for &j in order.iter().take(nn) {
                graph[(i, j)] = direct[(i, j)];
                graph[(j, i)] = direct[(i, j)];
            }
        }

        for via in 0..n {
            for i in 0..n {
                let to_via = graph[(i, via)];
                if !to_via.is_finite() {
                    continue;
                }
                for j in 0..n {
                    let candidate = to_via + graph[(via, j)];
                    if candidate < graph[(i, j)] {
                        graph[(i, j)] = candidate;
                    }
                }
            }
        }

        for i in 0..n {
            for j in 0..n {
                if !graph[(i, j)].is_finite() {
                    graph[(i, j)] = direct[(i, j)];
                }
            }
        }
        graph
    }
}

impl Reducer1D for IsomapReducer {
    fn reduce(&self, centroids: &[Vec<f64>]) -> Result<Vec<f64>, OracleError> {
        let n = centroids.len();
        if n < 2 {
            return Ok(vec![0.0; n]);
        }
        let dim = centroids[0].len();
        if centroids.iter().any(|c| c.len() != dim) {
            return Err(OracleError::Reduction(
                "centroids have inconsistent dimensions".into(),
            ));
        }

        let geo = self.geodesics(centroids);

        // Classical MDS: B = -1/2 · J D² J.
        let sq = geo.map(|d| d * d);
        let row_means: Vec<f64> = (0..n).map(|i| sq.row(i).mean()).collect();
        let grand = sq.mean();
        let b = DMatrix::from_fn(n, n, |i, j| {
            -0.5 * (sq[(i, j)] - row_means[i] - row_means[j] + grand)
        });

        let eig = SymmetricEigen::new(b);
        let (top, lambda) = eig
            .eigenvalues
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
            .map(|(i, l)| (i, *l))
            .ok_or_else(|| OracleError::Reduction("empty eigendecomposition".into()))?;

        if lambda <= 1e-12 {
            return Ok(vec![0.0; n]);
        }

        let scale = lambda.sqrt();
        let mut coords: Vec<f64> = eig.eigenvectors.column(top).iter().map(|v| v * scale).collect();

        // Eigenvector sign is arbitrary; pin it so the largest magnitude is positive.
        let pivot = coords
            .iter()
            .copied()
            .max_by(|a, b| a.abs().partial_cmp(&b.abs()).unwrap_or(Ordering::Equal))
            .unwrap_or(0.0);
        if pivot < 0.0 {
            for c in coords.iter_mut() {
                *c = -*c;
            }
        }
        Ok(coords)
    }
}
