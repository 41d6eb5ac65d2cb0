//! Export engine: turn the user layer into a concrete row selection.
//!
//! All sampling is seeded. Each cluster draws from its own RNG stream derived
//! from `(seed, cluster id)`, so changing one cluster's selection leaves the
//! rows chosen for every other cluster untouched.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::{index, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::oracle::ClusterId;

pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExportPolicy {
    /// Sample `selected_count` rows per cluster without replacement, scaled by weight.
    #[default]
    Prune,
    /// Draw `sample_count x weight` rows per cluster, with replacement when
    /// that exceeds the cluster, then shuffle.
    Resample,
    /// Every row, annotated with its cluster's weight.
    Weighted,
}

impl std::str::FromStr for ExportPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prune" | "select" => Ok(Self::Prune),
            "resample" => Ok(Self::Resample),
            "weighted" => Ok(Self::Weighted),
            other => Err(format!("unknown export policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExportError {
    #[error("nothing selected: every cluster resolves to zero rows")]
    NothingSelected,

    #[error("selection names cluster {cluster_id}, which has no rows")]
    UnknownCluster { cluster_id: ClusterId },
}

/// One output row: the index into the original dataset plus annotations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedRow {
    pub source_row: usize,
    pub cluster_id: ClusterId,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResult {
    pub policy: ExportPolicy,
    pub seed: u64,
    pub rows: Vec<ExportedRow>,
}

impl ExportResult {
    pub fn source_rows(&self) -> Vec<usize> {
        self.rows.iter().map(|r| r.source_row).collect()
    }

    /// Output rows per cluster.
    pub fn cluster_counts(&self) -> BTreeMap<ClusterId, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.rows {
            *counts.entry(row.cluster_id).or_insert(0) += 1;
        }
        counts
    }
}

/// Per-cluster selection read from the user layer: `(id, count, weight)`.
pub type Selection = (ClusterId, usize, f64);

/// Produce the export row set.
///
/// `assignments[i]` is the cluster of original row `i`, after the noise
/// policy. Clusters missing from `selection` contribute nothing.
pub fn export_rows(
    assignments: &[ClusterId],
    selection: &[Selection],
    policy: ExportPolicy,
    seed: u64,
) -> Result<ExportResult, ExportError> {
    let members = group_members(assignments);

    let mut rows = Vec::new();
    for &(cluster_id, count, weight) in selection {
        let rows_in_cluster = members
            .get(&cluster_id)
            .ok_or(ExportError::UnknownCluster { cluster_id })?;
        let mut rng = cluster_rng(seed, cluster_id);

        let picked: Vec<usize> = match policy {
            ExportPolicy::Prune => {
                let target = prune_target(count, weight, rows_in_cluster.len());
                sample_without_replacement(&mut rng, rows_in_cluster, target)
            }
            ExportPolicy::Resample => {
                let target = resample_target(rows_in_cluster.len(), weight);
                if target > rows_in_cluster.len() {
                    (0..target)
                        .map(|_| rows_in_cluster[rng.gen_range(0..rows_in_cluster.len())])
                        .collect()
                } else {
                    sample_without_replacement(&mut rng, rows_in_cluster, target)
                }
            }
            ExportPolicy::Weighted => rows_in_cluster.clone(),
        };

        debug!(cluster_id, rows = picked.len(), ?policy, "cluster export");
        rows.extend(picked.into_iter().map(|source_row| ExportedRow {
            source_row,
            cluster_id,
            weight,
        }));
    }

    if rows.is_empty() {
        return Err(ExportError::NothingSelected);
    }

    match policy {
        ExportPolicy::Prune | ExportPolicy::Weighted => rows.sort_by_key(|r| r.source_row),
        ExportPolicy::Resample => rows.shuffle(&mut StdRng::seed_from_u64(seed)),
    }

    Ok(ExportResult { policy, seed, rows })
}

/// Rows to keep under the prune policy.
///
/// Weight 1.0 keeps `count`. Otherwise `round(count x weight)`, clamped to
/// the cluster size, with at least one row while both count and weight are
/// positive.
pub fn prune_target(count: usize, weight: f64, available: usize) -> usize {
    let count = count.min(available);
    if weight == 1.0 {
        return count;
    }
    let scaled = (count as f64 * weight).round().max(0.0) as usize;
    let mut target = scaled.min(available);
    if target == 0 && weight > 0.0 && count > 0 {
        target = 1;
    }
    target
}

pub fn resample_target(sample_count: usize, weight: f64) -> usize {
    (sample_count as f64 * weight).round().max(0.0) as usize
}

fn group_members(assignments: &[ClusterId]) -> BTreeMap<ClusterId, Vec<usize>> {
    let mut members: BTreeMap<ClusterId, Vec<usize>> = BTreeMap::new();
    for (row, &id) in assignments.iter().enumerate() {
        members.entry(id).or_default().push(row);
    }
    members
}

fn cluster_rng(seed: u64, cluster_id: ClusterId) -> StdRng {
    let mixed = seed ^ (cluster_id as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(mixed)
}

fn sample_without_replacement(rng: &mut StdRng, rows: &[usize], target: usize) -> Vec<usize> {
    if target >= rows.len() {
        return rows.to_vec();
    }
    let mut picked: Vec<usize> = index::sample(rng, rows.len(), target)
        .into_iter()
        .map(|i| rows[i])
        .collect();
    picked.sort_unstable();
    picked
}
