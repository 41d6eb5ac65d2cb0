//! Ingestion pipeline: embed, cluster, aggregate, describe, project, build.
//!
//! Stages run strictly in sequence. Any failure aborts the run; the caller
//! marks the session failed rather than keeping a half-built state.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::state::BalanceState;
use crate::advisor::{describe_all, Advisor};
use crate::aggregate::{aggregate, AggregateError, NoisePolicy};
use crate::oracle::{validate_embeddings, ClusterAssigner, ClusterId, Embedder, OracleError, Reducer1D};
use crate::projection::{project_to_1d, ProjectionError};
use crate::waveform::build_waveform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStage {
    Embedding,
    Clustering,
    Aggregating,
    Describing,
    Projecting,
    Building,
    Ready,
}

impl IngestStage {
    pub fn progress(self) -> u8 {
        match self {
            IngestStage::Embedding => 10,
            IngestStage::Clustering => 40,
            IngestStage::Aggregating => 60,
            IngestStage::Describing => 70,
            IngestStage::Projecting => 80,
            IngestStage::Building => 90,
            IngestStage::Ready => 100,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            IngestStage::Embedding => "Generating embeddings",
            IngestStage::Clustering => "Clustering rows",
            IngestStage::Aggregating => "Summarizing clusters",
            IngestStage::Describing => "Describing clusters",
            IngestStage::Projecting => "Laying out clusters",
            IngestStage::Building => "Building waveform",
            IngestStage::Ready => "Ready",
        }
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Receives stage transitions while a pipeline runs.
#[async_trait::async_trait]
pub trait IngestProgress: Send + Sync {
    async fn stage(&self, stage: IngestStage);
}

pub struct NoopProgress;

#[async_trait::async_trait]
impl IngestProgress for NoopProgress {
    async fn stage(&self, _stage: IngestStage) {}
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub exemplar_count: usize,
    pub noise_policy: NoisePolicy,
    pub describe_concurrency: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            exemplar_count: 5,
            noise_policy: NoisePolicy::OwnCluster,
            describe_concurrency: 4,
        }
    }
}

/// Everything a ready session keeps from ingestion.
#[derive(Debug, Clone)]
pub struct IngestOutput {
    pub embeddings: Vec<Vec<f32>>,
    /// Per-row cluster id after the noise policy.
    pub assignments: Vec<ClusterId>,
    pub state: BalanceState,
}

pub struct IngestPipeline {
    embedder: Arc<dyn Embedder>,
    assigner: Arc<dyn ClusterAssigner>,
    reducer: Arc<dyn Reducer1D>,
    advisor: Arc<dyn Advisor>,
    settings: IngestSettings,
}

impl IngestPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        assigner: Arc<dyn ClusterAssigner>,
        reducer: Arc<dyn Reducer1D>,
        advisor: Arc<dyn Advisor>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            embedder,
            assigner,
            reducer,
            advisor,
            settings,
        }
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        texts: &[String],
        progress: &dyn IngestProgress,
    ) -> Result<IngestOutput, IngestError> {
        let started = Instant::now();

        progress.stage(IngestStage::Embedding).await;
        let embeddings = self.embedder.embed(texts).await?;
        let dim = validate_embeddings(texts.len(), &embeddings)?;
        debug!(embedder = self.embedder.name(), rows = texts.len(), dim, "embedded rows");

        progress.stage(IngestStage::Clustering).await;
        let raw_ids = self.assigner.assign(&embeddings).await?;
        if raw_ids.len() != texts.len() {
            return Err(OracleError::AssignmentCount {
                expected: texts.len(),
                got: raw_ids.len(),
            }
            .into());
        }
        let assignments = self.settings.noise_policy.apply(&raw_ids);

        progress.stage(IngestStage::Aggregating).await;
        let summaries = aggregate(texts, &embeddings, &assignments, self.settings.exemplar_count)?;
        debug!(
            assigner = self.assigner.name(),
            clusters = summaries.len(),
            "aggregated clusters"
        );

        progress.stage(IngestStage::Describing).await;
        let exemplars: Vec<(ClusterId, Vec<String>)> = summaries
            .iter()
            .map(|s| (s.id, s.exemplars.clone()))
            .collect();
        let descriptions = describe_all(
            Arc::clone(&self.advisor),
            exemplars,
            self.settings.describe_concurrency,
        )
        .await;

        progress.stage(IngestStage::Projecting).await;
        let centroids: Vec<Vec<f64>> = summaries.iter().map(|s| s.centroid.clone()).collect();
        let reducer = self.reducer.clone();
        let positions = tokio::task::spawn_blocking(move || project_to_1d(&centroids, reducer.as_ref()))
            .await
            .map_err(OracleError::from)??;

        progress.stage(IngestStage::Building).await;
        let waveform = build_waveform(&summaries, &positions, &descriptions);
        info!(
            rows = waveform.total_points,
            clusters = waveform.peaks.len(),
            gini = waveform.representation.gini_coefficient,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion complete"
        );

        progress.stage(IngestStage::Ready).await;
        Ok(IngestOutput {
            embeddings,
            assignments,
            state: BalanceState::new(waveform),
        })
    }
}
