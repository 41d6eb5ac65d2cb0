//! Collaborator contracts for the external oracles.
//!
//! The balance engine only needs one vector per row, one cluster id per row,
//! and a 1-D reduction of centroids. Everything behind these traits (model
//! choice, clustering algorithm, manifold learner) is replaceable.

use thiserror::Error;

use crate::gateway::ProviderError;

/// Cluster identifier as produced by a [`ClusterAssigner`]. Ids need not be contiguous.
pub type ClusterId = i64;

/// Reserved id for rows a density-based assigner could not place.
pub const NOISE: ClusterId = -1;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error("embedding provider returned {got} vectors for {expected} texts")]
    EmbeddingCount { expected: usize, got: usize },

    #[error("embedding dimension mismatch at row {row}: expected {expected}, got {got}")]
    EmbeddingDimension {
        row: usize,
        expected: usize,
        got: usize,
    },

    #[error("cluster assignment failed: {0}")]
    Clustering(String),

    #[error("cluster assigner returned {got} ids for {expected} rows")]
    AssignmentCount { expected: usize, got: usize },

    #[error("dimensionality reduction failed: {0}")]
    Reduction(String),

    #[error("advisor failed: {0}")]
    Advisor(String),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for OracleError {
    fn from(e: tokio::task::JoinError) -> Self {
        OracleError::Join(e.to_string())
    }
}

/// `Embed(texts) -> matrix[n][d]`.
#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Return exactly one vector per input text, all of the same dimension.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// `AssignClusters(vectors) -> ids[n]`.
#[async_trait::async_trait]
pub trait ClusterAssigner: Send + Sync {
    async fn assign(&self, vectors: &[Vec<f32>]) -> Result<Vec<ClusterId>, OracleError>;

    fn name(&self) -> &str;
}

/// Raw 1-D reduction of centroids. Output need not be normalized; the layout
/// projector applies min-max scaling and the degenerate-case rules.
pub trait Reducer1D: Send + Sync {
    fn reduce(&self, centroids: &[Vec<f64>]) -> Result<Vec<f64>, OracleError>;
}

/// Check the embedding contract: one vector per text, constant dimension.
pub fn validate_embeddings(texts: usize, vectors: &[Vec<f32>]) -> Result<usize, OracleError> {
    if vectors.len() != texts {
        return Err(OracleError::EmbeddingCount {
            expected: texts,
            got: vectors.len(),
        });
    }
    let dim = vectors.first().map(Vec::len).unwrap_or(0);
    if dim == 0 {
        return Err(OracleError::Embedding("zero-dimensional vectors".into()));
    }
    for (row, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            return Err(OracleError::EmbeddingDimension {
                row,
                expected: dim,
                got: v.len(),
            });
        }
    }
    Ok(dim)
}
