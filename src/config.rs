//! Layered configuration: defaults, then an optional TOML file, then `LEVEL_*`
//! environment variables.
//!
//! Gateway credentials are not part of this file; the OpenRouter adapter reads
//! `OPENROUTER_API_KEY`, `OPENROUTER_BASE_URL` and `OPENROUTER_TIMEOUT_SECONDS`.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::NoisePolicy;
use crate::cluster::ClusterAlgorithm;
use crate::dataset::DEFAULT_MAX_UPLOAD_BYTES;
use crate::embed::EmbeddingBackend;
use crate::export::{ExportPolicy, DEFAULT_SEED};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value}")]
    Env { var: &'static str, value: String },

    #[error("invalid config: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LevelConfig {
    pub ingest: IngestConfig,
    pub embedding: EmbeddingConfig,
    pub clustering: ClusteringConfig,
    pub projection: ProjectionConfig,
    pub advisor: AdvisorConfig,
    pub export: ExportConfig,
    pub sessions: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub min_rows: usize,
    pub max_upload_bytes: usize,
    pub exemplar_count: usize,
    pub noise_policy: NoisePolicy,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_rows: 50,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            exemplar_count: 5,
            noise_policy: NoisePolicy::OwnCluster,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    pub model: String,
    /// Output dimension. For the hashing backend this is the bucket count.
    pub dimensions: Option<usize>,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Hashing,
            model: "openai/text-embedding-3-small".into(),
            dimensions: None,
            batch_size: 32,
        }
    }
}

impl EmbeddingConfig {
    pub const DEFAULT_HASHING_DIMENSIONS: usize = 256;

    pub fn hashing_dimensions(&self) -> usize {
        self.dimensions.unwrap_or(Self::DEFAULT_HASHING_DIMENSIONS)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub algorithm: ClusterAlgorithm,
    /// Fixed k for k-means; auto-chosen when absent.
    pub k: Option<usize>,
    pub max_iters: usize,
    pub min_samples: usize,
    /// DBSCAN radius in cosine distance; estimated when absent.
    pub eps: Option<f64>,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            algorithm: ClusterAlgorithm::Kmeans,
            k: None,
            max_iters: 100,
            min_samples: 5,
            eps: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    pub n_neighbors: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self { n_neighbors: 15 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub model: String,
    pub temperature: f32,
    pub describe_concurrency: usize,
    pub max_output_tokens: u32,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            model: "openai/gpt-4o-mini".into(),
            temperature: 0.3,
            describe_concurrency: 4,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub seed: u64,
    pub default_policy: ExportPolicy,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            default_policy: ExportPolicy::Prune,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub idle_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: 3600,
        }
    }
}

impl SessionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl LevelConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Override fields from `LEVEL_*` variables resolved through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: FromStr>(
            lookup: &dyn Fn(&str) -> Option<String>,
            var: &'static str,
        ) -> Result<Option<T>, ConfigError> {
            match lookup(var) {
                None => Ok(None),
                Some(value) => value
                    .trim()
                    .parse::<T>()
                    .map(Some)
                    .map_err(|_| ConfigError::Env { var, value }),
            }
        }
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;

        if let Some(v) = parse(lookup, "LEVEL_MIN_ROWS")? {
            self.ingest.min_rows = v;
        }
        if let Some(v) = parse(lookup, "LEVEL_MAX_UPLOAD_BYTES")? {
            self.ingest.max_upload_bytes = v;
        }
        if let Some(v) = parse(lookup, "LEVEL_EXEMPLAR_COUNT")? {
            self.ingest.exemplar_count = v;
        }
        if let Some(value) = lookup("LEVEL_EMBEDDING_BACKEND") {
            self.embedding.backend = match value.trim().to_ascii_lowercase().as_str() {
                "hashing" => EmbeddingBackend::Hashing,
                "gateway" => EmbeddingBackend::Gateway,
                _ => {
                    return Err(ConfigError::Env {
                        var: "LEVEL_EMBEDDING_BACKEND",
                        value,
                    })
                }
            };
        }
        if let Some(v) = lookup("LEVEL_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = parse(lookup, "LEVEL_EMBEDDING_DIMENSIONS")? {
            self.embedding.dimensions = Some(v);
        }
        if let Some(v) = parse(lookup, "LEVEL_EMBEDDING_BATCH_SIZE")? {
            self.embedding.batch_size = v;
        }
        if let Some(value) = lookup("LEVEL_CLUSTER_ALGORITHM") {
            self.clustering.algorithm = match value.trim().to_ascii_lowercase().as_str() {
                "kmeans" => ClusterAlgorithm::Kmeans,
                "dbscan" => ClusterAlgorithm::Dbscan,
                _ => {
                    return Err(ConfigError::Env {
                        var: "LEVEL_CLUSTER_ALGORITHM",
                        value,
                    })
                }
            };
        }
        if let Some(v) = parse(lookup, "LEVEL_CLUSTER_K")? {
            self.clustering.k = Some(v);
        }
        if let Some(v) = lookup("LEVEL_ADVISOR_MODEL") {
            self.advisor.model = v;
        }
        if let Some(v) = parse(lookup, "LEVEL_DESCRIBE_CONCURRENCY")? {
            self.advisor.describe_concurrency = v;
        }
        if let Some(v) = parse(lookup, "LEVEL_EXPORT_SEED")? {
            self.export.seed = v;
        }
        if let Some(value) = lookup("LEVEL_EXPORT_POLICY") {
            self.export.default_policy = value.parse().map_err(|_| ConfigError::Env {
                var: "LEVEL_EXPORT_POLICY",
                value,
            })?;
        }
        if let Some(v) = parse(lookup, "LEVEL_IDLE_TTL_SECS")? {
            self.sessions.idle_ttl_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::Invalid {
            field,
            reason: reason.to_string(),
        };
        if self.ingest.min_rows < 3 {
            return Err(invalid("ingest.min_rows", "must be at least 3"));
        }
        if self.ingest.exemplar_count == 0 {
            return Err(invalid("ingest.exemplar_count", "must be positive"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size", "must be positive"));
        }
        if self.embedding.dimensions == Some(0) {
            return Err(invalid("embedding.dimensions", "must be positive"));
        }
        if self.clustering.k.is_some_and(|k| k < 2) {
            return Err(invalid("clustering.k", "must be at least 2"));
        }
        if self.clustering.min_samples == 0 {
            return Err(invalid("clustering.min_samples", "must be positive"));
        }
        if self.clustering.eps.is_some_and(|e| !(e > 0.0)) {
            return Err(invalid("clustering.eps", "must be positive"));
        }
        if self.projection.n_neighbors == 0 {
            return Err(invalid("projection.n_neighbors", "must be positive"));
        }
        if !(0.0..=2.0).contains(&self.advisor.temperature) {
            return Err(invalid("advisor.temperature", "must be within [0, 2]"));
        }
        Ok(())
    }
}
