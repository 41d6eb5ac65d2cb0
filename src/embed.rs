//! Embedding providers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::distance::l2_normalize;
use crate::gateway::{Attribution, EmbedRequest, EmbeddingGateway};
use crate::oracle::{validate_embeddings, Embedder, OracleError};

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingBackend {
    /// Offline feature-hashing embedder.
    #[default]
    Hashing,
    /// OpenAI-compatible `/embeddings` endpoint.
    Gateway,
}

// =============================================================================
// HASHING EMBEDDER
// =============================================================================

/// Deterministic offline embedder.
///
/// Lowercased word tokens and adjacent-token bigrams are hashed with blake3
/// into `dimensions` signed buckets, then the vector is L2-normalized. Texts
/// sharing vocabulary land close in cosine distance, which is enough for the
/// balance engine to find topical clusters without a model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let tokens: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase)
            .collect();

        let mut v = vec![0.0f64; self.dimensions];
        for token in &tokens {
            self.bump(&mut v, token.as_bytes(), 1.0);
        }
        for pair in tokens.windows(2) {
            let bigram = format!("{} {}", pair[0], pair[1]);
            self.bump(&mut v, bigram.as_bytes(), 0.5);
        }
        l2_normalize(&mut v);
        v.into_iter().map(|x| x as f32).collect()
    }

    fn bump(&self, v: &mut [f64], feature: &[u8], weight: f64) {
        let hash = blake3::hash(feature);
        let bytes = hash.as_bytes();
        let bucket = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]) % self.dimensions as u64;
        let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
        v[bucket as usize] += sign * weight;
    }
}

#[async_trait::async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        if texts.is_empty() {
            return Err(OracleError::Embedding("no texts to embed".into()));
        }
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

// =============================================================================
// GATEWAY EMBEDDER
// =============================================================================

/// Embedder backed by an OpenAI-compatible embeddings endpoint.
pub struct GatewayEmbedder {
    gateway: Arc<dyn EmbeddingGateway>,
    model: String,
    dimensions: Option<usize>,
    batch_size: usize,
}

impl GatewayEmbedder {
    pub fn new(
        gateway: Arc<dyn EmbeddingGateway>,
        model: impl Into<String>,
        dimensions: Option<usize>,
        batch_size: usize,
    ) -> Self {
        Self {
            gateway,
            model: model.into(),
            dimensions,
            batch_size: batch_size.max(1),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for GatewayEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, OracleError> {
        if texts.is_empty() {
            return Err(OracleError::Embedding("no texts to embed".into()));
        }

        let mut out = Vec::with_capacity(texts.len());
        for (batch_idx, batch) in texts.chunks(self.batch_size).enumerate() {
            let mut req = EmbedRequest::new(
                self.model.clone(),
                batch.to_vec(),
                Attribution::new("embed::gateway"),
            );
            if let Some(d) = self.dimensions {
                req = req.dimensions(d);
            }
            let resp = self.gateway.embed(req).await.map_err(|e| {
                OracleError::Embedding(format!("batch {batch_idx} failed: {e}"))
            })?;
            if resp.embeddings.len() != batch.len() {
                return Err(OracleError::EmbeddingCount {
                    expected: batch.len(),
                    got: resp.embeddings.len(),
                });
            }
            debug!(batch = batch_idx, size = batch.len(), "embedded batch");
            out.extend(resp.embeddings);
        }

        validate_embeddings(texts.len(), &out)?;
        Ok(out)
    }

    fn name(&self) -> &str {
        &self.model
    }
}
