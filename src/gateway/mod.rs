//! Provider gateway for OpenAI-compatible chat completions and embeddings.

pub mod error;
pub mod openrouter;
pub mod types;

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use openrouter::{ChatProvider, EmbeddingProvider, OpenRouterAdapter};

pub use error::{ErrorContext, ProviderError};
pub use types::*;

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
pub trait EmbeddingGateway: Send + Sync {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Retrying front for the OpenRouter adapter.
pub struct ProviderGateway {
    openrouter: OpenRouterAdapter,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl ChatGateway for ProviderGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

#[async_trait::async_trait]
impl EmbeddingGateway for ProviderGateway {
    async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        ProviderGateway::embed(self, req).await
    }
}

impl ProviderGateway {
    pub fn from_env() -> Result<Self, ProviderError> {
        Ok(Self {
            openrouter: OpenRouterAdapter::from_env()?,
            config: GatewayConfig::default(),
        })
    }

    pub fn with_config(openrouter: OpenRouterAdapter, config: GatewayConfig) -> Self {
        Self { openrouter, config }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let resp = self
            .with_retries(req.attribution, "chat/completions", || {
                self.openrouter.chat(&req)
            })
            .await?;
        debug!(
            caller = req.attribution.caller,
            model = req.model.model_id(),
            input_tokens = resp.input_tokens,
            output_tokens = resp.output_tokens,
            latency_ms = resp.latency.as_millis() as u64,
            "chat completed"
        );
        Ok(resp)
    }

    pub async fn embed(&self, req: EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        let resp = self
            .with_retries(req.attribution, "embeddings", || self.openrouter.embed(&req))
            .await?;
        debug!(
            caller = req.attribution.caller,
            model = %req.model,
            texts = req.texts.len(),
            input_tokens = resp.input_tokens,
            latency_ms = resp.latency.as_millis() as u64,
            "embedding batch completed"
        );
        Ok(resp)
    }

    async fn with_retries<T, F, Fut>(
        &self,
        attribution: Attribution,
        endpoint: &'static str,
        mut call: F,
    ) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(resp) => return Ok(resp),
                Err(err) if !err.is_retryable() || attempt >= self.config.max_retries => {
                    return Err(err)
                }
                Err(err) => {
                    let delay = retry_delay(&err, self.config.retry_base_delay, attempt);
                    warn!(
                        caller = attribution.caller,
                        endpoint,
                        attempt,
                        code = err.code(),
                        server_hint = err.retry_after().is_some(),
                        delay_ms = delay.as_millis() as u64,
                        "retrying provider call"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Longest server `Retry-After` hint honoured before retrying.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// The server's hint when it sent one, exponential backoff otherwise.
fn retry_delay(err: &ProviderError, base: Duration, attempt: u32) -> Duration {
    err.retry_after()
        .map(|hint| hint.min(MAX_RETRY_AFTER))
        .unwrap_or_else(|| backoff_delay(base, attempt))
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}
