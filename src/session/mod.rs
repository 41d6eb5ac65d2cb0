//! Dataset sessions and the balance service operating on them.
//!
//! A session is created by [`BalanceService::ingest`], which returns at once
//! with a `processing` ticket while the pipeline runs on a detached task.
//! Every mutation takes the session's write lock and is fully validated
//! before anything changes. Advisor calls run without holding the lock.

pub mod ingest;
pub mod state;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::advisor::{Advisor, AdvisorContext, AdvisorError, LlmAdvisor, OfflineAdvisor};
use crate::cluster::{ClusterAlgorithm, DbscanAssigner, KMeansAssigner};
use crate::config::{ConfigError, LevelConfig};
use crate::dataset::{Dataset, DatasetError};
use crate::embed::{EmbeddingBackend, GatewayEmbedder, HashingEmbedder};
use crate::export::{export_rows, ExportError, ExportPolicy, ExportResult};
use crate::gateway::{ChatGateway, EmbeddingGateway, Role};
use crate::oracle::{ClusterAssigner, ClusterId, Embedder};
use crate::projection::IsomapReducer;
use crate::waveform::Waveform;

use ingest::{IngestOutput, IngestPipeline, IngestProgress, IngestSettings, IngestStage};
use state::{AdjustError, Adjustment, AiMergeReport, BalanceState, WaveformSnapshot};
use store::{InMemorySessionStore, SessionHandle, SessionId, SessionStore};

// =============================================================================
// Session types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionStatus {
    Processing {
        stage: IngestStage,
        progress: u8,
        message: String,
    },
    Ready,
    Failed {
        message: String,
    },
}

impl SessionStatus {
    pub fn processing(stage: IngestStage) -> Self {
        SessionStatus::Processing {
            stage,
            progress: stage.progress(),
            message: stage.message().to_string(),
        }
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self, SessionStatus::Processing { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            SessionStatus::Processing { .. } => "processing",
            SessionStatus::Ready => "ready",
            SessionStatus::Failed { .. } => "failed",
        }
    }
}

/// One entry of the interaction log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
    pub at: DateTime<Utc>,
}

/// Everything ingestion produced for a ready session.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub embeddings: Vec<Vec<f32>>,
    pub assignments: Vec<ClusterId>,
    pub state: BalanceState,
}

impl From<IngestOutput> for SessionData {
    fn from(out: IngestOutput) -> Self {
        Self {
            embeddings: out.embeddings,
            assignments: out.assignments,
            state: out.state,
        }
    }
}

#[derive(Debug)]
pub struct DatasetSession {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub dataset: Arc<Dataset>,
    pub text_column: usize,
    pub status: SessionStatus,
    pub data: Option<SessionData>,
    pub chat_log: Vec<ChatTurn>,
}

impl DatasetSession {
    pub fn new(dataset: Dataset, text_column: usize) -> Self {
        Self {
            id: SessionId::new_v4(),
            created_at: Utc::now(),
            dataset: Arc::new(dataset),
            text_column,
            status: SessionStatus::processing(IngestStage::Embedding),
            data: None,
            chat_log: Vec::new(),
        }
    }

    fn ready(&self) -> Result<&SessionData, SessionError> {
        match (&self.status, &self.data) {
            (SessionStatus::Ready, Some(data)) => Ok(data),
            _ => Err(SessionError::NotReady {
                id: self.id,
                status: self.status.label(),
            }),
        }
    }

    fn ready_mut(&mut self) -> Result<&mut SessionData, SessionError> {
        let id = self.id;
        let status = self.status.label();
        match (&self.status, &mut self.data) {
            (SessionStatus::Ready, Some(data)) => Ok(data),
            _ => Err(SessionError::NotReady { id, status }),
        }
    }

    fn log(&mut self, role: Role, content: impl Into<String>) {
        self.chat_log.push(ChatTurn {
            role,
            content: content.into(),
            at: Utc::now(),
        });
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),

    #[error("session {id} is {status}")]
    NotReady { id: SessionId, status: &'static str },

    #[error(transparent)]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Adjust(#[from] AdjustError),

    #[error(transparent)]
    Advisor(#[from] AdvisorError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Returned by `ingest` before the pipeline finishes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestTicket {
    pub session_id: SessionId,
    pub rows: usize,
    pub text_column: String,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionOutcome {
    pub snapshot: WaveformSnapshot,
    pub report: AiMergeReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatOutcome {
    pub reply: String,
    /// New AI layer when the message triggered a rebalance.
    pub ai: Option<Waveform>,
}

// =============================================================================
// Service
// =============================================================================

struct SessionProgress(SessionHandle);

#[async_trait::async_trait]
impl IngestProgress for SessionProgress {
    async fn stage(&self, stage: IngestStage) {
        let mut session = self.0.write().await;
        if stage != IngestStage::Ready {
            session.status = SessionStatus::processing(stage);
        }
    }
}

pub struct BalanceService {
    store: Arc<dyn SessionStore>,
    pipeline: Arc<IngestPipeline>,
    advisor: Arc<dyn Advisor>,
    config: LevelConfig,
}

impl BalanceService {
    pub fn new(
        store: Arc<dyn SessionStore>,
        pipeline: Arc<IngestPipeline>,
        advisor: Arc<dyn Advisor>,
        config: LevelConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            advisor,
            config,
        }
    }

    /// Wire providers from configuration.
    ///
    /// Without gateways the hashing embedder and the offline advisor are
    /// used; asking for the gateway embedding backend without one is an error.
    pub fn from_config(
        config: LevelConfig,
        chat: Option<Arc<dyn ChatGateway>>,
        embeddings: Option<Arc<dyn EmbeddingGateway>>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let embedder: Arc<dyn Embedder> = match (config.embedding.backend, embeddings) {
            (EmbeddingBackend::Hashing, _) => {
                Arc::new(HashingEmbedder::new(config.embedding.hashing_dimensions()))
            }
            (EmbeddingBackend::Gateway, Some(gateway)) => Arc::new(GatewayEmbedder::new(
                gateway,
                config.embedding.model.clone(),
                config.embedding.dimensions,
                config.embedding.batch_size,
            )),
            (EmbeddingBackend::Gateway, None) => {
                return Err(ConfigError::Invalid {
                    field: "embedding.backend",
                    reason: "gateway backend needs an API key (OPENROUTER_API_KEY)".into(),
                }
                .into())
            }
        };

        let assigner: Arc<dyn ClusterAssigner> = match config.clustering.algorithm {
            ClusterAlgorithm::Kmeans => Arc::new(KMeansAssigner::new(
                config.clustering.k,
                config.clustering.max_iters,
            )),
            ClusterAlgorithm::Dbscan => Arc::new(DbscanAssigner::new(
                config.clustering.eps,
                config.clustering.min_samples,
            )),
        };

        let advisor: Arc<dyn Advisor> = match chat {
            Some(gateway) => Arc::new(
                LlmAdvisor::new(gateway, config.advisor.model.clone())
                    .temperature(config.advisor.temperature)
                    .max_tokens(config.advisor.max_output_tokens),
            ),
            None => Arc::new(OfflineAdvisor),
        };

        let pipeline = IngestPipeline::new(
            embedder,
            assigner,
            Arc::new(IsomapReducer::new(config.projection.n_neighbors)),
            advisor.clone(),
            IngestSettings {
                exemplar_count: config.ingest.exemplar_count,
                noise_policy: config.ingest.noise_policy,
                describe_concurrency: config.advisor.describe_concurrency,
            },
        );

        Ok(Self::new(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(pipeline),
            advisor,
            config,
        ))
    }

    pub fn config(&self) -> &LevelConfig {
        &self.config
    }

    async fn handle(&self, id: SessionId) -> Result<SessionHandle, SessionError> {
        self.store.get(id).await.ok_or(SessionError::NotFound(id))
    }

    /// Validate an upload and start ingestion on a detached task.
    pub async fn ingest(
        &self,
        upload: &[u8],
        text_column: Option<&str>,
    ) -> Result<IngestTicket, SessionError> {
        let dataset = Dataset::from_upload(
            upload,
            self.config.ingest.max_upload_bytes,
            self.config.ingest.min_rows,
        )?;
        self.ingest_dataset(dataset, text_column).await
    }

    pub async fn ingest_dataset(
        &self,
        dataset: Dataset,
        text_column: Option<&str>,
    ) -> Result<IngestTicket, SessionError> {
        if dataset.len() < self.config.ingest.min_rows {
            return Err(DatasetError::TooFewRows {
                rows: dataset.len(),
                min: self.config.ingest.min_rows,
            }
            .into());
        }
        let column = dataset.text_column(text_column)?;
        let texts = dataset.texts(column)?;
        let column_name = dataset.columns[column].clone();
        let rows = dataset.len();

        let session = DatasetSession::new(dataset, column);
        let id = session.id;
        let status = session.status.clone();
        let handle = self.store.insert(session).await;
        info!(session_id = %id, rows, text_column = %column_name, "ingestion started");

        let pipeline = self.pipeline.clone();
        tokio::spawn(async move {
            let progress = SessionProgress(handle.clone());
            // Inner task so a panicking provider still settles the session.
            let run = tokio::spawn(async move { pipeline.run(&texts, &progress).await });
            let result = match run.await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(join) => Err(join_failure(join)),
            };

            let mut session = handle.write().await;
            match result {
                Ok(out) => {
                    session.data = Some(out.into());
                    session.status = SessionStatus::Ready;
                    info!(session_id = %id, "session ready");
                }
                Err(message) => {
                    error!(session_id = %id, error = %message, "ingestion failed");
                    session.data = None;
                    session.status = SessionStatus::Failed { message };
                }
            }
        });

        Ok(IngestTicket {
            session_id: id,
            rows,
            text_column: column_name,
            status,
        })
    }

    pub async fn status(&self, id: SessionId) -> Result<SessionStatus, SessionError> {
        Ok(self.handle(id).await?.read().await.status.clone())
    }

    /// Poll until the session is ready or failed.
    pub async fn wait_until_settled(
        &self,
        id: SessionId,
        poll: Duration,
    ) -> Result<SessionStatus, SessionError> {
        loop {
            let status = self.status(id).await?;
            if status.is_settled() {
                return Ok(status);
            }
            tokio::time::sleep(poll).await;
        }
    }

    pub async fn adjust(
        &self,
        id: SessionId,
        adjustments: &[Adjustment],
    ) -> Result<WaveformSnapshot, SessionError> {
        let handle = self.handle(id).await?;
        let mut session = handle.write().await;
        let data = session.ready_mut()?;
        data.state.adjust(adjustments).map_err(|e| {
            warn!(session_id = %id, cluster_id = e.cluster_id(), error = %e, "adjust rejected");
            e
        })?;
        Ok(data.state.snapshot())
    }

    /// One advisor round trip. On any failure the AI layer is left as it was.
    pub async fn request_suggestion(
        &self,
        id: SessionId,
        request: Option<&str>,
    ) -> Result<SuggestionOutcome, SessionError> {
        let handle = self.handle(id).await?;
        let ctx = {
            let session = handle.read().await;
            let data = session.ready()?;
            AdvisorContext::from_state(&data.state, &session.dataset.columns, request)
        };

        let reply = self.advisor.advise(&ctx).await.map_err(|e| {
            warn!(session_id = %id, error = %e, "advisor suggestion failed");
            e
        })?;

        let mut session = handle.write().await;
        let data = session.ready_mut()?;
        let report = data.state.replace_ai(&reply);
        info!(
            session_id = %id,
            suggestions = reply.suggestions.len(),
            clamped = report.clamped.len(),
            ignored = report.ignored.len(),
            "ai layer replaced"
        );
        Ok(SuggestionOutcome {
            snapshot: data.state.snapshot(),
            report,
        })
    }

    /// Answer a chat message; rebalance requests also refresh the AI layer.
    pub async fn chat(&self, id: SessionId, message: &str) -> Result<ChatOutcome, SessionError> {
        let handle = self.handle(id).await?;
        let ctx = {
            let mut session = handle.write().await;
            session.ready()?;
            session.log(Role::User, message);
            let data = session.ready()?;
            AdvisorContext::from_state(&data.state, &session.dataset.columns, Some(message))
        };

        let reply = self.advisor.chat(&ctx, message).await?;

        let wants_rebalance = self.advisor.wants_rebalance(message).await.unwrap_or_else(|e| {
            warn!(session_id = %id, error = %e, "rebalance detection failed");
            false
        });
        let ai = if wants_rebalance {
            match self.request_suggestion(id, Some(message)).await {
                Ok(outcome) => outcome.snapshot.ai,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "chat-triggered suggestion failed");
                    None
                }
            }
        } else {
            None
        };

        handle.write().await.log(Role::Assistant, reply.clone());
        Ok(ChatOutcome { reply, ai })
    }

    pub async fn chat_log(&self, id: SessionId) -> Result<Vec<ChatTurn>, SessionError> {
        Ok(self.handle(id).await?.read().await.chat_log.clone())
    }

    pub async fn waveforms(&self, id: SessionId) -> Result<WaveformSnapshot, SessionError> {
        let handle = self.handle(id).await?;
        let session = handle.read().await;
        Ok(session.ready()?.state.snapshot())
    }

    /// Export with the given policy and seed, falling back to the configured defaults.
    pub async fn export(
        &self,
        id: SessionId,
        policy: Option<ExportPolicy>,
        seed: Option<u64>,
    ) -> Result<ExportResult, SessionError> {
        let handle = self.handle(id).await?;
        let session = handle.read().await;
        let data = session.ready()?;
        let policy = policy.unwrap_or(self.config.export.default_policy);
        let seed = seed.unwrap_or(self.config.export.seed);

        let result = export_rows(&data.assignments, &data.state.user_selection(), policy, seed)?;
        info!(session_id = %id, ?policy, seed, rows = result.rows.len(), "export built");
        Ok(result)
    }

    /// Export serialized as CSV with the original columns.
    pub async fn export_csv(
        &self,
        id: SessionId,
        policy: Option<ExportPolicy>,
        seed: Option<u64>,
        annotate: bool,
    ) -> Result<String, SessionError> {
        let result = self.export(id, policy, seed).await?;
        let dataset = self.handle(id).await?.read().await.dataset.clone();
        Ok(dataset.export_csv(&result, annotate)?)
    }

    pub async fn evict(&self, id: SessionId) -> bool {
        self.store.remove(id).await
    }

    /// Drop sessions idle for longer than the configured TTL.
    pub async fn evict_idle(&self) -> Vec<SessionId> {
        self.store
            .evict_idle(self.config.sessions.idle_ttl(), Utc::now())
            .await
    }
}

fn join_failure(join: JoinError) -> String {
    if !join.is_panic() {
        return format!("ingestion task stopped: {join}");
    }
    let payload = join.into_panic();
    let reason = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("ingestion panicked: {reason}")
}
