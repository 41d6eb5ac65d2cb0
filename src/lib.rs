#![forbid(unsafe_code)]

//! # level-balance
//!
//! Measure and rebalance representational imbalance in tabular datasets.
//!
//! Each row's text is embedded, rows are grouped into semantic clusters, and
//! the cluster sizes are laid out along one axis as a "waveform" whose
//! unevenness is scored with the Gini coefficient. A user (optionally helped
//! by an LLM advisor) then adjusts per-cluster counts and weights, and the
//! export engine samples the original rows accordingly with a fixed seed.
//!
//! Each dataset session keeps three layers: `base` (as ingested, immutable),
//! `user` (explicit adjustments) and `ai` (the latest advisor suggestion,
//! replaced wholesale on every reply).

pub mod advisor;
pub mod aggregate;
pub mod cluster;
pub mod config;
pub mod dataset;
pub mod distance;
pub mod embed;
pub mod export;
pub mod gateway;
pub mod metrics;
pub mod oracle;
pub mod projection;
pub mod session;
pub mod waveform;

pub use advisor::{Advisor, AdvisorError, AdvisorReply, LlmAdvisor, OfflineAdvisor, Suggestion};
pub use config::LevelConfig;
pub use dataset::{Dataset, DatasetError};
pub use export::{ExportError, ExportPolicy, ExportResult};
pub use gateway::{Attribution, ChatGateway, EmbeddingGateway, ProviderGateway};
pub use metrics::{flatness_score, gini_coefficient, WaveformMetrics};
pub use oracle::{ClusterAssigner, ClusterId, Embedder, OracleError, Reducer1D, NOISE};
pub use session::state::{AdjustError, Adjustment, BalanceState, WaveformSnapshot};
pub use session::{BalanceService, SessionError, SessionStatus};
pub use waveform::{Peak, Waveform};
