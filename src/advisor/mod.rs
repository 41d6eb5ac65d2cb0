//! Natural-language advisor: cluster descriptions, balance suggestions, chat.

pub mod context;
pub mod llm;
pub mod prompts;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tracing::warn;

use crate::gateway::ProviderError;
use crate::oracle::{ClusterId, NOISE};
use crate::waveform::ClusterDescription;

pub use context::{AdvisorContext, ClusterContext};
pub use llm::LlmAdvisor;
pub use schema::{extract_json, parse_reply, AdvisorReply, Suggestion};

/// Labels longer than this are cut and suffixed with `...`.
pub const MAX_LABEL_CHARS: usize = 40;

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor call failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("malformed advisor reply: {reason} (raw: {preview})")]
    Malformed { reason: String, preview: String },

    #[error("advisor unavailable: {0}")]
    Unavailable(String),
}

impl AdvisorError {
    pub fn malformed(reason: impl Into<String>, raw: &str) -> Self {
        Self::Malformed {
            reason: reason.into(),
            preview: raw.chars().take(300).collect(),
        }
    }
}

#[async_trait::async_trait]
pub trait Advisor: Send + Sync {
    /// Suggest per-cluster counts and weights.
    async fn advise(&self, ctx: &AdvisorContext) -> Result<AdvisorReply, AdvisorError>;

    /// Short label and summary for one cluster from its exemplars.
    async fn describe_cluster(
        &self,
        cluster_id: ClusterId,
        exemplars: &[String],
    ) -> Result<ClusterDescription, AdvisorError>;

    /// Free-text answer to a user message, grounded in the session context.
    async fn chat(&self, ctx: &AdvisorContext, message: &str) -> Result<String, AdvisorError>;

    /// Whether the message asks for a rebalance rather than information.
    async fn wants_rebalance(&self, message: &str) -> Result<bool, AdvisorError>;
}

/// Advisor that is never reachable. Descriptions fall back to placeholders
/// and suggestion or chat requests fail cleanly.
#[derive(Debug, Clone, Default)]
pub struct OfflineAdvisor;

#[async_trait::async_trait]
impl Advisor for OfflineAdvisor {
    async fn advise(&self, _ctx: &AdvisorContext) -> Result<AdvisorReply, AdvisorError> {
        Err(AdvisorError::Unavailable("running offline".into()))
    }

    async fn describe_cluster(
        &self,
        _cluster_id: ClusterId,
        _exemplars: &[String],
    ) -> Result<ClusterDescription, AdvisorError> {
        Err(AdvisorError::Unavailable("running offline".into()))
    }

    async fn chat(&self, _ctx: &AdvisorContext, _message: &str) -> Result<String, AdvisorError> {
        Err(AdvisorError::Unavailable("running offline".into()))
    }

    async fn wants_rebalance(&self, _message: &str) -> Result<bool, AdvisorError> {
        Err(AdvisorError::Unavailable("running offline".into()))
    }
}

/// Describe every cluster with at most `concurrency` calls in flight.
///
/// Results are keyed by cluster id, so completion order does not matter.
/// Failures degrade to the placeholder label; the noise cluster is never sent.
pub async fn describe_all(
    advisor: Arc<dyn Advisor>,
    clusters: Vec<(ClusterId, Vec<String>)>,
    concurrency: usize,
) -> HashMap<ClusterId, ClusterDescription> {
    let mut out = HashMap::with_capacity(clusters.len());
    let mut jobs: Vec<BoxFuture<'static, (ClusterId, ClusterDescription)>> = Vec::new();

    for (id, exemplars) in clusters {
        if id == NOISE {
            out.insert(id, ClusterDescription::placeholder(id));
            continue;
        }
        let advisor = Arc::clone(&advisor);
        jobs.push(
            async move {
                let description = match advisor.describe_cluster(id, &exemplars).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!(cluster_id = id, error = %e, "describe failed; using placeholder");
                        ClusterDescription::placeholder(id)
                    }
                };
                (id, description)
            }
            .boxed(),
        );
    }

    let results: Vec<(ClusterId, ClusterDescription)> = stream::iter(jobs)
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    out.extend(results);
    out
}

/// Parse a `Label: ... / Description: ...` reply.
///
/// A reply without a `Label:` line uses its first non-empty line. An empty
/// reply yields the placeholder.
pub fn parse_description(raw: &str, cluster_id: ClusterId) -> ClusterDescription {
    let mut label: Option<String> = None;
    let mut summary = String::new();

    for line in raw.lines().map(str::trim) {
        let line = line.trim_start_matches(['*', '#', '-', ' ']);
        if let Some(rest) = strip_prefix_ci(line, "label:") {
            label = Some(rest.trim_matches(['*', '"', ' ']).to_string());
        } else if let Some(rest) = strip_prefix_ci(line, "description:") {
            summary = rest.trim().to_string();
        }
    }

    let label = label
        .filter(|l| !l.is_empty())
        .or_else(|| {
            raw.lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string)
        });

    match label {
        Some(label) => ClusterDescription {
            label: truncate_label(&label),
            summary,
        },
        None => ClusterDescription::placeholder(cluster_id),
    }
}

fn strip_prefix_ci<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &line[prefix.len()..])
}

pub fn truncate_label(label: &str) -> String {
    if label.chars().count() <= MAX_LABEL_CHARS {
        return label.to_string();
    }
    let kept: String = label.chars().take(MAX_LABEL_CHARS - 3).collect();
    format!("{}...", kept.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn parses_label_and_description() {
        let d = parse_description(
            "Label: Home Cooking\nDescription: Recipes for weeknight dinners.",
            3,
        );
        assert_eq!(d.label, "Home Cooking");
        assert_eq!(d.summary, "Recipes for weeknight dinners.");

        let d = parse_description("**Label:** \"Space Missions\"\n", 1);
        assert_eq!(d.label, "Space Missions");
    }

    #[test]
    fn description_fallbacks() {
        assert_eq!(parse_description("Just a label", 2).label, "Just a label");
        assert_eq!(parse_description("  \n ", 2).label, "Cluster 2");
    }

    #[test]
    fn long_labels_are_truncated() {
        let label = "A very long label that goes on and on beyond forty characters";
        let t = truncate_label(label);
        assert!(t.ends_with("..."));
        assert!(t.chars().count() <= MAX_LABEL_CHARS);
        assert_eq!(truncate_label("Short"), "Short");
    }

    struct SlowAdvisor {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Advisor for SlowAdvisor {
        async fn advise(&self, _ctx: &AdvisorContext) -> Result<AdvisorReply, AdvisorError> {
            unreachable!()
        }

        async fn describe_cluster(
            &self,
            cluster_id: ClusterId,
            _exemplars: &[String],
        ) -> Result<ClusterDescription, AdvisorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            // Later ids finish first.
            tokio::time::sleep(Duration::from_millis(50 - 10 * cluster_id as u64)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if cluster_id == 2 {
                return Err(AdvisorError::Unavailable("boom".into()));
            }
            Ok(ClusterDescription {
                label: format!("Topic {cluster_id}"),
                summary: String::new(),
            })
        }

        async fn chat(&self, _ctx: &AdvisorContext, _m: &str) -> Result<String, AdvisorError> {
            unreachable!()
        }

        async fn wants_rebalance(&self, _m: &str) -> Result<bool, AdvisorError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn describe_all_merges_by_id_and_bounds_concurrency() {
        let advisor = Arc::new(SlowAdvisor {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let clusters: Vec<(ClusterId, Vec<String>)> =
            vec![(NOISE, vec![]), (0, vec![]), (1, vec![]), (2, vec![]), (3, vec![])];

        let out = describe_all(advisor.clone(), clusters, 2).await;

        assert_eq!(out.len(), 5);
        assert_eq!(out[&0].label, "Topic 0");
        assert_eq!(out[&3].label, "Topic 3");
        assert_eq!(out[&2].label, "Cluster 2");
        assert_eq!(out[&NOISE].label, "Uncategorized");
        assert!(advisor.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn offline_advisor_is_unavailable() {
        let out = describe_all(Arc::new(OfflineAdvisor), vec![(0, vec!["x".into()])], 4).await;
        assert_eq!(out[&0].label, "Cluster 0");
    }
}
