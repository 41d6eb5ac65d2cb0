//! Advisor backed by a chat-completion gateway.

use std::sync::Arc;

use tracing::{debug, info};

use super::prompts::{render_samples, BALANCE_PROMPT, CHAT_PROMPT, DESCRIBE_PROMPT, DETECT_PROMPT};
use super::{parse_description, parse_reply, Advisor, AdvisorContext, AdvisorError, AdvisorReply};
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, FinishReason};
use crate::oracle::ClusterId;
use crate::waveform::ClusterDescription;

/// Default request when the user asked for suggestions without saying why.
const DEFAULT_REQUEST: &str = "Suggest a balanced rebalancing strategy for this dataset.";

pub struct LlmAdvisor {
    gateway: Arc<dyn ChatGateway>,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl LlmAdvisor {
    pub fn new(gateway: Arc<dyn ChatGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: 0.3,
            max_tokens: 2048,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = max;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, prompt: super::prompts::PromptInstance, caller: &'static str) -> ChatRequest {
        ChatRequest::new(
            ChatModel::openrouter(&self.model),
            prompt.to_messages(),
            Attribution::new(caller),
        )
        .temperature(self.temperature)
        .max_tokens(self.max_tokens)
    }
}

#[async_trait::async_trait]
impl Advisor for LlmAdvisor {
    async fn advise(&self, ctx: &AdvisorContext) -> Result<AdvisorReply, AdvisorError> {
        let context = ctx.render();
        let request = ctx.user_request.as_deref().unwrap_or(DEFAULT_REQUEST);
        let prompt = BALANCE_PROMPT.render(&[("context", &context), ("request", request)]);

        let resp = self
            .gateway
            .chat(self.request(prompt, "advisor::advise").json())
            .await?;
        if resp.finish_reason == FinishReason::Length {
            debug!(model = %self.model, "suggestion reply hit the token limit");
        }

        let reply = parse_reply(&resp.content)?;
        info!(
            suggestions = reply.suggestions.len(),
            clusters = ctx.clusters.len(),
            "advisor suggestions received"
        );
        Ok(reply)
    }

    async fn describe_cluster(
        &self,
        cluster_id: ClusterId,
        exemplars: &[String],
    ) -> Result<ClusterDescription, AdvisorError> {
        let id = cluster_id.to_string();
        let samples = render_samples(exemplars);
        let prompt = DESCRIBE_PROMPT.render(&[("cluster_id", &id), ("samples", &samples)]);

        let resp = self
            .gateway
            .chat(self.request(prompt, "advisor::describe").max_tokens(200))
            .await?;
        Ok(parse_description(&resp.content, cluster_id))
    }

    async fn chat(&self, ctx: &AdvisorContext, message: &str) -> Result<String, AdvisorError> {
        let context = ctx.render();
        let prompt = CHAT_PROMPT.render(&[("context", &context), ("message", message)]);

        let resp = self
            .gateway
            .chat(self.request(prompt, "advisor::chat").temperature(0.7))
            .await?;
        let reply = resp.content.trim();
        if reply.is_empty() {
            return Err(AdvisorError::malformed("empty chat reply", &resp.content));
        }
        Ok(reply.to_string())
    }

    async fn wants_rebalance(&self, message: &str) -> Result<bool, AdvisorError> {
        let prompt = DETECT_PROMPT.render(&[("message", message)]);
        let resp = self
            .gateway
            .chat(
                self.request(prompt, "advisor::detect")
                    .temperature(0.0)
                    .max_tokens(5),
            )
            .await?;
        Ok(resp.content.trim().to_ascii_uppercase().starts_with("YES"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatResponse, ProviderError, Role};
    use std::sync::Mutex;
    use std::time::Duration;

    struct ScriptedGateway {
        replies: Mutex<Vec<String>>,
        seen: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedGateway {
        fn new(replies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.iter().rev().map(|s| s.to_string()).collect()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatGateway for ScriptedGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(req);
            let content = self.replies.lock().unwrap().pop().unwrap_or_default();
            Ok(ChatResponse {
                content,
                input_tokens: 10,
                output_tokens: 5,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    fn ctx() -> AdvisorContext {
        AdvisorContext {
            total_rows: 10,
            columns: vec!["text".into()],
            clusters: vec![],
            previous_strategy: None,
            user_request: Some("shrink <big> ones".into()),
        }
    }

    #[tokio::test]
    async fn advise_sends_json_request_with_escaped_context() {
        let gw = ScriptedGateway::new(&[
            r#"{"suggestions": [{"id": 0, "suggestedCount": 3, "suggestedWeight": 1.2}], "overall_strategy": "ok"}"#,
        ]);
        let advisor = LlmAdvisor::new(gw.clone(), "openai/gpt-4o-mini");

        let reply = advisor.advise(&ctx()).await.unwrap();
        assert_eq!(reply.suggestions.len(), 1);

        let seen = gw.seen.lock().unwrap();
        assert!(seen[0].json_mode);
        assert_eq!(seen[0].attribution.caller, "advisor::advise");
        assert_eq!(seen[0].messages[1].role, Role::User);
        assert!(seen[0].messages[1].content.contains("shrink &lt;big&gt; ones"));
    }

    #[tokio::test]
    async fn describe_and_detect() {
        let gw = ScriptedGateway::new(&["Label: Pets\nDescription: Cats and dogs.", " yes."]);
        let advisor = LlmAdvisor::new(gw.clone(), "m");

        let d = advisor
            .describe_cluster(4, &["my cat".into(), "our dog".into()])
            .await
            .unwrap();
        assert_eq!(d.label, "Pets");
        assert!(advisor.wants_rebalance("reduce cluster 1").await.unwrap());

        let seen = gw.seen.lock().unwrap();
        assert!(seen[0].messages[1].content.contains("- my cat"));
        assert_eq!(seen[1].max_tokens, Some(5));
    }

    #[tokio::test]
    async fn empty_chat_reply_is_malformed() {
        let gw = ScriptedGateway::new(&["   "]);
        let advisor = LlmAdvisor::new(gw, "m");
        assert!(matches!(
            advisor.chat(&ctx(), "hi").await,
            Err(AdvisorError::Malformed { .. })
        ));
    }
}
