//! Prompt templates for the dataset advisor.
//!
//! Provider-agnostic. Templates use `{placeholder}` slots; every substituted
//! value is XML-escaped so dataset text cannot break out of its tag.

use crate::gateway::Message;

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub(crate) fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// A prompt template with `{name}` placeholders in the user part.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        let mut user = self.user.to_string();
        for (name, value) in vars {
            user = user.replace(&format!("{{{name}}}"), &escape_xml_chars(value));
        }
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: self.system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const BALANCE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "balance_v1",
    system: r#"You are an expert in dataset bias analysis and rebalancing. You receive a dataset that has been grouped into semantic clusters, with each cluster's original size, the user's current selection, and any previous suggestion of yours.

Distinguish two kinds of imbalance:
- Collection artifacts (duplicates, spam, over-sampling from one source, wrong population): reduce aggressively (40-60% of original, weight 0.5-0.7).
- Real-world skew that may perpetuate inequity: reduce moderately if fairness is the goal (60-75% of original, weight 0.7-0.9).
Preserve or boost underrepresented clusters with good data (90-100% of original, weight 1.2-1.8). Do not flatten everything; keep justified imbalances.

Start from your previous suggestion when one is given, not from the user's current selection, and adjust it for the user's new request.

Constraints:
- suggestedCount must be between 0 and the cluster's original size.
- To boost a cluster beyond its size, use its full size and raise suggestedWeight (effective influence = count x weight).
- suggestedWeight must be between 0.01 and 2.0.

Output only valid JSON:
{"suggestions": [{"id": <cluster id>, "suggestedCount": <integer>, "suggestedWeight": <0.01-2.0>, "reasoning": "<one or two sentences>"}], "overall_strategy": "<short paragraph>"}"#,
    user: r#"<dataset_state>
{context}
</dataset_state>

<user_request>
{request}
</user_request>

Return a JSON object with one suggestion per cluster.
json:"#,
};

pub const DESCRIBE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "describe_v1",
    system: r#"You label clusters of dataset rows. Given representative rows from one cluster, give a short label (2-4 words) capturing the shared theme and a 1-2 sentence description of what the cluster represents.

Respond in exactly this format:
Label: <label>
Description: <description>"#,
    user: r#"<cluster_id>{cluster_id}</cluster_id>
<samples>
{samples}
</samples>"#,
};

pub const CHAT_PROMPT: PromptTemplate = PromptTemplate {
    slug: "chat_v1",
    system: r#"You are an assistant helping a user rebalance a dataset by adjusting per-cluster sample counts and weights.

When the user asks to adjust, reduce, increase or rebalance any cluster:
1. Acknowledge the request and say you are generating new suggestions.
2. Describe the changes with concrete numbers, e.g. "I'll reduce <cluster> from <current> to <suggested> samples".
3. If they want a cluster larger than its available rows, explain that you will use every row and raise its weight instead.
4. Mention that the suggestions appear as a separate layer they can apply or adjust.

For informational questions answer directly. Keep replies short and conversational."#,
    user: r#"<dataset_state>
{context}
</dataset_state>

<user_message>
{message}
</user_message>"#,
};

pub const DETECT_PROMPT: PromptTemplate = PromptTemplate {
    slug: "detect_rebalance_v1",
    system: r#"Decide whether a user message asks for dataset balance changes (reduce, increase, adjust, rebalance, flatten, prioritize, lower, raise) or only asks a question (what, why, how many, explain).

Examples of YES: "reduce the largest cluster", "make it more balanced", "increase representation of recent grads".
Examples of NO: "what is cluster 2?", "how many clusters are there?", "why is this one so large?".

Respond with only YES or NO."#,
    user: r#"<user_message>
{message}
</user_message>"#,
};

pub const PROMPTS: &[PromptTemplate] = &[BALANCE_PROMPT, DESCRIBE_PROMPT, CHAT_PROMPT, DETECT_PROMPT];

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

/// Samples are clipped before they go into a describe prompt.
pub const MAX_SAMPLE_CHARS: usize = 200;
pub const MAX_DESCRIBE_SAMPLES: usize = 10;

pub fn render_samples(samples: &[String]) -> String {
    samples
        .iter()
        .take(MAX_DESCRIBE_SAMPLES)
        .map(|s| {
            let clipped: String = s.chars().take(MAX_SAMPLE_CHARS).collect();
            format!("- {}", clipped.replace('\n', " "))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// =============================================================================
// TESTS
// =============================================================================
