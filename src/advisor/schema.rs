//! Structured advisor replies and their validation.
//!
//! Replies are validated at the boundary: a payload missing any required
//! field is rejected as a whole rather than partially merged.

use serde::{Deserialize, Serialize};

use super::AdvisorError;
use crate::oracle::ClusterId;

// =============================================================================
// Types
// =============================================================================

/// One per-cluster suggestion, after validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub cluster_id: ClusterId,
    /// Rounded to the nearest integer; range is enforced at merge time.
    pub suggested_count: i64,
    pub suggested_weight: f64,
    pub reasoning: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A validated advisor reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorReply {
    pub suggestions: Vec<Suggestion>,
    pub overall_strategy: String,
}

#[derive(Debug, Deserialize)]
struct RawReply {
    suggestions: Vec<RawSuggestion>,
    #[serde(alias = "overallStrategy")]
    overall_strategy: String,
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    #[serde(alias = "clusterId", alias = "cluster_id")]
    id: ClusterId,
    #[serde(rename = "suggestedCount", alias = "suggested_count")]
    suggested_count: f64,
    #[serde(rename = "suggestedWeight", alias = "suggested_weight")]
    suggested_weight: f64,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    label: Option<String>,
}

// =============================================================================
// Parsing
// =============================================================================

/// Parse and validate a raw advisor response.
pub fn parse_reply(raw: &str) -> Result<AdvisorReply, AdvisorError> {
    let json_str = extract_json(raw);
    let parsed: RawReply =
        serde_json::from_str(json_str).map_err(|e| AdvisorError::malformed(e.to_string(), raw))?;

    let mut suggestions = Vec::with_capacity(parsed.suggestions.len());
    for (i, s) in parsed.suggestions.into_iter().enumerate() {
        if !s.suggested_count.is_finite() {
            return Err(AdvisorError::malformed(
                format!("suggestion {i} (cluster {}) has non-finite suggestedCount", s.id),
                raw,
            ));
        }
        if !s.suggested_weight.is_finite() {
            return Err(AdvisorError::malformed(
                format!("suggestion {i} (cluster {}) has non-finite suggestedWeight", s.id),
                raw,
            ));
        }
        suggestions.push(Suggestion {
            cluster_id: s.id,
            suggested_count: s.suggested_count.round() as i64,
            suggested_weight: s.suggested_weight,
            reasoning: s.reasoning.unwrap_or_default(),
            label: s
                .label
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        });
    }

    Ok(AdvisorReply {
        suggestions,
        overall_strategy: parsed.overall_strategy,
    })
}

// =============================================================================
// JSON extraction
// =============================================================================

/// Extract a JSON object from potentially noisy LLM output.
///
/// Handles:
/// - Pure JSON responses
/// - JSON wrapped in markdown code fences
/// - JSON embedded in prose
pub fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();

    if trimmed.starts_with('{') {
        if let Some(end) = find_matching_brace(trimmed) {
            return &trimmed[..end];
        }
    }

    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }

    trimmed
}

/// Byte offset just past the brace closing the first object, respecting JSON strings.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_snake_and_camel_variants() {
        let raw = r#"{
            "suggestions": [
                {"id": 0, "suggestedCount": 42, "suggestedWeight": 0.75, "reasoning": "dominant"},
                {"clusterId": 2, "suggestedCount": 9.6, "suggestedWeight": 1.5}
            ],
            "overallStrategy": "trim the head"
        }"#;
        let reply = parse_reply(raw).unwrap();
        assert_eq!(reply.overall_strategy, "trim the head");
        assert_eq!(reply.suggestions[0].cluster_id, 0);
        assert_eq!(reply.suggestions[0].reasoning, "dominant");
        assert_eq!(reply.suggestions[1].cluster_id, 2);
        assert_eq!(reply.suggestions[1].suggested_count, 10);
        assert_eq!(reply.suggestions[1].reasoning, "");
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let no_strategy = r#"{"suggestions": []}"#;
        assert!(matches!(
            parse_reply(no_strategy),
            Err(AdvisorError::Malformed { .. })
        ));

        let no_weight =
            r#"{"suggestions": [{"id": 1, "suggestedCount": 3}], "overall_strategy": "x"}"#;
        assert!(matches!(
            parse_reply(no_weight),
            Err(AdvisorError::Malformed { .. })
        ));

        let string_count = r#"{"suggestions": [{"id": 1, "suggestedCount": "many", "suggestedWeight": 1}], "overall_strategy": "x"}"#;
        assert!(matches!(
            parse_reply(string_count),
            Err(AdvisorError::Malformed { .. })
        ));
    }

    #[test]
    fn prose_is_malformed() {
        assert!(matches!(
            parse_reply("Sorry, I think the clusters look fine."),
            Err(AdvisorError::Malformed { .. })
        ));
    }

    #[test]
    fn reply_inside_code_fence() {
        let raw = "Here you go:\n```json\n{\"suggestions\": [], \"overall_strategy\": \"keep {as is}\"}\n```";
        let reply = parse_reply(raw).unwrap();
        assert!(reply.suggestions.is_empty());
        assert_eq!(reply.overall_strategy, "keep {as is}");
    }

    #[test]
    fn extract_json_braces_in_strings() {
        let input = r#"{"description": "Use {braces} literally", "count": 1}"#;
        assert_eq!(extract_json(input), input);

        let wrapped = r#"Here is the result: {"desc": "a {b} c", "x": 2} done"#;
        assert_eq!(extract_json(wrapped), r#"{"desc": "a {b} c", "x": 2}"#);
    }

    #[test]
    fn extract_json_escaped_quotes_in_strings() {
        let input = r#"{"title": "Fix \"broken\" thing"}"#;
        assert_eq!(extract_json(input), input);
    }
}
