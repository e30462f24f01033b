// src/evolution/feedback.rs
// User-feedback triage. Classifies free-form feedback with one LLM call and,
// when actionable, enqueues it rather than invoking the Evolution Engine
// directly — a deliberate deviation from the original supervisor (which calls
// evolution straight from feedback processing) so the Improvement Queue stays
// the single entry point for every source-tree mutation.

use crate::llm::router::LlmRouter;
use crate::llm::types::Complexity;
use crate::queue::{ImprovementQueue, QueueItem, QueueItemSource};
use crate::safety::SafetyGuard;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::info;

const SYSTEM_PROMPT: &str = r#"You triage user feedback about an AI assistant's own behavior.

Classify the feedback into one category:
- "bug": something broke or behaved incorrectly
- "feature": a request for new capability
- "behavior": a request to change how the assistant responds or behaves
- "general": praise, venting, or anything not actionable as a code change

Decide whether this is actionable as a concrete source change. If it is, phrase
`improvement_request` as a specific, implementable instruction.

RESPONSE FORMAT (JSON only):
{
    "category": "bug|feature|behavior|general",
    "actionable": true|false,
    "improvement_request": "specific instruction, or empty string if not actionable",
    "explanation": "one sentence explaining the classification"
}"#;

#[derive(Debug, Deserialize)]
struct RawAnalysis {
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    actionable: bool,
    #[serde(default)]
    improvement_request: String,
    #[serde(default)]
    explanation: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Clone)]
pub struct FeedbackAnalysis {
    pub category: String,
    pub actionable: bool,
    pub improvement_request: String,
    pub explanation: String,
}

static JSON_OBJECT: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)\{.*\}").expect("valid regex"));

fn parse_analysis(response: &str) -> FeedbackAnalysis {
    let mut text = response.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
        if let Some(idx) = text.find('\n') {
            text = &text[idx + 1..];
        }
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text);
    }

    let raw: Option<RawAnalysis> = serde_json::from_str(text.trim())
        .ok()
        .or_else(|| JSON_OBJECT.find(text).and_then(|m| serde_json::from_str(m.as_str()).ok()));

    match raw {
        Some(raw) => FeedbackAnalysis {
            category: raw.category,
            actionable: raw.actionable,
            improvement_request: raw.improvement_request,
            explanation: raw.explanation,
        },
        None => FeedbackAnalysis {
            category: "general".to_string(),
            actionable: false,
            improvement_request: String::new(),
            explanation: "could not classify feedback".to_string(),
        },
    }
}

pub struct FeedbackTriage {
    router: Arc<LlmRouter>,
    queue: Arc<ImprovementQueue>,
    safety: Arc<SafetyGuard>,
}

impl FeedbackTriage {
    pub fn new(router: Arc<LlmRouter>, queue: Arc<ImprovementQueue>, safety: Arc<SafetyGuard>) -> Self {
        Self { router, queue, safety }
    }

    pub async fn analyze(&self, feedback: &str) -> FeedbackAnalysis {
        match self
            .router
            .quick(feedback.to_string(), Some(SYSTEM_PROMPT.to_string()), Complexity::Standard)
            .await
        {
            Ok(text) => parse_analysis(&text),
            Err(_) => FeedbackAnalysis {
                category: "general".to_string(),
                actionable: false,
                improvement_request: String::new(),
                explanation: "LLM call failed".to_string(),
            },
        }
    }

    /// Classifies feedback and, if actionable, enqueues an improvement
    /// request with `source = user` rather than calling the Evolution Engine
    /// directly (spec.md §4.7 invariants I1/I2).
    pub async fn process(&self, user_id: &str, feedback: &str) -> (bool, String, Option<QueueItem>) {
        self.safety
            .audit("feedback_received", json!({"user_id": user_id, "feedback": feedback}))
            .await;

        let analysis = self.analyze(feedback).await;

        if !analysis.actionable || analysis.improvement_request.is_empty() {
            self.safety
                .audit(
                    "feedback_not_actionable",
                    json!({"category": analysis.category, "explanation": analysis.explanation}),
                )
                .await;
            return (
                false,
                format!("Feedback noted ({}): {}", analysis.category, analysis.explanation),
                None,
            );
        }

        self.safety
            .audit("feedback_actionable", json!({"category": analysis.category, "request": analysis.improvement_request}))
            .await;

        let item = match self
            .queue
            .add(
                analysis.improvement_request.clone(),
                QueueItemSource::User,
                5,
                json!({"category": analysis.category, "user_id": user_id}),
            )
            .await
        {
            Ok(item) => item,
            Err(err) => {
                return (false, format!("Feedback classified as actionable but could not be queued: {err}"), None);
            }
        };

        info!(id = %item.id, category = %analysis.category, "feedback_enqueued");
        (true, format!("Queued as improvement: {}", analysis.improvement_request), Some(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_actionable_feedback_json() {
        let text = r#"{"category": "bug", "actionable": true, "improvement_request": "fix X", "explanation": "clear bug report"}"#;
        let analysis = parse_analysis(text);
        assert_eq!(analysis.category, "bug");
        assert!(analysis.actionable);
        assert_eq!(analysis.improvement_request, "fix X");
    }

    #[test]
    fn unparsable_feedback_is_treated_as_non_actionable() {
        let analysis = parse_analysis("not json");
        assert!(!analysis.actionable);
        assert_eq!(analysis.category, "general");
    }

    #[test]
    fn parses_json_wrapped_in_markdown_fence() {
        let text = "```json\n{\"category\": \"feature\", \"actionable\": true, \"improvement_request\": \"add dark mode\", \"explanation\": \"feature ask\"}\n```";
        let analysis = parse_analysis(text);
        assert_eq!(analysis.category, "feature");
        assert_eq!(analysis.improvement_request, "add dark mode");
    }
}
