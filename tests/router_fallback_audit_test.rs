// tests/router_fallback_audit_test.rs
// Cross-module: a failing primary provider drives the Router into its
// fallback chain, and the audit trail observably records both the failure
// and the fallback (spec.md §4.2 + §4.9 audit integration).

use async_trait::async_trait;
use orchestration_core::error::{ProviderError, ProviderResult};
use orchestration_core::llm::provider::LlmProvider;
use orchestration_core::llm::types::{ChatMessage, FinishReason, LlmRequest, LlmResponse};
use orchestration_core::llm::{LlmRouter, ProviderId};
use orchestration_core::safety::audit::AuditLog;
use std::collections::HashMap;
use std::sync::Arc;

struct AlwaysFails(ProviderId);

#[async_trait]
impl LlmProvider for AlwaysFails {
    fn name(&self) -> &'static str {
        "always-fails"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn complete(&self, _req: &LlmRequest, _model: &str) -> ProviderResult<LlmResponse> {
        Err(ProviderError::Permanent("simulated outage".to_string()))
    }
}

struct AlwaysSucceeds(ProviderId);

#[async_trait]
impl LlmProvider for AlwaysSucceeds {
    fn name(&self) -> &'static str {
        "always-succeeds"
    }
    fn is_available(&self) -> bool {
        true
    }
    async fn complete(&self, _req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
        Ok(LlmResponse {
            content: "fallback reply".to_string(),
            provider: self.0,
            model: model.to_string(),
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
            finish_reason: FinishReason::Stop,
            tool_calls: None,
            raw: None,
        })
    }
}

#[tokio::test]
async fn fallback_emits_both_failure_and_fallback_audit_records() {
    let dir = tempfile::tempdir().unwrap();
    let audit_path = dir.path().join("audit_log.jsonl");
    let audit = AuditLog::new(audit_path.clone());

    let mut providers: HashMap<ProviderId, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert(ProviderId::Openai, Arc::new(AlwaysFails(ProviderId::Openai)));
    providers.insert(ProviderId::Anthropic, Arc::new(AlwaysSucceeds(ProviderId::Anthropic)));

    let router = LlmRouter::new(providers, 60).with_audit(audit);

    let mut req = LlmRequest::new(vec![ChatMessage::user("hello")]);
    req.provider = Some(ProviderId::Openai);
    let resp = router.complete(req).await.unwrap();
    assert_eq!(resp.provider, ProviderId::Anthropic);
    assert_eq!(resp.content, "fallback reply");

    let contents = tokio::fs::read_to_string(&audit_path).await.unwrap();
    let lines: Vec<serde_json::Value> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

    assert!(lines.iter().any(|l| l["action"] == "llm_provider_failed" && l["provider"] == "openai"));
    assert!(lines.iter().any(|l| l["action"] == "llm_fallback_used" && l["provider"] == "anthropic"));
}
