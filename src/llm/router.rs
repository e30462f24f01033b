// src/llm/router.rs
// Multi-provider dispatcher: cooldown tracking, complexity-based model
// selection, transparent fallback (spec.md §4.2).

use crate::error::{AllProvidersExhausted, ProviderError};
use crate::llm::provider::LlmProvider;
use crate::llm::types::{ChatMessage, Complexity, LlmRequest, LlmResponse, ProviderId};
use crate::safety::audit::AuditLog;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

fn model_table() -> HashMap<(ProviderId, Complexity), &'static str> {
    use Complexity::*;
    use ProviderId::*;
    HashMap::from([
        ((Openai, Simple), "cheap-mini"),
        ((Openai, Standard), "flagship-4o"),
        ((Openai, Complex), "flagship-4o"),
        ((Anthropic, Simple), "cheap-haiku"),
        ((Anthropic, Standard), "sonnet-4"),
        ((Anthropic, Complex), "sonnet-4"),
        ((Google, Simple), "fast-flash"),
        ((Google, Standard), "pro-1.5"),
        ((Google, Complex), "pro-1.5"),
        ((Openrouter, Simple), "fast-flash"),
        ((Openrouter, Standard), "sonnet-4"),
        ((Openrouter, Complex), "sonnet-4"),
    ])
}

fn default_rate_table() -> HashMap<String, (f64, f64)> {
    HashMap::from([
        ("flagship-4o".to_string(), (0.005, 0.015)),
        ("cheap-mini".to_string(), (0.00015, 0.0006)),
        ("sonnet-4".to_string(), (0.003, 0.015)),
        ("cheap-haiku".to_string(), (0.0008, 0.004)),
        ("pro-1.5".to_string(), (0.00125, 0.005)),
        ("fast-flash".to_string(), (0.000075, 0.0003)),
    ])
}

pub struct LlmRouter {
    providers: HashMap<ProviderId, Arc<dyn LlmProvider>>,
    cooldowns: Mutex<HashMap<ProviderId, Instant>>,
    cooldown: Duration,
    model_table: HashMap<(ProviderId, Complexity), &'static str>,
    rate_table: HashMap<String, (f64, f64)>,
    audit: Option<AuditLog>,
}

impl LlmRouter {
    pub fn new(providers: HashMap<ProviderId, Arc<dyn LlmProvider>>, cooldown_seconds: u64) -> Self {
        Self {
            providers,
            cooldowns: Mutex::new(HashMap::new()),
            cooldown: Duration::from_secs(cooldown_seconds),
            model_table: model_table(),
            rate_table: default_rate_table(),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn available_providers(&self) -> Vec<ProviderId> {
        ProviderId::ALL
            .into_iter()
            .filter(|id| self.providers.get(id).is_some_and(|p| p.is_available()))
            .collect()
    }

    pub fn select_model(&self, provider: ProviderId, complexity: Complexity) -> &'static str {
        self.model_table
            .get(&(provider, complexity))
            .copied()
            .unwrap_or("flagship-4o")
    }

    async fn is_cooled_down(&self, id: ProviderId) -> bool {
        let cooldowns = self.cooldowns.lock().await;
        cooldowns.get(&id).is_some_and(|until| Instant::now() < *until)
    }

    async fn mark_cooldown(&self, id: ProviderId) {
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.insert(id, Instant::now() + self.cooldown);
    }

    async fn clear_cooldown(&self, id: ProviderId) {
        let mut cooldowns = self.cooldowns.lock().await;
        cooldowns.remove(&id);
    }

    /// Builds the ordered fallback chain (spec.md §4.2): preferred first,
    /// then the rest in stable `ProviderId::ALL` order, unavailable
    /// providers dropped, then stable-partitioned not-cooled-down before
    /// cooled-down so a cooled-down provider is tried last rather than
    /// skipped entirely.
    async fn fallback_chain(&self, preferred: Option<ProviderId>) -> Vec<ProviderId> {
        let mut ordered = Vec::new();
        if let Some(p) = preferred {
            ordered.push(p);
        }
        for id in ProviderId::ALL {
            if Some(id) != preferred {
                ordered.push(id);
            }
        }

        let available: Vec<ProviderId> = ordered
            .into_iter()
            .filter(|id| self.providers.get(id).is_some_and(|p| p.is_available()))
            .collect();

        let mut not_cooled = Vec::new();
        let mut cooled = Vec::new();
        for id in available {
            if self.is_cooled_down(id).await {
                cooled.push(id);
            } else {
                not_cooled.push(id);
            }
        }
        not_cooled.extend(cooled);
        not_cooled
    }

    fn log_cost(&self, resp: &LlmResponse) {
        let cost = resp.estimated_cost_usd(&self.rate_table);
        info!(
            provider = %resp.provider,
            model = %resp.model,
            prompt_tokens = resp.prompt_tokens,
            completion_tokens = resp.completion_tokens,
            estimated_cost_usd = cost,
            "llm_call_completed"
        );
    }

    /// Iterates the fallback chain, returning the first success. On
    /// exhaustion, fails with `AllProvidersExhausted` carrying the last
    /// underlying error (spec.md §4.2).
    pub async fn complete(&self, req: LlmRequest) -> Result<LlmResponse, AllProvidersExhausted> {
        let chain = self.fallback_chain(req.provider).await;
        let mut last_error = "no providers configured".to_string();

        for (idx, provider_id) in chain.iter().copied().enumerate() {
            let Some(provider) = self.providers.get(&provider_id) else {
                continue;
            };
            let model = if Some(provider_id) == req.provider {
                req.model.clone().unwrap_or_else(|| self.select_model(provider_id, req.complexity).to_string())
            } else {
                self.select_model(provider_id, req.complexity).to_string()
            };

            match provider.complete(&req, &model).await {
                Ok(resp) => {
                    self.clear_cooldown(provider_id).await;
                    self.log_cost(&resp);
                    if idx > 0 {
                        if let Some(audit) = &self.audit {
                            let _ = audit
                                .append(
                                    "llm_fallback_used",
                                    json!({"provider": provider_id.as_str(), "attempt": idx}),
                                )
                                .await;
                        }
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(provider = %provider_id, error = %last_error, "llm_provider_failed");
                    if let Some(audit) = &self.audit {
                        let _ = audit
                            .append(
                                "llm_provider_failed",
                                json!({"provider": provider_id.as_str(), "error": last_error}),
                            )
                            .await;
                    }
                    self.mark_cooldown(provider_id).await;
                }
            }
        }

        Err(AllProvidersExhausted { last_error })
    }

    /// Single-turn convenience helper.
    pub async fn quick(
        &self,
        prompt: impl Into<String>,
        system: Option<String>,
        complexity: Complexity,
    ) -> Result<String, AllProvidersExhausted> {
        let mut req = LlmRequest::new(vec![ChatMessage::user(prompt)]);
        req.system_prompt = system;
        req.complexity = complexity;
        let resp = self.complete(req).await?;
        Ok(resp.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::llm::types::FinishReason;

    struct MockProvider {
        id: ProviderId,
        available: bool,
        calls: AtomicUsize,
        fail_first_n: usize,
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn complete(&self, _req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                return Err(ProviderError::Transient("boom".to_string()));
            }
            Ok(LlmResponse {
                content: format!("{}-ok", self.id),
                provider: self.id,
                model: model.to_string(),
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
                finish_reason: FinishReason::Stop,
                tool_calls: None,
                raw: None,
            })
        }
    }

    fn router_with(providers: Vec<(ProviderId, Arc<dyn LlmProvider>)>) -> LlmRouter {
        LlmRouter::new(providers.into_iter().collect(), 60)
    }

    #[tokio::test]
    async fn falls_back_to_secondary_on_primary_failure() {
        let primary = Arc::new(MockProvider {
            id: ProviderId::Openai,
            available: true,
            calls: AtomicUsize::new(0),
            fail_first_n: 1,
        });
        let secondary = Arc::new(MockProvider {
            id: ProviderId::Anthropic,
            available: true,
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let router = router_with(vec![
            (ProviderId::Openai, primary.clone()),
            (ProviderId::Anthropic, secondary.clone()),
        ]);

        let mut req = LlmRequest::new(vec![ChatMessage::user("hi")]);
        req.provider = Some(ProviderId::Openai);
        let resp = router.complete(req).await.unwrap();
        assert_eq!(resp.provider, ProviderId::Anthropic);
        assert!(router.is_cooled_down(ProviderId::Openai).await);
    }

    #[tokio::test]
    async fn successful_response_is_not_in_cooldown() {
        let primary = Arc::new(MockProvider {
            id: ProviderId::Openai,
            available: true,
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let router = router_with(vec![(ProviderId::Openai, primary)]);
        let req = LlmRequest::new(vec![ChatMessage::user("hi")]);
        router.complete(req).await.unwrap();
        assert!(!router.is_cooled_down(ProviderId::Openai).await);
    }

    #[tokio::test]
    async fn exhausts_when_all_providers_fail() {
        let only = Arc::new(MockProvider {
            id: ProviderId::Openai,
            available: true,
            calls: AtomicUsize::new(0),
            fail_first_n: 99,
        });
        let router = router_with(vec![(ProviderId::Openai, only)]);
        let req = LlmRequest::new(vec![ChatMessage::user("hi")]);
        let err = router.complete(req).await.unwrap_err();
        assert!(err.last_error.contains("boom"));
    }

    #[tokio::test]
    async fn unavailable_provider_is_never_selected() {
        let unavailable = Arc::new(MockProvider {
            id: ProviderId::Openai,
            available: false,
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let available = Arc::new(MockProvider {
            id: ProviderId::Anthropic,
            available: true,
            calls: AtomicUsize::new(0),
            fail_first_n: 0,
        });
        let router = router_with(vec![
            (ProviderId::Openai, unavailable),
            (ProviderId::Anthropic, available),
        ]);
        assert_eq!(router.available_providers(), vec![ProviderId::Anthropic]);
        let req = LlmRequest::new(vec![ChatMessage::user("hi")]);
        let resp = router.complete(req).await.unwrap();
        assert_eq!(resp.provider, ProviderId::Anthropic);
    }

    #[test]
    fn select_model_matches_complexity_tier() {
        let router = router_with(vec![]);
        assert_eq!(router.select_model(ProviderId::Openai, Complexity::Simple), "cheap-mini");
        assert_eq!(router.select_model(ProviderId::Anthropic, Complexity::Standard), "sonnet-4");
        assert_eq!(router.select_model(ProviderId::Google, Complexity::Complex), "pro-1.5");
    }
}
