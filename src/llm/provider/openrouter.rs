// src/llm/provider/openrouter.rs
// OpenRouter speaks the same chat-completions wire shape as OpenAI; only the
// base URL, auth header, and routing headers differ, so response parsing is
// reused from the OpenAI adapter.

use super::openai::OpenAiProvider;
use super::{map_reqwest_err, with_retry, LlmProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::llm::types::{LlmRequest, LlmResponse, ProviderId};
use async_trait::async_trait;
use serde_json::{json, Value};

const API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

pub struct OpenRouterProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenRouterProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenRouterProvider {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    async fn complete(&self, req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Permanent("openrouter: missing API key".to_string()))?;

        with_retry(|| async {
            let mut body = json!({
                "model": model,
                "messages": OpenAiProvider::render_messages(req),
                "temperature": req.temperature,
                "max_tokens": req.max_tokens,
            });
            if let Some(tools) = &req.tools {
                body["tools"] = json!(tools);
            }

            let resp = self
                .client
                .post(API_URL)
                .header("Authorization", format!("Bearer {api_key}"))
                .header("HTTP-Referer", "https://orchestration-core.local")
                .header("X-Title", "orchestration-core")
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_err)?;

            let status = resp.status();
            let payload: Value = resp.json().await.map_err(map_reqwest_err)?;

            if !status.is_success() {
                let msg = payload["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown openrouter error")
                    .to_string();
                return Err(if status.is_server_error() || status.as_u16() == 429 {
                    ProviderError::Transient(format!("{status}: {msg}"))
                } else {
                    ProviderError::Permanent(format!("{status}: {msg}"))
                });
            }

            let resp = OpenAiProvider::parse_response(model, &payload)?;
            Ok(LlmResponse {
                provider: ProviderId::Openrouter,
                ..resp
            })
        })
        .await
    }
}
