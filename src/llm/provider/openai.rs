// src/llm/provider/openai.rs

use super::{map_reqwest_err, with_retry, LlmProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::llm::types::{FinishReason, LlmRequest, LlmResponse, ProviderId, Role, ToolCallInfo};
use async_trait::async_trait;
use serde_json::{json, Value};

const API_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub(crate) fn render_messages(req: &LlmRequest) -> Vec<Value> {
        let mut out = Vec::with_capacity(req.messages.len() + 1);
        if let Some(sp) = &req.system_prompt {
            out.push(json!({"role": "system", "content": sp}));
        }
        for m in &req.messages {
            let mut entry = json!({
                "role": Self::role_str(m.role),
                "content": m.content,
            });
            if let Some(id) = &m.tool_call_id {
                entry["tool_call_id"] = json!(id);
            }
            if let Some(calls) = &m.tool_calls {
                entry["tool_calls"] = json!(calls
                    .iter()
                    .map(|c| json!({
                        "id": c.id,
                        "type": "function",
                        "function": {"name": c.function_name, "arguments": c.arguments_json},
                    }))
                    .collect::<Vec<_>>());
            }
            out.push(entry);
        }
        out
    }

    pub(crate) fn parse_response(model: &str, body: &Value) -> ProviderResult<LlmResponse> {
        let choice = body["choices"].get(0).ok_or_else(|| {
            ProviderError::Malformed("openai response had no choices".to_string())
        })?;
        let message = &choice["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();

        let tool_calls = message["tool_calls"].as_array().map(|calls| {
            calls
                .iter()
                .filter_map(|c| {
                    Some(ToolCallInfo {
                        id: c["id"].as_str()?.to_string(),
                        function_name: c["function"]["name"].as_str()?.to_string(),
                        arguments_json: c["function"]["arguments"].as_str().unwrap_or("{}").to_string(),
                    })
                })
                .collect::<Vec<_>>()
        }).filter(|v| !v.is_empty());

        let finish_reason = match choice["finish_reason"].as_str() {
            Some("tool_calls") => FinishReason::ToolCalls,
            Some("length") => FinishReason::Length,
            Some("stop") | None => {
                if tool_calls.is_some() {
                    FinishReason::ToolCalls
                } else {
                    FinishReason::Stop
                }
            }
            Some(_) => FinishReason::Stop,
        };

        let usage = &body["usage"];
        Ok(LlmResponse {
            content,
            provider: ProviderId::Openai,
            model: model.to_string(),
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
            finish_reason,
            tool_calls,
            raw: Some(body.clone()),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    async fn complete(&self, req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Permanent("openai: missing API key".to_string()))?;

        with_retry(|| async {
            let mut body = json!({
                "model": model,
                "messages": Self::render_messages(req),
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
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_err)?;

            let status = resp.status();
            let payload: Value = resp.json().await.map_err(map_reqwest_err)?;

            if !status.is_success() {
                let msg = payload["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown openai error")
                    .to_string();
                return Err(if status.is_server_error() || status.as_u16() == 429 {
                    ProviderError::Transient(format!("{status}: {msg}"))
                } else {
                    ProviderError::Permanent(format!("{status}: {msg}"))
                });
            }

            Self::parse_response(model, &payload)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_without_key() {
        let p = OpenAiProvider::new(None);
        assert!(!p.is_available());
    }

    #[test]
    fn available_with_key() {
        let p = OpenAiProvider::new(Some("sk-test".to_string()));
        assert!(p.is_available());
    }

    #[test]
    fn parses_plain_text_response() {
        let body = json!({
            "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 2, "total_tokens": 12},
        });
        let resp = OpenAiProvider::parse_response("flagship-4o", &body).unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.total_tokens, 12);
    }

    #[test]
    fn parses_tool_call_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"id": "call_1", "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}}],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 5, "total_tokens": 10},
        });
        let resp = OpenAiProvider::parse_response("flagship-4o", &body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        let calls = resp.tool_calls.unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_name, "search");
    }

    #[test]
    fn missing_choices_is_malformed() {
        let body = json!({"choices": []});
        let err = OpenAiProvider::parse_response("flagship-4o", &body).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
