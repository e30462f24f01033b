// src/llm/provider/anthropic.rs

use super::{map_reqwest_err, with_retry, LlmProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::llm::types::{ChatMessage, FinishReason, LlmRequest, LlmResponse, ProviderId, Role, ToolCallInfo};
use async_trait::async_trait;
use serde_json::{json, Value};

const API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    /// Anthropic keeps tool results and tool uses as typed content blocks
    /// rather than separate `tool`-role messages; translate on the way in.
    fn render_messages(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }],
                }),
                Role::Assistant if m.tool_calls.is_some() => {
                    let mut blocks = vec![];
                    if !m.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": m.content}));
                    }
                    for c in m.tool_calls.as_ref().unwrap() {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": c.id,
                            "name": c.function_name,
                            "input": serde_json::from_str::<Value>(&c.arguments_json)
                                .unwrap_or(json!({})),
                        }));
                    }
                    json!({"role": "assistant", "content": blocks})
                }
                Role::User => json!({"role": "user", "content": m.content}),
                Role::Assistant => json!({"role": "assistant", "content": m.content}),
                Role::System => unreachable!(),
            })
            .collect()
    }

    fn render_tools(req: &LlmRequest) -> Option<Vec<Value>> {
        req.tools.as_ref().map(|tools| {
            tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.function.name,
                        "description": t.function.description,
                        "input_schema": t.function.parameters,
                    })
                })
                .collect()
        })
    }

    fn parse_response(model: &str, body: &Value) -> ProviderResult<LlmResponse> {
        let blocks = body["content"].as_array().ok_or_else(|| {
            ProviderError::Malformed("anthropic response had no content blocks".to_string())
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCallInfo {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        function_name: block["name"].as_str().unwrap_or_default().to_string(),
                        arguments_json: block["input"].to_string(),
                    });
                }
                _ => {}
            }
        }

        let stop_reason = body["stop_reason"].as_str().unwrap_or("end_turn");
        let finish_reason = if !tool_calls.is_empty() || stop_reason == "tool_use" {
            FinishReason::ToolCalls
        } else if stop_reason == "max_tokens" {
            FinishReason::Length
        } else {
            FinishReason::Stop
        };

        let usage = &body["usage"];
        let prompt_tokens = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = usage["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(LlmResponse {
            content: text,
            provider: ProviderId::Anthropic,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            finish_reason,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            raw: Some(body.clone()),
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    async fn complete(&self, req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Permanent("anthropic: missing API key".to_string()))?;

        with_retry(|| async {
            let mut body = json!({
                "model": model,
                "messages": Self::render_messages(&req.messages),
                "max_tokens": req.max_tokens,
                "temperature": req.temperature,
            });
            if let Some(sp) = &req.system_prompt {
                body["system"] = json!(sp);
            }
            if let Some(tools) = Self::render_tools(req) {
                body["tools"] = json!(tools);
            }

            let resp = self
                .client
                .post(API_URL)
                .header("x-api-key", &api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_err)?;

            let status = resp.status();
            let payload: Value = resp.json().await.map_err(map_reqwest_err)?;

            if !status.is_success() {
                let msg = payload["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown anthropic error")
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
    fn parses_text_response() {
        let body = json!({
            "content": [{"type": "text", "text": "hello"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 4},
        });
        let resp = AnthropicProvider::parse_response("sonnet-4", &body).unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
        assert_eq!(resp.total_tokens, 7);
    }

    #[test]
    fn parses_tool_use_response() {
        let body = json!({
            "content": [{"type": "tool_use", "id": "t1", "name": "search_memory", "input": {"query": "x"}}],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 1, "output_tokens": 1},
        });
        let resp = AnthropicProvider::parse_response("sonnet-4", &body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.unwrap()[0].function_name, "search_memory");
    }
}
