// src/llm/provider/google.rs

use super::{map_reqwest_err, with_retry, LlmProvider};
use crate::error::{ProviderError, ProviderResult};
use crate::llm::types::{ChatMessage, FinishReason, LlmRequest, LlmResponse, ProviderId, Role, ToolCallInfo};
use async_trait::async_trait;
use serde_json::{json, Value};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

pub struct GoogleProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn render_contents(messages: &[ChatMessage]) -> Vec<Value> {
        messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                    Role::Tool => "function",
                    Role::System => unreachable!(),
                };
                let parts = if m.role == Role::Tool {
                    vec![json!({
                        "functionResponse": {
                            "name": m.tool_call_id,
                            "response": {"content": m.content},
                        }
                    })]
                } else if let Some(calls) = &m.tool_calls {
                    calls
                        .iter()
                        .map(|c| {
                            json!({
                                "functionCall": {
                                    "name": c.function_name,
                                    "args": serde_json::from_str::<Value>(&c.arguments_json)
                                        .unwrap_or(json!({})),
                                }
                            })
                        })
                        .collect()
                } else {
                    vec![json!({"text": m.content})]
                };
                json!({"role": role, "parts": parts})
            })
            .collect()
    }

    fn parse_response(model: &str, body: &Value) -> ProviderResult<LlmResponse> {
        let candidate = body["candidates"].get(0).ok_or_else(|| {
            ProviderError::Malformed("google response had no candidates".to_string())
        })?;
        let parts = candidate["content"]["parts"].as_array().ok_or_else(|| {
            ProviderError::Malformed("google candidate had no parts".to_string())
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if let Some(fc) = part.get("functionCall") {
                tool_calls.push(ToolCallInfo {
                    id: format!("{}-{i}", fc["name"].as_str().unwrap_or("call")),
                    function_name: fc["name"].as_str().unwrap_or_default().to_string(),
                    arguments_json: fc["args"].to_string(),
                });
            }
        }

        let finish_reason = match candidate["finishReason"].as_str() {
            _ if !tool_calls.is_empty() => FinishReason::ToolCalls,
            Some("MAX_TOKENS") => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        let usage = &body["usageMetadata"];
        let prompt_tokens = usage["promptTokenCount"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32;
        let total_tokens = usage["totalTokenCount"].as_u64().unwrap_or((prompt_tokens + completion_tokens) as u64) as u32;

        Ok(LlmResponse {
            content: text,
            provider: ProviderId::Google,
            model: model.to_string(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            finish_reason,
            tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
            raw: Some(body.clone()),
        })
    }
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn name(&self) -> &'static str {
        "google"
    }

    fn is_available(&self) -> bool {
        self.api_key.as_ref().is_some_and(|k| !k.is_empty())
    }

    async fn complete(&self, req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse> {
        let api_key = self
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Permanent("google: missing API key".to_string()))?;

        with_retry(|| async {
            let mut body = json!({
                "contents": Self::render_contents(&req.messages),
                "generationConfig": {
                    "temperature": req.temperature,
                    "maxOutputTokens": req.max_tokens,
                },
            });
            if let Some(sp) = &req.system_prompt {
                body["systemInstruction"] = json!({"parts": [{"text": sp}]});
            }
            if let Some(tools) = &req.tools {
                let function_decls: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.function.name,
                            "description": t.function.description,
                            "parameters": t.function.parameters,
                        })
                    })
                    .collect();
                body["tools"] = json!([{"functionDeclarations": function_decls}]);
            }

            let url = format!("{API_BASE}/{model}:generateContent?key={api_key}");
            let resp = self
                .client
                .post(url)
                .json(&body)
                .send()
                .await
                .map_err(map_reqwest_err)?;

            let status = resp.status();
            let payload: Value = resp.json().await.map_err(map_reqwest_err)?;

            if !status.is_success() {
                let msg = payload["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown google error")
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
            "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 1, "totalTokenCount": 3},
        });
        let resp = GoogleProvider::parse_response("pro-1.5", &body).unwrap();
        assert_eq!(resp.content, "hi");
        assert_eq!(resp.total_tokens, 3);
    }

    #[test]
    fn parses_function_call() {
        let body = json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "search_memory", "args": {"q": "x"}}}]}}],
            "usageMetadata": {},
        });
        let resp = GoogleProvider::parse_response("pro-1.5", &body).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
        assert_eq!(resp.tool_calls.unwrap()[0].function_name, "search_memory");
    }
}
