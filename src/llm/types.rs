// src/llm/types.rs
// Wire/data shapes shared by every provider adapter and the router.
// Tagged enums stand in for the original's duck-typed dict payloads.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One of the four backends the Router knows how to fall back across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Openai,
    Anthropic,
    Google,
    Openrouter,
}

impl ProviderId {
    /// Stable iteration order used to build the fallback chain (spec.md §4.2 step 2).
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Openai,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Openrouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Openai => "openai",
            ProviderId::Anthropic => "anthropic",
            ProviderId::Google => "google",
            ProviderId::Openrouter => "openrouter",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Complexity tier driving model selection (spec.md §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Standard,
    Complex,
}

/// A single turn in a conversation. Immutable once appended to history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(tool_calls: Vec<ToolCallInfo>) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            name: None,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            name: None,
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A model-emitted request to invoke a named function with JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub function_name: String,
    pub arguments_json: String,
}

/// Rendered tool schema handed to a provider in the function-calling shape
/// (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedTool {
    #[serde(rename = "type")]
    pub kind: String,
    pub function: RenderedFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedFunction {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Request issued to a provider adapter or the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f64,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<RenderedTool>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(skip)]
    pub complexity: Complexity,
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            provider: None,
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
            system_prompt: None,
            tools: None,
            metadata: HashMap::new(),
            complexity: Complexity::Standard,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Error,
}

/// Normalized reply from a provider, regardless of which backend produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub provider: ProviderId,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl LlmResponse {
    /// Estimated USD cost from a per-model rate table; unknown models fall
    /// back to `(0.001, 0.002)` per 1k tokens (spec.md §4.2).
    pub fn estimated_cost_usd(&self, rates: &HashMap<String, (f64, f64)>) -> f64 {
        let (in_rate, out_rate) = rates.get(&self.model).copied().unwrap_or((0.001, 0.002));
        (self.prompt_tokens as f64 / 1000.0) * in_rate
            + (self.completion_tokens as f64 / 1000.0) * out_rate
    }
}
