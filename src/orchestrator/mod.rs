// src/orchestrator/mod.rs
// Bounded iterative tool-call loop mediating between the model, the Tool
// Registry, and the token-budgeted context window (spec.md §4.5).

pub mod sanitize;

use crate::config::{ContextConfig, OrchestratorConfig};
use crate::context::{ContextAssembler, MemoryStore};
use crate::errors::ErrorCollector;
use crate::llm::types::{ChatMessage, Complexity, LlmRequest, ToolCallInfo};
use crate::llm::LlmRouter;
use crate::safety::audit::AuditLog;
use crate::tools::{SessionContext, ToolRegistry};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

const FALLBACK_MESSAGE: &str = "I'm having trouble processing your request. Please try again.";
const STEP_BUDGET_MESSAGE: &str = "I was unable to finish this task within the step budget.";

pub struct ProcessResult {
    pub response: String,
    pub chunks: Vec<String>,
    pub tool_calls: Vec<ToolCallInfo>,
    pub iterations: usize,
    pub tokens_used: u32,
    pub model: String,
}

/// Returned when a caller's `CancellationToken` fires mid-loop. No partial
/// assistant state is persisted and the Error Collector is not notified for
/// the calls that were in flight (spec.md §4.5 Cancellation).
#[derive(Debug, thiserror::Error)]
#[error("request cancelled")]
pub struct Cancelled;

pub struct Orchestrator {
    router: Arc<LlmRouter>,
    tools: Arc<ToolRegistry>,
    memory: Arc<dyn MemoryStore>,
    errors: ErrorCollector,
    audit: AuditLog,
    config: OrchestratorConfig,
    context_config: ContextConfig,
    system_prompt_template: String,
    assistant_name: String,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: Arc<LlmRouter>,
        tools: Arc<ToolRegistry>,
        memory: Arc<dyn MemoryStore>,
        errors: ErrorCollector,
        audit: AuditLog,
        config: OrchestratorConfig,
        context_config: ContextConfig,
        system_prompt_template: impl Into<String>,
        assistant_name: impl Into<String>,
    ) -> Self {
        Self {
            router,
            tools,
            memory,
            errors,
            audit,
            config,
            context_config,
            system_prompt_template: system_prompt_template.into(),
            assistant_name: assistant_name.into(),
        }
    }

    #[instrument(skip(self, cancel), fields(user_id = %user_id, channel = %channel))]
    pub async fn process_message(
        &self,
        user_id: &str,
        text: &str,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<ProcessResult, Cancelled> {
        self.memory
            .append_conversation(user_id, "user", text, channel, None, None)
            .await
            .ok();

        let assembler = ContextAssembler::new(
            &self.context_config,
            self.system_prompt_template.as_str(),
            self.assistant_name.as_str(),
        );
        let messages = match assembler.assemble(self.memory.as_ref(), user_id, user_id, text).await {
            Ok(m) => m,
            Err(_) => vec![ChatMessage::user(text)],
        };

        let mut req = LlmRequest::new(messages);
        req.tools = Some(self.tools.render_schemas());
        req.complexity = Complexity::Standard;

        let mut iteration = 0usize;
        let mut accumulated_tool_calls = Vec::new();
        let mut total_tokens = 0u32;
        let mut final_model = String::new();
        let mut final_text: Option<String> = None;

        while iteration < self.config.max_tool_iterations {
            iteration += 1;
            let resp = tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                resp = self.router.complete(req.clone()) => resp,
            };

            let resp = match resp {
                Ok(r) => r,
                Err(exhausted) => {
                    warn!(error = %exhausted, "all providers exhausted");
                    final_text = Some(FALLBACK_MESSAGE.to_string());
                    break;
                }
            };

            total_tokens += resp.total_tokens;
            final_model = resp.model.clone();

            let Some(tool_calls) = resp.tool_calls.clone() else {
                final_text = Some(resp.content.clone());
                break;
            };
            if tool_calls.is_empty() {
                final_text = Some(resp.content.clone());
                break;
            }

            req.messages.push(ChatMessage::assistant_with_tool_calls(tool_calls.clone()));

            for call in &tool_calls {
                if cancel.is_cancelled() {
                    return Err(Cancelled);
                }

                let result_json = self.dispatch_tool_call(call, user_id, channel).await;
                req.messages.push(ChatMessage::tool_result(call.id.clone(), result_json));
            }

            accumulated_tool_calls.extend(tool_calls);
        }

        let final_text = final_text.unwrap_or_else(|| STEP_BUDGET_MESSAGE.to_string());

        let legacy_unwrapped = sanitize::unwrap_legacy_response_field(&final_text);
        let unwrapped = sanitize::sanitize(&legacy_unwrapped);

        self.memory
            .append_conversation(user_id, "assistant", &unwrapped, channel, Some(&final_model), Some(total_tokens))
            .await
            .ok();

        let chunks = if unwrapped.chars().count() > self.config.message_chunk_limit {
            sanitize::chunk(&unwrapped, self.config.message_chunk_limit)
        } else {
            vec![unwrapped.clone()]
        };

        let _ = self
            .audit
            .append(
                "message_processed",
                json!({
                    "intent": user_id,
                    "tools_called_count": accumulated_tool_calls.len(),
                    "tokens": total_tokens,
                }),
            )
            .await;

        info!(iterations = iteration, tools_called = accumulated_tool_calls.len(), "message_processed");

        Ok(ProcessResult {
            response: unwrapped,
            chunks,
            tool_calls: accumulated_tool_calls,
            iterations: iteration,
            tokens_used: total_tokens,
            model: final_model,
        })
    }

    /// Looks up and invokes a handler; unhandled exceptions and unknown
    /// tools become `{"error": ...}` fed back to the model, and the Error
    /// Collector is notified for genuine handler failures (spec.md §4.5
    /// step e).
    async fn dispatch_tool_call(&self, call: &ToolCallInfo, user_id: &str, channel: &str) -> String {
        let Some(handler) = self.tools.get_handler(&call.function_name) else {
            return json!({"error": "unknown tool"}).to_string();
        };

        let args: serde_json::Value = serde_json::from_str(&call.arguments_json).unwrap_or(json!({}));
        let ctx = SessionContext {
            user_id: user_id.to_string(),
            channel: channel.to_string(),
        };

        match handler.call(args, &ctx).await {
            Ok(result) => result.to_string(),
            Err(err) => {
                let error_text = err.to_string();
                let preview: String = call.arguments_json.chars().take(200).collect();
                self.errors
                    .record_error(&call.function_name, &error_text, &preview, user_id, channel)
                    .await;
                json!({"error": error_text}).to_string()
            }
        }
    }
}
