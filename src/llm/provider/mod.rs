// src/llm/provider/mod.rs
// Uniform provider trait plus the shared retry helper every adapter uses.

use crate::error::{IntoProviderError, ProviderError, ProviderResult};
use crate::llm::types::{LlmRequest, LlmResponse};
use async_trait::async_trait;
use std::time::Duration;

pub mod anthropic;
pub mod google;
pub mod openai;
pub mod openrouter;

pub use anthropic::AnthropicProvider;
pub use google::GoogleProvider;
pub use openai::OpenAiProvider;
pub use openrouter::OpenRouterProvider;

/// Capability set every backend must implement (spec.md §4.1).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// True iff credentials are configured for this adapter.
    fn is_available(&self) -> bool;

    /// Blocks (from the caller's perspective) until the provider returns or
    /// raises. Must translate the provider's native tool-call format into
    /// the uniform `tool_calls` shape before returning.
    async fn complete(&self, req: &LlmRequest, model: &str) -> ProviderResult<LlmResponse>;

    /// Finite, not restartable; terminates when the provider signals
    /// end-of-message. Not every adapter supports this.
    async fn stream(
        &self,
        _req: &LlmRequest,
        _model: &str,
    ) -> ProviderResult<Vec<String>> {
        Err(ProviderError::Permanent(format!(
            "{} does not support streaming",
            self.name()
        )))
    }
}

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Retries `f` up to `MAX_ATTEMPTS` times with exponential backoff
/// (base 1s, cap 10s) when the error is transient; permanent/malformed
/// errors are returned immediately (spec.md §4.1).
pub async fn with_retry<F, Fut>(mut f: F) -> ProviderResult<LlmResponse>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<LlmResponse>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(resp) => return Ok(resp),
            Err(ProviderError::Transient(msg)) => {
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    return Err(ProviderError::Transient(msg));
                }
                let backoff = BASE_BACKOFF.saturating_mul(1 << (attempt - 1)).min(MAX_BACKOFF);
                tracing::warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying after transient provider error: {msg}");
                tokio::time::sleep(backoff).await;
            }
            Err(other) => return Err(other),
        }
    }
}

/// Shared helper: turn a `reqwest::Error` into this crate's error vocabulary.
pub(crate) fn map_reqwest_err(err: reqwest::Error) -> ProviderError {
    err.into_provider_error()
}
