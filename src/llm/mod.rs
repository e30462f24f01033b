// src/llm/mod.rs

pub mod provider;
pub mod router;
pub mod types;

pub use provider::LlmProvider;
pub use router::LlmRouter;
pub use types::{ChatMessage, Complexity, LlmRequest, LlmResponse, ProviderId, ToolCallInfo};
