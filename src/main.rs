// src/main.rs
// Composition root: builds every collaborator from `AppConfig` and env-
// sourced credentials and wires them together. No global/static state —
// everything here is constructed once and handed down as `Arc<...>`.

use orchestration_core::config::AppConfig;
use orchestration_core::context::MemoryStore;
use orchestration_core::errors::ErrorCollector;
use orchestration_core::evolution::feedback::FeedbackTriage;
use orchestration_core::evolution::repair::RepairEngine;
use orchestration_core::evolution::EvolutionEngine;
use orchestration_core::llm::provider::{AnthropicProvider, GoogleProvider, OpenAiProvider, OpenRouterProvider};
use orchestration_core::llm::{LlmProvider, LlmRouter, ProviderId};
use orchestration_core::orchestrator::Orchestrator;
use orchestration_core::queue::{Evolver, ImprovementQueue};
use orchestration_core::safety::audit::AuditLog;
use orchestration_core::safety::SafetyGuard;
use orchestration_core::tools::ToolRegistry;
use std::collections::HashMap;
use std::sync::Arc;

const SYSTEM_PROMPT_TEMPLATE: &str = "You are {assistant_name}, a personal AI assistant talking with {user_name}.";
const ASSISTANT_NAME: &str = "Orchestration Core";

/// In-memory placeholder for the conversation/recall store this crate
/// consumes through `MemoryStore` but does not implement (spec.md §6 —
/// persistence drivers are out of scope).
struct NullMemoryStore;

#[async_trait::async_trait]
impl MemoryStore for NullMemoryStore {
    async fn append_conversation(
        &self,
        _user_id: &str,
        _role: &str,
        _content: &str,
        _channel: &str,
        _model: Option<&str>,
        _tokens: Option<u32>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn recent_conversations(&self, _user_id: &str, _limit: usize) -> anyhow::Result<Vec<orchestration_core::llm::ChatMessage>> {
        Ok(Vec::new())
    }

    async fn recall(&self, _query: &str, _user_id: &str, _n: usize) -> anyhow::Result<Vec<String>> {
        Ok(Vec::new())
    }
}

fn build_providers() -> HashMap<ProviderId, Arc<dyn LlmProvider>> {
    let mut providers: HashMap<ProviderId, Arc<dyn LlmProvider>> = HashMap::new();
    providers.insert(ProviderId::Openai, Arc::new(OpenAiProvider::new(std::env::var("OPENAI_API_KEY").ok())));
    providers.insert(ProviderId::Anthropic, Arc::new(AnthropicProvider::new(std::env::var("ANTHROPIC_API_KEY").ok())));
    providers.insert(ProviderId::Google, Arc::new(GoogleProvider::new(std::env::var("GOOGLE_API_KEY").ok())));
    providers.insert(ProviderId::Openrouter, Arc::new(OpenRouterProvider::new(std::env::var("OPENROUTER_API_KEY").ok())));
    providers
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();
    tokio::fs::create_dir_all(&config.state.data_dir).await?;

    let audit = AuditLog::new(config.state.audit_log_file());
    let errors = ErrorCollector::new(config.state.runtime_errors_file());

    let router = Arc::new(
        LlmRouter::new(build_providers(), config.router.provider_cooldown_seconds).with_audit(audit.clone()),
    );

    let safety = Arc::new(
        SafetyGuard::new(
            config.state.repo_path.clone(),
            config.state.repair_state_file(),
            audit.clone(),
            config.safety.clone(),
        )
        .await?,
    );

    let evolution = Arc::new(EvolutionEngine::new(router.clone(), safety.clone(), config.state.repo_path.clone()));
    let repair = RepairEngine::new(safety.clone(), router.clone(), config.state.repo_path.clone());

    let queue = Arc::new(ImprovementQueue::load(config.state.queue_file(), config.queue.clone()).await?);
    let feedback = FeedbackTriage::new(router.clone(), queue.clone(), safety.clone());

    let tools = Arc::new(ToolRegistry::new());
    let memory: Arc<dyn MemoryStore> = Arc::new(NullMemoryStore);

    let orchestrator = Arc::new(Orchestrator::new(
        router.clone(),
        tools.clone(),
        memory,
        errors.clone(),
        audit.clone(),
        config.orchestrator.clone(),
        config.context.clone(),
        SYSTEM_PROMPT_TEMPLATE,
        ASSISTANT_NAME,
    ));

    let evolver: Arc<dyn Evolver> = evolution.clone();
    queue.start_workers(evolver).await;

    tracing::info!(
        providers = ?router.available_providers(),
        "orchestration core started"
    );

    // Demonstrates the feedback -> queue -> evolution loop without standing
    // up a real transport; a production deployment would replace this with
    // a channel listener (Slack/Discord/CLI) driving `orchestrator.process_message`.
    let _ = (&orchestrator, &repair, &feedback);

    tokio::signal::ctrl_c().await?;
    queue.stop_workers().await;
    Ok(())
}
