// src/config/mod.rs
// Composition-root configuration. Built once in main() and passed down as
// Arc<AppConfig>; no global/static state (see Design Notes §9: no singletons).

mod helpers;

use serde::{Deserialize, Serialize};

/// LLM Router tuning (spec.md §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub provider_cooldown_seconds: u64,
    pub default_provider: String,
    pub default_model: String,
}

impl RouterConfig {
    pub fn from_env() -> Self {
        Self {
            provider_cooldown_seconds: helpers::env_u64("PROVIDER_COOLDOWN_SECONDS", 60),
            default_provider: helpers::env_or("LLM_DEFAULT_PROVIDER", "openai"),
            default_model: helpers::env_or("LLM_DEFAULT_MODEL", "flagship-4o"),
        }
    }
}

/// Context Assembler tuning (spec.md §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub history_share: f64,
    pub chars_per_token: usize,
    pub recall_snippets: usize,
    pub recent_turns: usize,
}

impl ContextConfig {
    pub fn from_env() -> Self {
        Self {
            max_tokens: helpers::env_usize("CONTEXT_MAX_TOKENS", 100_000),
            history_share: helpers::env_f64("CONTEXT_HISTORY_SHARE", 0.5),
            chars_per_token: helpers::env_usize("CHARS_PER_TOKEN", 4),
            recall_snippets: helpers::env_usize("CONTEXT_RECALL_SNIPPETS", 3),
            recent_turns: helpers::env_usize("CONTEXT_RECENT_TURNS", 10),
        }
    }
}

/// Orchestrator tool loop tuning (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_tool_iterations: usize,
    pub message_chunk_limit: usize,
    pub debounce_seconds: f64,
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        Self {
            max_tool_iterations: helpers::env_usize("MAX_TOOL_ITERATIONS", 15),
            message_chunk_limit: helpers::env_usize("MESSAGE_CHUNK_LIMIT", 4000),
            debounce_seconds: helpers::env_f64("DEBOUNCE_SECONDS", 1.0),
        }
    }
}

/// Improvement Queue tuning (spec.md §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub poll_interval_seconds: u64,
    pub item_cooldown_seconds: u64,
    pub keep_days: i64,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            worker_count: helpers::env_usize("QUEUE_WORKER_COUNT", 1),
            poll_interval_seconds: helpers::env_u64("QUEUE_POLL_INTERVAL_SECONDS", 30),
            item_cooldown_seconds: helpers::env_u64("QUEUE_ITEM_COOLDOWN_SECONDS", 5),
            keep_days: helpers::env_u64("QUEUE_KEEP_DAYS", 30) as i64,
        }
    }
}

/// Safety Guard tuning (spec.md §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    pub max_repair_attempts: u32,
    pub max_restarts_per_window: usize,
    pub restart_window_seconds: u64,
    pub test_timeout_seconds: u64,
}

impl SafetyConfig {
    pub fn from_env() -> Self {
        Self {
            max_repair_attempts: helpers::env_u64("MAX_REPAIR_ATTEMPTS", 3) as u32,
            max_restarts_per_window: helpers::env_usize("MAX_RESTARTS_PER_WINDOW", 5),
            restart_window_seconds: helpers::env_u64("RESTART_WINDOW_SECONDS", 600),
            test_timeout_seconds: helpers::env_u64("TEST_TIMEOUT_SECONDS", 120),
        }
    }
}

/// Filesystem layout for persisted state (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateLayout {
    pub data_dir: std::path::PathBuf,
    /// Working tree the Safety Guard stashes/commits/resets.
    pub repo_path: std::path::PathBuf,
}

impl StateLayout {
    pub fn from_env() -> Self {
        Self {
            data_dir: helpers::env_or("SUPERVISOR_DATA_DIR", "data/supervisor").into(),
            repo_path: helpers::env_or("SOURCE_REPO_PATH", ".").into(),
        }
    }

    pub fn queue_file(&self) -> std::path::PathBuf {
        self.data_dir.join("improvement_queue.json")
    }

    pub fn repair_state_file(&self) -> std::path::PathBuf {
        self.data_dir.join("repair_state.json")
    }

    pub fn audit_log_file(&self) -> std::path::PathBuf {
        self.data_dir.join("audit_log.jsonl")
    }

    pub fn runtime_errors_file(&self) -> std::path::PathBuf {
        self.data_dir.join("runtime_errors.jsonl")
    }
}

/// Top-level configuration, composed from domain sub-configs the way
/// `config/mod.rs` composes `MiraConfig` in the teacher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub router: RouterConfig,
    pub context: ContextConfig,
    pub orchestrator: OrchestratorConfig,
    pub queue: QueueConfig,
    pub safety: SafetyConfig,
    pub state: StateLayout,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            router: RouterConfig::from_env(),
            context: ContextConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
            queue: QueueConfig::from_env(),
            safety: SafetyConfig::from_env(),
            state: StateLayout::from_env(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
