// src/safety/state.rs
// RepairState persistence and the repair/restart rate-limiting policies
// (spec.md §4.9, invariants I5/I6). Restart times are wall-clock (not
// monotonic) because this state is the one piece of cooldown bookkeeping
// that must survive a process restart, unlike the Router's in-memory
// provider cooldowns.

use crate::config::SafetyConfig;
use crate::safety::signature::{signature, CrashSignature};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RepairState {
    pub repair_counts: HashMap<CrashSignature, u32>,
    pub restart_times: Vec<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

pub struct RateLimiter {
    path: PathBuf,
    config: SafetyConfig,
    state: Mutex<RepairState>,
}

impl RateLimiter {
    pub async fn load(path: PathBuf, config: SafetyConfig) -> std::io::Result<Self> {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RepairState::default(),
            Err(err) => return Err(err),
        };
        Ok(Self {
            path,
            config,
            state: Mutex::new(state),
        })
    }

    async fn save(&self, state: &RepairState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, serde_json::to_string_pretty(state)?).await
    }

    pub async fn can_attempt_repair(&self, stderr: &str) -> bool {
        let state = self.state.lock().await;
        let sig = signature(stderr);
        state.repair_counts.get(&sig).copied().unwrap_or(0) < self.config.max_repair_attempts
    }

    pub async fn record_repair_attempt(&self, stderr: &str, _success: bool) {
        let sig = signature(stderr);
        let mut state = self.state.lock().await;
        *state.repair_counts.entry(sig).or_insert(0) += 1;
        state.updated_at = Utc::now();
        let _ = self.save(&state).await;
    }

    pub async fn clear_repair_count(&self, stderr: &str) {
        let sig = signature(stderr);
        let mut state = self.state.lock().await;
        state.repair_counts.remove(&sig);
        state.updated_at = Utc::now();
        let _ = self.save(&state).await;
    }

    /// Prunes `restart_times` older than `restart_window_seconds`, then
    /// checks the remaining count against `max_restarts_per_window`
    /// (spec.md I6).
    pub async fn can_restart(&self) -> bool {
        let mut state = self.state.lock().await;
        self.prune_restarts(&mut state);
        state.restart_times.len() < self.config.max_restarts_per_window
    }

    pub async fn record_restart(&self) {
        let mut state = self.state.lock().await;
        self.prune_restarts(&mut state);
        state.restart_times.push(Utc::now());
        state.updated_at = Utc::now();
        let _ = self.save(&state).await;
    }

    fn prune_restarts(&self, state: &mut RepairState) {
        let cutoff = Utc::now() - Duration::seconds(self.config.restart_window_seconds as i64);
        state.restart_times.retain(|t| *t >= cutoff);
    }
}
