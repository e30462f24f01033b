// src/queue/mod.rs
// Persistent priority queue with background workers (spec.md §4.7). State
// file is the full JSON item list, rewritten whole on every mutation
// (Design Notes §9 sanctions this for modest sizes).

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Planning,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl QueueItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemSource {
    User,
    Learner,
    Supervisor,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub request: String,
    pub source: QueueItemSource,
    pub priority: u8,
    pub status: QueueItemStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_message: Option<String>,
    pub success: Option<bool>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub planning: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub max_workers: usize,
    pub active_workers: usize,
}

/// Implemented by the Evolution Engine; kept as a trait here so the queue's
/// picking/persistence logic can be exercised without a real git repository.
#[async_trait]
pub trait Evolver: Send + Sync {
    async fn implement_improvement(&self, request: &str) -> anyhow::Result<(bool, String)>;
}

struct QueueState {
    items: Vec<QueueItem>,
}

pub struct ImprovementQueue {
    path: PathBuf,
    state: Mutex<QueueState>,
    config: QueueConfig,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ImprovementQueue {
    /// Loads the queue file if present. Any item found in `planning` or
    /// `in_progress` is reset to `pending` (crash recovery, spec.md §4.7).
    pub async fn load(path: PathBuf, config: QueueConfig) -> QueueResult<Self> {
        let items = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let mut items: Vec<QueueItem> = serde_json::from_str(&contents)?;
                for item in &mut items {
                    if matches!(item.status, QueueItemStatus::Planning | QueueItemStatus::InProgress) {
                        item.status = QueueItemStatus::Pending;
                    }
                }
                items
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(QueueError::Io(err)),
        };

        Ok(Self {
            path,
            state: Mutex::new(QueueState { items }),
            config,
            workers: Mutex::new(Vec::new()),
        })
    }

    async fn save_locked(&self, state: &QueueState) -> QueueResult<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&state.items)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    pub async fn add(
        &self,
        request: impl Into<String>,
        source: QueueItemSource,
        priority: u8,
        metadata: serde_json::Value,
    ) -> QueueResult<QueueItem> {
        let full_id = Uuid::new_v4().simple().to_string();
        let item = QueueItem {
            id: full_id[..12].to_string(),
            request: request.into(),
            source,
            priority,
            status: QueueItemStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_message: None,
            success: None,
            metadata,
        };

        let mut state = self.state.lock().await;
        state.items.push(item.clone());
        self.save_locked(&state).await?;
        info!(id = %item.id, source = ?item.source, "queue_item_added");
        Ok(item)
    }

    pub async fn list(&self, status: Option<QueueItemStatus>, limit: usize) -> Vec<QueueItem> {
        let state = self.state.lock().await;
        let filtered: Vec<QueueItem> = state
            .items
            .iter()
            .filter(|i| status.is_none_or(|s| i.status == s))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered[skip..].to_vec()
    }

    pub async fn get(&self, id: &str) -> Option<QueueItem> {
        let state = self.state.lock().await;
        state.items.iter().find(|i| i.id == id).cloned()
    }

    /// Transitions `pending -> skipped`. Non-pending items cannot be
    /// cancelled (spec.md §4.7).
    pub async fn cancel(&self, id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let Some(item) = state.items.iter_mut().find(|i| i.id == id) else {
            return Ok(false);
        };
        if item.status != QueueItemStatus::Pending {
            return Ok(false);
        }
        item.status = QueueItemStatus::Skipped;
        item.result_message = Some("Cancelled".to_string());
        item.finished_at = Some(Utc::now());
        self.save_locked(&state).await?;
        Ok(true)
    }

    pub async fn stats(&self) -> QueueStats {
        let state = self.state.lock().await;
        let mut stats = QueueStats {
            total: state.items.len(),
            pending: 0,
            planning: 0,
            in_progress: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            max_workers: self.config.worker_count,
            active_workers: self.workers.lock().await.len(),
        };
        for item in &state.items {
            match item.status {
                QueueItemStatus::Pending => stats.pending += 1,
                QueueItemStatus::Planning => stats.planning += 1,
                QueueItemStatus::InProgress => stats.in_progress += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::Failed => stats.failed += 1,
                QueueItemStatus::Skipped => stats.skipped += 1,
            }
        }
        stats
    }

    /// Drops terminal items whose `finished_at` predates the cutoff.
    pub async fn prune_old(&self, keep_days: i64) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let cutoff = Utc::now() - chrono::Duration::days(keep_days);
        let before = state.items.len();
        state.items.retain(|i| {
            !i.status.is_terminal() || i.finished_at.is_none_or(|f| f >= cutoff)
        });
        let removed = before - state.items.len();
        if removed > 0 {
            self.save_locked(&state).await?;
        }
        Ok(removed)
    }

    /// Serialized critical section (I1): reads the pending set, selects the
    /// best item (lowest priority, tie-break by oldest `created_at`), and
    /// atomically transitions it to `planning`.
    async fn pick_item(&self) -> QueueResult<Option<QueueItem>> {
        let mut state = self.state.lock().await;
        let best_id = state
            .items
            .iter()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .min_by_key(|i| (i.priority, i.created_at))
            .map(|i| i.id.clone());

        let Some(id) = best_id else {
            return Ok(None);
        };

        let item = state.items.iter_mut().find(|i| i.id == id).unwrap();
        item.status = QueueItemStatus::Planning;
        let picked = item.clone();
        self.save_locked(&state).await?;
        Ok(Some(picked))
    }

    async fn transition(&self, id: &str, mutate: impl FnOnce(&mut QueueItem)) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.items.iter_mut().find(|i| i.id == id) {
            mutate(item);
        }
        self.save_locked(&state).await
    }

    /// `planning -> in_progress -> (completed | failed)` (spec.md §4.7).
    async fn process_one(&self, item: QueueItem, evolver: &dyn Evolver) {
        if let Err(err) = self
            .transition(&item.id, |i| {
                i.status = QueueItemStatus::InProgress;
                i.started_at = Some(Utc::now());
            })
            .await
        {
            error!(id = %item.id, error = %err, "queue_transition_failed");
            return;
        }

        info!(id = %item.id, request = %item.request, "queue_processing");

        let outcome = evolver.implement_improvement(&item.request).await;

        let (success, status, message) = match outcome {
            Ok((success, message)) => {
                let status = if success { QueueItemStatus::Completed } else { QueueItemStatus::Failed };
                (Some(success), status, message)
            }
            Err(exc) => (Some(false), QueueItemStatus::Failed, format!("Error: {exc}")),
        };

        let message: String = message.chars().take(500).collect();
        let _ = self
            .transition(&item.id, |i| {
                i.success = success;
                i.status = status;
                i.result_message = Some(message);
                i.finished_at = Some(Utc::now());
            })
            .await;

        info!(id = %item.id, success = ?success, "queue_item_done");
    }

    async fn worker_loop(self: Arc<Self>, evolver: Arc<dyn Evolver>) {
        loop {
            match self.pick_item().await {
                Ok(Some(item)) => {
                    self.process_one(item, evolver.as_ref()).await;
                    tokio::time::sleep(std::time::Duration::from_secs(self.config.item_cooldown_seconds)).await;
                }
                Ok(None) => {
                    tokio::time::sleep(std::time::Duration::from_secs(self.config.poll_interval_seconds)).await;
                }
                Err(err) => {
                    error!(error = %err, "queue_worker_error");
                    tokio::time::sleep(std::time::Duration::from_secs(self.config.poll_interval_seconds)).await;
                }
            }
        }
    }

    /// Spawns `config.worker_count` worker tasks.
    pub async fn start_workers(self: &Arc<Self>, evolver: Arc<dyn Evolver>) {
        let mut workers = self.workers.lock().await;
        for _ in 0..self.config.worker_count {
            let queue = Arc::clone(self);
            let evolver = Arc::clone(&evolver);
            workers.push(tokio::spawn(queue.worker_loop(evolver)));
        }
    }

    pub async fn stop_workers(&self) {
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> QueueConfig {
        QueueConfig {
            worker_count: 1,
            poll_interval_seconds: 30,
            item_cooldown_seconds: 5,
            keep_days: 30,
        }
    }

    #[tokio::test]
    async fn pending_items_pick_in_priority_then_age_order() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImprovementQueue::load(dir.path().join("queue.json"), config()).await.unwrap();
        queue.add("A", QueueItemSource::User, 10, serde_json::json!({})).await.unwrap();
        queue.add("B", QueueItemSource::User, 1, serde_json::json!({})).await.unwrap();
        queue.add("C", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();

        let first = queue.pick_item().await.unwrap().unwrap();
        assert_eq!(first.request, "B");
        let second = queue.pick_item().await.unwrap().unwrap();
        assert_eq!(second.request, "C");
        let third = queue.pick_item().await.unwrap().unwrap();
        assert_eq!(third.request, "A");
    }

    #[tokio::test]
    async fn crash_recovery_resets_non_terminal_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let queue = ImprovementQueue::load(path.clone(), config()).await.unwrap();
        let item = queue.add("A", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();
        queue.pick_item().await.unwrap(); // -> planning
        queue
            .transition(&item.id, |i| i.status = QueueItemStatus::InProgress)
            .await
            .unwrap();

        let reloaded = ImprovementQueue::load(path, config()).await.unwrap();
        let item = reloaded.get(&item.id).await.unwrap();
        assert_eq!(item.status, QueueItemStatus::Pending);
    }

    #[tokio::test]
    async fn cancel_only_works_on_pending_items() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImprovementQueue::load(dir.path().join("queue.json"), config()).await.unwrap();
        let item = queue.add("A", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();
        queue.pick_item().await.unwrap(); // moves to planning
        assert!(!queue.cancel(&item.id).await.unwrap());

        let item2 = queue.add("B", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();
        assert!(queue.cancel(&item2.id).await.unwrap());
    }

    struct FakeEvolver {
        success: bool,
    }

    #[async_trait]
    impl Evolver for FakeEvolver {
        async fn implement_improvement(&self, _request: &str) -> anyhow::Result<(bool, String)> {
            Ok((self.success, "done".to_string()))
        }
    }

    #[tokio::test]
    async fn process_one_transitions_to_completed_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImprovementQueue::load(dir.path().join("queue.json"), config()).await.unwrap();
        let item = queue.add("A", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();
        let picked = queue.pick_item().await.unwrap().unwrap();
        queue.process_one(picked, &FakeEvolver { success: true }).await;

        let final_item = queue.get(&item.id).await.unwrap();
        assert_eq!(final_item.status, QueueItemStatus::Completed);
        assert_eq!(final_item.success, Some(true));
    }

    #[tokio::test]
    async fn prune_old_drops_terminal_items_past_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ImprovementQueue::load(dir.path().join("queue.json"), config()).await.unwrap();
        let item = queue.add("A", QueueItemSource::User, 5, serde_json::json!({})).await.unwrap();
        queue
            .transition(&item.id, |i| {
                i.status = QueueItemStatus::Completed;
                i.finished_at = Some(Utc::now() - chrono::Duration::days(60));
            })
            .await
            .unwrap();

        let removed = queue.prune_old(30).await.unwrap();
        assert_eq!(removed, 1);
        assert!(queue.get(&item.id).await.is_none());
    }
}
