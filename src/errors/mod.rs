// src/errors/mod.rs
// Bounded JSONL sink for runtime tool errors, consumed by the (out-of-scope)
// learner (spec.md §4.10). Fire-and-forget: never raises on I/O failure.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

const MAX_ENTRIES: usize = 500;
const PRUNE_THRESHOLD_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: String,
    pub tool_name: String,
    pub error: String,
    pub args_preview: String,
    pub user_id: String,
    pub channel: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorSummary {
    pub total: usize,
    pub counts_by_tool: HashMap<String, usize>,
    pub top_errors_by_frequency: Vec<(String, usize)>,
}

#[derive(Clone)]
pub struct ErrorCollector {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ErrorCollector {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Appends one record; truncates `args_preview` to 200 chars; prunes the
    /// file to `MAX_ENTRIES` once it exceeds `1.5 * MAX_ENTRIES`. Never
    /// raises — a collector that can't write is not allowed to break the
    /// tool loop it observes.
    pub async fn record_error(
        &self,
        tool_name: &str,
        error: &str,
        args_preview: &str,
        user_id: &str,
        channel: &str,
    ) {
        let preview: String = args_preview.chars().take(200).collect();
        let record = ErrorRecord {
            timestamp: Utc::now().to_rfc3339(),
            tool_name: tool_name.to_string(),
            error: error.to_string(),
            args_preview: preview,
            user_id: user_id.to_string(),
            channel: channel.to_string(),
        };

        if let Err(err) = self.append(record).await {
            warn!(error = %err, "error collector failed to persist record");
        }
    }

    async fn append(&self, record: ErrorRecord) -> std::io::Result<()> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_all().await.unwrap_or_default();
        records.push(record);

        if records.len() as f64 > MAX_ENTRIES as f64 * PRUNE_THRESHOLD_FACTOR {
            let drop = records.len() - MAX_ENTRIES;
            records.drain(0..drop);
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = String::new();
        for r in &records {
            out.push_str(&serde_json::to_string(r)?);
            out.push('\n');
        }
        tokio::fs::write(self.path.as_path(), out).await
    }

    async fn read_all(&self) -> std::io::Result<Vec<ErrorRecord>> {
        match tokio::fs::read_to_string(self.path.as_path()).await {
            Ok(contents) => Ok(contents
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    pub async fn read_recent(&self, limit: usize) -> Vec<ErrorRecord> {
        let records = self.read_all().await.unwrap_or_default();
        let skip = records.len().saturating_sub(limit);
        records[skip..].to_vec()
    }

    pub async fn summary(&self) -> ErrorSummary {
        let records = self.read_all().await.unwrap_or_default();
        let mut counts_by_tool: HashMap<String, usize> = HashMap::new();
        let mut counts_by_error: HashMap<String, usize> = HashMap::new();
        for r in &records {
            *counts_by_tool.entry(r.tool_name.clone()).or_insert(0) += 1;
            *counts_by_error.entry(r.error.clone()).or_insert(0) += 1;
        }
        let mut top: Vec<(String, usize)> = counts_by_error.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1));
        top.truncate(10);

        ErrorSummary {
            total: records.len(),
            counts_by_tool,
            top_errors_by_frequency: top,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_persisted_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ErrorCollector::new(dir.path().join("runtime_errors.jsonl"));
        collector.record_error("search_memory", "boom", "{\"q\":\"x\"}", "u1", "cli").await;
        let recent = collector.read_recent(10).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].tool_name, "search_memory");
    }

    #[tokio::test]
    async fn args_preview_is_truncated_to_200_chars() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ErrorCollector::new(dir.path().join("runtime_errors.jsonl"));
        let long_args = "a".repeat(500);
        collector.record_error("t", "e", &long_args, "u1", "cli").await;
        let recent = collector.read_recent(1).await;
        assert_eq!(recent[0].args_preview.chars().count(), 200);
    }

    #[tokio::test]
    async fn prunes_once_past_1_5x_cap() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ErrorCollector::new(dir.path().join("runtime_errors.jsonl"));
        for i in 0..(MAX_ENTRIES + MAX_ENTRIES / 2 + 1) {
            collector.record_error("t", &format!("e{i}"), "", "u1", "cli").await;
        }
        let all = collector.read_all().await.unwrap();
        assert_eq!(all.len(), MAX_ENTRIES);
        // the oldest entries were dropped, newest survive
        assert!(all.last().unwrap().error.contains(&(MAX_ENTRIES + MAX_ENTRIES / 2).to_string()));
    }

    #[tokio::test]
    async fn summary_counts_by_tool() {
        let dir = tempfile::tempdir().unwrap();
        let collector = ErrorCollector::new(dir.path().join("runtime_errors.jsonl"));
        collector.record_error("a", "e1", "", "u1", "cli").await;
        collector.record_error("a", "e2", "", "u1", "cli").await;
        collector.record_error("b", "e1", "", "u1", "cli").await;
        let summary = collector.summary().await;
        assert_eq!(summary.total, 3);
        assert_eq!(summary.counts_by_tool["a"], 2);
        assert_eq!(summary.counts_by_tool["b"], 1);
    }
}
