// src/safety/audit.rs
// Append-only JSONL audit log. Many components may hold a clone (Router,
// Orchestrator, Safety Guard); writes are append-only so concurrent writers
// never need to coordinate beyond the OS's atomic single-write-call
// guarantee for records this size (spec.md §5).

use chrono::Utc;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Clone)]
pub struct AuditLog {
    path: Arc<PathBuf>,
    // Serializes writes from within this process; concurrent *processes*
    // rely on the OS's atomicity of a single `write()` syscall for
    // append-mode file descriptors.
    lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Arc::new(path.as_ref().to_path_buf()),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Appends one JSONL record `{timestamp, action, ...details}`.
    pub async fn append(&self, action: &str, details: Value) -> std::io::Result<()> {
        let mut record = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "action": action,
        });
        if let Value::Object(details_map) = details {
            if let Value::Object(record_map) = &mut record {
                record_map.extend(details_map);
            }
        }

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .await?;
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_one_record_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit_log.jsonl"));
        log.append("llm_provider_failed", json!({"provider": "openai"})).await.unwrap();
        log.append("llm_fallback_used", json!({"provider": "anthropic"})).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("audit_log.jsonl")).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["action"], "llm_provider_failed");
    }
}
