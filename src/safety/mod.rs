// src/safety/mod.rs
// Git snapshot/restore, test runner, rate limiting, audit log, crash-
// signature dedup (spec.md §4.9). The sole caller of git and test commands;
// the Evolution Engine defers to it for every mutation.

pub mod audit;
pub mod signature;
pub mod state;

use crate::config::SafetyConfig;
use audit::AuditLog;
use git2::{Repository, ResetType, Signature};
use serde_json::json;
use state::RateLimiter;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

pub use signature::{signature as crash_signature, CrashSignature};

const STASH_MESSAGE: &str = "pre-evolution-backup";

pub struct SafetyGuard {
    repo_path: PathBuf,
    rate_limiter: RateLimiter,
    audit: AuditLog,
    test_timeout: Duration,
}

impl SafetyGuard {
    pub async fn new(
        repo_path: PathBuf,
        repair_state_path: PathBuf,
        audit: AuditLog,
        config: SafetyConfig,
    ) -> std::io::Result<Self> {
        let test_timeout = Duration::from_secs(config.test_timeout_seconds);
        let rate_limiter = RateLimiter::load(repair_state_path, config).await?;
        Ok(Self {
            repo_path,
            rate_limiter,
            audit,
            test_timeout,
        })
    }

    pub async fn can_attempt_repair(&self, stderr: &str) -> bool {
        self.rate_limiter.can_attempt_repair(stderr).await
    }

    pub async fn record_repair_attempt(&self, stderr: &str, success: bool) {
        self.rate_limiter.record_repair_attempt(stderr, success).await;
    }

    pub async fn clear_repair_count(&self, stderr: &str) {
        self.rate_limiter.clear_repair_count(stderr).await;
    }

    pub async fn can_restart(&self) -> bool {
        self.rate_limiter.can_restart().await
    }

    pub async fn record_restart(&self) {
        self.rate_limiter.record_restart().await;
    }

    pub async fn audit(&self, action: &str, details: serde_json::Value) {
        if let Err(err) = self.audit.append(action, details).await {
            warn!(error = %err, action, "audit_write_failed");
        }
    }

    /// `git stash` with a named message, run off the async executor since
    /// `git2` is synchronous. A clean working tree has nothing to stash;
    /// libgit2 reports that as a `NotFound` error, which is treated as
    /// success rather than aborting the caller's patch pipeline.
    pub async fn stash(&self) -> anyhow::Result<()> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut repo = Repository::open(&repo_path)?;
            let signature = repo.signature().unwrap_or_else(|_| {
                Signature::now("orchestration-core", "evolution@localhost").unwrap()
            });
            match repo.stash_save(&signature, STASH_MESSAGE, None) {
                Ok(_) => Ok(()),
                Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(()),
                Err(err) => Err(err.into()),
            }
        })
        .await??;
        Ok(())
    }

    pub async fn stash_pop(&self) -> anyhow::Result<()> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut repo = Repository::open(&repo_path)?;
            repo.stash_pop(0, None)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// `git add -A && git commit -m message`.
    pub async fn commit_all(&self, message: &str) -> anyhow::Result<()> {
        let repo_path = self.repo_path.clone();
        let message = message.to_string();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let repo = Repository::open(&repo_path)?;
            let mut index = repo.index()?;
            index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
            index.write()?;
            let tree_id = index.write_tree()?;
            let tree = repo.find_tree(tree_id)?;
            let signature = repo.signature().unwrap_or_else(|_| {
                Signature::now("orchestration-core", "evolution@localhost").unwrap()
            });
            let parent = repo.head()?.peel_to_commit()?;
            repo.commit(Some("HEAD"), &signature, &signature, &message, &tree, &[&parent])?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    pub async fn push(&self) -> anyhow::Result<()> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let repo = Repository::open(&repo_path)?;
            let mut remote = repo.find_remote("origin")?;
            let head = repo.head()?;
            let refname = head.name().unwrap_or("refs/heads/main").to_string();
            remote.push(&[format!("{refname}:{refname}")], None)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// `git checkout .` — hard reset the working tree to HEAD.
    pub async fn hard_reset(&self) -> anyhow::Result<()> {
        let repo_path = self.repo_path.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let repo = Repository::open(&repo_path)?;
            let head = repo.head()?.peel_to_commit()?.into_object();
            repo.reset(&head, ResetType::Hard, None)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Runs the test suite with a wall-clock timeout; a timeout is treated
    /// identically to a failing run (spec.md §5).
    pub async fn run_tests(&self) -> anyhow::Result<(bool, String)> {
        let mut command = Command::new("cargo");
        command
            .arg("test")
            .current_dir(&self.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let run = async {
            let output = command.output().await?;
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            Ok::<(bool, String), anyhow::Error>((output.status.success(), combined))
        };

        match timeout(self.test_timeout, run).await {
            Ok(result) => result,
            Err(_) => Ok((false, "test run timed out".to_string())),
        }
    }

    /// Verifies the on-disk content still equals `original` (aborts
    /// otherwise), stashes, writes `patched`, runs tests, commits on pass /
    /// reverts on fail (spec.md §4.9).
    pub async fn apply_patch_safely(
        &self,
        file: &PathBuf,
        original: &str,
        patched: &str,
        commit_message: &str,
    ) -> anyhow::Result<(bool, String)> {
        let absolute = self.repo_path.join(file);
        let on_disk = tokio::fs::read_to_string(&absolute).await.unwrap_or_default();
        if on_disk != original {
            return Ok((false, "on-disk content no longer matches expected original; aborting".to_string()));
        }

        self.stash().await?;

        if let Some(parent) = absolute.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&absolute, patched).await?;

        let (passed, output) = self.run_tests().await?;
        if passed {
            self.commit_all(commit_message).await?;
            self.push().await.ok();
            info!(file = %file.display(), "patch applied and committed");
            Ok((true, "patch applied".to_string()))
        } else {
            self.hard_reset().await?;
            warn!(file = %file.display(), "patch failed tests, reverted");
            Ok((false, tail(&output, 2000)))
        }
    }
}

fn tail(s: &str, max_chars: usize) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= max_chars {
        s.to_string()
    } else {
        chars[chars.len() - max_chars..].iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SafetyConfig {
        SafetyConfig {
            max_repair_attempts: 3,
            max_restarts_per_window: 5,
            restart_window_seconds: 600,
            test_timeout_seconds: 120,
        }
    }

    #[tokio::test]
    async fn apply_patch_safely_aborts_on_stale_original() {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().to_path_buf();
        let target = repo_path.join("src").join("lib.rs");
        tokio::fs::create_dir_all(target.parent().unwrap()).await.unwrap();
        tokio::fs::write(&target, "current contents").await.unwrap();

        let audit = AuditLog::new(repo_path.join("audit_log.jsonl"));
        let guard = SafetyGuard::new(
            repo_path.clone(),
            repo_path.join("repair_state.json"),
            audit,
            config(),
        )
        .await
        .unwrap();

        let (ok, msg) = guard
            .apply_patch_safely(&PathBuf::from("src/lib.rs"), "stale expected contents", "new contents", "msg")
            .await
            .unwrap();
        assert!(!ok);
        assert!(msg.contains("no longer matches"));
    }

    #[test]
    fn tail_truncates_from_the_front() {
        let long = "a".repeat(50);
        let result = tail(&long, 10);
        assert_eq!(result.len(), 10);
        assert_eq!(result, "a".repeat(10));
    }
}
