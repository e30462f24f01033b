// src/evolution/repair.rs
// Self-repair: crash stderr -> diagnosis + whole-file patch -> SafetyGuard
// (spec.md's supplemented features — grounded in the original supervisor's
// repair.py, adapted from Python tracebacks to Rust panic/backtrace output).

use crate::llm::router::LlmRouter;
use crate::llm::types::Complexity;
use crate::safety::{crash_signature, SafetyGuard};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use tracing::{info, warn};

const MAX_SOURCE_LINES: usize = 100;

static PANIC_LOCATION: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"panicked at ([^:]+):(\d+):\d+").expect("valid regex"));

#[derive(Debug, Default)]
struct CrashInfo {
    message: String,
    file: String,
    line: usize,
    traceback: String,
}

/// Pulls the panic message and `file:line` location out of a Rust panic's
/// stderr (`thread '...' panicked at src/foo.rs:12:5:\n<message>\n`), falling
/// back to the raw text when nothing matches.
fn extract_crash_info(stderr: &str) -> CrashInfo {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return CrashInfo::default();
    }

    let mut info = CrashInfo {
        traceback: trimmed.to_string(),
        ..Default::default()
    };

    if let Some(caps) = PANIC_LOCATION.captures(trimmed) {
        info.file = caps[1].to_string();
        info.line = caps[2].parse().unwrap_or(0);
    }

    if let Some(message_line) = trimmed
        .lines()
        .find(|l| l.contains("panicked at"))
        .and_then(|l| l.split(':').next_back())
    {
        info.message = message_line.trim().to_string();
    } else if let Some(last) = trimmed.lines().last() {
        info.message = last.trim().to_string();
    }

    info
}

fn read_source_context(repo_root: &std::path::Path, file: &str, error_line: usize) -> String {
    let Ok(path) = std::path::Path::new(file).canonicalize().or_else(|_| repo_root.join(file).canonicalize()) else {
        return String::new();
    };
    if !path.starts_with(repo_root) {
        return String::new();
    }
    let Ok(content) = std::fs::read_to_string(&path) else {
        return String::new();
    };

    let lines: Vec<&str> = content.lines().collect();
    let start = error_line.saturating_sub(MAX_SOURCE_LINES / 2);
    let end = (error_line + MAX_SOURCE_LINES / 2).min(lines.len());

    lines[start.min(lines.len())..end]
        .iter()
        .enumerate()
        .map(|(offset, text)| {
            let lineno = start + offset + 1;
            let marker = if lineno == error_line { " >>> " } else { "     " };
            format!("{lineno:>4}{marker}{text}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Deserialize)]
struct RawDiagnosis {
    #[serde(default = "default_diagnosis")]
    diagnosis: String,
    #[serde(default)]
    patched_content: String,
    #[serde(default = "default_commit_message")]
    commit_message: String,
    #[serde(default = "default_confidence")]
    confidence: String,
}

fn default_diagnosis() -> String {
    "No diagnosis".to_string()
}
fn default_commit_message() -> String {
    "fix: auto-repair".to_string()
}
fn default_confidence() -> String {
    "low".to_string()
}

pub struct Diagnosis {
    pub diagnosis: String,
    pub file: String,
    pub original: String,
    pub patched: String,
    pub commit_message: String,
    pub confidence: String,
}

const SYSTEM_PROMPT: &str = r#"You are a Rust debugging expert. You analyze crash reports and generate minimal, targeted fixes.

RULES:
1. Only fix the actual bug — do NOT refactor, add features, or change unrelated code.
2. Your fix must be the MINIMUM change needed to resolve the crash.
3. Return the COMPLETE file content with your fix applied.
4. Explain your diagnosis clearly.
5. Rate your confidence: "high" (obvious fix), "medium" (likely correct), "low" (uncertain).
6. If you're not confident, say so — it's better to not patch than to break things further.

RESPONSE FORMAT (JSON):
{
    "diagnosis": "Clear explanation of what went wrong",
    "confidence": "high|medium|low",
    "commit_message": "fix: brief description",
    "patched_content": "...complete file with fix applied..."
}"#;

pub struct RepairEngine {
    safety: Arc<SafetyGuard>,
    router: Arc<LlmRouter>,
    repo_root: PathBuf,
}

impl RepairEngine {
    pub fn new(safety: Arc<SafetyGuard>, router: Arc<LlmRouter>, repo_root: PathBuf) -> Self {
        Self { safety, router, repo_root }
    }

    pub async fn analyze_crash(&self, stderr: &str) -> Diagnosis {
        let crash = extract_crash_info(stderr);
        self.safety
            .audit(
                "crash_analysis_start",
                serde_json::json!({"file": crash.file, "line": crash.line, "message": crash.message}),
            )
            .await;

        let source_context = if crash.file.is_empty() {
            String::new()
        } else {
            read_source_context(&self.repo_root, &crash.file, crash.line)
        };

        let absolute = self.repo_root.join(&crash.file);
        let full_content = tokio::fs::read_to_string(&absolute).await.unwrap_or_default();
        let relative_path = crash.file.clone();

        let user_prompt = format!(
            "This service crashed with this error:\n\n\
             ## Error\nMessage: {message}\nFile: {file}\nLine: {line}\n\n\
             ## Panic output\n```\n{traceback}\n```\n\n\
             ## Source Context (around error line)\n```rust\n{source_context}\n```\n\n\
             ## Full File Content ({file})\n```rust\n{full_content}\n```\n\n\
             Analyze this crash and provide a minimal fix. Return JSON only.",
            message = crash.message,
            file = relative_path,
            line = crash.line,
            traceback = crash.traceback,
            source_context = source_context,
            full_content = full_content,
        );

        let raw = match self
            .router
            .quick(user_prompt, Some(SYSTEM_PROMPT.to_string()), Complexity::Complex)
            .await
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "crash_analysis_call_failed");
                self.safety.audit("crash_analysis_failed", serde_json::json!({"error": err.to_string()})).await;
                return Diagnosis {
                    diagnosis: format!("Analysis failed: {err}"),
                    file: relative_path,
                    original: full_content.clone(),
                    patched: full_content,
                    commit_message: String::new(),
                    confidence: "low".to_string(),
                };
            }
        };

        let parsed = parse_diagnosis(&raw);
        self.safety
            .audit(
                "crash_analysis_complete",
                serde_json::json!({
                    "file": relative_path,
                    "confidence": parsed.confidence,
                    "diagnosis": parsed.diagnosis.chars().take(200).collect::<String>(),
                }),
            )
            .await;

        Diagnosis {
            diagnosis: parsed.diagnosis,
            file: relative_path,
            original: full_content,
            patched: parsed.patched_content,
            commit_message: parsed.commit_message,
            confidence: parsed.confidence,
        }
    }

    /// Full repair cycle: rate-limit check -> analyze -> apply via the
    /// Safety Guard -> record outcome.
    pub async fn attempt_repair(&self, stderr: &str) -> (bool, String) {
        if !self.safety.can_attempt_repair(stderr).await {
            let msg = "Repair attempts exhausted for this crash type".to_string();
            warn!(%msg, "repair_rate_limited");
            return (false, msg);
        }

        info!("repair_attempt_starting");
        self.safety.audit("repair_cycle_start", serde_json::json!({})).await;

        let analysis = self.analyze_crash(stderr).await;

        if analysis.confidence == "low" {
            self.safety.record_repair_attempt(stderr, false).await;
            let msg = format!("Low confidence fix — skipping. Diagnosis: {}", analysis.diagnosis);
            warn!(diagnosis = %analysis.diagnosis, "repair_low_confidence");
            return (false, msg);
        }

        if analysis.patched.is_empty() || analysis.file.is_empty() {
            self.safety.record_repair_attempt(stderr, false).await;
            return (false, format!("No patch generated. Diagnosis: {}", analysis.diagnosis));
        }

        let commit_message = format!("fix(auto-repair): {}", analysis.commit_message);
        let result = self
            .safety
            .apply_patch_safely(&PathBuf::from(&analysis.file), &analysis.original, &analysis.patched, &commit_message)
            .await;

        let (success, patch_msg) = match result {
            Ok(outcome) => outcome,
            Err(err) => (false, err.to_string()),
        };

        self.safety.record_repair_attempt(stderr, success).await;

        if success {
            self.safety.clear_repair_count(stderr).await;
            info!(file = %analysis.file, "repair_success");
            (true, format!("Repaired: {}", analysis.diagnosis))
        } else {
            warn!(message = %patch_msg, "repair_failed");
            (false, format!("Repair failed: {patch_msg}"))
        }
    }
}

/// Strips a markdown fence, parses as JSON, falls back to regex-extracting
/// the first `{...}` span (same two-stage algorithm as the planning parser).
fn parse_diagnosis(response: &str) -> RawDiagnosis {
    let mut text = response.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped;
        if let Some(idx) = text.find('\n') {
            text = &text[idx + 1..];
        }
        text = text.trim_end();
        text = text.strip_suffix("```").unwrap_or(text);
    }

    if let Ok(parsed) = serde_json::from_str(text.trim()) {
        return parsed;
    }

    static JSON_OBJECT: LazyLock<regex::Regex> =
        LazyLock::new(|| regex::Regex::new(r"(?s)\{.*\}").expect("valid regex"));
    if let Some(found) = JSON_OBJECT.find(text) {
        if let Ok(parsed) = serde_json::from_str(found.as_str()) {
            return parsed;
        }
    }

    RawDiagnosis {
        diagnosis: "Could not parse repair response".to_string(),
        patched_content: String::new(),
        commit_message: String::new(),
        confidence: "low".to_string(),
    }
}

pub fn identify(stderr: &str) -> crate::safety::CrashSignature {
    crash_signature(stderr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_panic_location_and_message() {
        let stderr = "thread 'main' panicked at src/queue/mod.rs:142:9:\nindex out of bounds\nnote: run with RUST_BACKTRACE=1";
        let info = extract_crash_info(stderr);
        assert_eq!(info.file, "src/queue/mod.rs");
        assert_eq!(info.line, 142);
        assert_eq!(info.message, "index out of bounds");
    }

    #[test]
    fn empty_stderr_yields_default_info() {
        let info = extract_crash_info("");
        assert_eq!(info.file, "");
        assert_eq!(info.line, 0);
    }

    #[test]
    fn parses_fenced_diagnosis_json() {
        let text = "```json\n{\"diagnosis\": \"off by one\", \"confidence\": \"high\", \"commit_message\": \"fix: bound\", \"patched_content\": \"fn x() {}\"}\n```";
        let parsed = parse_diagnosis(text);
        assert_eq!(parsed.diagnosis, "off by one");
        assert_eq!(parsed.confidence, "high");
    }

    #[test]
    fn unparsable_diagnosis_falls_back_to_low_confidence() {
        let parsed = parse_diagnosis("not json");
        assert_eq!(parsed.confidence, "low");
        assert!(parsed.patched_content.is_empty());
    }
}
