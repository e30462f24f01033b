// src/orchestrator/sanitize.rs
// Response Sanitizer: strips structured-data leakage from model output
// (spec.md §4.6). Pure, idempotent.

use regex::Regex;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)```(?:json|jsonc|JSON)?\s*\n?(.*?)\n?```").unwrap()
});

static TOOL_OUTPUT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*(tool output|tool result|function output)\s*:.*$").unwrap()
});

static EXCESS_NEWLINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

fn parses_as_json_object_or_array(candidate: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(candidate.trim()) {
        Ok(serde_json::Value::Object(_)) | Ok(serde_json::Value::Array(_)) => true,
        _ => false,
    }
}

/// Strips (a) fenced ```json blocks whose body round-trips through JSON
/// decoding, (b) bare JSON objects/arrays occupying whole lines, (c) lines
/// beginning with `Tool output:`/`Tool result:`/`Function output:`
/// (case-insensitive). Curly-brace prose placeholders like `{name}` are left
/// untouched because they never round-trip through JSON decoding on their
/// own. After stripping, runs of 3+ newlines collapse to exactly two.
pub fn sanitize(text: &str) -> String {
    let mut out = FENCED_BLOCK
        .replace_all(text, |caps: &regex::Captures| {
            let body = &caps[1];
            if parses_as_json_object_or_array(body) {
                String::new()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned();

    out = out
        .lines()
        .filter(|line| !parses_as_json_object_or_array(line))
        .collect::<Vec<_>>()
        .join("\n");

    out = TOOL_OUTPUT_LINE.replace_all(&out, "").into_owned();

    out = EXCESS_NEWLINES.replace_all(&out, "\n\n").into_owned();
    out.trim().to_string()
}

/// If `text` is itself a JSON object with a `response` field, unwrap that
/// field (robustness against legacy formats, spec.md §4.5 step 7).
pub fn unwrap_legacy_response_field(text: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(text.trim()) {
        Ok(serde_json::Value::Object(map)) => match map.get("response") {
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => text.to_string(),
        },
        _ => text.to_string(),
    }
}

/// Splits `text` into chunks `<= limit` chars for channel delivery
/// (spec.md §4.6). Greedily packs whole paragraphs (split on `\n\n`); a
/// paragraph longer than `limit` is hard-split at `limit`-char boundaries.
/// Empty input returns an empty list.
pub fn chunk(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for paragraph in text.split("\n\n") {
        if paragraph.is_empty() {
            continue;
        }
        let candidate_len = if current.is_empty() {
            paragraph.chars().count()
        } else {
            current.chars().count() + 2 + paragraph.chars().count()
        };

        if candidate_len <= limit {
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(paragraph);
            continue;
        }

        if !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }

        if paragraph.chars().count() <= limit {
            current = paragraph.to_string();
        } else {
            for hard_chunk in hard_split(paragraph, limit) {
                chunks.push(hard_chunk);
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

fn hard_split(text: &str, limit: usize) -> Vec<String> {
    text.chars()
        .collect::<Vec<char>>()
        .chunks(limit)
        .map(|c| c.iter().collect())
        .collect()
}
