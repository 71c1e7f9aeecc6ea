//! Post-LLM output cleanup before JSON decoding.
//!
//! Structured-output APIs return bare JSON, but local models may still wrap
//! it in thinking tags or a markdown fence.

use std::sync::LazyLock;

use regex::Regex;

static UNUSED_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<unused\d+>").expect("valid regex"));

static THINK_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<think>.*?</think>").expect("valid regex"));

/// Strip model artifacts from a raw completion.
///
/// Handles, in order:
/// 1. `<unusedN>thought\n...` thinking prefixes ahead of the JSON payload,
///    and stray `<unusedN>` tokens
/// 2. `<think>...</think>` blocks
/// 3. A surrounding ```json (or bare ```) fence
pub fn sanitize_completion(raw: &str) -> String {
    let mut text = raw.to_string();

    let payload_start = text.find('{').unwrap_or(text.len());
    if let Some(idx) = text.find("<unused").filter(|&idx| idx < payload_start) {
        if let Some(thought_offset) = text[idx..].find("thought\n") {
            text = text[idx + thought_offset + 8..].to_string();
        }
    }
    text = UNUSED_TOKEN_RE.replace_all(&text, "").to_string();
    text = THINK_BLOCK_RE.replace_all(&text, "").to_string();

    strip_code_fence(text.trim()).to_string()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    match rest.rfind("```") {
        Some(end) => rest[..end].trim(),
        None => rest.trim(),
    }
}
