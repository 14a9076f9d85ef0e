use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

fn session_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("session_([A-Za-z0-9_-]+)").expect("must be valid regex"))
}

/// Derive a stable session fingerprint from a raw request body
///
/// Priority:
/// 1. `metadata.user_id` matching `session_<id>`: the captured id.
/// 2. SHA-256 over the first 500 bytes of the first user message's
///    text content, keeping the first 16 hex characters.
///
/// Pure and total: malformed or unrecognizable input yields the empty
/// string, never an error.
pub fn extract_session_id(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let Ok(request) = serde_json::from_slice::<serde_json::Value>(body) else {
        return String::new();
    };

    if let Some(user_id) = request
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        && let Some(captures) = session_id_pattern().captures(user_id)
    {
        return captures[1].to_owned();
    }

    let Some(messages) = request.get("messages").and_then(|m| m.as_array()) else {
        return String::new();
    };
    for message in messages {
        if message.get("role").and_then(|r| r.as_str()) != Some("user") {
            continue;
        }
        let content = flatten_content(message.get("content"));
        if !content.is_empty() {
            return hash_content(&content);
        }
    }

    String::new()
}

/// Text of a message content field: either a plain string or the
/// first text part of a multimodal list
fn flatten_content(content: Option<&serde_json::Value>) -> String {
    match content {
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(serde_json::Value::Array(parts)) => parts
            .iter()
            .find_map(|part| {
                (part.get("type").and_then(|t| t.as_str()) == Some("text"))
                    .then(|| part.get("text").and_then(|t| t.as_str()))
                    .flatten()
            })
            .unwrap_or_default()
            .to_owned(),
        _ => String::new(),
    }
}

fn hash_content(content: &str) -> String {
    // long prompts hash the same as their 500-byte prefix, clamped to
    // a char boundary
    let mut cut = content.len().min(500);
    while cut < content.len() && !content.is_char_boundary(cut) {
        cut -= 1;
    }
    let digest = Sha256::digest(content[..cut].as_bytes());
    format!("{digest:x}")[..16].to_owned()
}
