use std::collections::BTreeMap;

use aho_corasick::AhoCorasick;
use http::{HeaderMap, StatusCode};
use meridian_core::HttpError;
use regex::Regex;
use thiserror::Error;

use crate::GuardError;

/// A request rejected by channel audit
#[derive(Debug, Error)]
pub enum AuditRejection {
    /// One or more headers did not match their required pattern
    #[error("request headers do not match audit rules: {}", failed.join(", "))]
    Header {
        failed: Vec<String>,
    },

    /// The request content contains blocked keywords
    #[error("content contains blocked keywords: {}", matched.join(", "))]
    Content {
        matched: Vec<String>,
    },
}

impl HttpError for AuditRejection {
    fn status_code(&self) -> StatusCode {
        StatusCode::FORBIDDEN
    }

    fn error_type(&self) -> &str {
        match self {
            Self::Header { .. } => "header_audit_failed",
            Self::Content { .. } => "content_audit_failed",
        }
    }

    fn client_message(&self) -> String {
        self.to_string()
    }
}

/// Compiled audit rules for one channel
///
/// Compilation is fail-closed: a rules blob that is not a JSON object
/// of `header → regex`, or a pattern that does not compile, rejects
/// the request as misconfigured instead of waving it through.
pub struct ChannelAudit {
    header_rules: Vec<(String, Regex)>,
    content: Option<AhoCorasick>,
    keywords: Vec<String>,
}

impl ChannelAudit {
    pub fn compile(
        header_enabled: bool,
        header_rules_json: &str,
        content_enabled: bool,
        keywords: &str,
    ) -> Result<Self, GuardError> {
        let mut header_rules = Vec::new();
        if header_enabled && !header_rules_json.trim().is_empty() {
            // BTreeMap keeps rule evaluation order stable
            let rules: BTreeMap<String, String> = serde_json::from_str(header_rules_json)
                .map_err(|e| GuardError::AuditMisconfigured(format!("invalid rules JSON: {e}")))?;
            for (header, pattern) in rules {
                let regex = Regex::new(&pattern).map_err(|e| {
                    GuardError::AuditMisconfigured(format!("invalid pattern for header '{header}': {e}"))
                })?;
                header_rules.push((header, regex));
            }
        }

        let mut compiled_keywords = Vec::new();
        let mut content = None;
        if content_enabled {
            compiled_keywords = keywords
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>();
            if !compiled_keywords.is_empty() {
                let automaton = AhoCorasick::builder()
                    .ascii_case_insensitive(true)
                    .build(&compiled_keywords)
                    .map_err(|e| GuardError::AuditMisconfigured(format!("keyword automaton: {e}")))?;
                content = Some(automaton);
            }
        }

        Ok(Self {
            header_rules,
            content,
            keywords: compiled_keywords,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.header_rules.is_empty() && self.content.is_none()
    }

    /// Check a request against the channel's rules
    ///
    /// Every configured header must match its pattern; a missing
    /// header is matched as the empty string. Keywords match
    /// case-insensitively anywhere in the content.
    pub fn check(&self, headers: &HeaderMap, content: &str) -> Result<(), AuditRejection> {
        let mut failed = Vec::new();
        for (header, regex) in &self.header_rules {
            let value = headers
                .get(header.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !regex.is_match(value) {
                failed.push(header.clone());
            }
        }
        if !failed.is_empty() {
            tracing::warn!(failed = ?failed, "header audit rejected request");
            return Err(AuditRejection::Header { failed });
        }

        if let Some(automaton) = &self.content
            && !content.is_empty()
        {
            let matched: Vec<String> = {
                let mut seen: Vec<String> = Vec::new();
                for hit in automaton.find_iter(content) {
                    let keyword = self.keywords[hit.pattern().as_usize()].clone();
                    if !seen.contains(&keyword) {
                        seen.push(keyword);
                    }
                }
                seen
            };
            if !matched.is_empty() {
                tracing::warn!(matched = ?matched, "content audit rejected request");
                return Err(AuditRejection::Content { matched });
            }
        }
        Ok(())
    }
}

/// Concatenated text content of a request body's messages
///
/// The audit surface: every string content and every `text` part of a
/// multimodal list, joined with newlines. Malformed bodies audit as
/// empty.
pub fn request_text(body: &[u8]) -> String {
    let Ok(request) = serde_json::from_slice::<serde_json::Value>(body) else {
        return String::new();
    };
    let Some(messages) = request.get("messages").and_then(|m| m.as_array()) else {
        return String::new();
    };

    let mut text = String::new();
    for message in messages {
        match message.get("content") {
            Some(serde_json::Value::String(s)) => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(s);
            }
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("text")
                        && let Some(s) = part.get("text").and_then(|t| t.as_str())
                    {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(s);
                    }
                }
            }
            _ => {}
        }
    }
    text
}
