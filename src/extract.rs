//! Normalizes the chunk shapes different gateways put into `data:` payloads.
//!
//! Providers are not consistent between delta-style and full-message-style
//! chunks, so no single schema is assumed.

use crate::constants::SSE_DONE_SENTINEL;
use crate::types::Usage;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Content(String),
    Done,
    Unparseable,
}

/// `{"error": {...}}` envelope sent in-band by some gateways.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InBandError {
    pub message: String,
    pub code: Option<String>,
}

impl InBandError {
    /// Numeric codes are HTTP statuses in the OpenAI-compatible error envelope.
    pub fn status(&self) -> Option<u16> {
        self.code.as_deref().and_then(|c| c.parse::<u16>().ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub delta: Delta,
    pub usage: Option<Usage>,
    pub error: Option<InBandError>,
}

/// Maps one event payload to a text delta or a terminal signal.
pub fn extract_delta(payload: &str) -> Delta {
    inspect_chunk(payload).delta
}

/// Like [`extract_delta`], but also surfaces usage and in-band errors from the same parse.
pub fn inspect_chunk(payload: &str) -> ChunkInfo {
    if payload.trim() == SSE_DONE_SENTINEL {
        return ChunkInfo {
            delta: Delta::Done,
            usage: None,
            error: None,
        };
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => {
            return ChunkInfo {
                delta: Delta::Unparseable,
                usage: None,
                error: None,
            }
        }
    };

    ChunkInfo {
        delta: delta_from_value(&value),
        usage: usage_from_value(&value),
        error: error_from_value(&value),
    }
}

fn delta_from_value(value: &Value) -> Delta {
    let first_choice = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let candidates = [
        first_choice
            .and_then(|c| c.get("delta"))
            .and_then(|d| d.get("content")),
        first_choice
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content")),
        first_choice.and_then(|c| c.get("text")),
        value.get("content"),
    ];

    candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str())
        .map(|s| Delta::Content(s.to_string()))
        .unwrap_or(Delta::Unparseable)
}

fn usage_from_value(value: &Value) -> Option<Usage> {
    let usage = value.get("usage")?;
    if usage.is_null() {
        return None;
    }
    serde_json::from_value(usage.clone()).ok()
}

fn error_from_value(value: &Value) -> Option<InBandError> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = match error.get("message").and_then(|m| m.as_str()) {
        Some(m) => m.to_string(),
        None => match error.as_str() {
            Some(s) => s.to_string(),
            None => error.to_string(),
        },
    };
    let code = error.get("code").and_then(|c| match c {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    });
    Some(InBandError { message, code })
}
