use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct UserId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ConversationId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RequestId(pub String);

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ConversationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 8)
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestId {
    pub fn new() -> Self {
        Self(format!("req_{}", Uuid::new_v4().simple()))
    }

    pub fn short(&self) -> &str {
        crate::str_utils::prefix_chars(&self.0, 12)
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted message. Assistant rows are written only by the persistence handoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub role: Role,
    pub content: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub model_id: String,
    pub system_prompt: Option<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// One `{role, content}` entry of an outgoing completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Fully resolved request for one relay call. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<PromptMessage>,
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    pub api_key_override: Option<String>,
}

/// Identity of the caller as established by the (external) auth layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub api_key_override: Option<String>,
}

impl AuthContext {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: UserId(user_id.into()),
            api_key_override: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key_override = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Content aggregated over the lifetime of a single relay call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregatedResult {
    pub full_content: String,
    pub usage: Option<Usage>,
}

impl AggregatedResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) {
        self.full_content.push_str(delta);
    }

    pub fn is_empty(&self) -> bool {
        self.full_content.trim().is_empty()
    }
}

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Upstream error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("Malformed upstream response: {0}")]
    MalformedUpstream(String),

    #[error("Quota exceeded: {message}")]
    QuotaExceeded { status: Option<u16>, message: String },

    #[error("Model {0} returned an empty response")]
    EmptyResponse(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl RelayError {
    /// The upstream HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RelayError::Upstream { status, .. } => Some(*status),
            RelayError::QuotaExceeded { status, .. } => *status,
            RelayError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Database(_) | RelayError::Migration(_) => "persistence_error",
            RelayError::Serialization(_) => "serialization_error",
            RelayError::Network(_) | RelayError::Io(_) => "network_error",
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::Upstream { .. } => "upstream_error",
            RelayError::MalformedUpstream(_) => "malformed_upstream",
            RelayError::QuotaExceeded { .. } => "quota_exceeded",
            RelayError::EmptyResponse(_) => "empty_response",
            RelayError::StreamInterrupted(_) => "stream_interrupted",
            RelayError::Cancelled => "cancelled",
            RelayError::Internal(_, _) => "internal_error",
        }
    }

    pub fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RelayError::QuotaExceeded { .. } => StatusCode::PAYMENT_REQUIRED,
            RelayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            RelayError::Network(_)
            | RelayError::Io(_)
            | RelayError::MalformedUpstream(_)
            | RelayError::StreamInterrupted(_)
            | RelayError::EmptyResponse(_) => StatusCode::BAD_GATEWAY,
            RelayError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            RelayError::Database(_)
            | RelayError::Migration(_)
            | RelayError::Serialization(_)
            | RelayError::Internal(_, _) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: RelayError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<RelayError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        (
            self.inner.http_status(),
            axum::Json(serde_json::json!({
                "error": {
                    "message": self.inner.to_string(),
                    "code": self.inner.code(),
                }
            })),
        )
            .into_response()
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse_rejects_unknown() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("system"), Some(Role::System));
        assert_eq!(Role::parse("tool"), None);
        assert_eq!(Role::parse("User"), None);
    }

    #[test]
    fn test_request_id_format() {
        let rid = RequestId::new();
        assert!(rid.0.starts_with("req_"));
        assert_eq!(rid.0.len(), 4 + 32);
        assert_ne!(rid, RequestId::new());
    }

    #[test]
    fn test_error_status_and_code() {
        let err = RelayError::Upstream {
            status: 503,
            body: "busy".to_string(),
        };
        assert_eq!(err.status(), Some(503));
        assert_eq!(err.code(), "upstream_error");

        let quota = RelayError::QuotaExceeded {
            status: Some(402),
            message: "upgrade".to_string(),
        };
        assert_eq!(quota.code(), "quota_exceeded");
        assert_eq!(quota.http_status(), axum::http::StatusCode::PAYMENT_REQUIRED);

        let malformed = RelayError::MalformedUpstream("html".to_string());
        assert_eq!(malformed.status(), None);
    }

    #[test]
    fn test_aggregated_result_whitespace_is_empty() {
        let mut agg = AggregatedResult::new();
        assert!(agg.is_empty());
        agg.push("  \n");
        assert!(agg.is_empty());
        agg.push("Hi");
        assert!(!agg.is_empty());
        assert_eq!(agg.full_content, "  \nHi");
    }
}
