use crate::types::{PromptMessage, RequestId, Role, Usage};
use serde::{Deserialize, Serialize};

/// --- UPSTREAM (OPENAI-COMPATIBLE) REQUEST SCHEMA ---

/// Exactly the fields the gateway receives. Nothing else is forwarded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatCompletionBody {
    pub model: String,
    pub messages: Vec<WireMessage>,
    pub stream: bool,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireMessage {
    pub role: Role,
    pub content: String,
}

impl From<&PromptMessage> for WireMessage {
    fn from(m: &PromptMessage) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/// --- CALLER-FACING SCHEMA (SSE PASSTHROUGH) ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkEnvelope {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkDelta {
    pub content: String,
}

impl ChunkEnvelope {
    pub fn delta(request_id: &RequestId, model: &str, content: &str) -> Self {
        Self {
            id: request_id.0.clone(),
            object: "chat.completion.chunk".to_string(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: content.to_string(),
                },
                finish_reason: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionEnvelope {
    pub id: String,
    pub object: String,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: WireMessage,
    pub finish_reason: String,
}

impl CompletionEnvelope {
    pub fn new(
        request_id: &RequestId,
        model: &str,
        content: &str,
        usage: Option<Usage>,
        conversation_id: Option<String>,
    ) -> Self {
        Self {
            id: request_id.0.clone(),
            object: "chat.completion".to_string(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: WireMessage {
                    role: Role::Assistant,
                    content: content.to_string(),
                },
                finish_reason: "stop".to_string(),
            }],
            usage,
            conversation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub message: String,
    pub code: String,
    #[serde(rename = "requestId")]
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(rename = "partialContent", skip_serializing_if = "Option::is_none")]
    pub partial_content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_body_serializes_only_known_fields() {
        let body = ChatCompletionBody {
            model: "m".into(),
            messages: vec![WireMessage {
                role: Role::User,
                content: "hi".into(),
            }],
            stream: true,
            temperature: 0.5,
            max_tokens: 10,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(
            value,
            json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": true,
                "temperature": 0.5,
                "max_tokens": 10
            })
        );
    }

    #[test]
    fn test_chunk_envelope_shape() {
        let rid = RequestId("req_1".into());
        let value = serde_json::to_value(ChunkEnvelope::delta(&rid, "m", "Hel")).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "req_1",
                "object": "chat.completion.chunk",
                "model": "m",
                "choices": [{"index": 0, "delta": {"content": "Hel"}, "finish_reason": null}]
            })
        );
    }

    #[test]
    fn test_error_envelope_uses_camel_case_request_id() {
        let env = ErrorEnvelope {
            error: ErrorBody {
                message: "boom".into(),
                code: "upstream_error".into(),
                request_id: "req_2".into(),
                status: None,
                partial_content: None,
            },
        };
        let value = serde_json::to_value(env).unwrap();
        assert_eq!(
            value,
            json!({"error": {"message": "boom", "code": "upstream_error", "requestId": "req_2"}})
        );
    }
}
