use crate::types::*;
use serde::{Deserialize, Serialize};

const MAX_MESSAGES: usize = 1000;

/// Request body accepted from the routing layer.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct InboundChatRequest {
    #[serde(default)]
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct InboundMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl InboundMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
        }
    }
}

/// An inbound request that passed validation. Streaming defaults to on.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub messages: Vec<PromptMessage>,
    pub model: Option<String>,
    pub stream: bool,
    pub conversation_id: Option<ConversationId>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
}

impl InboundChatRequest {
    pub fn validate(&self) -> Result<ValidatedRequest> {
        if self.messages.is_empty() {
            return Err(RelayError::InvalidRequest("messages must not be empty".into()).into());
        }
        if self.messages.len() > MAX_MESSAGES {
            return Err(RelayError::InvalidRequest(format!(
                "messages exceeds limit of {}",
                MAX_MESSAGES
            ))
            .into());
        }

        let mut messages = Vec::with_capacity(self.messages.len());
        for (index, raw) in self.messages.iter().enumerate() {
            let role = match Role::parse(&raw.role) {
                Some(r) => r,
                None => {
                    return Err(RelayError::InvalidRequest(format!(
                        "Message at index {} has unsupported role '{}' (expected user, assistant or system)",
                        index, raw.role
                    ))
                    .into())
                }
            };
            let content = match &raw.content {
                Some(c) => c.clone(),
                None => {
                    return Err(RelayError::InvalidRequest(format!(
                        "Message at index {} is missing content",
                        index
                    ))
                    .into())
                }
            };
            messages.push(PromptMessage { role, content });
        }

        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(RelayError::InvalidRequest(format!(
                    "temperature {} is outside [0, 2]",
                    t
                ))
                .into());
            }
        }

        let model = non_blank(&self.model);
        let system_prompt = non_blank(&self.system_prompt);
        let conversation_id = match &self.conversation_id {
            Some(cid) if cid.trim().is_empty() => {
                return Err(
                    RelayError::InvalidRequest("conversation_id must not be blank".into()).into(),
                )
            }
            Some(cid) => Some(ConversationId(cid.clone())),
            None => None,
        };

        Ok(ValidatedRequest {
            messages,
            model,
            stream: self.stream.unwrap_or(true),
            conversation_id,
            temperature: self.temperature,
            system_prompt,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_ref()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
