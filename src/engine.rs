use crate::config::RelayConfig;
use crate::ingress::ValidatedRequest;
use crate::specs::openai::{ChatCompletionBody, WireMessage};
use crate::types::*;

/// Turns a resolved request into the upstream wire body.
///
/// The relay holds one of these so that differently-shaped providers can be
/// slotted in without touching the streaming state machine.
pub trait RequestBuilder: Send + Sync {
    fn name(&self) -> &'static str;
    fn build(&self, request: &CompletionRequest) -> ChatCompletionBody;
}

/// Plain OpenAI chat-completions body. Forwards `{model, messages, stream, temperature, max_tokens}`.
pub struct OpenAiCompatible;

impl RequestBuilder for OpenAiCompatible {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    fn build(&self, request: &CompletionRequest) -> ChatCompletionBody {
        ChatCompletionBody {
            model: request.model_id.clone(),
            messages: request.messages.iter().map(WireMessage::from).collect(),
            stream: request.stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

pub struct RelayEngine;

impl RelayEngine {
    /// Resolves model, temperature and system prompt for one call.
    ///
    /// Precedence is request, then stored conversation, then configuration.
    /// The system prompt is prepended only when the caller sent no system message.
    pub fn prepare(
        request: &ValidatedRequest,
        conversation: Option<&Conversation>,
        config: &RelayConfig,
        auth: &AuthContext,
    ) -> CompletionRequest {
        let model_id = request
            .model
            .clone()
            .or_else(|| conversation.map(|c| c.model_id.clone()))
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| config.default_model.clone());

        let system_prompt = request
            .system_prompt
            .clone()
            .or_else(|| conversation.and_then(|c| c.system_prompt.clone()))
            .or_else(|| config.system_prompt.clone())
            .filter(|s| !s.trim().is_empty());

        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        let has_system = request.messages.iter().any(|m| m.role == Role::System);
        if let (false, Some(prompt)) = (has_system, system_prompt) {
            tracing::debug!("[⚙️] Prepending system prompt ({} chars)", prompt.len());
            messages.push(PromptMessage::new(Role::System, prompt));
        }
        messages.extend(request.messages.iter().cloned());

        CompletionRequest {
            messages,
            model_id,
            temperature: request.temperature.unwrap_or(config.default_temperature),
            max_tokens: config.max_tokens,
            stream: request.stream,
            api_key_override: auth.api_key_override.clone(),
        }
    }

    /// The per-user override wins over the shared gateway key.
    pub fn resolve_api_key<'a>(
        request: &'a CompletionRequest,
        config: &'a RelayConfig,
    ) -> Result<&'a str> {
        request
            .api_key_override
            .as_deref()
            .or(config.api_key.as_deref())
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                RelayError::InvalidRequest("no API key configured for the upstream gateway".into())
                    .into()
            })
    }
}
