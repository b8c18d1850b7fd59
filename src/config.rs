use crate::constants::{
    DEFAULT_MAX_STREAM_EVENTS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
    DEFAULT_UPSTREAM_URL, PLACEHOLDER_TITLE,
};
use crate::hardening::RetryPolicy;

/// Everything a relay call needs besides the request itself.
///
/// Only the fields named here ever reach the upstream request body.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Chat-completions endpoint. Default: OpenRouter's OpenAI-compatible endpoint.
    pub upstream_url: String,
    /// Shared gateway key. An `AuthContext` override takes precedence.
    pub api_key: Option<String>,
    /// Used when neither the request nor the conversation names a model.
    pub default_model: String,
    /// Default: 0.7.
    pub default_temperature: f32,
    /// Default: 4096.
    pub max_tokens: u32,
    /// Prepended when no system message is present and neither the request nor
    /// the conversation supplies one. Default: none.
    pub system_prompt: Option<String>,
    /// Default: 3 retries, 500ms base, jittered.
    pub retry: RetryPolicy,
    /// Title for conversations the relay creates itself. Default: "New Chat".
    pub placeholder_title: String,
    /// Events read from one upstream body before it is abandoned as runaway. Hitting
    /// it fails the attempt as a malformed upstream, which becomes an interrupted
    /// stream once content has been forwarded. Default: 100 000, far above what any
    /// `max_tokens` setting produces.
    pub max_stream_events: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            api_key: None,
            default_model: DEFAULT_MODEL.to_string(),
            default_temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
            retry: RetryPolicy::default(),
            placeholder_title: PLACEHOLDER_TITLE.to_string(),
            max_stream_events: DEFAULT_MAX_STREAM_EVENTS,
        }
    }
}

impl RelayConfig {
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_upstream_url(mut self, url: impl Into<String>) -> Self {
        self.upstream_url = url.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
