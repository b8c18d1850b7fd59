use crate::config::RelayConfig;
use crate::constants::*;
use crate::hardening::RetryPolicy;
use crate::persistence::Persistence;
use crate::relay::CompletionRelay;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "chat_relay.db")]
    pub database: String,
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    pub upstream_url: String,
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub default_model: String,
    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,
    #[arg(long)]
    pub system_prompt: Option<String>,
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
    #[arg(long, default_value_t = DEFAULT_RETRY_BASE_DELAY_MS)]
    pub retry_base_delay_ms: u64,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = DEFAULT_FRAME_INTERVAL_MS)]
    pub frame_interval_ms: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_STREAM_EVENTS)]
    pub max_stream_events: usize,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    /// Send one prompt from the terminal instead of starting the server.
    #[arg(long)]
    pub prompt: Option<String>,
    /// Conversation to append the one-shot reply to.
    #[arg(long)]
    pub conversation_id: Option<String>,
    #[arg(long, default_value = "local")]
    pub user_id: String,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "127.0.0.1".to_string(),
            database: "chat_relay.db".to_string(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            system_prompt: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            request_timeout_secs: 120,
            connect_timeout_secs: 10,
            max_body_size: 10 * 1024 * 1024,
            frame_interval_ms: DEFAULT_FRAME_INTERVAL_MS,
            max_stream_events: DEFAULT_MAX_STREAM_EVENTS,
            log_dir: "logs".to_string(),
            prompt: None,
            conversation_id: None,
            user_id: "local".to_string(),
        }
    }
}

impl Args {
    pub fn relay_config(&self, api_key: Option<String>) -> RelayConfig {
        RelayConfig {
            upstream_url: self.upstream_url.clone(),
            api_key,
            default_model: self.default_model.clone(),
            default_temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: self.system_prompt.clone().filter(|s| !s.trim().is_empty()),
            retry: RetryPolicy::new(self.max_retries, self.retry_base_delay_ms),
            placeholder_title: PLACEHOLDER_TITLE.to_string(),
            max_stream_events: self.max_stream_events,
        }
    }
}

/// Shared gateway key from `GATEWAY_API_KEY`, falling back to `OPENROUTER_API_KEY`.
pub fn gateway_key_from_env() -> Option<String> {
    ["GATEWAY_API_KEY", "OPENROUTER_API_KEY"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|k| !k.trim().is_empty())
}

#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<CompletionRelay>,
    pub store: Arc<dyn Persistence>,
    pub args: Arc<Args>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults_match_config_defaults() {
        let args = match Args::try_parse_from(["chat-relay"]) {
            Ok(a) => a,
            Err(e) => panic!("Failed to parse args: {}", e),
        };
        let config = args.relay_config(None);
        let defaults = RelayConfig::default();
        assert_eq!(config.upstream_url, defaults.upstream_url);
        assert_eq!(config.default_model, defaults.default_model);
        assert_eq!(config.max_tokens, defaults.max_tokens);
        assert_eq!(config.retry.max_attempts, defaults.retry.max_attempts);
        assert_eq!(config.retry.base_delay_ms, defaults.retry.base_delay_ms);
        assert_eq!(config.max_stream_events, defaults.max_stream_events);
        assert_eq!(args.frame_interval_ms, 16);
    }

    #[test]
    fn test_blank_system_prompt_is_dropped() {
        let args = match Args::try_parse_from(["chat-relay", "--system-prompt", "  "]) {
            Ok(a) => a,
            Err(e) => panic!("Failed to parse args: {}", e),
        };
        assert_eq!(args.relay_config(None).system_prompt, None);
    }
}
