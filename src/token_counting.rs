//! Token Counting Utility
//!
//! Heuristic token counts for usage records when the provider reports none.

use crate::types::{PromptMessage, Usage};

/// Estimator for token counts to avoid shipping a tokenizer for best-effort accounting.
pub struct TokenEstimator;

impl TokenEstimator {
    /// Estimate token count for the prompt side of a request.
    pub fn estimate_prompt_tokens(messages: &[PromptMessage]) -> u32 {
        messages
            .iter()
            .map(|m| 4 + Self::estimate_text_tokens(&m.content)) // Message overhead
            .sum()
    }

    /// Lightweight heuristic: ~3 chars per token, which over-counts plain English slightly.
    pub fn estimate_text_tokens(text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        ((text.len() / 3) as u32).max(1)
    }

    pub fn estimate_usage(messages: &[PromptMessage], completion: &str) -> Usage {
        let prompt_tokens = Self::estimate_prompt_tokens(messages);
        let completion_tokens = Self::estimate_text_tokens(completion);
        Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    #[test]
    fn test_token_estimation() {
        let messages = vec![
            PromptMessage::new(Role::System, "You are a helpful assistant."),
            PromptMessage::new(Role::User, "Hello"),
        ];
        let usage = TokenEstimator::estimate_usage(&messages, "Hi there, how can I help?");
        assert_eq!(usage.prompt_tokens, (4 + 9) + (4 + 1));
        assert_eq!(usage.completion_tokens, 8);
        assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    }

    #[test]
    fn test_empty_text_is_zero() {
        assert_eq!(TokenEstimator::estimate_text_tokens(""), 0);
        assert_eq!(TokenEstimator::estimate_text_tokens("a"), 1);
    }
}
