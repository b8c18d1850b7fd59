use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_MS, MAX_BACKOFF_MS, MAX_JITTER_PERCENT,
    RETRYABLE_CLIENT_STATUS,
};
use crate::types::{RelayError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::future::Future;
use std::time::Duration;

lazy_static! {
    static ref QUOTA_PATTERN: Regex = Regex::new(
        r"(?i)(insufficient_quota|quota[ _]exceeded|exceeded your (current )?quota|subscription (required|expired|limit)|upgrade your plan|payment required)"
    )
    .expect("quota pattern is a valid regex");
}

/// Retry settings for a single relay call.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Adds up to 30% on top of each delay when set.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            jitter: true,
        }
    }
}

/// Per-call retry bookkeeping. Reset for every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl RetryState {
    /// Whether another attempt may follow the current one.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            attempt: 0,
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
        }
    }

    /// Un-jittered delay before retry number `attempt` (0-indexed).
    pub fn base_delay(attempt: u32, base_delay_ms: u64) -> u64 {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        base_delay_ms.saturating_mul(factor).min(MAX_BACKOFF_MS)
    }

    /// `min(base * 2^attempt, 30s)`, jittered upwards and clamped to the cap.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = Self::base_delay(attempt, self.base_delay_ms);
        let jitter = if self.jitter && base > 0 {
            fastrand::u64(0..=base * MAX_JITTER_PERCENT / 100)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(MAX_BACKOFF_MS))
    }

    /// No status (network/timeout) or 429/5xx, unless the failure is an exhausted quota.
    pub fn is_retryable(err: &RelayError) -> bool {
        match err {
            RelayError::Network(e) => match e.status() {
                Some(status) => Self::is_retryable_status(status.as_u16()),
                None => true,
            },
            RelayError::Io(_) => true,
            RelayError::Upstream { status, .. } => Self::is_retryable_status(*status),
            _ => false,
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        status == RETRYABLE_CLIENT_STATUS || (500..600).contains(&status)
    }

    /// Runs `operation` until it succeeds, fails terminally, or retries run out.
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_retry_when(Self::is_retryable, operation)
            .await
    }

    /// [`execute_with_retry`](Self::execute_with_retry) with a caller-supplied retry predicate.
    pub async fn execute_with_retry_when<P, F, Fut, T>(
        &self,
        retryable: P,
        mut operation: F,
    ) -> Result<T>
    where
        P: Fn(&RelayError) -> bool,
        F: FnMut(RetryState) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut state = self.start();
        loop {
            match operation(state).await {
                Ok(val) => return Ok(val),
                Err(e) if state.can_retry() && retryable(&e.inner) => {
                    let delay = self.next_delay(state.attempt);
                    tracing::warn!(
                        "Request failed (attempt {} of {}): {}. Retrying in {:?}...",
                        state.attempt + 1,
                        self.max_attempts + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    state.attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Turns an upstream error status/body into the right error kind.
///
/// Quota exhaustion is recognised by status 402 or by the message, so that a
/// 429 carrying `insufficient_quota` is not retried.
pub fn classify_upstream_failure(status: u16, body: &str) -> RelayError {
    if status == 402 || QUOTA_PATTERN.is_match(body) {
        return RelayError::QuotaExceeded {
            status: Some(status),
            message: upstream_message(body),
        };
    }
    RelayError::Upstream {
        status,
        body: body.to_string(),
    }
}

/// Pulls `error.message` out of an OpenAI-style error body, falling back to the raw text.
pub fn upstream_message(body: &str) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(|m| m.as_str())
            .or_else(|| v.get("message").and_then(|m| m.as_str()))
            .map(|m| m.to_string())
    });
    match message {
        Some(m) => m,
        None => crate::str_utils::snippet(body.trim(), 500).into_owned(),
    }
}
