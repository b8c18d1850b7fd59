/// Statuses that are worth another attempt when no content has been streamed yet.
pub const RETRYABLE_CLIENT_STATUS: u16 = 429;

/// Upper bound for any single backoff wait.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Upper bound for upward jitter, in percent of the un-jittered delay.
pub const MAX_JITTER_PERCENT: u64 = 30;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 500;

/// OpenAI-compatible gateway endpoint
pub const DEFAULT_UPSTREAM_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Title given to conversations the relay has to create itself.
pub const PLACEHOLDER_TITLE: &str = "New Chat";

/// SSE framing
pub const SSE_DATA_PREFIX: &str = "data: ";
pub const SSE_EVENT_DELIMITER: &[u8] = b"\n\n";
pub const SSE_DONE_SENTINEL: &str = "[DONE]";
pub const MAX_SSE_FRAME_BYTES: usize = 1024 * 1024;
/// Events read from one upstream body before it is treated as runaway.
pub const DEFAULT_MAX_STREAM_EVENTS: usize = 100_000;

/// Markers of an HTML error page served where an event stream was expected.
/// Compared case-insensitively.
pub const HTML_DOCUMENT_MARKERS: &[&str] = &["<!doctype", "<html"];

/// Message shown in place of an empty assistant bubble.
pub const EMPTY_RESPONSE_PLACEHOLDER: &str =
    "The model returned an empty response. Please try again.";

/// Database defaults
pub const DB_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DB_MAX_CONNECTIONS: u32 = 8;
/// Total tries for one write when SQLite reports BUSY/LOCKED.
pub const DB_WRITE_ATTEMPTS: u32 = 3;
pub const DB_WRITE_RETRY_DELAY_MS: u64 = 50;

/// Capacity of the per-call event channel.
pub const RELAY_EVENT_BUFFER: usize = 100;

/// Client repaint cadence (one animation frame at 60Hz).
pub const DEFAULT_FRAME_INTERVAL_MS: u64 = 16;

/// Request id header shared between the HTTP shell and the relay.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const USER_ID_HEADER: &str = "x-user-id";
pub const API_KEY_HEADER: &str = "x-api-key";
pub const ANONYMOUS_USER_ID: &str = "anonymous";
