use crate::constants::REQUEST_ID_HEADER;
use crate::types::{RequestId, Usage};
use axum::{
    body::Body,
    http::{HeaderValue, Request, Response},
    middleware::Next,
};
use colored::*;
use std::panic;
use std::time::Instant;
use tracing::{error, info, warn};
use tracing::{info_span, Instrument};

/// Sets up a global panic hook that logs panics using tracing before the default hook runs.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Assigns a request id (or adopts the caller's), opens the request span and echoes the id back.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| RequestId(v.to_string()))
        .unwrap_or_default();

    if let Ok(val) = HeaderValue::from_str(&request_id.0) {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = HeaderValue::from_str(&request_id.0) {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-call stream counters, logged once when the call ends.
pub struct StreamMetric {
    pub started: Instant,
    pub attempts: u32,
    pub events: usize,
    pub deltas: usize,
    pub skipped: usize,
    pub text_chars: usize,
    pub tokens: Option<u32>,
    pub first_delta_ms: Option<u128>,
}

impl Default for StreamMetric {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            attempts: 0,
            events: 0,
            deltas: 0,
            skipped: 0,
            text_chars: 0,
            tokens: None,
            first_delta_ms: None,
        }
    }
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    pub fn record_event(&mut self) {
        self.events += 1;
    }

    pub fn record_delta(&mut self, text: &str) {
        if self.first_delta_ms.is_none() {
            self.first_delta_ms = Some(self.started.elapsed().as_millis());
        }
        self.deltas += 1;
        self.text_chars += text.len();
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.tokens = Some(usage.total_tokens);
    }

    pub fn clear_usage(&mut self) {
        self.tokens = None;
    }

    pub fn log_summary(&self, request_id: &RequestId, outcome: &str) {
        let ttft = match self.first_delta_ms {
            Some(ms) => format!("{}ms", ms),
            None => "-".to_string(),
        };
        let tokens = match self.tokens {
            Some(t) => t.to_string(),
            None => "n/a".to_string(),
        };

        if self.skipped > 0 {
            warn!(
                target: "flight_recorder",
                "{}",
                format!("[STREAM] Skipped {} unparseable events", self.skipped).yellow()
            );
        }

        info!(
            target: "flight_recorder",
            "[STREAM END] RequestID: {} | Outcome: {} | Attempts: {} | Events: {} | Deltas: {} | Text: {} chars | Tokens: {} | TTFT: {} | Elapsed: {}ms",
            request_id,
            outcome,
            self.attempts,
            self.events,
            self.deltas,
            self.text_chars,
            tokens,
            ttft,
            self.started.elapsed().as_millis()
        );
    }
}
