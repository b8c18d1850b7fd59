use crate::constants::*;
use crate::ingress::InboundChatRequest;
use crate::logging::request_id_middleware;
use crate::relay::{RelayCall, RelayEvent, RelayFailure};
use crate::specs::openai::{ChunkEnvelope, CompletionEnvelope};
use crate::types::*;
use crate::AppState;
use axum::extract::rejection::JsonRejection;
use axum::response::sse::{Event, KeepAlive};
use axum::{
    extract::State,
    http::HeaderMap,
    middleware,
    response::{IntoResponse, Response, Sse},
    routing::{get, post},
    Json, Router,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/chat/completions", post(chat_completions_handler))
        .route("/health", get(crate::health::liveness))
        .route("/readyz", get(crate::health::readiness))
        .layer(axum::extract::DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Identity as established by the auth layer in front of this service.
pub fn auth_from_headers(headers: &HeaderMap) -> AuthContext {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| v.to_string())
    };
    let mut auth = AuthContext::new(header(USER_ID_HEADER).unwrap_or_else(|| ANONYMOUS_USER_ID.to_string()));
    if let Some(key) = header(API_KEY_HEADER) {
        auth = auth.with_api_key(key);
    }
    auth
}

fn request_id_from_headers(headers: &HeaderMap) -> RequestId {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(|v| RequestId(v.to_string()))
        .unwrap_or_default()
}

pub async fn chat_completions_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<InboundChatRequest>, JsonRejection>,
) -> Response {
    let inbound = match payload {
        Ok(Json(p)) => p,
        Err(rejection) => {
            tracing::error!("[🖥️  -> ⚙️ ] Rejected body: {}", rejection.body_text());
            return ObservedError::from(RelayError::InvalidRequest(rejection.body_text()))
                .into_response();
        }
    };

    let request = match inbound.validate() {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("[🖥️  -> ⚙️ ] Validation Failed: {}", e);
            return e.into_response();
        }
    };

    let call = RelayCall {
        request_id: request_id_from_headers(&headers),
        request,
        auth: auth_from_headers(&headers),
    };
    tracing::info!(
        "[🖥️  -> ⚙️ ] {} messages from user {} (stream={})",
        call.request.messages.len(),
        call.auth.user_id,
        call.request.stream
    );

    if call.request.stream {
        stream_response(state, call)
    } else {
        complete_response(state, call).await
    }
}

fn stream_response(state: Arc<AppState>, call: RelayCall) -> Response {
    let handle = state.relay.submit_call(call);
    let request_id = handle.request_id.clone();
    let mut events = handle.events;
    let (tx, rx) = mpsc::channel::<std::result::Result<Event, Infallible>>(RELAY_EVENT_BUFFER);

    tokio::spawn(async move {
        let mut model_id = String::new();
        while let Some(event) = events.recv().await {
            let sse = match event {
                RelayEvent::Started { model_id: m, .. } => {
                    model_id = m;
                    continue;
                }
                RelayEvent::Delta(text) => json_event(&ChunkEnvelope::delta(&request_id, &model_id, &text)),
                RelayEvent::Completed(_) => Event::default().data(SSE_DONE_SENTINEL),
                RelayEvent::Failed(failure) => error_event(&failure),
            };
            if tx.send(Ok(sse)).await.is_err() {
                tracing::debug!("[⚙️  -> 🖥️ ] Client disconnected; the relay finishes on its own");
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}

fn json_event<T: serde::Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            tracing::error!("Failed to serialize SSE payload: {}", e);
            Event::default().comment("serialization error")
        }
    }
}

fn error_event(failure: &RelayFailure) -> Event {
    tracing::error!("[⚙️  -> 🖥️ ] {}", failure);
    json_event(&failure.to_envelope())
}

async fn complete_response(state: Arc<AppState>, call: RelayCall) -> Response {
    let (tx, rx) = mpsc::channel(RELAY_EVENT_BUFFER);
    drop(rx);
    match state.relay.run(call, &tx, &CancellationToken::new()).await {
        Ok(outcome) => Json(CompletionEnvelope::new(
            &outcome.request_id,
            &outcome.model_id,
            &outcome.content,
            outcome.usage,
            outcome.conversation_id().map(|c| c.0.clone()),
        ))
        .into_response(),
        Err(failure) => {
            tracing::error!("[⚙️  -> 🖥️ ] {}", failure);
            failure.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(auth_from_headers(&headers), AuthContext::new(ANONYMOUS_USER_ID));

        headers.insert(USER_ID_HEADER, "user-7".parse().unwrap());
        headers.insert(API_KEY_HEADER, "sk-own".parse().unwrap());
        let auth = auth_from_headers(&headers);
        assert_eq!(auth.user_id, UserId("user-7".into()));
        assert_eq!(auth.api_key_override.as_deref(), Some("sk-own"));
    }
}
