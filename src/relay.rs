//! The completion relay: one upstream call per logical request, retried only
//! while nothing has reached the caller yet.

use crate::config::RelayConfig;
use crate::constants::RELAY_EVENT_BUFFER;
use crate::engine::{OpenAiCompatible, RelayEngine, RequestBuilder};
use crate::hardening::{classify_upstream_failure, RetryPolicy};
use crate::ingress::ValidatedRequest;
use crate::persistence::{self, Handoff, HandoffReport, Persistence};
use crate::specs::openai::{ChatCompletionBody, ErrorBody, ErrorEnvelope};
use crate::streaming::{DeltaSink, StreamHandler};
use crate::token_counting::TokenEstimator;
use crate::transport::Transport;
use crate::types::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Failed,
}

/// Ordered events of one call. Exactly one terminal event ends a submitted call.
#[derive(Debug)]
pub enum RelayEvent {
    /// Resolved before the first upstream attempt.
    Started {
        request_id: RequestId,
        model_id: String,
    },
    Delta(String),
    Completed(CompletionOutcome),
    Failed(RelayFailure),
}

#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub request_id: RequestId,
    pub model_id: String,
    pub content: String,
    pub usage: Option<Usage>,
    /// Upstream attempts made, including the one that succeeded.
    pub attempts: u32,
    pub persistence: HandoffReport,
}

impl CompletionOutcome {
    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.persistence.conversation_id.as_ref()
    }
}

/// Terminal failure of a call, wrapped with the request id.
#[derive(Debug)]
pub struct RelayFailure {
    pub request_id: RequestId,
    pub error: ObservedError,
    /// Content forwarded to the caller before the failure. Empty unless the stream broke mid-way.
    pub partial_content: String,
    pub attempts: u32,
}

impl RelayFailure {
    pub fn status(&self) -> Option<u16> {
        self.error.inner.status()
    }

    pub fn code(&self) -> &'static str {
        self.error.inner.code()
    }

    pub fn upstream_body(&self) -> Option<&str> {
        match &self.error.inner {
            RelayError::Upstream { body, .. } => Some(body),
            _ => None,
        }
    }

    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self.error.inner, RelayError::QuotaExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error.inner, RelayError::Cancelled)
    }

    /// Human-readable message for the single terminal callback.
    pub fn message(&self) -> String {
        match &self.error.inner {
            RelayError::Upstream { status, body } => format!(
                "Upstream returned status {}: {}",
                status,
                crate::hardening::upstream_message(body)
            ),
            RelayError::QuotaExceeded { message, .. } => {
                format!("Your quota or subscription limit was reached: {}", message)
            }
            RelayError::Network(_) | RelayError::Io(_) => {
                format!("Could not reach the model provider: {}", self.error)
            }
            other => other.to_string(),
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                message: self.message(),
                code: self.code().to_string(),
                request_id: self.request_id.0.clone(),
                status: self.status(),
                partial_content: if self.partial_content.is_empty() {
                    None
                } else {
                    Some(self.partial_content.clone())
                },
            },
        }
    }
}

impl std::fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.request_id, self.error)
    }
}

impl axum::response::IntoResponse for RelayFailure {
    fn into_response(self) -> axum::response::Response {
        (self.error.inner.http_status(), axum::Json(self.to_envelope())).into_response()
    }
}

/// One logical request, carrying its id from submission to the terminal event.
#[derive(Debug, Clone)]
pub struct RelayCall {
    pub request_id: RequestId,
    pub request: ValidatedRequest,
    pub auth: AuthContext,
}

impl RelayCall {
    pub fn new(request: ValidatedRequest, auth: AuthContext) -> Self {
        Self {
            request_id: RequestId::new(),
            request,
            auth,
        }
    }
}

/// A submitted call. Dropping the receiver does not cancel; use [`RelayHandle::cancel`].
pub struct RelayHandle {
    pub request_id: RequestId,
    pub events: mpsc::Receiver<RelayEvent>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

pub struct CompletionRelay {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
    builder: Arc<dyn RequestBuilder>,
}

enum AttemptError {
    /// Nothing was forwarded yet; the retry policy decides.
    BeforeContent(ObservedError),
    /// Content already reached the caller; never retried.
    AfterContent(ObservedError),
}

impl CompletionRelay {
    pub fn new(config: RelayConfig, transport: Arc<dyn Transport>, store: Arc<dyn Persistence>) -> Self {
        Self {
            config,
            transport,
            store,
            builder: Arc::new(OpenAiCompatible),
        }
    }

    pub fn with_request_builder(mut self, builder: Arc<dyn RequestBuilder>) -> Self {
        self.builder = builder;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Spawns the call and returns its event stream. The last event is `Completed` or `Failed`,
    /// except after cancellation, where the channel simply closes.
    pub fn submit(self: &Arc<Self>, request: ValidatedRequest, auth: AuthContext) -> RelayHandle {
        self.submit_call(RelayCall::new(request, auth))
    }

    /// [`submit`](Self::submit) for a call whose request id was assigned upstream.
    pub fn submit_call(self: &Arc<Self>, call: RelayCall) -> RelayHandle {
        let request_id = call.request_id.clone();
        let (tx, rx) = mpsc::channel(RELAY_EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let relay = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(
            async move {
                let terminal = match relay.run(call, &tx, &token).await {
                    Ok(outcome) => RelayEvent::Completed(outcome),
                    Err(failure) if failure.is_cancelled() => return,
                    Err(failure) => RelayEvent::Failed(failure),
                };
                if tx.send(terminal).await.is_err() {
                    debug!("[⚙️  -> 🖥️ ] Caller went away before the terminal event");
                }
            }
            .in_current_span(),
        );

        RelayHandle {
            request_id,
            events: rx,
            cancel,
            task,
        }
    }

    /// Drives one call to its terminal state.
    ///
    /// `Started` and `Delta` events go to `progress`; the terminal result is returned.
    pub async fn run(
        &self,
        call: RelayCall,
        progress: &mpsc::Sender<RelayEvent>,
        cancel: &CancellationToken,
    ) -> std::result::Result<CompletionOutcome, RelayFailure> {
        let span = tracing::info_span!(
            "relay",
            request_id = %call.request_id,
            conversation_id = call.request.conversation_id.as_ref().map(|c| c.0.as_str()).unwrap_or("-"),
        );
        self.run_inner(call, progress, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        call: RelayCall,
        progress: &mpsc::Sender<RelayEvent>,
        cancel: &CancellationToken,
    ) -> std::result::Result<CompletionOutcome, RelayFailure> {
        let RelayCall {
            request_id,
            request,
            auth,
        } = call;
        let mut state = RelayState::Idle;

        let conversation = match &request.conversation_id {
            Some(id) => match self.store.get_conversation(id).await {
                Ok(found) => found,
                Err(e) => {
                    warn!("[💾 -> ⚙️ ] Could not load conversation {}: {}", id.short(), e);
                    None
                }
            },
            None => None,
        };

        if let Some(found) = &conversation {
            if found.user_id != auth.user_id {
                warn!(
                    "[⚙️ ] User {} named conversation {} owned by someone else",
                    auth.user_id,
                    found.id.short()
                );
                return Err(RelayFailure {
                    request_id,
                    error: RelayError::InvalidRequest(format!(
                        "conversation {} is not available to this user",
                        found.id
                    ))
                    .into(),
                    partial_content: String::new(),
                    attempts: 0,
                });
            }
        }

        let resolved = RelayEngine::prepare(&request, conversation.as_ref(), &self.config, &auth);
        let api_key = match RelayEngine::resolve_api_key(&resolved, &self.config) {
            Ok(key) => key.to_string(),
            Err(e) => {
                return Err(RelayFailure {
                    request_id,
                    error: e,
                    partial_content: String::new(),
                    attempts: 0,
                })
            }
        };
        let body = self.builder.build(&resolved);
        info!(
            "[⚙️ ] Relaying {} messages to {} via {} (stream={})",
            body.messages.len(),
            body.model,
            self.builder.name(),
            body.stream
        );

        let mut sink = DeltaSink::new(progress).with_event_limit(self.config.max_stream_events);
        sink.emit(RelayEvent::Started {
            request_id: request_id.clone(),
            model_id: resolved.model_id.clone(),
        })
        .await;

        let policy = &self.config.retry;
        let mut retry = policy.start();
        let fail = |sink: &DeltaSink<'_>, error: ObservedError, attempts: u32| RelayFailure {
            request_id: request_id.clone(),
            error,
            partial_content: sink.aggregate.full_content.clone(),
            attempts,
        };

        loop {
            transition(&mut state, RelayState::Connecting);
            sink.metric.record_attempt();

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.attempt(&body, &api_key, &request_id, &mut sink, &mut state) => Some(result),
            };

            match attempt {
                None => {
                    info!("[⚙️ ] Call cancelled during attempt {}", retry.attempt + 1);
                    sink.metric.log_summary(&request_id, "cancelled");
                    return Err(fail(&sink, RelayError::Cancelled.into(), retry.attempt + 1));
                }
                Some(Ok(())) => break,
                Some(Err(AttemptError::AfterContent(e))) => {
                    transition(&mut state, RelayState::Failed);
                    error!(
                        "[☁️  -> ⚙️ ] Stream broke after {} chars were delivered: {}",
                        sink.aggregate.full_content.len(),
                        e
                    );
                    sink.metric.log_summary(&request_id, "interrupted");
                    let error = RelayError::StreamInterrupted(e.inner.to_string()).into();
                    return Err(fail(&sink, error, retry.attempt + 1));
                }
                Some(Err(AttemptError::BeforeContent(e))) => {
                    if !(retry.can_retry() && RetryPolicy::is_retryable(&e.inner)) {
                        transition(&mut state, RelayState::Failed);
                        error!(
                            "[☁️  -> ⚙️ ] Giving up after {} attempt(s): {}",
                            retry.attempt + 1,
                            e
                        );
                        sink.metric.log_summary(&request_id, e.inner.code());
                        return Err(fail(&sink, e, retry.attempt + 1));
                    }

                    sink.discard_attempt();
                    let delay = policy.next_delay(retry.attempt);
                    warn!(
                        "Request failed (attempt {} of {}): {}. Retrying in {:?}...",
                        retry.attempt + 1,
                        retry.max_attempts + 1,
                        e,
                        delay
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!("[⚙️ ] Call cancelled during backoff");
                            sink.metric.log_summary(&request_id, "cancelled");
                            return Err(fail(&sink, RelayError::Cancelled.into(), retry.attempt + 1));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry.attempt += 1;
                }
            }
        }

        let attempts = retry.attempt + 1;
        if cancel.is_cancelled() {
            sink.metric.log_summary(&request_id, "cancelled");
            return Err(fail(&sink, RelayError::Cancelled.into(), attempts));
        }

        if sink.aggregate.is_empty() {
            transition(&mut state, RelayState::Failed);
            warn!("[☁️  -> ⚙️ ] {} returned no content", resolved.model_id);
            sink.metric.log_summary(&request_id, "empty");
            let error = RelayError::EmptyResponse(resolved.model_id.clone()).into();
            return Err(fail(&sink, error, attempts));
        }

        let (usage, usage_estimated) = match sink.aggregate.usage {
            Some(u) => (u, false),
            None => (
                TokenEstimator::estimate_usage(&resolved.messages, &sink.aggregate.full_content),
                true,
            ),
        };

        let report = persistence::commit(
            self.store.as_ref(),
            Handoff {
                request_id: &request_id,
                user_id: &auth.user_id,
                conversation_id: request.conversation_id.as_ref(),
                model_id: &resolved.model_id,
                placeholder_title: &self.config.placeholder_title,
                content: &sink.aggregate.full_content,
                usage,
                usage_estimated,
            },
        )
        .await;

        transition(&mut state, RelayState::Completed);
        sink.metric.log_summary(&request_id, "completed");

        Ok(CompletionOutcome {
            request_id,
            model_id: resolved.model_id,
            content: sink.aggregate.full_content,
            usage: sink.aggregate.usage,
            attempts,
            persistence: report,
        })
    }

    async fn attempt(
        &self,
        body: &ChatCompletionBody,
        api_key: &str,
        request_id: &RequestId,
        sink: &mut DeltaSink<'_>,
        state: &mut RelayState,
    ) -> std::result::Result<(), AttemptError> {
        let response = self
            .transport
            .send(body, api_key, request_id)
            .await
            .map_err(AttemptError::BeforeContent)?;

        if !response.is_success() {
            let status = response.status;
            let text = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("Upstream error (body unreadable): {}", e),
            };
            error!("[☁️  -> ⚙️ ] Upstream Error {}: {}", status, crate::str_utils::snippet(&text, 500));
            return Err(AttemptError::BeforeContent(
                classify_upstream_failure(status, &text).into(),
            ));
        }

        transition(state, RelayState::Streaming);
        if !body.stream {
            let text = response.text().await.map_err(AttemptError::BeforeContent)?;
            return StreamHandler::handle_full_body(&text, sink).map_err(AttemptError::BeforeContent);
        }

        let frames = crate::sse::frame_body(response.body);
        match StreamHandler::handle_stream(frames, sink).await {
            Ok(_) => Ok(()),
            Err(e) if sink.has_forwarded() => Err(AttemptError::AfterContent(e)),
            Err(e) => Err(AttemptError::BeforeContent(e)),
        }
    }
}

fn transition(state: &mut RelayState, next: RelayState) {
    if *state != next {
        debug!("[⚙️ ] {:?} -> {:?}", state, next);
        *state = next;
    }
}
