#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chat_relay::config::RelayConfig;
use chat_relay::hardening::RetryPolicy;
use chat_relay::ingress::{InboundChatRequest, InboundMessage, ValidatedRequest};
use chat_relay::persistence::{NewConversation, Persistence, UsageRecord};
use chat_relay::relay::{CompletionRelay, RelayEvent, RelayHandle};
use chat_relay::specs::openai::ChatCompletionBody;
use chat_relay::transport::{Transport, UpstreamResponse};
use chat_relay::types::*;
use futures_util::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

pub const HELLO_STREAM: &str = concat!(
    "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
    "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
    "data: [DONE]\n\n",
);

pub const TEST_KEY: &str = "test-key";

/// One canned upstream reply.
pub enum Reply {
    Status(u16, String),
    Stream(Vec<std::io::Result<Bytes>>),
    /// 200 whose body never yields.
    Pending,
}

impl Reply {
    pub fn sse(body: &str) -> Self {
        Reply::Stream(vec![Ok(Bytes::from(body.to_string()))])
    }
}

/// Replays scripted replies in order and records what was sent.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicU32,
    bodies: Mutex<Vec<ChatCompletionBody>>,
    keys: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn bodies(&self) -> Vec<ChatCompletionBody> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        body: &ChatCompletionBody,
        api_key: &str,
        _request_id: &RequestId,
    ) -> Result<UpstreamResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies.lock().unwrap().push(body.clone());
        self.keys.lock().unwrap().push(api_key.to_string());
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Status(status, text)) => Ok(UpstreamResponse::new(
                status,
                Box::pin(stream::iter(vec![Ok(Bytes::from(text))])),
            )),
            Some(Reply::Stream(chunks)) => {
                Ok(UpstreamResponse::new(200, Box::pin(stream::iter(chunks))))
            }
            Some(Reply::Pending) => Ok(UpstreamResponse::new(
                200,
                Box::pin(stream::pending::<std::io::Result<Bytes>>()),
            )),
            None => Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no scripted reply left",
            ))
            .into()),
        }
    }
}

/// In-memory [`Persistence`] that records every call.
#[derive(Default)]
pub struct RecordingStore {
    pub conversations: Mutex<HashMap<String, NewConversation>>,
    pub messages: Mutex<Vec<(ConversationId, String)>>,
    pub usage: Mutex<Vec<UsageRecord>>,
    pub fail_usage: bool,
}

impl RecordingStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_usage() -> Arc<Self> {
        Arc::new(Self {
            fail_usage: true,
            ..Default::default()
        })
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.lock().unwrap().len()
    }
}

#[async_trait]
impl Persistence for RecordingStore {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let found = self.conversations.lock().unwrap().get(&id.0).cloned();
        Ok(found.map(|c| Conversation {
            id: c.id,
            user_id: c.user_id,
            title: c.title,
            model_id: c.model_id,
            system_prompt: c.system_prompt,
            updated_at: chrono::Utc::now(),
        }))
    }

    async fn create_conversation(&self, conversation: &NewConversation) -> Result<()> {
        self.conversations
            .lock()
            .unwrap()
            .entry(conversation.id.0.clone())
            .or_insert_with(|| conversation.clone());
        Ok(())
    }

    async fn append_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .push((conversation_id.clone(), content.to_string()));
        Ok(ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
            content: content.to_string(),
            created_at: chrono::Utc::now(),
        })
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        if self.fail_usage {
            return Err(RelayError::Internal(
                "usage table unavailable".into(),
                tracing_error::SpanTrace::capture(),
            )
            .into());
        }
        self.usage.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub fn test_config() -> RelayConfig {
    RelayConfig::default()
        .with_api_key(TEST_KEY)
        .with_retry(RetryPolicy::new(3, 1).without_jitter())
}

pub fn relay_with(
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn Persistence>,
) -> Arc<CompletionRelay> {
    Arc::new(CompletionRelay::new(config, transport, store))
}

pub fn user_request(text: &str) -> ValidatedRequest {
    let inbound = InboundChatRequest {
        messages: vec![InboundMessage::new("user", text)],
        ..Default::default()
    };
    match inbound.validate() {
        Ok(r) => r,
        Err(e) => panic!("Request should validate: {}", e),
    }
}

/// Drains a submitted call's events after the task has finished.
pub async fn collect(mut handle: RelayHandle) -> Vec<RelayEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    if let Err(e) = handle.task.await {
        panic!("Relay task panicked: {:?}", e);
    }
    events
}

pub fn deltas(events: &[RelayEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            RelayEvent::Delta(d) => Some(d.clone()),
            _ => None,
        })
        .collect()
}

pub fn terminal_counts(events: &[RelayEvent]) -> (usize, usize) {
    let completed = events
        .iter()
        .filter(|e| matches!(e, RelayEvent::Completed(_)))
        .count();
    let failed = events
        .iter()
        .filter(|e| matches!(e, RelayEvent::Failed(_)))
        .count();
    (completed, failed)
}
