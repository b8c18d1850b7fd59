mod common;

use chat_relay::db::SqliteStore;
use chat_relay::ingress::{InboundChatRequest, InboundMessage};
use chat_relay::persistence::{Handoff, NewConversation, Persistence};
use chat_relay::relay::RelayEvent;
use chat_relay::types::*;
use common::*;
use std::sync::Arc;
use tempfile::tempdir;

async fn open_store(dir: &tempfile::TempDir) -> Arc<SqliteStore> {
    match SqliteStore::open(dir.path().join("relay.db")).await {
        Ok(s) => Arc::new(s),
        Err(e) => panic!("Failed to open store: {:?}", e),
    }
}

fn request_in(conversation_id: Option<&str>, text: &str) -> chat_relay::ingress::ValidatedRequest {
    let inbound = InboundChatRequest {
        messages: vec![InboundMessage::new("user", text)],
        conversation_id: conversation_id.map(|c| c.to_string()),
        ..Default::default()
    };
    match inbound.validate() {
        Ok(r) => r,
        Err(e) => panic!("Request should validate: {}", e),
    }
}

#[tokio::test]
async fn test_retried_call_saves_exactly_one_message() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = open_store(&dir).await;
    let transport = ScriptedTransport::new(vec![
        Reply::Status(503, "busy".to_string()),
        Reply::Status(502, "bad gateway".to_string()),
        Reply::sse(HELLO_STREAM),
    ]);
    let relay = relay_with(test_config(), transport.clone(), store.clone());

    let events = collect(relay.submit(request_in(None, "hi"), AuthContext::new("u1"))).await;
    let outcome = match events.last() {
        Some(RelayEvent::Completed(o)) => o.clone(),
        other => panic!("Expected Completed, got {:?}", other),
    };
    assert_eq!(outcome.attempts, 3);
    assert_eq!(transport.calls(), 3);

    let conversation_id = match outcome.conversation_id() {
        Some(id) => id.clone(),
        None => panic!("Reply was not attached to a conversation"),
    };
    let conversation = match store.get_conversation(&conversation_id).await {
        Ok(Some(c)) => c,
        other => panic!("Conversation missing: {:?}", other),
    };
    assert_eq!(conversation.title, "New Chat");
    assert_eq!(conversation.model_id, outcome.model_id);
    assert_eq!(conversation.user_id, UserId("u1".into()));

    let messages = match store.messages_for(&conversation_id).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to load messages: {:?}", e),
    };
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::Assistant);
    assert_eq!(messages[0].content, "Hello");
    assert_eq!(outcome.persistence.message_id.as_deref(), Some(messages[0].id.as_str()));

    let usage_rows: (i64,) = match sqlx::query_as("SELECT COUNT(*) FROM usage_logs")
        .fetch_one(store.pool())
        .await
    {
        Ok(c) => c,
        Err(e) => panic!("Failed to count usage rows: {:?}", e),
    };
    assert_eq!(usage_rows.0, 1);
}

#[tokio::test]
async fn test_unknown_conversation_is_created_under_given_id() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = open_store(&dir).await;
    let transport = ScriptedTransport::new(vec![Reply::sse(HELLO_STREAM)]);
    let relay = relay_with(test_config(), transport, store.clone());

    let events = collect(relay.submit(
        request_in(Some("client-made-id"), "hi"),
        AuthContext::new("u2"),
    ))
    .await;
    let outcome = match events.last() {
        Some(RelayEvent::Completed(o)) => o.clone(),
        other => panic!("Expected Completed, got {:?}", other),
    };
    assert!(outcome.persistence.created_conversation);
    assert_eq!(
        outcome.conversation_id(),
        Some(&ConversationId::from("client-made-id"))
    );

    let messages = match store.messages_for(&ConversationId::from("client-made-id")).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to load messages: {:?}", e),
    };
    assert_eq!(messages.len(), 1);
}

#[tokio::test]
async fn test_conversation_settings_shape_the_request() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = open_store(&dir).await;
    let id = ConversationId::from("conv-settings");
    if let Err(e) = store
        .create_conversation(&NewConversation {
            id: id.clone(),
            user_id: UserId("u3".into()),
            title: "Pirate talk".into(),
            model_id: "anthropic/claude-3-haiku".into(),
            system_prompt: Some("Answer like a pirate.".into()),
        })
        .await
    {
        panic!("Failed to create conversation: {:?}", e);
    }

    let transport = ScriptedTransport::new(vec![Reply::sse(HELLO_STREAM), Reply::sse(HELLO_STREAM)]);
    let relay = relay_with(test_config(), transport.clone(), store.clone());

    let events = collect(relay.submit(request_in(Some("conv-settings"), "hi"), AuthContext::new("u3"))).await;
    let outcome = match events.last() {
        Some(RelayEvent::Completed(o)) => o.clone(),
        other => panic!("Expected Completed, got {:?}", other),
    };
    assert!(!outcome.persistence.created_conversation);
    assert_eq!(outcome.model_id, "anthropic/claude-3-haiku");

    let body = &transport.bodies()[0];
    assert_eq!(body.model, "anthropic/claude-3-haiku");
    assert_eq!(body.messages[0].role, Role::System);
    assert_eq!(body.messages[0].content, "Answer like a pirate.");
    assert_eq!(body.messages[1].role, Role::User);

    let conversation = match store.get_conversation(&id).await {
        Ok(Some(c)) => c,
        other => panic!("Conversation missing: {:?}", other),
    };
    assert_eq!(conversation.title, "Pirate talk");

    // A second reply lands in the same conversation.
    let _ = collect(relay.submit(request_in(Some("conv-settings"), "again"), AuthContext::new("u3"))).await;
    let messages = match store.messages_for(&id).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to load messages: {:?}", e),
    };
    assert_eq!(messages.len(), 2);

    let totals = match store.usage_totals(&UserId("u3".into())).await {
        Ok(t) => t,
        Err(e) => panic!("Failed to sum usage: {:?}", e),
    };
    assert!(totals.total_tokens > 0);
    assert_eq!(totals.total_tokens, totals.prompt_tokens + totals.completion_tokens);
}

#[tokio::test]
async fn test_failed_call_leaves_storage_untouched() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = open_store(&dir).await;
    let transport = ScriptedTransport::new(vec![Reply::Status(401, "unauthorized".to_string())]);
    let relay = relay_with(test_config(), transport, store.clone());

    let events = collect(relay.submit(request_in(Some("conv-x"), "hi"), AuthContext::new("u4"))).await;
    assert_eq!(terminal_counts(&events), (0, 1));

    match store.get_conversation(&ConversationId::from("conv-x")).await {
        Ok(None) => {}
        other => panic!("Failed call must not create a conversation: {:?}", other),
    }
    let count: (i64,) = match sqlx::query_as("SELECT COUNT(*) FROM messages")
        .fetch_one(store.pool())
        .await
    {
        Ok(c) => c,
        Err(e) => panic!("Failed to count messages: {:?}", e),
    };
    assert_eq!(count.0, 0);
}

#[tokio::test]
async fn test_handoff_never_writes_into_another_users_conversation() {
    let dir = match tempdir() {
        Ok(d) => d,
        Err(e) => panic!("Failed to create temp dir: {:?}", e),
    };
    let store = open_store(&dir).await;
    let id = ConversationId::from("alice-conv");
    if let Err(e) = store
        .create_conversation(&NewConversation {
            id: id.clone(),
            user_id: UserId("alice".into()),
            title: "Private".into(),
            model_id: "m".into(),
            system_prompt: None,
        })
        .await
    {
        panic!("Failed to create conversation: {:?}", e);
    }
    let before = match store.get_conversation(&id).await {
        Ok(Some(c)) => c,
        other => panic!("Conversation missing: {:?}", other),
    };

    let report = chat_relay::persistence::commit(
        store.as_ref(),
        Handoff {
            request_id: &RequestId::new(),
            user_id: &UserId("mallory".into()),
            conversation_id: Some(&id),
            model_id: "m",
            placeholder_title: "New Chat",
            content: "Hello",
            usage: Usage::default(),
            usage_estimated: true,
        },
    )
    .await;

    assert!(!report.persisted());
    assert!(!report.usage_recorded);
    assert_eq!(report.conversation_id, None);
    let messages = match store.messages_for(&id).await {
        Ok(m) => m,
        Err(e) => panic!("Failed to load messages: {:?}", e),
    };
    assert!(messages.is_empty());
    let after = match store.get_conversation(&id).await {
        Ok(Some(c)) => c,
        other => panic!("Conversation missing: {:?}", other),
    };
    assert_eq!(after.updated_at, before.updated_at);
}
