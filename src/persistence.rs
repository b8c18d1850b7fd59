use crate::types::*;
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Storage port used by the relay. All writes the relay performs go through here.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>>;

    /// Creating an id that already exists is not an error.
    async fn create_conversation(&self, conversation: &NewConversation) -> Result<()>;

    /// Inserts the message and bumps the conversation's `updated_at` in one transaction.
    async fn append_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<ChatMessage>;

    async fn record_usage(&self, record: &UsageRecord) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewConversation {
    pub id: ConversationId,
    pub user_id: UserId,
    pub title: String,
    pub model_id: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub user_id: UserId,
    pub conversation_id: Option<ConversationId>,
    pub request_id: RequestId,
    pub model_id: String,
    pub usage: Usage,
    /// True when the counts come from the local estimator rather than the provider.
    pub estimated: bool,
}

/// What the relay hands over once a call has completed.
#[derive(Debug, Clone)]
pub struct Handoff<'a> {
    pub request_id: &'a RequestId,
    pub user_id: &'a UserId,
    pub conversation_id: Option<&'a ConversationId>,
    pub model_id: &'a str,
    pub placeholder_title: &'a str,
    pub content: &'a str,
    pub usage: Usage,
    pub usage_estimated: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandoffReport {
    /// The conversation the message landed in, if it landed anywhere.
    pub conversation_id: Option<ConversationId>,
    pub created_conversation: bool,
    pub message_id: Option<String>,
    pub usage_recorded: bool,
}

impl HandoffReport {
    pub fn persisted(&self) -> bool {
        self.message_id.is_some()
    }
}

/// Runs the post-completion writes. Never fails: the caller already has the content.
pub async fn commit(store: &dyn Persistence, handoff: Handoff<'_>) -> HandoffReport {
    let mut report = HandoffReport::default();

    let conversation_id = match ensure_conversation(store, &handoff, &mut report).await {
        Ok(id) => id,
        Err(e) => {
            error!(
                request_id = %handoff.request_id,
                conversation_id = ?handoff.conversation_id.map(|c| c.0.as_str()),
                "[⚙️  -> 💾] Could not resolve conversation: {}",
                e
            );
            return report;
        }
    };
    report.conversation_id = Some(conversation_id.clone());

    match store
        .append_assistant_message(&conversation_id, handoff.content)
        .await
    {
        Ok(message) => {
            info!(
                "[⚙️  -> 💾] Saved assistant message {} ({} chars) to conversation {}",
                message.id,
                message.content.len(),
                conversation_id.short()
            );
            report.message_id = Some(message.id);
        }
        Err(e) => {
            error!(
                request_id = %handoff.request_id,
                conversation_id = %conversation_id,
                "[⚙️  -> 💾] Failed to save assistant message: {}",
                e
            );
            return report;
        }
    }

    let record = UsageRecord {
        user_id: handoff.user_id.clone(),
        conversation_id: Some(conversation_id),
        request_id: handoff.request_id.clone(),
        model_id: handoff.model_id.to_string(),
        usage: handoff.usage,
        estimated: handoff.usage_estimated,
    };
    match store.record_usage(&record).await {
        Ok(()) => report.usage_recorded = true,
        Err(e) => warn!(
            request_id = %handoff.request_id,
            "[⚙️  -> 💾] Usage logging failed (message kept): {}",
            e
        ),
    }

    report
}

async fn ensure_conversation(
    store: &dyn Persistence,
    handoff: &Handoff<'_>,
    report: &mut HandoffReport,
) -> Result<ConversationId> {
    let id = match handoff.conversation_id {
        Some(id) => {
            match store.get_conversation(id).await? {
                Some(existing) if existing.user_id == *handoff.user_id => return Ok(id.clone()),
                Some(_) => {
                    return Err(RelayError::InvalidRequest(format!(
                        "conversation {} belongs to another user",
                        id
                    ))
                    .into())
                }
                None => {}
            }
            warn!(
                "[⚙️  -> 💾] Conversation {} not found, creating it before saving the reply",
                id.short()
            );
            id.clone()
        }
        None => ConversationId::new(),
    };

    store
        .create_conversation(&NewConversation {
            id: id.clone(),
            user_id: handoff.user_id.clone(),
            title: handoff.placeholder_title.to_string(),
            model_id: handoff.model_id.to_string(),
            system_prompt: None,
        })
        .await?;
    report.created_conversation = true;
    Ok(id)
}
