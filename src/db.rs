use crate::constants::{
    DB_BUSY_TIMEOUT_MS, DB_MAX_CONNECTIONS, DB_WRITE_ATTEMPTS, DB_WRITE_RETRY_DELAY_MS,
};
use crate::hardening::RetryPolicy;
use crate::persistence::{NewConversation, Persistence, UsageRecord};
use crate::types::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::path::Path;
use std::time::Duration;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let options = SqliteConnectOptions::new()
        .filename(path.as_ref())
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(DB_MAX_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// SQLite reports contention as BUSY (5) or LOCKED (6), possibly extended.
pub fn is_transient_db_error(err: &RelayError) -> bool {
    match err {
        RelayError::Database(sqlx::Error::Database(db)) => {
            let code_is_contention = db
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| matches!(c & 0xff, 5 | 6))
                .unwrap_or(false);
            let message = db.message().to_ascii_lowercase();
            code_is_contention || message.contains("database is locked") || message.contains("busy")
        }
        RelayError::Database(sqlx::Error::PoolTimedOut) => true,
        _ => false,
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Ok(ts.with_timezone(&Utc)),
        Err(e) => Err(RelayError::Internal(
            format!("Invalid timestamp '{}' in database: {}", raw, e),
            tracing_error::SpanTrace::capture(),
        )
        .into()),
    }
}

fn conversation_from_row(row: &SqliteRow) -> Result<Conversation> {
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        title: row.try_get("title")?,
        model_id: row.try_get("model_id")?,
        system_prompt: row.try_get("system_prompt")?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChatMessage> {
    let role: String = row.try_get("role")?;
    let created_at: String = row.try_get("created_at")?;
    let role = match Role::parse(&role) {
        Some(r) => r,
        None => {
            return Err(RelayError::Internal(
                format!("Unknown role '{}' in messages table", role),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    Ok(ChatMessage {
        id: row.try_get("id")?,
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        role,
        content: row.try_get("content")?,
        created_at: parse_timestamp(&created_at)?,
    })
}

/// [`Persistence`] backed by a SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    write_retry: RetryPolicy,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            write_retry: RetryPolicy::new(DB_WRITE_ATTEMPTS - 1, DB_WRITE_RETRY_DELAY_MS)
                .without_jitter(),
        }
    }

    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(init_db(path).await?))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn messages_for(&self, conversation_id: &ConversationId) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, conversation_id, role, content, created_at FROM messages \
             WHERE conversation_id = ? ORDER BY created_at, rowid",
        )
        .bind(&conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    /// Sum of recorded usage for one user.
    pub async fn usage_totals(&self, user_id: &UserId) -> Result<Usage> {
        let (prompt, completion, total): (i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0), \
             COALESCE(SUM(total_tokens), 0) FROM usage_logs WHERE user_id = ?",
        )
        .bind(&user_id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(Usage {
            prompt_tokens: prompt as u32,
            completion_tokens: completion as u32,
            total_tokens: total as u32,
        })
    }

    async fn insert_conversation_once(&self, conversation: &NewConversation) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, model_id, system_prompt, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.user_id.0)
        .bind(&conversation.title)
        .bind(&conversation.model_id)
        .bind(&conversation.system_prompt)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message_once(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<ChatMessage> {
        let created_at = Utc::now();
        let message = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            role: Role::Assistant,
            content: content.to_string(),
            created_at,
        };
        let stamp = created_at.to_rfc3339();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&conversation_id.0)
        .bind(Role::Assistant.as_str())
        .bind(&message.content)
        .bind(&stamp)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(&stamp)
            .bind(&conversation_id.0)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(message)
    }

    async fn insert_usage_once(&self, record: &UsageRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO usage_logs (user_id, conversation_id, request_id, model_id, prompt_tokens, \
             completion_tokens, total_tokens, estimated, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.user_id.0)
        .bind(record.conversation_id.as_ref().map(|c| c.0.as_str()))
        .bind(&record.request_id.0)
        .bind(&record.model_id)
        .bind(record.usage.prompt_tokens as i64)
        .bind(record.usage.completion_tokens as i64)
        .bind(record.usage.total_tokens as i64)
        .bind(record.estimated)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, user_id, title, model_id, system_prompt, updated_at FROM conversations WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(conversation_from_row).transpose()
    }

    async fn create_conversation(&self, conversation: &NewConversation) -> Result<()> {
        self.write_retry
            .execute_with_retry_when(is_transient_db_error, |_| {
                self.insert_conversation_once(conversation)
            })
            .await
    }

    async fn append_assistant_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<ChatMessage> {
        self.write_retry
            .execute_with_retry_when(is_transient_db_error, |_| {
                self.insert_message_once(conversation_id, content)
            })
            .await
    }

    async fn record_usage(&self, record: &UsageRecord) -> Result<()> {
        self.write_retry
            .execute_with_retry_when(is_transient_db_error, |_| self.insert_usage_once(record))
            .await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
