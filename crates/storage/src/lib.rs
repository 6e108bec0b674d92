use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::{
    Conversation, ConversationId, ConversationStatus, Message, MessageStatus, PendingMessage,
};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    /// Stores the conversation header and any messages it carries.
    pub async fn upsert_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.upsert_conversations(std::slice::from_ref(conversation))
            .await
    }

    pub async fn upsert_conversations(&self, conversations: &[Conversation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for conversation in conversations {
            let mut header = conversation.clone();
            let messages = std::mem::take(&mut header.messages);
            let payload = serde_json::to_string(&header).with_context(|| {
                format!("failed to encode conversation {}", conversation.id)
            })?;
            sqlx::query(
                "INSERT INTO conversations (id, status, payload, activity_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, CURRENT_TIMESTAMP)
                 ON CONFLICT(id) DO UPDATE SET
                    status = excluded.status,
                    payload = excluded.payload,
                    activity_at = excluded.activity_at,
                    updated_at = CURRENT_TIMESTAMP",
            )
            .bind(conversation.id.as_str())
            .bind(status_label(conversation.status))
            .bind(payload)
            .bind(conversation.activity_at())
            .execute(&mut *tx)
            .await?;

            for message in &messages {
                insert_message(&mut tx, message).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_conversations(&self, limit: u32) -> Result<Vec<Conversation>> {
        let rows = sqlx::query(
            "SELECT payload FROM conversations ORDER BY activity_at DESC, rowid ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_conversation).collect()
    }

    pub async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT payload FROM conversations WHERE id = ?")
            .bind(conversation_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut conversation = decode_conversation(&row)?;
        conversation.messages = self.list_messages(conversation_id).await?;
        Ok(Some(conversation))
    }

    pub async fn upsert_message(&self, message: &Message) -> Result<()> {
        self.upsert_messages(std::slice::from_ref(message)).await
    }

    pub async fn upsert_messages(&self, messages: &[Message]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for message in messages {
            insert_message(&mut tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT payload FROM messages
             WHERE conversation_id = ?
             ORDER BY sent_at ASC, sequence ASC, rowid ASC",
        )
        .bind(conversation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let payload: String = row.get("payload");
                serde_json::from_str::<Message>(&payload).context("failed to decode cached message")
            })
            .collect()
    }

    pub async fn upsert_pending_message(&self, pending: &PendingMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO pending_messages
                (temp_id, conversation_id, content, created_at, status, attempts, last_error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(temp_id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error",
        )
        .bind(&pending.temp_id)
        .bind(pending.conversation_id.as_str())
        .bind(&pending.content)
        .bind(pending.timestamp)
        .bind(message_status_label(pending.status))
        .bind(i64::from(pending.attempts))
        .bind(pending.last_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Pending entries grouped by conversation, oldest first within each group.
    pub async fn list_pending_messages(&self) -> Result<Vec<PendingMessage>> {
        let rows = sqlx::query(
            "SELECT temp_id, conversation_id, content, created_at, status, attempts, last_error
             FROM pending_messages
             ORDER BY conversation_id ASC, created_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let status = parse_message_status(row.get::<String, _>("status").as_str())?;
                Ok(PendingMessage {
                    temp_id: row.get("temp_id"),
                    conversation_id: ConversationId(row.get("conversation_id")),
                    content: row.get("content"),
                    timestamp: row.get::<DateTime<Utc>, _>("created_at"),
                    status,
                    attempts: u32::try_from(row.get::<i64, _>("attempts")).unwrap_or(u32::MAX),
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    /// Returns whether an entry was actually removed.
    pub async fn remove_pending_message(&self, temp_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pending_messages WHERE temp_id = ?")
            .bind(temp_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["messages", "conversations", "pending_messages"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to clear {table}"))?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn insert_message(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    message: &Message,
) -> Result<()> {
    let payload = serde_json::to_string(message)
        .with_context(|| format!("failed to encode message {}", message.id))?;
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, payload, sent_at, sequence)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            payload = excluded.payload,
            sent_at = excluded.sent_at,
            sequence = excluded.sequence",
    )
    .bind(message.id.as_str())
    .bind(message.conversation_id.as_str())
    .bind(payload)
    .bind(message.timestamp)
    .bind(i64::try_from(message.sequence).unwrap_or(i64::MAX))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn decode_conversation(row: &SqliteRow) -> Result<Conversation> {
    let payload: String = row.get("payload");
    serde_json::from_str(&payload).context("failed to decode cached conversation")
}

fn status_label(status: ConversationStatus) -> &'static str {
    match status {
        ConversationStatus::Awaiting => "awaiting",
        ConversationStatus::InProgress => "in_progress",
        ConversationStatus::Finished => "finished",
        ConversationStatus::Archived => "archived",
    }
}

fn message_status_label(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => "sending",
        MessageStatus::Sent => "sent",
        MessageStatus::Pending => "pending",
        MessageStatus::Failed => "failed",
    }
}

fn parse_message_status(raw: &str) -> Result<MessageStatus> {
    match raw {
        "sending" => Ok(MessageStatus::Sending),
        "sent" => Ok(MessageStatus::Sent),
        "pending" => Ok(MessageStatus::Pending),
        "failed" => Ok(MessageStatus::Failed),
        other => Err(anyhow!("unknown pending message status '{other}'")),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
