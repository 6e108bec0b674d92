use anyhow::Result;
use async_trait::async_trait;
use shared::domain::{Conversation, ConversationId, Message, PendingMessage};
use storage::Storage;

use crate::config::normalize_database_url;

/// Local persistence for conversations, message history and the outbound
/// queue. Cache failures never block the realtime path; callers log them.
#[async_trait]
pub trait OfflineCache: Send + Sync {
    async fn store_conversations(&self, conversations: &[Conversation]) -> Result<()>;
    async fn cached_conversations(&self, limit: u32) -> Result<Vec<Conversation>>;
    async fn store_conversation(&self, conversation: &Conversation) -> Result<()>;
    async fn cached_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>>;
    async fn store_messages(&self, messages: &[Message]) -> Result<()>;
    async fn save_pending(&self, pending: &PendingMessage) -> Result<()>;
    /// Ordered by conversation, then by creation time.
    async fn pending_messages(&self) -> Result<Vec<PendingMessage>>;
    async fn remove_pending(&self, temp_id: &str) -> Result<bool>;
    async fn clear(&self) -> Result<()>;
}

/// Cache that keeps nothing; every lookup comes back empty.
#[derive(Default)]
pub struct NoopOfflineCache;

#[async_trait]
impl OfflineCache for NoopOfflineCache {
    async fn store_conversations(&self, _conversations: &[Conversation]) -> Result<()> {
        Ok(())
    }

    async fn cached_conversations(&self, _limit: u32) -> Result<Vec<Conversation>> {
        Ok(Vec::new())
    }

    async fn store_conversation(&self, _conversation: &Conversation) -> Result<()> {
        Ok(())
    }

    async fn cached_conversation(
        &self,
        _conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        Ok(None)
    }

    async fn store_messages(&self, _messages: &[Message]) -> Result<()> {
        Ok(())
    }

    async fn save_pending(&self, _pending: &PendingMessage) -> Result<()> {
        Ok(())
    }

    async fn pending_messages(&self) -> Result<Vec<PendingMessage>> {
        Ok(Vec::new())
    }

    async fn remove_pending(&self, _temp_id: &str) -> Result<bool> {
        Ok(false)
    }

    async fn clear(&self) -> Result<()> {
        Ok(())
    }
}

pub struct DurableOfflineCache {
    storage: Storage,
}

impl DurableOfflineCache {
    pub async fn open(raw_database_url: &str) -> Result<Self> {
        let database_url = normalize_database_url(raw_database_url);
        Ok(Self {
            storage: Storage::new(&database_url).await?,
        })
    }

    pub fn from_storage(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

#[async_trait]
impl OfflineCache for DurableOfflineCache {
    async fn store_conversations(&self, conversations: &[Conversation]) -> Result<()> {
        self.storage.upsert_conversations(conversations).await
    }

    async fn cached_conversations(&self, limit: u32) -> Result<Vec<Conversation>> {
        self.storage.list_conversations(limit).await
    }

    async fn store_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.storage.upsert_conversation(conversation).await
    }

    async fn cached_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        self.storage.load_conversation(conversation_id).await
    }

    async fn store_messages(&self, messages: &[Message]) -> Result<()> {
        self.storage.upsert_messages(messages).await
    }

    async fn save_pending(&self, pending: &PendingMessage) -> Result<()> {
        self.storage.upsert_pending_message(pending).await
    }

    async fn pending_messages(&self) -> Result<Vec<PendingMessage>> {
        self.storage.list_pending_messages().await
    }

    async fn remove_pending(&self, temp_id: &str) -> Result<bool> {
        self.storage.remove_pending_message(temp_id).await
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear().await
    }
}

#[cfg(test)]
#[path = "tests/offline_cache_tests.rs"]
mod tests;
