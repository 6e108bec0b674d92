use std::{collections::HashMap, time::Duration};

use shared::domain::{ConversationId, UserId};
use tokio::time::Instant;

/// Who is typing where. An indicator expires `ttl` after its last refresh
/// unless the peer sends `is_typing = false` first.
pub struct TypingRegistry {
    ttl: Duration,
    active: HashMap<ConversationId, HashMap<UserId, Instant>>,
}

impl TypingRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            active: HashMap::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Applies one indicator and returns the conversation's current typists.
    pub fn update(
        &mut self,
        conversation_id: &ConversationId,
        user_id: UserId,
        is_typing: bool,
        now: Instant,
    ) -> Vec<UserId> {
        let users = self.active.entry(conversation_id.clone()).or_default();
        if is_typing {
            users.insert(user_id, now);
        } else {
            users.remove(&user_id);
        }
        self.users(conversation_id, now)
    }

    pub fn users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .active
            .get(conversation_id)
            .map(|users| {
                users
                    .iter()
                    .filter(|(_, seen)| now.saturating_duration_since(**seen) < self.ttl)
                    .map(|(user_id, _)| user_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Drops expired indicators and returns the conversations that changed.
    pub fn evict_expired(&mut self, now: Instant) -> Vec<ConversationId> {
        let ttl = self.ttl;
        let mut changed = Vec::new();
        for (conversation_id, users) in &mut self.active {
            let before = users.len();
            users.retain(|_, seen| now.saturating_duration_since(*seen) < ttl);
            if users.len() != before {
                changed.push(conversation_id.clone());
            }
        }
        self.active.retain(|_, users| !users.is_empty());
        changed.sort();
        changed
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
