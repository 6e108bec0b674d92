use std::{collections::HashMap, time::Duration};

use shared::{domain::ConversationId, protocol::MessagePayload};
use tokio::time::Instant;

const CONTENT_PREFIX_CHARS: usize = 20;

/// `(conversation, message id or timestamp, first 20 chars of content)`.
pub fn message_key(conversation_id: &ConversationId, message: &MessagePayload) -> String {
    let identity = match &message.id {
        Some(id) if !id.is_blank() => id.to_string(),
        _ => message.timestamp.timestamp_millis().to_string(),
    };
    let prefix: String = message.content.chars().take(CONTENT_PREFIX_CHARS).collect();
    format!("{conversation_id}:{identity}:{prefix}")
}

/// Bounded memory of recently seen message keys. Once the ledger grows past
/// `max_entries`, keys older than `ttl` are evicted.
pub struct DedupLedger {
    seen: HashMap<String, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl DedupLedger {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Records `key` and returns true when it has not been seen before.
    pub fn check_and_record(&mut self, key: String, now: Instant) -> bool {
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        if self.seen.len() > self.max_entries {
            self.evict_expired(now);
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let before = self.seen.len();
        let ttl = self.ttl;
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) <= ttl);
        before - self.seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
