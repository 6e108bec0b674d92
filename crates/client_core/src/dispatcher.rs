use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Conversation, ConversationId, UserId},
    protocol::{MessagePayload, ServerEvent},
};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::DisconnectReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connect,
    Disconnect,
    Reconnect,
    ReconnectAttempt,
    ReconnectFailed,
    HeartbeatAck,
    NewConversation,
    NewMessage,
    Typing,
    ConversationUpdated,
    MessageRead,
    Error,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::Connect => "connect",
            EventName::Disconnect => "disconnect",
            EventName::Reconnect => "reconnect",
            EventName::ReconnectAttempt => "reconnect_attempt",
            EventName::ReconnectFailed => "reconnect_failed",
            EventName::HeartbeatAck => "heartbeat_ack",
            EventName::NewConversation => "new_conversation",
            EventName::NewMessage => "new_message",
            EventName::Typing => "typing",
            EventName::ConversationUpdated => "conversation_updated",
            EventName::MessageRead => "message_read",
            EventName::Error => "error",
        }
    }

    /// Critical events bypass throttling and are always delivered.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            EventName::Connect
                | EventName::Disconnect
                | EventName::NewMessage
                | EventName::NewConversation
        )
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connected,
    Disconnected {
        reason: DisconnectReason,
    },
    Reconnected {
        attempts: u32,
    },
    ReconnectAttempt {
        attempt: u32,
        delay: Duration,
    },
    ReconnectFailed {
        reason: DisconnectReason,
    },
    HeartbeatAck {
        server_time: Option<DateTime<Utc>>,
    },
    NewConversation {
        conversation: Conversation,
    },
    NewMessage {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    MessageRead {
        conversation_id: ConversationId,
        reader_id: Option<UserId>,
    },
    Error {
        message: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> EventName {
        match self {
            SyncEvent::Connected => EventName::Connect,
            SyncEvent::Disconnected { .. } => EventName::Disconnect,
            SyncEvent::Reconnected { .. } => EventName::Reconnect,
            SyncEvent::ReconnectAttempt { .. } => EventName::ReconnectAttempt,
            SyncEvent::ReconnectFailed { .. } => EventName::ReconnectFailed,
            SyncEvent::HeartbeatAck { .. } => EventName::HeartbeatAck,
            SyncEvent::NewConversation { .. } => EventName::NewConversation,
            SyncEvent::NewMessage { .. } => EventName::NewMessage,
            SyncEvent::Typing { .. } => EventName::Typing,
            SyncEvent::ConversationUpdated { .. } => EventName::ConversationUpdated,
            SyncEvent::MessageRead { .. } => EventName::MessageRead,
            SyncEvent::Error { .. } => EventName::Error,
        }
    }
}

impl From<ServerEvent> for SyncEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::HeartbeatAck { server_time } => SyncEvent::HeartbeatAck { server_time },
            ServerEvent::NewConversation { conversation } => {
                SyncEvent::NewConversation { conversation }
            }
            ServerEvent::NewMessage {
                conversation_id,
                message,
            } => SyncEvent::NewMessage {
                conversation_id,
                message,
            },
            ServerEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } => SyncEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            },
            ServerEvent::ConversationUpdated { conversation } => {
                SyncEvent::ConversationUpdated { conversation }
            }
            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
            } => SyncEvent::MessageRead {
                conversation_id,
                reader_id,
            },
            ServerEvent::Error(error) => SyncEvent::Error {
                message: error.message,
            },
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { handlers: usize, failed: usize },
    Throttled,
}

struct DispatcherState {
    next_id: u64,
    handlers: HashMap<EventName, Vec<(u64, EventHandler)>>,
    last_notified: HashMap<EventName, Instant>,
}

/// Per-event-name listener registry. Non-critical events are dropped, not
/// queued, when they arrive faster than `throttle_interval`.
pub struct EventDispatcher {
    throttle_interval: Duration,
    state: Mutex<DispatcherState>,
}

#[must_use = "dropping a Subscription keeps the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    dispatcher: Weak<EventDispatcher>,
    name: EventName,
    id: u64,
}

impl Subscription {
    pub fn event(&self) -> EventName {
        self.name
    }

    pub fn unsubscribe(self) -> bool {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.remove(self.name, self.id),
            None => false,
        }
    }
}

impl EventDispatcher {
    pub fn new(throttle_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            throttle_interval,
            state: Mutex::new(DispatcherState {
                next_id: 0,
                handlers: HashMap::new(),
                last_notified: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DispatcherState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(self: &Arc<Self>, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        state
            .handlers
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            dispatcher: Arc::downgrade(self),
            name,
            id,
        }
    }

    fn remove(&self, name: EventName, id: u64) -> bool {
        let mut state = self.lock();
        let Some(handlers) = state.handlers.get_mut(&name) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            state.handlers.remove(&name);
        }
        removed
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.lock().handlers.get(&name).map_or(0, Vec::len)
    }

    pub fn dispatch(&self, event: &SyncEvent) -> DispatchOutcome {
        let name = event.name();
        let handlers = {
            let mut state = self.lock();
            if !name.is_critical() {
                let now = Instant::now();
                if let Some(last) = state.last_notified.get(&name) {
                    if now.saturating_duration_since(*last) < self.throttle_interval {
                        debug!(event = %name, "dispatch: throttled");
                        return DispatchOutcome::Throttled;
                    }
                }
                state.last_notified.insert(name, now);
            }
            state
                .handlers
                .get(&name)
                .map(|handlers| {
                    handlers
                        .iter()
                        .map(|(_, handler)| Arc::clone(handler))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        let mut failed = 0;
        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failed += 1;
                    warn!(event = %name, "dispatch: handler failed: {err:#}");
                }
                Err(_) => {
                    failed += 1;
                    error!(event = %name, "dispatch: handler panicked");
                }
            }
        }

        DispatchOutcome::Delivered {
            handlers: handlers.len(),
            failed,
        }
    }

    /// Forgets throttle timestamps so the next event of every name is delivered.
    pub fn reset_throttle(&self) {
        self.lock().last_notified.clear();
    }

    /// Drops every listener and throttle timestamp.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.handlers.clear();
        state.last_notified.clear();
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
