use std::sync::Arc;

use chrono::Utc;
use shared::domain::{new_temp_id, ConversationId, Message, MessageStatus, PendingMessage, TempId};
use tracing::{info, warn};

use crate::{
    api::ConversationApi,
    error::SyncError,
    guards::SessionGuards,
    ingest::MessagePipeline,
    notify::{Notifier, ToastLevel},
    offline_cache::OfflineCache,
    store::{ConversationStore, ListAction, SelectedAction},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Confirmed by the server; `message` carries the server id.
    Sent { temp_id: TempId, message: Message },
    /// Kept in the pending-send queue for the next replay or retry.
    Queued {
        temp_id: TempId,
        error: Option<String>,
    },
}

impl SendOutcome {
    pub fn temp_id(&self) -> &str {
        match self {
            SendOutcome::Sent { temp_id, .. } | SendOutcome::Queued { temp_id, .. } => temp_id,
        }
    }

    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// Outbound messages: `sending -> sent`, `sending -> failed -> pending`, or
/// `sending -> pending` when offline.
pub struct OptimisticWriter {
    store: Arc<ConversationStore>,
    pipeline: Arc<MessagePipeline>,
    api: Arc<dyn ConversationApi>,
    cache: Arc<dyn OfflineCache>,
    notifier: Arc<dyn Notifier>,
    guards: Arc<SessionGuards>,
}

impl OptimisticWriter {
    pub fn new(
        store: Arc<ConversationStore>,
        pipeline: Arc<MessagePipeline>,
        api: Arc<dyn ConversationApi>,
        cache: Arc<dyn OfflineCache>,
        notifier: Arc<dyn Notifier>,
        guards: Arc<SessionGuards>,
    ) -> Self {
        Self {
            store,
            pipeline,
            api,
            cache,
            notifier,
            guards,
        }
    }

    pub async fn send(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<SendOutcome, SyncError> {
        if conversation_id.is_blank() {
            warn!("outbound: send rejected without conversation id");
            return Err(SyncError::MissingConversationId);
        }
        let content = text.trim();
        if content.is_empty() {
            warn!(conversation_id = %conversation_id, "outbound: empty message rejected");
            return Err(SyncError::EmptyMessage);
        }

        let mut pending = PendingMessage {
            temp_id: new_temp_id(),
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            timestamp: Utc::now(),
            status: MessageStatus::Sending,
            attempts: 0,
            last_error: None,
        };
        self.show_optimistic(&pending);

        if !self.guards.is_online() {
            info!(conversation_id = %conversation_id, temp_id = %pending.temp_id, "outbound: offline; queued");
            pending.status = MessageStatus::Pending;
            self.persist_pending(&pending).await;
            self.set_status(conversation_id, &pending.temp_id, MessageStatus::Pending);
            self.notifier.toast(
                ToastLevel::Warning,
                "You are offline. The message will be sent when the connection returns.",
            );
            return Ok(SendOutcome::Queued {
                temp_id: pending.temp_id,
                error: None,
            });
        }

        match self.submit(&mut pending).await {
            Ok(message) => Ok(SendOutcome::Sent {
                temp_id: pending.temp_id,
                message,
            }),
            Err(error) => {
                self.notifier
                    .toast(ToastLevel::Error, "Message not sent. It will be retried.");
                Ok(SendOutcome::Queued {
                    temp_id: pending.temp_id,
                    error: Some(error),
                })
            }
        }
    }

    /// Sends a queued entry through the same path as a live send. The entry
    /// leaves the queue only on confirmed success.
    pub async fn resubmit(&self, mut pending: PendingMessage) -> Result<Message, String> {
        self.set_status(
            &pending.conversation_id,
            &pending.temp_id,
            MessageStatus::Sending,
        );
        pending.status = MessageStatus::Sending;
        let message = self.submit(&mut pending).await?;
        match self.cache.remove_pending(&pending.temp_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(temp_id = %pending.temp_id, "outbound: confirmed entry was not queued")
            }
            Err(error) => {
                warn!(temp_id = %pending.temp_id, "outbound: failed to dequeue: {error:#}")
            }
        }
        Ok(message)
    }

    async fn submit(&self, pending: &mut PendingMessage) -> Result<Message, String> {
        pending.attempts += 1;
        match self
            .api
            .send_message(&pending.conversation_id, &pending.content)
            .await
        {
            Ok(confirmed) => {
                info!(
                    conversation_id = %pending.conversation_id,
                    temp_id = %pending.temp_id,
                    message_id = %confirmed.id,
                    "outbound: confirmed"
                );
                Ok(self.reconcile(&pending.temp_id, confirmed).await)
            }
            Err(error) => {
                let reason = format!("{error:#}");
                warn!(
                    conversation_id = %pending.conversation_id,
                    temp_id = %pending.temp_id,
                    attempts = pending.attempts,
                    "outbound: send failed: {reason}"
                );
                self.set_status(
                    &pending.conversation_id,
                    &pending.temp_id,
                    MessageStatus::Failed,
                );
                pending.status = MessageStatus::Pending;
                pending.last_error = Some(reason.clone());
                self.persist_pending(pending).await;
                self.set_status(
                    &pending.conversation_id,
                    &pending.temp_id,
                    MessageStatus::Pending,
                );
                Err(reason)
            }
        }
    }

    fn show_optimistic(&self, pending: &PendingMessage) {
        let message = pending.to_message(self.pipeline.next_sequence());
        self.store.dispatch_selected(SelectedAction::MessagesCommitted {
            conversation_id: pending.conversation_id.clone(),
            messages: vec![message.clone()],
            mark_read: true,
        });
        self.store
            .dispatch_list(ListAction::PreviewUpdated { message });
    }

    async fn reconcile(&self, temp_id: &str, confirmed: Message) -> Message {
        let confirmed = Message {
            temp_id: Some(temp_id.to_string()),
            status: MessageStatus::Sent,
            read: true,
            sequence: self.pipeline.next_sequence(),
            ..confirmed
        };
        self.store.dispatch_list(ListAction::MessageReconciled {
            temp_id: temp_id.to_string(),
            message: confirmed.clone(),
        });
        self.store.dispatch_selected(SelectedAction::MessageReconciled {
            temp_id: temp_id.to_string(),
            message: confirmed.clone(),
        });

        let stored = self
            .store
            .selected()
            .conversation
            .and_then(|conversation| {
                conversation
                    .messages
                    .into_iter()
                    .find(|message| message.id == confirmed.id)
            })
            .unwrap_or(confirmed);
        if let Err(error) = self
            .cache
            .store_messages(std::slice::from_ref(&stored))
            .await
        {
            warn!(message_id = %stored.id, "cache: failed to persist sent message: {error:#}");
        }
        stored
    }

    async fn persist_pending(&self, pending: &PendingMessage) {
        if let Err(error) = self.cache.save_pending(pending).await {
            warn!(temp_id = %pending.temp_id, "cache: failed to queue pending message: {error:#}");
        }
    }

    fn set_status(&self, conversation_id: &ConversationId, temp_id: &str, status: MessageStatus) {
        self.store.dispatch_list(ListAction::MessageStatusChanged {
            conversation_id: conversation_id.clone(),
            message_id: temp_id.to_string(),
            status,
        });
        self.store
            .dispatch_selected(SelectedAction::MessageStatusChanged {
                message_id: temp_id.to_string(),
                status,
            });
    }
}

#[cfg(test)]
#[path = "tests/outbound_tests.rs"]
mod tests;
