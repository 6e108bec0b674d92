use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use shared::{
    domain::{ConversationId, Message, MessageId, MessageStatus, Sender},
    protocol::MessagePayload,
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    config::PipelineSettings,
    dedup::{message_key, DedupLedger},
    store::{ConversationStore, ListAction, SelectedAction},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    /// Commit immediately instead of waiting for the batch window.
    pub high_priority: bool,
}

impl IngestOptions {
    pub fn high_priority() -> Self {
        Self {
            high_priority: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestDisposition {
    /// Duplicate or malformed; nothing was recorded.
    Rejected,
    Committed(CommitReport),
    /// Waiting in the batch buffer. `schedule_flush` is set for exactly one
    /// caller per window; that caller owns the flush timer.
    Buffered { schedule_flush: bool },
}

impl IngestDisposition {
    pub fn accepted(&self) -> bool {
        !matches!(self, IngestDisposition::Rejected)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommittedGroup {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub marked_read: bool,
    pub known: bool,
}

impl CommittedGroup {
    pub fn has_customer_messages(&self) -> bool {
        self.messages
            .iter()
            .any(|message| message.sender == Sender::Customer)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub groups: Vec<CommittedGroup>,
}

impl CommitReport {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Conversations that received messages but are missing from the list.
    pub fn unknown_conversations(&self) -> impl Iterator<Item = &ConversationId> {
        self.groups
            .iter()
            .filter(|group| !group.known)
            .map(|group| &group.conversation_id)
    }

    /// Conversations whose new messages were marked read on arrival.
    pub fn read_receipts(&self) -> impl Iterator<Item = &ConversationId> {
        self.groups
            .iter()
            .filter(|group| group.known && group.marked_read && group.has_customer_messages())
            .map(|group| &group.conversation_id)
    }
}

struct PipelineState {
    ledger: DedupLedger,
    buffer: Vec<Message>,
}

pub struct MessagePipeline {
    store: Arc<ConversationStore>,
    settings: PipelineSettings,
    focused: AtomicBool,
    sequence: AtomicU64,
    flush_scheduled: AtomicBool,
    state: Mutex<PipelineState>,
}

impl MessagePipeline {
    pub fn new(store: Arc<ConversationStore>, settings: PipelineSettings) -> Self {
        let ledger = DedupLedger::new(settings.dedup_ttl, settings.dedup_max_entries);
        Self {
            store,
            settings,
            focused: AtomicBool::new(true),
            sequence: AtomicU64::new(0),
            flush_scheduled: AtomicBool::new(false),
            state: Mutex::new(PipelineState {
                ledger,
                buffer: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PipelineState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, Ordering::SeqCst);
    }

    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Strictly increasing per session, starting at 1.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Stamps fetched history in timestamp order.
    pub fn assign_sequences(&self, messages: &mut [Message]) {
        messages.sort_by_key(|message| message.timestamp);
        for message in messages.iter_mut() {
            message.sequence = self.next_sequence();
        }
    }

    pub fn ingest(
        &self,
        conversation_id: &ConversationId,
        raw: MessagePayload,
        options: IngestOptions,
    ) -> IngestDisposition {
        if conversation_id.is_blank() {
            warn!("ingest: message without conversation id rejected");
            return IngestDisposition::Rejected;
        }

        let key = message_key(conversation_id, &raw);
        let message = {
            let mut state = self.lock();
            if !state.ledger.check_and_record(key, Instant::now()) {
                debug!(conversation_id = %conversation_id, "ingest: duplicate dropped");
                return IngestDisposition::Rejected;
            }
            let sequence = self.next_sequence();
            let message = stamp(conversation_id, raw, sequence);
            if !options.high_priority {
                state.buffer.push(message);
                let schedule_flush = !self.flush_scheduled.swap(true, Ordering::SeqCst);
                return IngestDisposition::Buffered { schedule_flush };
            }
            message
        };

        IngestDisposition::Committed(self.commit(vec![message]))
    }

    /// Commits everything buffered since the last flush.
    pub fn flush(&self) -> CommitReport {
        let buffered = {
            let mut state = self.lock();
            self.flush_scheduled.store(false, Ordering::SeqCst);
            std::mem::take(&mut state.buffer)
        };
        if buffered.is_empty() {
            return CommitReport::default();
        }
        debug!(count = buffered.len(), "ingest: flushing batch");
        self.commit(buffered)
    }

    pub fn buffered_len(&self) -> usize {
        self.lock().buffer.len()
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.ledger.clear();
        state.buffer.clear();
        self.flush_scheduled.store(false, Ordering::SeqCst);
    }

    fn commit(&self, messages: Vec<Message>) -> CommitReport {
        let mut order: Vec<ConversationId> = Vec::new();
        let mut grouped: HashMap<ConversationId, Vec<Message>> = HashMap::new();
        for message in messages {
            let conversation_id = message.conversation_id.clone();
            if !grouped.contains_key(&conversation_id) {
                order.push(conversation_id.clone());
            }
            grouped.entry(conversation_id).or_default().push(message);
        }

        let focused = self.is_focused();
        let mut report = CommitReport::default();
        for conversation_id in order {
            let Some(mut messages) = grouped.remove(&conversation_id) else {
                continue;
            };
            messages.sort_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then(a.sequence.cmp(&b.sequence))
            });

            let known = self.store.contains(&conversation_id);
            let selected = self.store.is_selected(&conversation_id);
            // Read only once shown; a selection still loading holds them unread.
            let marked_read = self.store.is_open(&conversation_id) && focused;

            if known {
                self.store.dispatch_list(ListAction::MessagesCommitted {
                    conversation_id: conversation_id.clone(),
                    messages: messages.clone(),
                    mark_read: marked_read,
                });
            } else {
                debug!(conversation_id = %conversation_id, "ingest: unknown conversation");
            }
            if selected {
                self.store.dispatch_selected(SelectedAction::MessagesCommitted {
                    conversation_id: conversation_id.clone(),
                    messages: messages.clone(),
                    mark_read: marked_read,
                });
            }

            if marked_read {
                for message in &mut messages {
                    message.read = true;
                }
            }
            report.groups.push(CommittedGroup {
                conversation_id,
                messages,
                marked_read,
                known,
            });
        }
        report
    }
}

fn stamp(conversation_id: &ConversationId, raw: MessagePayload, sequence: u64) -> Message {
    let id = match raw.id {
        Some(id) if !id.is_blank() => id,
        _ => MessageId::new(format!("local-{sequence}")),
    };
    Message {
        id,
        temp_id: None,
        conversation_id: conversation_id.clone(),
        content: raw.content,
        sender: raw.sender,
        timestamp: raw.timestamp,
        status: MessageStatus::Sent,
        sequence,
        read: raw.read,
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
