//! Conversation list and selected-conversation reducers.
//!
//! Every mutation goes through `reduce_list` / `reduce_selected`, which are
//! pure functions of `(state, action)`. `ConversationStore` only holds the
//! current values and publishes them to watchers.

use std::collections::HashSet;

use shared::{
    domain::{Conversation, ConversationId, LastMessage, Message, MessageStatus, Sender, UserId},
    protocol::ConversationFilters,
};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationListState {
    pub conversations: Vec<Conversation>,
    pub filters: ConversationFilters,
    pub loading: bool,
    pub error: Option<String>,
    pub from_cache: bool,
}

impl ConversationListState {
    pub fn get(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.get(conversation_id).is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListAction {
    LoadStarted {
        filters: ConversationFilters,
    },
    Loaded {
        conversations: Vec<Conversation>,
        from_cache: bool,
    },
    LoadFailed {
        error: String,
    },
    Upserted {
        conversation: Conversation,
    },
    MessagesCommitted {
        conversation_id: ConversationId,
        messages: Vec<Message>,
        mark_read: bool,
    },
    PreviewUpdated {
        message: Message,
    },
    MessageReconciled {
        temp_id: String,
        message: Message,
    },
    MessageStatusChanged {
        conversation_id: ConversationId,
        message_id: String,
        status: MessageStatus,
    },
    MarkedRead {
        conversation_id: ConversationId,
    },
    Removed {
        conversation_id: ConversationId,
    },
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectedConversationState {
    pub conversation_id: Option<ConversationId>,
    pub conversation: Option<Conversation>,
    pub loading: bool,
    pub error: Option<String>,
    pub typing_users: Vec<UserId>,
    /// Messages committed while the conversation was still loading. They join
    /// the view when the fetched conversation is installed.
    pub arrived: Vec<Message>,
}

impl SelectedConversationState {
    pub fn is_selected(&self, conversation_id: &ConversationId) -> bool {
        self.conversation_id.as_ref() == Some(conversation_id)
    }

    /// Selected and showing its messages, as opposed to still loading.
    pub fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.conversation
            .as_ref()
            .is_some_and(|conversation| &conversation.id == conversation_id)
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation
            .as_ref()
            .map(|conversation| conversation.messages.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectedAction {
    SelectStarted {
        conversation_id: ConversationId,
    },
    /// `carried` holds local messages absent from the fetched history,
    /// already stamped after it.
    Loaded {
        conversation: Conversation,
        carried: Vec<Message>,
    },
    LoadFailed {
        conversation_id: ConversationId,
        error: String,
    },
    MessagesCommitted {
        conversation_id: ConversationId,
        messages: Vec<Message>,
        mark_read: bool,
    },
    MessageReconciled {
        temp_id: String,
        message: Message,
    },
    MessageStatusChanged {
        message_id: String,
        status: MessageStatus,
    },
    MarkedRead {
        conversation_id: ConversationId,
    },
    ConversationUpdated {
        conversation: Conversation,
    },
    TypingChanged {
        conversation_id: ConversationId,
        users: Vec<UserId>,
    },
    Cleared,
}

pub fn reduce_list(mut state: ConversationListState, action: ListAction) -> ConversationListState {
    match action {
        ListAction::LoadStarted { filters } => {
            state.filters = filters;
            state.loading = true;
            state.error = None;
        }
        ListAction::Loaded {
            conversations,
            from_cache,
        } => {
            state.conversations = dedupe_by_id(conversations)
                .into_iter()
                .map(normalize_messages)
                .collect();
            state.loading = false;
            state.from_cache = from_cache;
            if !from_cache {
                state.error = None;
            }
        }
        ListAction::LoadFailed { error } => {
            state.loading = false;
            state.error = Some(error);
        }
        ListAction::Upserted { conversation } => {
            match state
                .conversations
                .iter_mut()
                .find(|existing| existing.id == conversation.id)
            {
                Some(existing) => *existing = merge_header(existing, conversation),
                None => state.conversations.push(normalize_messages(conversation)),
            }
        }
        ListAction::MessagesCommitted {
            conversation_id,
            messages,
            mark_read,
        } => {
            if let Some(conversation) = find_mut(&mut state.conversations, &conversation_id) {
                apply_committed(conversation, messages, mark_read);
            }
        }
        ListAction::PreviewUpdated { message } => {
            if let Some(conversation) =
                find_mut(&mut state.conversations, &message.conversation_id)
            {
                apply_preview(conversation, message);
            }
        }
        ListAction::MessageReconciled { temp_id, message } => {
            if let Some(conversation) =
                find_mut(&mut state.conversations, &message.conversation_id)
            {
                apply_reconciled(conversation, &temp_id, message);
            }
        }
        ListAction::MessageStatusChanged {
            conversation_id,
            message_id,
            status,
        } => {
            if let Some(conversation) = find_mut(&mut state.conversations, &conversation_id) {
                set_status(&mut conversation.messages, &message_id, status);
            }
        }
        ListAction::MarkedRead { conversation_id } => {
            if let Some(conversation) = find_mut(&mut state.conversations, &conversation_id) {
                mark_read(conversation);
            }
        }
        ListAction::Removed { conversation_id } => {
            state
                .conversations
                .retain(|conversation| conversation.id != conversation_id);
        }
        ListAction::Reset => return ConversationListState::default(),
    }

    sort_conversations(&mut state.conversations);
    state
}

pub fn reduce_selected(
    mut state: SelectedConversationState,
    action: SelectedAction,
) -> SelectedConversationState {
    match action {
        SelectedAction::SelectStarted { conversation_id } => {
            let keep_current = state.is_selected(&conversation_id);
            state.conversation_id = Some(conversation_id);
            if !keep_current {
                state.conversation = None;
                state.typing_users.clear();
                state.arrived.clear();
            }
            state.loading = true;
            state.error = None;
        }
        SelectedAction::Loaded {
            conversation,
            carried,
        } => {
            if !state.is_selected(&conversation.id) {
                return state;
            }
            let mut conversation = normalize_messages(conversation);
            conversation.messages = merge_messages(conversation.messages, carried).0;
            state.conversation = Some(conversation);
            state.arrived.clear();
            state.loading = false;
            state.error = None;
        }
        SelectedAction::LoadFailed {
            conversation_id,
            error,
        } => {
            if state.is_selected(&conversation_id) {
                state.loading = false;
                state.error = Some(error);
            }
        }
        SelectedAction::MessagesCommitted {
            conversation_id,
            messages,
            mark_read,
        } => {
            if let Some(conversation) = selected_mut(&mut state, &conversation_id) {
                apply_committed(conversation, messages, mark_read);
            } else if state.is_selected(&conversation_id) {
                let arrived = std::mem::take(&mut state.arrived);
                state.arrived = merge_messages(arrived, messages).0;
            }
        }
        SelectedAction::MessageReconciled { temp_id, message } => {
            let conversation_id = message.conversation_id.clone();
            if let Some(conversation) = selected_mut(&mut state, &conversation_id) {
                apply_reconciled(conversation, &temp_id, message);
            } else if state.is_selected(&conversation_id) {
                reconcile_messages(&mut state.arrived, &temp_id, &message);
            }
        }
        SelectedAction::MessageStatusChanged { message_id, status } => {
            if let Some(conversation) = state.conversation.as_mut() {
                set_status(&mut conversation.messages, &message_id, status);
            }
            set_status(&mut state.arrived, &message_id, status);
        }
        SelectedAction::MarkedRead { conversation_id } => {
            if let Some(conversation) = selected_mut(&mut state, &conversation_id) {
                mark_read(conversation);
            }
            if state.is_selected(&conversation_id) {
                for message in &mut state.arrived {
                    message.read = true;
                }
            }
        }
        SelectedAction::ConversationUpdated { conversation } => {
            let conversation_id = conversation.id.clone();
            if let Some(current) = selected_mut(&mut state, &conversation_id) {
                *current = merge_header(current, conversation);
            }
        }
        SelectedAction::TypingChanged {
            conversation_id,
            users,
        } => {
            if state.is_selected(&conversation_id) {
                state.typing_users = users;
            }
        }
        SelectedAction::Cleared => return SelectedConversationState::default(),
    }
    state
}

fn find_mut<'a>(
    conversations: &'a mut [Conversation],
    conversation_id: &ConversationId,
) -> Option<&'a mut Conversation> {
    conversations
        .iter_mut()
        .find(|conversation| &conversation.id == conversation_id)
}

fn selected_mut<'a>(
    state: &'a mut SelectedConversationState,
    conversation_id: &ConversationId,
) -> Option<&'a mut Conversation> {
    state
        .conversation
        .as_mut()
        .filter(|conversation| &conversation.id == conversation_id)
}

/// Descending by `max(last_activity, created_at)`; ties keep their prior order.
pub fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
}

fn dedupe_by_id(conversations: Vec<Conversation>) -> Vec<Conversation> {
    let mut seen = HashSet::new();
    conversations
        .into_iter()
        .filter(|conversation| seen.insert(conversation.id.clone()))
        .collect()
}

fn normalize_messages(mut conversation: Conversation) -> Conversation {
    conversation.messages = merge_messages(Vec::new(), conversation.messages).0;
    conversation
}

/// Server-owned fields come from `incoming`; locally held messages survive
/// when the update carries none.
fn merge_header(existing: &Conversation, mut incoming: Conversation) -> Conversation {
    if incoming.messages.is_empty() {
        incoming.messages = existing.messages.clone();
    } else {
        incoming.messages = merge_messages(existing.messages.clone(), incoming.messages).0;
    }
    if incoming.last_activity.is_none() || incoming.last_activity < existing.last_activity {
        incoming.last_activity = existing.last_activity;
        if incoming.last_message.is_none() {
            incoming.last_message = existing.last_message.clone();
        }
    }
    incoming
}

/// Merges `incoming` into `existing` by id (or temp id), keeping the result
/// ordered by local sequence. Returns the merged list and how many entries
/// were new.
pub fn merge_messages(mut existing: Vec<Message>, incoming: Vec<Message>) -> (Vec<Message>, usize) {
    let mut added = 0;
    for message in incoming {
        let position = existing.iter().position(|current| {
            current.id == message.id
                || message
                    .temp_id
                    .as_deref()
                    .is_some_and(|temp_id| current.matches_id(temp_id))
        });
        match position {
            Some(index) => {
                let sequence = match existing[index].sequence {
                    0 => message.sequence,
                    kept => kept,
                };
                existing[index] = Message { sequence, ..message };
            }
            None => {
                existing.push(message);
                added += 1;
            }
        }
    }
    existing.sort_by_key(|message| message.sequence);
    (existing, added)
}

fn newest(messages: &[Message]) -> Option<&Message> {
    messages
        .iter()
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.sequence.cmp(&b.sequence)))
}

fn bump_preview(conversation: &mut Conversation, message: &Message) {
    let is_newer = conversation
        .last_message
        .as_ref()
        .map_or(true, |last| message.timestamp >= last.timestamp);
    if is_newer {
        conversation.last_message = Some(LastMessage {
            text: message.content.clone(),
            timestamp: message.timestamp,
        });
    }
    if conversation
        .last_activity
        .map_or(true, |last_activity| message.timestamp > last_activity)
    {
        conversation.last_activity = Some(message.timestamp);
    }
}

fn apply_committed(conversation: &mut Conversation, mut messages: Vec<Message>, read: bool) {
    if messages.is_empty() {
        return;
    }
    if read {
        for message in &mut messages {
            message.read = true;
        }
    }
    let fresh_customer_messages = messages
        .iter()
        .filter(|message| {
            message.sender == Sender::Customer
                && !conversation
                    .messages
                    .iter()
                    .any(|current| current.id == message.id)
        })
        .count();
    if let Some(latest) = newest(&messages).cloned() {
        bump_preview(conversation, &latest);
    }

    let existing = std::mem::take(&mut conversation.messages);
    conversation.messages = merge_messages(existing, messages).0;

    if read {
        mark_read(conversation);
    } else if fresh_customer_messages > 0 {
        let increment = u32::try_from(fresh_customer_messages).unwrap_or(u32::MAX);
        conversation.unread_count = conversation.unread_count.saturating_add(increment);
        conversation.last_message_read = false;
    }
}

fn apply_preview(conversation: &mut Conversation, message: Message) {
    bump_preview(conversation, &message);
    let existing = std::mem::take(&mut conversation.messages);
    conversation.messages = merge_messages(existing, vec![message]).0;
}

fn apply_reconciled(conversation: &mut Conversation, temp_id: &str, confirmed: Message) {
    reconcile_messages(&mut conversation.messages, temp_id, &confirmed);
    bump_preview(conversation, &confirmed);
}

/// Replaces the optimistic entry (or the server echo) with the confirmed
/// message, keeping the sequence it was first shown with. A confirmation
/// for a message not held at all keeps the sequence it was stamped with.
fn reconcile_messages(messages: &mut Vec<Message>, temp_id: &str, confirmed: &Message) {
    let temp_index = messages
        .iter()
        .position(|message| message.matches_id(temp_id));
    let echo_index = messages
        .iter()
        .position(|message| message.id == confirmed.id);

    match (temp_index, echo_index) {
        (Some(temp_index), Some(echo_index)) if temp_index != echo_index => {
            let sequence = messages[temp_index].sequence;
            messages[echo_index] = Message {
                temp_id: Some(temp_id.to_string()),
                status: MessageStatus::Sent,
                sequence,
                ..confirmed.clone()
            };
            messages.remove(temp_index);
        }
        (Some(index), _) | (None, Some(index)) => {
            let sequence = messages[index].sequence;
            messages[index] = Message {
                temp_id: Some(temp_id.to_string()),
                status: MessageStatus::Sent,
                sequence,
                ..confirmed.clone()
            };
        }
        (None, None) => {
            messages.push(Message {
                temp_id: Some(temp_id.to_string()),
                status: MessageStatus::Sent,
                ..confirmed.clone()
            });
        }
    }
    messages.sort_by_key(|message| message.sequence);
}

fn same_message(a: &Message, b: &Message) -> bool {
    a.id == b.id
        || a.temp_id.as_deref().is_some_and(|temp_id| b.matches_id(temp_id))
        || b.temp_id.as_deref().is_some_and(|temp_id| a.matches_id(temp_id))
}

/// Local messages of the selection that `fetched` does not contain: queued
/// entries restored from the send queue first (by timestamp), then what this
/// session showed (by sequence).
fn carried_messages(
    state: &SelectedConversationState,
    fetched: &Conversation,
    queued: Vec<Message>,
) -> Vec<Message> {
    if !state.is_selected(&fetched.id) {
        return Vec::new();
    }
    let missing = |message: &Message| {
        !fetched
            .messages
            .iter()
            .any(|held| same_message(held, message))
    };

    let mut local: Vec<Message> = state
        .conversation
        .iter()
        .filter(|conversation| conversation.id == fetched.id)
        .flat_map(|conversation| conversation.messages.iter())
        .chain(state.arrived.iter())
        .filter(|message| missing(*message))
        .cloned()
        .collect();
    local.sort_by_key(|message| message.sequence);

    let mut carried: Vec<Message> = queued
        .into_iter()
        .filter(|entry| entry.conversation_id == fetched.id && missing(entry))
        .filter(|entry| !local.iter().any(|shown| same_message(shown, entry)))
        .collect();
    carried.sort_by_key(|entry| entry.timestamp);
    carried.extend(local);
    carried
}

fn set_status(messages: &mut [Message], message_id: &str, status: MessageStatus) {
    if let Some(message) = messages
        .iter_mut()
        .find(|message| message.matches_id(message_id))
    {
        message.status = status;
    }
}

fn mark_read(conversation: &mut Conversation) {
    conversation.unread_count = 0;
    conversation.last_message_read = true;
    for message in &mut conversation.messages {
        message.read = true;
    }
}

/// Single owner of list and selection state. Writers dispatch actions; the UI
/// watches the published snapshots.
pub struct ConversationStore {
    list: watch::Sender<ConversationListState>,
    selected: watch::Sender<SelectedConversationState>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (list, _) = watch::channel(ConversationListState::default());
        let (selected, _) = watch::channel(SelectedConversationState::default());
        Self { list, selected }
    }

    pub fn dispatch_list(&self, action: ListAction) {
        self.list.send_modify(|state| {
            let current = std::mem::take(state);
            *state = reduce_list(current, action);
        });
    }

    pub fn dispatch_selected(&self, action: SelectedAction) {
        self.selected.send_modify(|state| {
            let current = std::mem::take(state);
            *state = reduce_selected(current, action);
        });
    }

    /// Installs a fetched conversation as the selection. Local messages it
    /// lacks (arrivals during the load, unconfirmed sends, `queued` entries
    /// from the send queue) are kept and stamped from `next_sequence`, after
    /// the fetched history.
    pub fn load_selected(
        &self,
        conversation: Conversation,
        queued: Vec<Message>,
        mut next_sequence: impl FnMut() -> u64,
    ) {
        self.selected.send_modify(|state| {
            let current = std::mem::take(state);
            let carried = carried_messages(&current, &conversation, queued)
                .into_iter()
                .map(|message| Message {
                    sequence: next_sequence(),
                    ..message
                })
                .collect();
            *state = reduce_selected(
                current,
                SelectedAction::Loaded {
                    conversation,
                    carried,
                },
            );
        });
    }

    pub fn list(&self) -> ConversationListState {
        self.list.borrow().clone()
    }

    pub fn selected(&self) -> SelectedConversationState {
        self.selected.borrow().clone()
    }

    pub fn selected_id(&self) -> Option<ConversationId> {
        self.selected.borrow().conversation_id.clone()
    }

    pub fn is_selected(&self, conversation_id: &ConversationId) -> bool {
        self.selected.borrow().is_selected(conversation_id)
    }

    pub fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.selected.borrow().is_open(conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.list.borrow().contains(conversation_id)
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<Conversation> {
        self.list.borrow().get(conversation_id).cloned()
    }

    pub fn watch_list(&self) -> watch::Receiver<ConversationListState> {
        self.list.subscribe()
    }

    pub fn watch_selected(&self) -> watch::Receiver<SelectedConversationState> {
        self.selected.subscribe()
    }

    pub fn reset(&self) {
        self.dispatch_list(ListAction::Reset);
        self.dispatch_selected(SelectedAction::Cleared);
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
