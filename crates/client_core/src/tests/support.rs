use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{
        Conversation, ConversationId, ConversationStatus, CustomerSummary, Message, MessageId,
        MessageStatus, PendingMessage, Role, SectorId, Sender, UserId,
    },
    protocol::{AuthPayload, ClientRequest, ConversationFilters, MessagePayload, TransferTarget},
};
use tokio::{
    sync::{mpsc, Notify},
    time::Instant,
};

use crate::{
    api::ConversationApi,
    connection::SessionIdentity,
    notify::{Notifier, ToastLevel},
    offline_cache::OfflineCache,
    transport::{TransportConnector, TransportEvent, TransportLink, TransportSession},
};

pub(crate) fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap() + chrono::Duration::minutes(minute)
}

pub(crate) fn conversation(id: &str, created_minute: i64) -> Conversation {
    Conversation {
        id: ConversationId::from(id),
        customer: CustomerSummary {
            name: format!("customer {id}"),
            phone: None,
            email: None,
        },
        status: ConversationStatus::InProgress,
        sector_id: None,
        assigned_agent: None,
        last_message: None,
        last_activity: None,
        created_at: at(created_minute),
        unread_count: 0,
        last_message_read: true,
        messages: Vec::new(),
    }
}

pub(crate) fn payload(
    conversation_id: &str,
    id: Option<&str>,
    content: &str,
    minute: i64,
) -> MessagePayload {
    MessagePayload {
        id: id.map(MessageId::from),
        conversation_id: ConversationId::from(conversation_id),
        content: content.to_string(),
        sender: Sender::Customer,
        timestamp: at(minute),
        read: false,
    }
}

pub(crate) fn message(conversation_id: &str, id: &str, minute: i64, sequence: u64) -> Message {
    Message {
        id: MessageId::from(id),
        temp_id: None,
        conversation_id: ConversationId::from(conversation_id),
        content: format!("text {id}"),
        sender: Sender::Customer,
        timestamp: at(minute),
        status: MessageStatus::Sent,
        sequence,
        read: false,
    }
}

pub(crate) fn pending(temp_id: &str, conversation_id: &str, minute: i64) -> PendingMessage {
    PendingMessage {
        temp_id: temp_id.to_string(),
        conversation_id: ConversationId::from(conversation_id),
        content: format!("queued {temp_id}"),
        timestamp: at(minute),
        status: MessageStatus::Pending,
        attempts: 0,
        last_error: None,
    }
}

pub(crate) fn identity(user: &str) -> SessionIdentity {
    SessionIdentity {
        token: format!("token-{user}"),
        user_id: UserId::from(user),
        role: Role::Agent,
        sector_id: Some(SectorId::from("support")),
    }
}

/// Lets spawned tasks make progress without moving the clock.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectPlan {
    Accept,
    Fail,
    /// Accepts, then closes before any heartbeat is acknowledged.
    AcceptThenClose,
}

#[derive(Default)]
pub(crate) struct FakeSession {
    emitted: Mutex<Vec<ClientRequest>>,
    fail_emits: AtomicBool,
    closed: AtomicBool,
}

impl FakeSession {
    pub(crate) fn emitted(&self) -> Vec<ClientRequest> {
        self.emitted.lock().unwrap().clone()
    }

    pub(crate) fn emitted_names(&self) -> Vec<&'static str> {
        self.emitted()
            .iter()
            .map(ClientRequest::event_name)
            .collect()
    }

    pub(crate) fn joined_rooms(&self) -> Vec<String> {
        self.emitted()
            .into_iter()
            .filter_map(|request| match request {
                ClientRequest::Join { room } => Some(room),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn left_rooms(&self) -> Vec<String> {
        self.emitted()
            .into_iter()
            .filter_map(|request| match request {
                ClientRequest::Leave { room } => Some(room),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn set_fail_emits(&self, fail: bool) {
        self.fail_emits.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn emit(&self, request: ClientRequest) -> Result<()> {
        if self.fail_emits.load(Ordering::SeqCst) {
            return Err(anyhow!("socket write failed"));
        }
        self.emitted.lock().unwrap().push(request);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct FakeConnector {
    plan: Mutex<VecDeque<ConnectPlan>>,
    fallback: ConnectPlan,
    attempts: Mutex<Vec<Instant>>,
    auths: Mutex<Vec<AuthPayload>>,
    sessions: Mutex<Vec<(Arc<FakeSession>, mpsc::Sender<TransportEvent>)>>,
}

impl FakeConnector {
    pub(crate) fn scripted(plan: Vec<ConnectPlan>, fallback: ConnectPlan) -> Arc<Self> {
        Arc::new(Self {
            plan: Mutex::new(plan.into()),
            fallback,
            attempts: Mutex::new(Vec::new()),
            auths: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn accepting() -> Arc<Self> {
        Self::scripted(Vec::new(), ConnectPlan::Accept)
    }

    pub(crate) fn failing() -> Arc<Self> {
        Self::scripted(Vec::new(), ConnectPlan::Fail)
    }

    pub(crate) fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    pub(crate) fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub(crate) fn auths(&self) -> Vec<AuthPayload> {
        self.auths.lock().unwrap().clone()
    }

    pub(crate) fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub(crate) fn session(&self, index: usize) -> Arc<FakeSession> {
        Arc::clone(&self.sessions.lock().unwrap()[index].0)
    }

    pub(crate) fn events(&self, index: usize) -> mpsc::Sender<TransportEvent> {
        self.sessions.lock().unwrap()[index].1.clone()
    }
}

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(&self, endpoint: &str, auth: &AuthPayload) -> Result<TransportLink> {
        self.attempts.lock().unwrap().push(Instant::now());
        self.auths.lock().unwrap().push(auth.clone());
        let plan = self
            .plan
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        if plan == ConnectPlan::Fail {
            return Err(anyhow!("connection refused: {endpoint}"));
        }
        let session = Arc::new(FakeSession::default());
        let (tx, rx) = mpsc::channel(64);
        if plan == ConnectPlan::AcceptThenClose {
            tx.try_send(TransportEvent::Closed("authentication rejected".to_string()))
                .expect("queue close");
        }
        self.sessions
            .lock()
            .unwrap()
            .push((Arc::clone(&session), tx));
        Ok(TransportLink {
            session,
            events: rx,
        })
    }
}

#[derive(Default)]
pub(crate) struct FakeApi {
    conversations: Mutex<Vec<Conversation>>,
    fail_reads: AtomicBool,
    fail_sends: AtomicBool,
    fail_operations: AtomicBool,
    list_delay: Mutex<Option<Duration>>,
    fetch_delays: Mutex<HashMap<ConversationId, Duration>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
    sent: Mutex<Vec<(ConversationId, String)>>,
    read_receipts: Mutex<Vec<ConversationId>>,
    list_calls: AtomicUsize,
    next_id: AtomicU64,
}

impl FakeApi {
    pub(crate) fn with_conversations(conversations: Vec<Conversation>) -> Arc<Self> {
        let api = Self::default();
        *api.conversations.lock().unwrap() = conversations;
        Arc::new(api)
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub(crate) fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_operations(&self, fail: bool) {
        self.fail_operations.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_fetch_delay(&self, conversation_id: &str, delay: Duration) {
        self.fetch_delays
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation_id), delay);
    }

    /// Holds every send until the returned gate is notified once per send.
    pub(crate) fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn sent(&self) -> Vec<(ConversationId, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_contents(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|(_, content)| content)
            .collect()
    }

    pub(crate) fn read_receipts(&self) -> Vec<ConversationId> {
        self.read_receipts.lock().unwrap().clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn find(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.conversations
            .lock()
            .unwrap()
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
            .cloned()
            .ok_or_else(|| anyhow!("NotFound: conversation {conversation_id}"))
    }

    fn operation(
        &self,
        conversation_id: &ConversationId,
        apply: impl FnOnce(&mut Conversation),
    ) -> Result<Conversation> {
        if self.fail_operations.load(Ordering::SeqCst) {
            return Err(anyhow!("Internal: operation rejected"));
        }
        let mut conversation = self.find(conversation_id)?;
        conversation.messages.clear();
        apply(&mut conversation);
        Ok(conversation)
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn list_conversations(&self, _filters: &ConversationFilters) -> Result<Vec<Conversation>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn get_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        let delay = self.fetch_delays.lock().unwrap().get(conversation_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        self.find(conversation_id)
    }

    async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> Result<Message> {
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow!("network unreachable"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((conversation_id.clone(), content.to_string()));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Message {
            id: MessageId::new(format!("srv-{id}")),
            temp_id: None,
            conversation_id: conversation_id.clone(),
            content: content.to_string(),
            sender: Sender::Agent,
            timestamp: at(100 + i64::try_from(id).unwrap_or_default()),
            status: MessageStatus::Sent,
            sequence: 0,
            read: true,
        })
    }

    async fn transfer_conversation(
        &self,
        conversation_id: &ConversationId,
        target: &TransferTarget,
    ) -> Result<Conversation> {
        let target = target.clone();
        self.operation(conversation_id, move |conversation| {
            conversation.assigned_agent = target.agent_id;
            if target.sector_id.is_some() {
                conversation.sector_id = target.sector_id;
            }
        })
    }

    async fn finish_conversation(&self, conversation_id: &ConversationId) -> Result<Conversation> {
        self.operation(conversation_id, |conversation| {
            conversation.status = ConversationStatus::Finished;
        })
    }

    async fn archive_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation> {
        self.operation(conversation_id, |conversation| {
            conversation.status = ConversationStatus::Archived;
        })
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<()> {
        self.read_receipts
            .lock()
            .unwrap()
            .push(conversation_id.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryCache {
    conversations: Mutex<BTreeMap<ConversationId, Conversation>>,
    pending: Mutex<Vec<PendingMessage>>,
    fail_writes: AtomicBool,
}

impl MemoryCache {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn pending(&self) -> Vec<PendingMessage> {
        self.pending.lock().unwrap().clone()
    }

    pub(crate) fn cached(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .lock()
            .unwrap()
            .get(&ConversationId::from(conversation_id))
            .cloned()
    }

    fn check_writes(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        Ok(())
    }
}

#[async_trait]
impl OfflineCache for MemoryCache {
    async fn store_conversations(&self, conversations: &[Conversation]) -> Result<()> {
        self.check_writes()?;
        let mut cached = self.conversations.lock().unwrap();
        for conversation in conversations {
            cached.insert(conversation.id.clone(), conversation.clone());
        }
        Ok(())
    }

    async fn cached_conversations(&self, limit: u32) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<Conversation> =
            self.conversations.lock().unwrap().values().cloned().collect();
        conversations.sort_by(|a, b| b.activity_at().cmp(&a.activity_at()));
        conversations.truncate(limit as usize);
        Ok(conversations)
    }

    async fn store_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.store_conversations(std::slice::from_ref(conversation))
            .await
    }

    async fn cached_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Conversation>> {
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned())
    }

    async fn store_messages(&self, messages: &[Message]) -> Result<()> {
        self.check_writes()?;
        let mut cached = self.conversations.lock().unwrap();
        for message in messages {
            if let Some(conversation) = cached.get_mut(&message.conversation_id) {
                conversation
                    .messages
                    .retain(|existing| existing.id != message.id);
                conversation.messages.push(message.clone());
            }
        }
        Ok(())
    }

    async fn save_pending(&self, pending: &PendingMessage) -> Result<()> {
        self.check_writes()?;
        let mut queue = self.pending.lock().unwrap();
        match queue
            .iter_mut()
            .find(|queued| queued.temp_id == pending.temp_id)
        {
            Some(queued) => {
                queued.status = pending.status;
                queued.attempts = pending.attempts;
                queued.last_error = pending.last_error.clone();
            }
            None => queue.push(pending.clone()),
        }
        Ok(())
    }

    async fn pending_messages(&self) -> Result<Vec<PendingMessage>> {
        let mut queue = self.pending();
        queue.sort_by(|a, b| {
            a.conversation_id
                .cmp(&b.conversation_id)
                .then(a.timestamp.cmp(&b.timestamp))
        });
        Ok(queue)
    }

    async fn remove_pending(&self, temp_id: &str) -> Result<bool> {
        let mut queue = self.pending.lock().unwrap();
        let before = queue.len();
        queue.retain(|queued| queued.temp_id != temp_id);
        Ok(queue.len() != before)
    }

    async fn clear(&self) -> Result<()> {
        self.conversations.lock().unwrap().clear();
        self.pending.lock().unwrap().clear();
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    entries: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub(crate) fn contains(&self, prefix: &str) -> bool {
        self.entries()
            .iter()
            .any(|entry| entry.starts_with(prefix))
    }

    fn record(&self, entry: String) {
        self.entries.lock().unwrap().push(entry);
    }
}

impl Notifier for RecordingNotifier {
    fn toast(&self, level: ToastLevel, text: &str) {
        self.record(format!("toast:{level:?}:{text}"));
    }

    fn new_message(&self, _conversation: Option<&Conversation>, message: &Message) {
        self.record(format!("new_message:{}", message.conversation_id));
    }

    fn new_conversation(&self, conversation: &Conversation) {
        self.record(format!("new_conversation:{}", conversation.id));
    }

    fn error(&self, text: &str) {
        self.record(format!("error:{text}"));
    }
}
