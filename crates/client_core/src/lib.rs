use std::{
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::{Context, Result};
use shared::{
    domain::{Conversation, ConversationId, Message, MessageStatus, Sender, UserId},
    protocol::{ClientRequest, ConversationFilters, MessagePayload, TransferTarget},
};
use tokio::{sync::watch, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod guards;
pub mod ingest;
pub mod notify;
pub mod offline_cache;
pub mod outbound;
pub mod replay;
pub mod store;
pub mod transport;
pub mod typing;

pub use config::{load_settings, load_settings_from, SyncSettings};
pub use connection::{ConnectOutcome, ConnectionState, ConnectionStatus, SessionIdentity};
pub use error::{DisconnectReason, SyncError};
pub use outbound::SendOutcome;
pub use replay::{ReplayOutcome, ReplayReport};

use crate::{
    api::{ConversationApi, HttpConversationApi},
    connection::{conversation_room, ConnectionManager},
    dispatcher::{EventDispatcher, EventName, Subscription, SyncEvent},
    guards::SessionGuards,
    ingest::{CommitReport, IngestDisposition, IngestOptions, MessagePipeline},
    notify::{Notifier, ToastLevel, TracingNotifier},
    offline_cache::{DurableOfflineCache, OfflineCache},
    outbound::OptimisticWriter,
    replay::OfflineReplay,
    store::{
        ConversationListState, ConversationStore, ListAction, SelectedAction,
        SelectedConversationState,
    },
    transport::{TransportConnector, WsTransportConnector},
    typing::TypingRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Loaded { count: usize },
    /// The API failed; the list now shows the cached copy.
    FromCache { count: usize },
    /// Another refresh was already running.
    Skipped,
}

/// One authenticated dashboard session: owns the realtime connection, the
/// conversation store and every path that writes into it.
pub struct SyncSession {
    settings: SyncSettings,
    api: Arc<dyn ConversationApi>,
    cache: Arc<dyn OfflineCache>,
    notifier: Arc<dyn Notifier>,
    store: Arc<ConversationStore>,
    pipeline: Arc<MessagePipeline>,
    dispatcher: Arc<EventDispatcher>,
    connection: ConnectionManager,
    writer: Arc<OptimisticWriter>,
    replay: OfflineReplay,
    guards: Arc<SessionGuards>,
    typing: Mutex<TypingRegistry>,
    handlers: Mutex<Vec<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncSession {
    pub fn new(
        settings: SyncSettings,
        api: Arc<dyn ConversationApi>,
        cache: Arc<dyn OfflineCache>,
        notifier: Arc<dyn Notifier>,
        connector: Arc<dyn TransportConnector>,
    ) -> Arc<Self> {
        let store = Arc::new(ConversationStore::new());
        let guards = Arc::new(SessionGuards::new());
        let pipeline = Arc::new(MessagePipeline::new(
            Arc::clone(&store),
            settings.pipeline(),
        ));
        let dispatcher = EventDispatcher::new(settings.throttle_interval());
        let connection =
            ConnectionManager::new(connector, Arc::clone(&dispatcher), settings.connection());
        let writer = Arc::new(OptimisticWriter::new(
            Arc::clone(&store),
            Arc::clone(&pipeline),
            Arc::clone(&api),
            Arc::clone(&cache),
            Arc::clone(&notifier),
            Arc::clone(&guards),
        ));
        let replay = OfflineReplay::new(
            Arc::clone(&writer),
            Arc::clone(&cache),
            Arc::clone(&guards),
        );
        let typing = Mutex::new(TypingRegistry::new(settings.typing_ttl()));

        Arc::new(Self {
            settings,
            api,
            cache,
            notifier,
            store,
            pipeline,
            dispatcher,
            connection,
            writer,
            replay,
            guards,
            typing,
            handlers: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Production wiring: REST over reqwest, SQLite cache, websocket
    /// transport and a tracing-backed notifier.
    pub async fn open(settings: SyncSettings, token: &str) -> Result<Arc<Self>> {
        let cache = DurableOfflineCache::open(&settings.cache_database_url)
            .await
            .with_context(|| {
                format!(
                    "failed to open offline cache at {}",
                    settings.cache_database_url
                )
            })?;
        let api = HttpConversationApi::new(settings.api_base_url.clone(), token);
        Ok(Self::new(
            settings,
            Arc::new(api),
            Arc::new(cache),
            Arc::new(TracingNotifier),
            Arc::new(WsTransportConnector::new()),
        ))
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Connects as `identity` and loads the conversation list. Calling it
    /// again with the same identity leaves the running session alone.
    pub async fn start(self: &Arc<Self>, identity: SessionIdentity) -> ConnectOutcome {
        self.install_handlers();
        let user_id = identity.user_id.clone();
        let outcome = self
            .connection
            .connect(&self.settings.realtime_url, identity)
            .await;
        info!(user_id = %user_id, ?outcome, "session: started");

        if outcome == ConnectOutcome::Started {
            let filters = self.store.list().filters;
            self.refresh_conversations(filters).await;
        }
        if self.guards.mark_initialized() {
            let session = Arc::clone(self);
            self.spawn_task(async move {
                session.replay.replay_pending().await;
            });
        }
        outcome
    }

    /// Tears everything down: connection, listeners, timers, store state and
    /// session guards.
    pub async fn shutdown(&self) {
        info!("session: shutting down");
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.connection.disconnect().await;
        self.lock_handlers().clear();
        self.lock_typing().clear();
        self.pipeline.reset();
        self.store.reset();
        self.guards.reset();
    }

    pub fn subscribe<F>(&self, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.subscribe(name, handler)
    }

    pub fn conversations(&self) -> ConversationListState {
        self.store.list()
    }

    pub fn selected(&self) -> SelectedConversationState {
        self.store.selected()
    }

    pub fn watch_conversations(&self) -> watch::Receiver<ConversationListState> {
        self.store.watch_list()
    }

    pub fn watch_selected(&self) -> watch::Receiver<SelectedConversationState> {
        self.store.watch_selected()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    pub fn is_online(&self) -> bool {
        self.guards.is_online()
    }

    /// Regaining focus on an open conversation with unread messages sends a
    /// read receipt.
    pub fn set_focus(self: &Arc<Self>, focused: bool) {
        self.pipeline.set_focused(focused);
        if !focused {
            return;
        }
        let Some(conversation_id) = self.store.selected_id() else {
            return;
        };
        // A selection still loading is marked read once its view is installed.
        let unread = self.store.is_open(&conversation_id)
            && self
                .store
                .conversation(&conversation_id)
                .is_some_and(|conversation| conversation.unread_count > 0);
        if unread {
            let session = Arc::clone(self);
            self.spawn_task(async move {
                session.mark_conversation_read(&conversation_id).await;
            });
        }
    }

    /// Returns the replay result when this call brought the session back
    /// online.
    pub async fn set_online(&self, online: bool) -> Option<ReplayOutcome> {
        let was_online = self.guards.set_online(online);
        if online == was_online {
            return None;
        }
        if !online {
            info!("session: offline; sends will be queued");
            return None;
        }
        info!("session: back online; replaying queued messages");
        Some(self.replay.replay_pending().await)
    }

    pub async fn replay_pending(&self) -> ReplayOutcome {
        self.replay.replay_pending().await
    }

    pub async fn refresh_conversations(&self, filters: ConversationFilters) -> RefreshOutcome {
        let Some(_in_flight) = self.guards.try_begin_refresh() else {
            debug!("session: refresh already running");
            return RefreshOutcome::Skipped;
        };
        self.store.dispatch_list(ListAction::LoadStarted {
            filters: filters.clone(),
        });

        match self.api.list_conversations(&filters).await {
            Ok(mut conversations) => {
                for conversation in &mut conversations {
                    self.pipeline.assign_sequences(&mut conversation.messages);
                }
                if let Err(error) = self.cache.store_conversations(&conversations).await {
                    warn!("cache: failed to store conversation list: {error:#}");
                }
                let count = conversations.len();
                self.store.dispatch_list(ListAction::Loaded {
                    conversations,
                    from_cache: false,
                });
                info!(count, "session: conversation list loaded");
                RefreshOutcome::Loaded { count }
            }
            Err(error) => {
                warn!("session: conversation list request failed: {error:#}");
                let cached = match self
                    .cache
                    .cached_conversations(self.settings.conversation_list_limit)
                    .await
                {
                    Ok(cached) => cached,
                    Err(cache_error) => {
                        warn!("cache: failed to read conversation list: {cache_error:#}");
                        Vec::new()
                    }
                };
                let count = cached.len();
                self.store.dispatch_list(ListAction::Loaded {
                    conversations: cached,
                    from_cache: true,
                });
                self.store.dispatch_list(ListAction::LoadFailed {
                    error: format!("{error:#}"),
                });
                self.notifier.toast(
                    ToastLevel::Warning,
                    "Could not reach the server. Showing cached conversations.",
                );
                RefreshOutcome::FromCache { count }
            }
        }
    }

    /// Opens `conversation_id`. A response that arrives after the user has
    /// moved on to another conversation is dropped.
    pub async fn select_conversation(&self, conversation_id: &ConversationId) -> Result<(), SyncError> {
        if conversation_id.is_blank() {
            warn!("session: select rejected without conversation id");
            return Err(SyncError::MissingConversationId);
        }

        let previous = self.store.selected_id();
        if previous.as_ref() != Some(conversation_id) {
            if let Some(previous) = previous {
                self.leave_conversation_room(&previous);
            }
            self.join_conversation_room(conversation_id);
        }
        self.store.dispatch_selected(SelectedAction::SelectStarted {
            conversation_id: conversation_id.clone(),
        });

        let loaded = self.load_conversation(conversation_id).await;
        let queued = if loaded.is_ok() {
            self.queued_messages(conversation_id).await
        } else {
            Vec::new()
        };
        if !self.store.is_selected(conversation_id) {
            debug!(conversation_id = %conversation_id, "session: stale conversation response dropped");
            return Ok(());
        }
        let mut conversation = match loaded {
            Ok(conversation) => conversation,
            Err(error) => {
                self.store.dispatch_selected(SelectedAction::LoadFailed {
                    conversation_id: conversation_id.clone(),
                    error,
                });
                self.notifier
                    .toast(ToastLevel::Error, "Could not load the conversation.");
                return Ok(());
            }
        };

        self.pipeline.assign_sequences(&mut conversation.messages);
        let fetched_unread = conversation.unread_count;
        let pipeline = Arc::clone(&self.pipeline);
        self.store
            .load_selected(conversation, queued, || pipeline.next_sequence());
        // Arrivals during the load were counted unread in the list.
        let listed_unread = self
            .store
            .conversation(conversation_id)
            .map_or(0, |listed| listed.unread_count);
        let unread = fetched_unread.max(listed_unread);

        if unread > 0 && self.pipeline.is_focused() {
            self.mark_conversation_read(conversation_id).await;
        }
        Ok(())
    }

    pub fn clear_selection(&self) {
        if let Some(previous) = self.store.selected_id() {
            self.leave_conversation_room(&previous);
        }
        self.store.dispatch_selected(SelectedAction::Cleared);
    }

    pub async fn transfer_conversation(
        &self,
        conversation_id: &ConversationId,
        target: &TransferTarget,
    ) -> bool {
        let result = self.api.transfer_conversation(conversation_id, target).await;
        self.apply_operation(
            conversation_id,
            "transfer",
            result,
            "Conversation transferred.",
            "Could not transfer the conversation.",
        )
    }

    pub async fn finish_conversation(&self, conversation_id: &ConversationId) -> bool {
        let result = self.api.finish_conversation(conversation_id).await;
        self.apply_operation(
            conversation_id,
            "finish",
            result,
            "Conversation finished.",
            "Could not finish the conversation.",
        )
    }

    pub async fn archive_conversation(&self, conversation_id: &ConversationId) -> bool {
        let result = self.api.archive_conversation(conversation_id).await;
        self.apply_operation(
            conversation_id,
            "archive",
            result,
            "Conversation archived.",
            "Could not archive the conversation.",
        )
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<SendOutcome, SyncError> {
        self.writer.send(conversation_id, text).await
    }

    /// Resubmits one queued message on request.
    pub async fn retry_message(&self, temp_id: &str) -> Result<SendOutcome, SyncError> {
        let queued = self
            .cache
            .pending_messages()
            .await
            .map_err(SyncError::Api)?;
        let Some(pending) = queued.into_iter().find(|pending| pending.temp_id == temp_id) else {
            warn!(temp_id, "session: retry for unknown pending message");
            return Err(SyncError::UnknownPendingMessage(temp_id.to_string()));
        };
        if !self.guards.is_online() {
            return Ok(SendOutcome::Queued {
                temp_id: pending.temp_id,
                error: None,
            });
        }

        let temp_id = pending.temp_id.clone();
        match self.writer.resubmit(pending).await {
            Ok(message) => Ok(SendOutcome::Sent { temp_id, message }),
            Err(error) => {
                self.notifier
                    .toast(ToastLevel::Error, "Message not sent. It will be retried.");
                Ok(SendOutcome::Queued {
                    temp_id,
                    error: Some(error),
                })
            }
        }
    }

    pub fn send_typing(
        &self,
        conversation_id: &ConversationId,
        is_typing: bool,
    ) -> Result<(), SyncError> {
        if self.connection.identity().is_none() {
            return Err(SyncError::SessionNotStarted);
        }
        self.connection.emit(ClientRequest::Typing {
            conversation_id: conversation_id.clone(),
            is_typing,
        })
    }

    fn install_handlers(self: &Arc<Self>) {
        let mut handlers = self.lock_handlers();
        if !handlers.is_empty() {
            return;
        }
        handlers.push(self.on(EventName::NewMessage, |session, event| {
            if let SyncEvent::NewMessage {
                conversation_id,
                message,
            } = event
            {
                session.on_new_message(conversation_id, message.clone());
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::NewConversation, |session, event| {
            if let SyncEvent::NewConversation { conversation } = event {
                session.on_new_conversation(conversation.clone());
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::ConversationUpdated, |session, event| {
            if let SyncEvent::ConversationUpdated { conversation } = event {
                session.store.dispatch_list(ListAction::Upserted {
                    conversation: conversation.clone(),
                });
                session
                    .store
                    .dispatch_selected(SelectedAction::ConversationUpdated {
                        conversation: conversation.clone(),
                    });
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::MessageRead, |session, event| {
            if let SyncEvent::MessageRead {
                conversation_id, ..
            } = event
            {
                session.store.dispatch_list(ListAction::MarkedRead {
                    conversation_id: conversation_id.clone(),
                });
                session.store.dispatch_selected(SelectedAction::MarkedRead {
                    conversation_id: conversation_id.clone(),
                });
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::Typing, |session, event| {
            if let SyncEvent::Typing {
                conversation_id,
                user_id,
                is_typing,
            } = event
            {
                session.on_typing(conversation_id, user_id, *is_typing);
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::Reconnect, |session, _| {
            let resync = Arc::clone(session);
            session.spawn_task(async move {
                let filters = resync.store.list().filters;
                resync.refresh_conversations(filters).await;
                resync.replay.replay_pending().await;
            });
            Ok(())
        }));
        handlers.push(self.on(EventName::ReconnectFailed, |session, event| {
            if let SyncEvent::ReconnectFailed { reason } = event {
                session
                    .notifier
                    .error(&format!("Realtime connection lost: {reason}. Reload to reconnect."));
            }
            Ok(())
        }));
        handlers.push(self.on(EventName::Error, |session, event| {
            if let SyncEvent::Error { message } = event {
                warn!("session: server reported error: {message}");
                session.notifier.error(message);
            }
            Ok(())
        }));
    }

    fn on<F>(self: &Arc<Self>, name: EventName, handler: F) -> Subscription
    where
        F: Fn(&Arc<SyncSession>, &SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let session = Arc::downgrade(self);
        self.dispatcher
            .subscribe(name, move |event| match session.upgrade() {
                Some(session) => handler(&session, event),
                None => Ok(()),
            })
    }

    fn on_new_message(self: &Arc<Self>, conversation_id: &ConversationId, payload: MessagePayload) {
        let options = IngestOptions {
            high_priority: payload.sender == Sender::Agent
                || self.store.is_selected(conversation_id),
        };
        match self.pipeline.ingest(conversation_id, payload, options) {
            IngestDisposition::Rejected => {}
            IngestDisposition::Committed(report) => self.after_commit(report),
            IngestDisposition::Buffered { schedule_flush } => {
                if schedule_flush {
                    self.schedule_flush();
                }
            }
        }
    }

    fn schedule_flush(self: &Arc<Self>) {
        let window = self.pipeline.settings().batch_window;
        let session = Arc::downgrade(self);
        self.spawn_task(async move {
            tokio::time::sleep(window).await;
            if let Some(session) = session.upgrade() {
                let report = session.pipeline.flush();
                session.after_commit(report);
            }
        });
    }

    fn after_commit(self: &Arc<Self>, report: CommitReport) {
        if report.is_empty() {
            return;
        }
        for group in report.groups.iter().filter(|group| !group.marked_read) {
            let conversation = self.store.conversation(&group.conversation_id);
            for message in group
                .messages
                .iter()
                .filter(|message| message.sender == Sender::Customer)
            {
                self.notifier.new_message(conversation.as_ref(), message);
            }
        }

        let receipts: Vec<ConversationId> = report.read_receipts().cloned().collect();
        let refresh = report.unknown_conversations().next().is_some();
        let messages: Vec<Message> = report
            .groups
            .into_iter()
            .flat_map(|group| group.messages)
            .collect();

        let session = Arc::clone(self);
        self.spawn_task(async move {
            for conversation_id in &receipts {
                session.send_read_receipt(conversation_id).await;
            }
            if let Err(error) = session.cache.store_messages(&messages).await {
                warn!(count = messages.len(), "cache: failed to store messages: {error:#}");
            }
            if refresh {
                info!("session: message for unknown conversation; refreshing list");
                let filters = session.store.list().filters;
                session.refresh_conversations(filters).await;
            }
        });
    }

    fn on_new_conversation(self: &Arc<Self>, conversation: Conversation) {
        info!(conversation_id = %conversation.id, "session: new conversation");
        self.store.dispatch_list(ListAction::Upserted {
            conversation: conversation.clone(),
        });
        self.notifier.new_conversation(&conversation);
        let session = Arc::clone(self);
        self.spawn_task(async move {
            if let Err(error) = session.cache.store_conversation(&conversation).await {
                warn!(conversation_id = %conversation.id, "cache: failed to store conversation: {error:#}");
            }
        });
    }

    fn on_typing(self: &Arc<Self>, conversation_id: &ConversationId, user_id: &UserId, is_typing: bool) {
        let now = Instant::now();
        let (users, expired) = {
            let mut typing = self.lock_typing();
            let expired = evict_typing(&mut typing, now);
            let users = typing.update(conversation_id, user_id.clone(), is_typing, now);
            (users, expired)
        };
        for (expired_id, expired_users) in expired {
            if &expired_id != conversation_id {
                self.publish_typing(&expired_id, expired_users);
            }
        }
        self.publish_typing(conversation_id, users);

        if is_typing {
            let ttl = self.settings.typing_ttl();
            let session = Arc::downgrade(self);
            self.spawn_task(async move {
                tokio::time::sleep(ttl).await;
                if let Some(session) = session.upgrade() {
                    session.expire_typing();
                }
            });
        }
    }

    fn expire_typing(&self) {
        let expired = evict_typing(&mut self.lock_typing(), Instant::now());
        for (conversation_id, users) in expired {
            self.publish_typing(&conversation_id, users);
        }
    }

    fn publish_typing(&self, conversation_id: &ConversationId, users: Vec<UserId>) {
        self.notifier.typing(conversation_id, users.len());
        self.store.dispatch_selected(SelectedAction::TypingChanged {
            conversation_id: conversation_id.clone(),
            users,
        });
    }

    async fn load_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Conversation, String> {
        let error = match self.api.get_conversation(conversation_id).await {
            Ok(conversation) => {
                if let Err(error) = self.cache.store_conversation(&conversation).await {
                    warn!(conversation_id = %conversation_id, "cache: failed to store conversation: {error:#}");
                }
                return Ok(conversation);
            }
            Err(error) => error,
        };
        warn!(conversation_id = %conversation_id, "session: conversation request failed: {error:#}");

        match self.cache.cached_conversation(conversation_id).await {
            Ok(Some(conversation)) => {
                self.notifier.toast(
                    ToastLevel::Warning,
                    "Could not reach the server. Showing the cached conversation.",
                );
                Ok(conversation)
            }
            Ok(None) => Err(format!("{error:#}")),
            Err(cache_error) => {
                warn!(conversation_id = %conversation_id, "cache: failed to read conversation: {cache_error:#}");
                Err(format!("{error:#}"))
            }
        }
    }

    /// Entries of the durable send queue for one conversation, shown as pending.
    async fn queued_messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        match self.cache.pending_messages().await {
            Ok(queued) => queued
                .into_iter()
                .filter(|entry| &entry.conversation_id == conversation_id)
                .map(|entry| Message {
                    status: MessageStatus::Pending,
                    ..entry.to_message(0)
                })
                .collect(),
            Err(error) => {
                warn!(conversation_id = %conversation_id, "cache: failed to read pending queue: {error:#}");
                Vec::new()
            }
        }
    }

    async fn mark_conversation_read(&self, conversation_id: &ConversationId) {
        self.store.dispatch_list(ListAction::MarkedRead {
            conversation_id: conversation_id.clone(),
        });
        self.store.dispatch_selected(SelectedAction::MarkedRead {
            conversation_id: conversation_id.clone(),
        });
        self.send_read_receipt(conversation_id).await;
    }

    async fn send_read_receipt(&self, conversation_id: &ConversationId) {
        if let Err(error) = self.api.mark_read(conversation_id).await {
            warn!(conversation_id = %conversation_id, "session: read receipt failed: {error:#}");
        }
        if let Err(error) = self.connection.emit(ClientRequest::MarkRead {
            conversation_id: conversation_id.clone(),
        }) {
            debug!(conversation_id = %conversation_id, "session: read receipt not emitted: {error}");
        }
    }

    fn apply_operation(
        &self,
        conversation_id: &ConversationId,
        operation: &str,
        result: Result<Conversation>,
        success_text: &str,
        failure_text: &str,
    ) -> bool {
        match result {
            Ok(conversation) => {
                info!(conversation_id = %conversation_id, operation, "session: conversation updated");
                self.store.dispatch_list(ListAction::Upserted {
                    conversation: conversation.clone(),
                });
                self.store
                    .dispatch_selected(SelectedAction::ConversationUpdated { conversation });
                self.notifier.toast(ToastLevel::Success, success_text);
                true
            }
            Err(error) => {
                warn!(conversation_id = %conversation_id, operation, "session: operation failed: {error:#}");
                self.notifier.toast(ToastLevel::Error, failure_text);
                false
            }
        }
    }

    fn join_conversation_room(&self, conversation_id: &ConversationId) {
        if let Err(error) = self.connection.join_room(conversation_room(conversation_id)) {
            debug!(conversation_id = %conversation_id, "session: room join skipped: {error}");
        }
    }

    fn leave_conversation_room(&self, conversation_id: &ConversationId) {
        if let Err(error) = self.connection.leave_room(conversation_room(conversation_id)) {
            debug!(conversation_id = %conversation_id, "session: room leave skipped: {error}");
        }
    }

    fn spawn_task(&self, task: impl Future<Output = ()> + Send + 'static) {
        let handle = tokio::spawn(task);
        let mut tasks = self.lock_tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn lock_handlers(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_typing(&self) -> MutexGuard<'_, TypingRegistry> {
        self.typing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn evict_typing(typing: &mut TypingRegistry, now: Instant) -> Vec<(ConversationId, Vec<UserId>)> {
    typing
        .evict_expired(now)
        .into_iter()
        .map(|conversation_id| {
            let users = typing.users(&conversation_id, now);
            (conversation_id, users)
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod tests_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
