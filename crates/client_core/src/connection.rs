//! Realtime connection lifecycle.
//!
//! One driver task per `connect` owns the transport session, the heartbeat
//! and ack deadline, reconnect backoff, the joined-room set and the outage
//! buffer. The manager talks to it over a command channel, so callers never
//! block on the transport.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Role, SectorId, UserId},
    protocol::{AuthPayload, ClientRequest, ServerEvent},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{sleep, sleep_until, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::ConnectionSettings,
    dispatcher::{EventDispatcher, SyncEvent},
    error::{DisconnectReason, SyncError},
    transport::{TransportConnector, TransportEvent, TransportLink, TransportSession},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_failure: Option<DisconnectReason>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempts: 0,
            last_heartbeat_at: None,
            last_failure: None,
        }
    }
}

/// Who the transport session is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    pub token: String,
    pub user_id: UserId,
    pub role: Role,
    pub sector_id: Option<SectorId>,
}

impl SessionIdentity {
    pub fn auth_payload(&self) -> AuthPayload {
        AuthPayload {
            token: self.token.clone(),
            user_id: self.user_id.clone(),
            role: self.role,
        }
    }

    pub fn default_rooms(&self) -> Vec<String> {
        let mut rooms = vec![
            format!("user:{}", self.user_id),
            format!("role:{}", self.role.as_str()),
        ];
        if let Some(sector_id) = &self.sector_id {
            rooms.push(format!("sector:{sector_id}"));
        }
        rooms
    }
}

pub fn conversation_room(conversation_id: &impl std::fmt::Display) -> String {
    format!("conversation:{conversation_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyConnected,
}

enum Command {
    Emit(ClientRequest),
    Join(String),
    Leave(String),
    Shutdown(oneshot::Sender<()>),
}

struct ActiveConnection {
    identity: SessionIdentity,
    endpoint: String,
    commands: mpsc::UnboundedSender<Command>,
    driver: JoinHandle<()>,
}

pub struct ConnectionManager {
    connector: Arc<dyn TransportConnector>,
    dispatcher: Arc<EventDispatcher>,
    settings: ConnectionSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    active: Mutex<Option<ActiveConnection>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn TransportConnector>,
        dispatcher: Arc<EventDispatcher>,
        settings: ConnectionSettings,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());
        Self {
            connector,
            dispatcher,
            settings,
            status: Arc::new(status),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveConnection>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().state == ConnectionState::Connected
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.lock_active()
            .as_ref()
            .map(|active| active.identity.clone())
    }

    /// Starts a driver bound to `identity`. A live session for the same
    /// identity and endpoint is left alone; any other session is torn down
    /// first. Transport failures surface as events, never as errors here.
    pub async fn connect(&self, endpoint: &str, identity: SessionIdentity) -> ConnectOutcome {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = {
            let mut active = self.lock_active();
            let unchanged = active.as_ref().is_some_and(|current| {
                current.identity == identity
                    && current.endpoint == endpoint
                    && !current.driver.is_finished()
            });
            if unchanged {
                debug!(user_id = %identity.user_id, "connection: identity unchanged; keeping session");
                return ConnectOutcome::AlreadyConnected;
            }
            active.take()
        };
        if let Some(previous) = previous {
            info!(user_id = %previous.identity.user_id, "connection: identity changed; tearing down");
            stop_driver(previous).await;
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            connector: Arc::clone(&self.connector),
            dispatcher: Arc::clone(&self.dispatcher),
            settings: self.settings.clone(),
            status: Arc::clone(&self.status),
            endpoint: endpoint.to_string(),
            auth: identity.auth_payload(),
            rooms: identity.default_rooms(),
            outage: VecDeque::new(),
            commands: commands_rx,
        };
        self.status.send_modify(|status| {
            *status = ConnectionStatus {
                state: ConnectionState::Connecting,
                ..ConnectionStatus::default()
            };
        });
        info!(user_id = %identity.user_id, endpoint, "connection: starting");
        let handle = tokio::spawn(driver.run());

        *self.lock_active() = Some(ActiveConnection {
            identity,
            endpoint: endpoint.to_string(),
            commands: commands_tx,
            driver: handle,
        });
        ConnectOutcome::Started
    }

    /// Leaves every room, closes the transport, and drops all listeners and
    /// throttle state.
    pub async fn disconnect(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let active = self.lock_active().take();
        if let Some(active) = active {
            info!(user_id = %active.identity.user_id, "connection: disconnecting");
            stop_driver(active).await;
        }
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.reconnect_attempts = 0;
        });
        self.dispatcher.clear();
    }

    fn send(&self, command: Command) -> Result<(), SyncError> {
        let active = self.lock_active();
        let Some(active) = active.as_ref() else {
            return Err(SyncError::NotConnected);
        };
        active
            .commands
            .send(command)
            .map_err(|_| SyncError::NotConnected)
    }

    /// Sends now when connected; otherwise buffers until the next session.
    pub fn emit(&self, request: ClientRequest) -> Result<(), SyncError> {
        self.send(Command::Emit(request))
    }

    pub fn join_room(&self, room: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Join(room.into()))
    }

    pub fn leave_room(&self, room: impl Into<String>) -> Result<(), SyncError> {
        self.send(Command::Leave(room.into()))
    }
}

async fn stop_driver(active: ActiveConnection) {
    let (ack_tx, ack_rx) = oneshot::channel();
    if active.commands.send(Command::Shutdown(ack_tx)).is_ok() {
        let _ = ack_rx.await;
    }
    if let Err(error) = active.driver.await {
        if error.is_panic() {
            warn!("connection: driver panicked during shutdown");
        }
    }
}

/// Local stop request; carries the caller's ack when there is one.
struct Exit(Option<oneshot::Sender<()>>);

enum SessionEnd {
    Lost(DisconnectReason),
    Exit(Exit),
}

struct Driver {
    connector: Arc<dyn TransportConnector>,
    dispatcher: Arc<EventDispatcher>,
    settings: ConnectionSettings,
    status: Arc<watch::Sender<ConnectionStatus>>,
    endpoint: String,
    auth: AuthPayload,
    rooms: Vec<String>,
    outage: VecDeque<ClientRequest>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl Driver {
    async fn run(mut self) {
        let policy = self.settings.reconnect;
        let mut attempts: u32 = 0;
        let mut was_connected = false;

        loop {
            let connector = Arc::clone(&self.connector);
            let endpoint = self.endpoint.clone();
            let auth = self.auth.clone();
            let connect = async move { connector.connect(&endpoint, &auth).await };
            tokio::pin!(connect);

            let result = loop {
                tokio::select! {
                    result = &mut connect => break result,
                    command = self.commands.recv() => {
                        if let Some(exit) = self.handle_offline(command) {
                            self.finish(exit, false);
                            return;
                        }
                    }
                }
            };

            match result {
                Ok(link) => {
                    let session = Arc::clone(&link.session);
                    match self
                        .run_session(link, was_connected, &mut attempts)
                        .await
                    {
                        SessionEnd::Exit(exit) => {
                            self.leave_all(session.as_ref()).await;
                            if let Err(error) = session.close().await {
                                debug!(%error, "connection: close failed");
                            }
                            self.finish(exit, true);
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!(%reason, "connection: session lost");
                            if let Err(error) = session.close().await {
                                debug!(%error, "connection: close failed");
                            }
                            self.status.send_modify(|status| {
                                status.state = ConnectionState::Reconnecting;
                                status.last_failure = Some(reason.clone());
                            });
                            self.dispatcher
                                .dispatch(&SyncEvent::Disconnected { reason });
                            was_connected = true;
                        }
                    }
                }
                Err(error) => {
                    let reason = DisconnectReason::TransportError(format!("{error:#}"));
                    warn!(attempts, %reason, "connection: connect failed");
                    self.status.send_modify(|status| {
                        status.last_failure = Some(reason);
                    });
                }
            }

            if policy.exhausted(attempts) {
                let reason = DisconnectReason::ReconnectExhausted { attempts };
                warn!(attempts, "connection: giving up");
                self.status.send_modify(|status| {
                    status.state = ConnectionState::Failed;
                    status.reconnect_attempts = attempts;
                    status.last_failure = Some(reason.clone());
                });
                self.dispatcher
                    .dispatch(&SyncEvent::ReconnectFailed { reason });
                return;
            }

            let delay = policy.delay_for(attempts);
            attempts += 1;
            self.status.send_modify(|status| {
                status.state = ConnectionState::Reconnecting;
                status.reconnect_attempts = attempts;
            });
            info!(attempt = attempts, delay_ms = delay.as_millis() as u64, "connection: reconnecting");
            self.dispatcher.dispatch(&SyncEvent::ReconnectAttempt {
                attempt: attempts,
                delay,
            });
            if let Some(exit) = self.wait_offline(delay).await {
                self.finish(exit, false);
                return;
            }
        }
    }

    async fn wait_offline(&mut self, delay: Duration) -> Option<Exit> {
        let backoff = sleep(delay);
        tokio::pin!(backoff);
        loop {
            tokio::select! {
                _ = &mut backoff => return None,
                command = self.commands.recv() => {
                    if let Some(exit) = self.handle_offline(command) {
                        return Some(exit);
                    }
                }
            }
        }
    }

    /// Room changes are remembered for the next session; emits wait in the
    /// bounded outage buffer.
    fn handle_offline(&mut self, command: Option<Command>) -> Option<Exit> {
        match command {
            None => Some(Exit(None)),
            Some(Command::Shutdown(ack)) => Some(Exit(Some(ack))),
            Some(Command::Join(room)) => {
                self.remember_room(room);
                None
            }
            Some(Command::Leave(room)) => {
                self.rooms.retain(|joined| *joined != room);
                None
            }
            Some(Command::Emit(request)) => {
                self.buffer(request);
                None
            }
        }
    }

    fn remember_room(&mut self, room: String) -> bool {
        if self.rooms.contains(&room) {
            return false;
        }
        self.rooms.push(room);
        true
    }

    fn buffer(&mut self, request: ClientRequest) {
        let limit = self.settings.outage_buffer_limit.max(1);
        if self.outage.len() >= limit {
            if let Some(dropped) = self.outage.pop_front() {
                warn!(event = dropped.event_name(), "connection: outage buffer full; dropping oldest");
            }
        }
        self.outage.push_back(request);
    }

    fn finish(&mut self, exit: Exit, was_connected: bool) {
        self.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.reconnect_attempts = 0;
        });
        if was_connected {
            self.dispatcher.dispatch(&SyncEvent::Disconnected {
                reason: DisconnectReason::LocalIntent,
            });
        }
        self.outage.clear();
        self.rooms.clear();
        if let Exit(Some(ack)) = exit {
            let _ = ack.send(());
        }
    }

    async fn leave_all(&self, session: &dyn TransportSession) {
        for room in &self.rooms {
            let request = ClientRequest::Leave { room: room.clone() };
            if let Err(error) = session.emit(request).await {
                debug!(%error, room, "connection: leave failed");
                break;
            }
        }
    }

    async fn on_established(&mut self, session: &dyn TransportSession) -> Result<(), DisconnectReason> {
        for room in &self.rooms {
            session
                .emit(ClientRequest::Join { room: room.clone() })
                .await
                .map_err(|error| DisconnectReason::TransportError(format!("{error:#}")))?;
        }
        while let Some(request) = self.outage.pop_front() {
            if let Err(error) = session.emit(request.clone()).await {
                self.outage.push_front(request);
                return Err(DisconnectReason::TransportError(format!("{error:#}")));
            }
        }
        Ok(())
    }

    async fn run_session(
        &mut self,
        mut link: TransportLink,
        reconnected: bool,
        attempts: &mut u32,
    ) -> SessionEnd {
        let session = Arc::clone(&link.session);
        if let Err(reason) = self.on_established(session.as_ref()).await {
            return SessionEnd::Lost(reason);
        }

        self.status.send_modify(|status| {
            status.state = ConnectionState::Connected;
            status.reconnect_attempts = 0;
        });
        info!(rooms = self.rooms.len(), reconnected, "connection: established");
        if reconnected {
            self.dispatcher.reset_throttle();
        }
        self.dispatcher.dispatch(&SyncEvent::Connected);
        if reconnected {
            self.dispatcher
                .dispatch(&SyncEvent::Reconnected {
                    attempts: *attempts,
                });
        }

        let interval = self.settings.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ack_deadline: Option<Instant> = None;

        loop {
            let deadline = ack_deadline;
            tokio::select! {
                _ = heartbeat.tick() => {
                    let ping = ClientRequest::Heartbeat { sent_at: Utc::now() };
                    if let Err(error) = session.emit(ping).await {
                        return SessionEnd::Lost(DisconnectReason::TransportError(format!("{error:#}")));
                    }
                    if ack_deadline.is_none() {
                        ack_deadline = Some(Instant::now() + self.settings.heartbeat_timeout);
                    }
                }
                _ = deadline_elapsed(deadline) => {
                    return SessionEnd::Lost(DisconnectReason::HeartbeatTimeout);
                }
                command = self.commands.recv() => {
                    match command {
                        None => return SessionEnd::Exit(Exit(None)),
                        Some(Command::Shutdown(ack)) => return SessionEnd::Exit(Exit(Some(ack))),
                        Some(Command::Emit(request)) => {
                            if let Err(error) = session.emit(request.clone()).await {
                                self.buffer(request);
                                return SessionEnd::Lost(DisconnectReason::TransportError(format!("{error:#}")));
                            }
                        }
                        Some(Command::Join(room)) => {
                            if self.remember_room(room.clone()) {
                                if let Err(error) = session.emit(ClientRequest::Join { room }).await {
                                    return SessionEnd::Lost(DisconnectReason::TransportError(format!("{error:#}")));
                                }
                            }
                        }
                        Some(Command::Leave(room)) => {
                            let before = self.rooms.len();
                            self.rooms.retain(|joined| *joined != room);
                            if self.rooms.len() != before {
                                if let Err(error) = session.emit(ClientRequest::Leave { room }).await {
                                    return SessionEnd::Lost(DisconnectReason::TransportError(format!("{error:#}")));
                                }
                            }
                        }
                    }
                }
                event = link.events.recv() => {
                    match event {
                        None => {
                            return SessionEnd::Lost(DisconnectReason::TransportClosed(
                                "event stream ended".to_string(),
                            ));
                        }
                        Some(TransportEvent::Closed(reason)) => {
                            return SessionEnd::Lost(DisconnectReason::TransportClosed(reason));
                        }
                        Some(TransportEvent::Error(reason)) => {
                            return SessionEnd::Lost(DisconnectReason::TransportError(reason));
                        }
                        Some(TransportEvent::Message(ServerEvent::HeartbeatAck { server_time })) => {
                            ack_deadline = None;
                            // The reconnect budget is restored only once the server has answered.
                            if *attempts > 0 {
                                debug!(attempts = *attempts, "connection: session stable");
                                *attempts = 0;
                            }
                            self.status.send_modify(|status| {
                                status.last_heartbeat_at = Some(Utc::now());
                            });
                            self.dispatcher.dispatch(&SyncEvent::HeartbeatAck { server_time });
                        }
                        Some(TransportEvent::Message(event)) => {
                            self.dispatcher.dispatch(&SyncEvent::from(event));
                        }
                    }
                }
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
