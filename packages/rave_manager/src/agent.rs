//! Session agent: one connection plus the bookkeeping that turns raw frames
//! into commands and events.
//!
//! The agent processes frames strictly in arrival order on the task that
//! calls [`SessionAgent::run`]. Handlers run inline on that task, so a slow
//! handler delays the next frame but never reorders it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use rave_protocol::{
    ChatMessage, Message, Notification, OutboundChat, PeerId, Queue, StateMessage, UserId, methods,
    typing,
};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::{MediaFile, SessionApi, UserProfile, fallback_name};
use crate::connection::{
    CLOSE_KICKED, CLOSE_NORMAL, ConnectTarget, Connection, ConnectionEvent, ConnectionOptions,
};
use crate::error::concise;
use crate::metrics::SupervisorMetrics;
use crate::registry::{
    AgentEvent, CommandContext, CommandHandler, EventContext, EventHandler, EventKind, Registry,
};
use crate::{ApiError, FailureKind};

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    /// Command markers, tried in order.
    pub prefixes: Vec<String>,
    /// Leave the session when we are the only member left.
    pub auto_leave_when_last: bool,
    /// Treat any reply as addressed to us when we sent something recently.
    /// Misattributes replies in busy sessions.
    pub assume_recent_reply: bool,
    pub recent_reply_window: Duration,
    pub reply_ring_capacity: usize,
    /// Reopen a dropped socket inside the same run before giving up.
    pub reconnect_in_session: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prefixes: vec!["!".to_string()],
            auto_leave_when_last: true,
            assume_recent_reply: true,
            recent_reply_window: Duration::from_secs(30),
            reply_ring_capacity: 50,
            reconnect_in_session: false,
        }
    }
}

/// Who the agent is in its session.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub user_id: UserId,
    pub peer_id: PeerId,
    pub device_id: String,
    pub auth_token: String,
}

impl AgentIdentity {
    /// Identity with a freshly generated peer id.
    pub fn new(user_id: UserId, device_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            user_id,
            peer_id: PeerId::generate(user_id),
            device_id: device_id.into(),
            auth_token: auth_token.into(),
        }
    }
}

/// A chat line from another member that is not a command.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageInfo {
    pub text: String,
    pub session_id: String,
    pub sender_peer_id: PeerId,
    pub sender_user_id: Option<UserId>,
    pub sender_name: String,
    pub message_id: String,
    pub reply_to: Option<String>,
    pub is_reply: bool,
    pub is_reply_to_self: bool,
    pub is_mentioned: bool,
    pub user_metas: Vec<Value>,
    pub raw: ChatMessage,
}

/// Why [`SessionAgent::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    Kicked,
    LeftAsLastMember,
    /// The socket dropped or was torn down; carries the last classified fault.
    Disconnected(Option<FailureKind>),
    ConnectFailed(FailureKind),
    Cancelled,
}

impl AgentExit {
    /// Exits after which the session must never be rejoined automatically.
    pub fn is_permanent(self) -> bool {
        matches!(self, AgentExit::Kicked | AgentExit::LeftAsLastMember)
    }

    pub fn failure(self) -> Option<FailureKind> {
        match self {
            AgentExit::Disconnected(kind) => kind,
            AgentExit::ConnectFailed(kind) => Some(kind),
            _ => None,
        }
    }
}

/// Members that joined and left between two snapshots, each sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub joined: Vec<UserId>,
    pub left: Vec<UserId>,
}

pub fn membership_delta(previous: &BTreeSet<UserId>, current: &BTreeSet<UserId>) -> MembershipDelta {
    MembershipDelta {
        joined: current.difference(previous).copied().collect(),
        left: previous.difference(current).copied().collect(),
    }
}

/// Split `text` into a lowercased command and its arguments when it starts
/// with one of `prefixes`. A bare prefix is not a command.
pub fn parse_command(text: &str, prefixes: &[String]) -> Option<(String, Vec<String>)> {
    let prefix = prefixes
        .iter()
        .find(|p| !p.is_empty() && text.starts_with(p.as_str()))?;
    let mut parts = text[prefix.len()..].split_whitespace();
    let command = parts.next()?.to_lowercase();
    Some((command, parts.map(str::to_string).collect()))
}

/// One-shot permission to perform the leave action for a session.
///
/// Shared between the agent's last-member detection and the supervisor's
/// idle reaper so only one of them ever calls the collaborator.
#[derive(Debug, Default)]
pub struct LeaveGuard(AtomicBool);

impl LeaveGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// True for the first caller only.
    pub fn try_acquire(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_spent(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct SentMessage {
    id: String,
    text: String,
    sent_at: Instant,
}

/// Which chat lines are ours.
///
/// Keeps the last `capacity` sends for text matching, every id ever
/// associated with one of our lines, and payloads attached to them. The room
/// may echo our line back under a new id; both ids are tracked.
#[derive(Debug)]
pub struct ReplyTracker {
    capacity: usize,
    recent: VecDeque<SentMessage>,
    tracked: HashSet<String>,
    payloads: HashMap<String, Value>,
}

impl ReplyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            recent: VecDeque::new(),
            tracked: HashSet::new(),
            payloads: HashMap::new(),
        }
    }

    pub fn record_sent(&mut self, id: &str, text: &str) {
        self.record_sent_at(id, text, Instant::now());
    }

    fn record_sent_at(&mut self, id: &str, text: &str, at: Instant) {
        self.tracked.insert(id.to_string());
        self.recent.push_back(SentMessage {
            id: id.to_string(),
            text: text.to_string(),
            sent_at: at,
        });
        while self.recent.len() > self.capacity {
            self.recent.pop_front();
        }
    }

    /// Our own line came back from the room as `server_id`.
    pub fn fold_echo(&mut self, server_id: &str, text: &str) {
        self.tracked.insert(server_id.to_string());
        let local = self
            .recent
            .iter()
            .rev()
            .find(|m| m.text == text && m.id != server_id)
            .map(|m| m.id.clone());
        let payload = local.and_then(|id| self.payloads.get(&id).cloned());
        if let Some(payload) = payload {
            self.payloads.entry(server_id.to_string()).or_insert(payload);
        }
    }

    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked.contains(id)
    }

    pub fn sent_within(&self, window: Duration, now: Instant) -> bool {
        self.recent
            .iter()
            .any(|m| now.saturating_duration_since(m.sent_at) < window)
    }

    pub fn recent_len(&self) -> usize {
        self.recent.len()
    }

    pub fn attach(&mut self, id: &str, payload: Value) {
        self.payloads.insert(id.to_string(), payload);
    }

    pub fn payload(&self, id: &str) -> Option<&Value> {
        self.payloads.get(id)
    }
}

struct AgentState {
    members: BTreeSet<UserId>,
    names: HashMap<UserId, String>,
    replies: ReplyTracker,
    queue: Option<Queue>,
}

/// Everything needed to build an agent.
pub struct AgentSetup {
    pub session_id: String,
    pub endpoint: String,
    pub identity: AgentIdentity,
    pub config: AgentConfig,
    pub connection: ConnectionOptions,
    pub api: Arc<dyn SessionApi>,
    pub registry: Registry,
    pub leave_guard: Arc<LeaveGuard>,
    pub metrics: Arc<SupervisorMetrics>,
}

pub struct SessionAgent {
    session_id: String,
    endpoint: String,
    identity: AgentIdentity,
    config: AgentConfig,
    api: Arc<dyn SessionApi>,
    connection: Connection,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    registry: RwLock<Registry>,
    state: StdMutex<AgentState>,
    kicked: AtomicBool,
    left_as_last_member: AtomicBool,
    leave_guard: Arc<LeaveGuard>,
    metrics: Arc<SupervisorMetrics>,
    started_at: Instant,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionAgent {
    pub fn new(setup: AgentSetup) -> Arc<Self> {
        let target = ConnectTarget {
            endpoint: setup.endpoint.clone(),
            session_id: setup.session_id.clone(),
            peer_id: setup.identity.peer_id.clone(),
            auth_token: setup.identity.auth_token.clone(),
        };
        let (connection, events) = Connection::new(target, setup.connection, setup.metrics.clone());
        let state = AgentState {
            members: BTreeSet::new(),
            names: HashMap::new(),
            replies: ReplyTracker::new(setup.config.reply_ring_capacity),
            queue: None,
        };
        Arc::new(Self {
            session_id: setup.session_id,
            endpoint: setup.endpoint,
            identity: setup.identity,
            config: setup.config,
            api: setup.api,
            connection,
            events: Mutex::new(Some(events)),
            registry: RwLock::new(setup.registry),
            state: StdMutex::new(state),
            kicked: AtomicBool::new(false),
            left_as_last_member: AtomicBool::new(false),
            leave_guard: setup.leave_guard,
            metrics: setup.metrics,
            started_at: Instant::now(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked.load(Ordering::SeqCst)
    }

    pub fn left_as_last_member(&self) -> bool {
        self.left_as_last_member.load(Ordering::SeqCst)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Current members in ascending id order, as of the last state update.
    pub fn members(&self) -> Vec<UserId> {
        lock(&self.state).members.iter().copied().collect()
    }

    /// Last playback queue seen, if any.
    pub fn queue(&self) -> Option<Queue> {
        lock(&self.state).queue.clone()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.config.prefixes
    }

    /// Sorted command names with descriptions.
    pub fn commands(&self) -> Vec<(String, String)> {
        self.registry_read().commands()
    }

    pub fn register_command(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.registry_write().register_command(name, handler);
    }

    pub fn register_event(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.registry_write().register_event(kind, handler);
    }

    fn registry_read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn registry_write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `id` is one of our chat lines.
    pub fn is_tracked(&self, message_id: &str) -> bool {
        lock(&self.state).replies.is_tracked(message_id)
    }

    pub fn attach_payload(&self, message_id: &str, payload: Value) {
        lock(&self.state).replies.attach(message_id, payload);
    }

    pub fn payload_for(&self, message_id: &str) -> Option<Value> {
        lock(&self.state).replies.payload(message_id).cloned()
    }

    /// Send a chat line; returns its locally generated id.
    pub async fn send_message(&self, text: impl Into<String>, reply_to: Option<String>) -> String {
        let mut chat = OutboundChat::new(text);
        chat.reply_to = reply_to;
        self.send_chat(chat).await
    }

    /// Send a prepared chat line; its id is tracked before the frame is written.
    pub async fn send_chat(&self, chat: OutboundChat) -> String {
        lock(&self.state).replies.record_sent(&chat.id, &chat.text);
        self.connection.send_notification(&chat.to_notification()).await;
        chat.id
    }

    /// Upload `files` and send them with `text` as one chat line.
    pub async fn send_media(
        &self,
        text: impl Into<String>,
        files: Vec<MediaFile>,
        reply_to: Option<String>,
    ) -> Result<String, ApiError> {
        let media = self.api.upload_media(&self.session_id, files).await?;
        let mut chat = OutboundChat::new(text).media(media);
        chat.reply_to = reply_to;
        Ok(self.send_chat(chat).await)
    }

    pub async fn send_typing(&self, is_typing: bool) {
        self.connection.send_notification(&typing(is_typing)).await;
    }

    /// Display name for `user_id`, cached for the life of the agent.
    pub async fn display_name(&self, user_id: UserId) -> String {
        if let Some(name) = lock(&self.state).names.get(&user_id) {
            return name.clone();
        }
        self.resolve_profiles(&[user_id])
            .await
            .into_iter()
            .next()
            .map(|p| p.display_name)
            .unwrap_or_else(|| fallback_name(user_id))
    }

    /// Tear the socket down. The run loop then exits with
    /// [`AgentExit::Disconnected`].
    pub async fn disconnect(&self, code: u16, reason: &str) -> bool {
        self.connection.disconnect(code, reason).await
    }

    /// Leave the session because we are its last member: call the
    /// collaborator's leave action, then disconnect.
    ///
    /// Returns false when the leave was already performed by someone else.
    pub async fn leave_as_last_member(&self) -> bool {
        if !self.leave_guard.try_acquire() {
            debug!(session = %self.session_id, "leave already performed");
            return false;
        }
        self.left_as_last_member.store(true, Ordering::SeqCst);
        info!(session = %self.session_id, "last member in session, leaving");
        match self
            .api
            .leave_session(&self.session_id, &self.identity.device_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(session = %self.session_id, "leave action was rejected"),
            Err(e) => warn!(session = %self.session_id, "leave action failed: {}", concise(&e.to_string())),
        }
        self.connection.disconnect(CLOSE_NORMAL, "left").await;
        true
    }

    /// Connect and process frames until the session ends for us.
    ///
    /// Can be called once; later calls return immediately. The connection is
    /// always torn down, and its tasks reaped, before this returns.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> AgentExit {
        let exit = self.run_inner(cancel).await;
        self.connection.disconnect(CLOSE_NORMAL, "finished").await;
        info!(session = %self.session_id, exit = ?exit, "agent finished");
        exit
    }

    async fn run_inner(self: &Arc<Self>, cancel: CancellationToken) -> AgentExit {
        let Some(mut events) = self.events.lock().await.take() else {
            warn!(session = %self.session_id, "agent already ran");
            return AgentExit::Disconnected(None);
        };

        let connected = tokio::select! {
            _ = cancel.cancelled() => return self.cancelled().await,
            ok = self.connection.connect() => ok,
        };
        if !connected {
            let kind = self.connection.last_failure().unwrap_or(FailureKind::Protocol);
            return AgentExit::ConnectFailed(kind);
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled().await,
                event = events.recv() => event,
                _ = self.connection.terminated() => {
                    return self.finished().unwrap_or(AgentExit::Disconnected(None));
                }
            };

            match event {
                Some(ConnectionEvent::Connected) => self.dispatch_event(AgentEvent::Connected).await,
                Some(ConnectionEvent::Message(message)) => self.handle_message(message).await,
                Some(ConnectionEvent::Error { kind, message }) => {
                    debug!(session = %self.session_id, kind = %kind, "connection error: {}", message);
                }
                Some(ConnectionEvent::Closed { failure }) => {
                    if let Some(exit) = self.finished() {
                        return exit;
                    }
                    if self.config.reconnect_in_session {
                        info!(session = %self.session_id, "socket dropped, reconnecting in session");
                        let ok = tokio::select! {
                            _ = cancel.cancelled() => return self.cancelled().await,
                            ok = self.connection.reconnect() => ok,
                        };
                        if ok {
                            continue;
                        }
                    }
                    return AgentExit::Disconnected(failure.or(self.connection.last_failure()));
                }
                None => return AgentExit::Disconnected(self.connection.last_failure()),
            }

            if let Some(exit) = self.finished() {
                return exit;
            }
        }
    }

    async fn cancelled(&self) -> AgentExit {
        self.connection.disconnect(CLOSE_NORMAL, "stopped").await;
        AgentExit::Cancelled
    }

    fn finished(&self) -> Option<AgentExit> {
        if self.is_kicked() {
            Some(AgentExit::Kicked)
        } else if self.left_as_last_member() {
            Some(AgentExit::LeftAsLastMember)
        } else if self.connection.is_terminated() {
            Some(AgentExit::Disconnected(None))
        } else {
            None
        }
    }

    async fn handle_message(self: &Arc<Self>, message: Message) {
        let notification = match message {
            Message::Notification(n) => n,
            Message::Request(r) => {
                debug!(session = %self.session_id, method = %r.method, "ignoring server request");
                return;
            }
            Message::Response(r) => {
                debug!(session = %self.session_id, id = r.id, "response without a waiter");
                return;
            }
        };

        match notification.method.as_str() {
            methods::KICKED => self.handle_kicked().await,
            methods::STATE_MESSAGE => match notification.state_message() {
                Some(state) => self.handle_state(state).await,
                None => warn!(session = %self.session_id, "dropping malformed stateMessage"),
            },
            methods::CHAT_MESSAGE => match notification.chat_message() {
                Some(chat) => self.handle_chat(chat).await,
                None => warn!(session = %self.session_id, "dropping malformed chatMessage"),
            },
            methods::QUEUE_MESSAGE => self.handle_queue(&notification),
            other => debug!(session = %self.session_id, method = other, "unhandled notification"),
        }
    }

    async fn handle_kicked(self: &Arc<Self>) {
        if self.kicked.swap(true, Ordering::SeqCst) {
            debug!(session = %self.session_id, "duplicate kicked notification ignored");
            return;
        }
        warn!(session = %self.session_id, "kicked from session");
        self.dispatch_event(AgentEvent::Kicked).await;
        self.connection.disconnect(CLOSE_KICKED, "kicked").await;
    }

    fn handle_queue(&self, notification: &Notification) {
        match notification.queue_message() {
            Some(queue) => {
                debug!(session = %self.session_id, items = queue.items.len(), "queue updated");
                lock(&self.state).queue = Some(queue);
            }
            None => warn!(session = %self.session_id, "dropping malformed queueMessage"),
        }
    }

    async fn handle_state(self: &Arc<Self>, state: StateMessage) {
        let current = state.member_ids();
        let delta = {
            let mut st = lock(&self.state);
            let delta = membership_delta(&st.members, &current);
            st.members = current;
            delta
        };

        if !delta.joined.is_empty() {
            debug!(session = %self.session_id, joined = ?delta.joined, "members joined");
            for profile in self.resolve_profiles(&delta.joined).await {
                self.dispatch_event(AgentEvent::UserJoined(profile)).await;
            }
        }

        if !delta.left.is_empty() {
            debug!(session = %self.session_id, left = ?delta.left, "members left");
            for id in &delta.left {
                let profile = UserProfile {
                    id: *id,
                    display_name: self.cached_name(*id).unwrap_or_else(|| fallback_name(*id)),
                    raw: Value::Null,
                };
                self.dispatch_event(AgentEvent::UserLeft(profile)).await;
            }
            if self.config.auto_leave_when_last && self.is_alone() {
                self.leave_as_last_member().await;
            }
        }
    }

    fn is_alone(&self) -> bool {
        let st = lock(&self.state);
        st.members.len() == 1 && st.members.contains(&self.identity.user_id)
    }

    fn cached_name(&self, id: UserId) -> Option<String> {
        lock(&self.state).names.get(&id).cloned()
    }

    /// Profiles for `ids`, in order, falling back to `"User {id}"` for
    /// anything the collaborator could not resolve. Resolved names are cached.
    async fn resolve_profiles(&self, ids: &[UserId]) -> Vec<UserProfile> {
        let mut resolved: HashMap<UserId, UserProfile> = match self.api.resolve_users(ids).await {
            Ok(profiles) => profiles.into_iter().map(|p| (p.id, p)).collect(),
            Err(e) => {
                warn!(session = %self.session_id, "user lookup failed: {}", concise(&e.to_string()));
                HashMap::new()
            }
        };
        {
            let mut st = lock(&self.state);
            for profile in resolved.values() {
                st.names.insert(profile.id, profile.display_name.clone());
            }
        }
        ids.iter()
            .map(|id| resolved.remove(id).unwrap_or_else(|| UserProfile::fallback(*id)))
            .collect()
    }

    async fn handle_chat(self: &Arc<Self>, chat: ChatMessage) {
        let sender = PeerId::from_wire(chat.from.clone());
        if sender == self.identity.peer_id {
            if !chat.id.is_empty() {
                lock(&self.state).replies.fold_echo(&chat.id, &chat.chat);
            }
            return;
        }

        if let Some((command, args)) = parse_command(&chat.chat, &self.config.prefixes) {
            let handler = self.registry_read().command(&command);
            match handler {
                Some(handler) => self.run_command(handler, command, args, sender, chat).await,
                None => debug!(session = %self.session_id, command = %command, "unknown command"),
            }
            return;
        }

        let sender_user_id = sender.user_id();
        let sender_name = match sender_user_id {
            Some(id) => self.display_name(id).await,
            None => "Unknown User".to_string(),
        };
        let is_reply_to_self = chat
            .reply
            .as_deref()
            .is_some_and(|reply| self.is_reply_to_self(reply));
        let info = MessageInfo {
            text: chat.chat.clone(),
            session_id: self.session_id.clone(),
            sender_peer_id: sender,
            sender_user_id,
            sender_name,
            message_id: chat.id.clone(),
            reply_to: chat.reply.clone(),
            is_reply: chat.reply.is_some(),
            is_reply_to_self,
            is_mentioned: chat.mentions(self.identity.user_id),
            user_metas: chat.user_metas.clone(),
            raw: chat,
        };
        self.dispatch_event(AgentEvent::Message(info)).await;
    }

    fn is_reply_to_self(&self, reply_to: &str) -> bool {
        let st = lock(&self.state);
        if st.replies.is_tracked(reply_to) {
            return true;
        }
        if self.config.assume_recent_reply
            && st
                .replies
                .sent_within(self.config.recent_reply_window, Instant::now())
        {
            info!(
                session = %self.session_id,
                reply_to,
                "assuming reply is to us (recent send, unknown id)"
            );
            return true;
        }
        false
    }

    async fn run_command(
        self: &Arc<Self>,
        handler: Arc<dyn CommandHandler>,
        command: String,
        args: Vec<String>,
        sender: PeerId,
        message: ChatMessage,
    ) {
        self.metrics.command_dispatched();
        info!(session = %self.session_id, command = %command, sender = %sender, "dispatching command");
        let ctx = CommandContext {
            agent: self.clone(),
            command,
            args,
            sender,
            message,
        };
        let outcome = AssertUnwindSafe(handler.handle(ctx.clone()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "handler panicked".to_string(),
        };
        self.metrics.handler_error();
        error!(session = %self.session_id, command = %ctx.command, "command failed: {}", failure);
        ctx.reply(format!("❌ Error executing command: {failure}")).await;
    }

    async fn dispatch_event(self: &Arc<Self>, event: AgentEvent) {
        let kind = event.kind();
        let handlers = self.registry_read().events(kind);
        for handler in handlers {
            let ctx = EventContext {
                agent: self.clone(),
                event: event.clone(),
            };
            let outcome = AssertUnwindSafe(handler.handle(ctx)).catch_unwind().await;
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            self.metrics.handler_error();
            error!(session = %self.session_id, event = %kind, "event handler failed: {}", failure);
        }
    }
}
