//! Session supervisor: keeps one agent per desired session alive.
//!
//! Per-session lifecycle:
//!
//! ```text
//! INITIALIZING -> CONNECTING -> CONNECTED <-> DISCONNECTED -> RETRYING -> CONNECTING ...
//!                                   |               |             |
//!                                   +--> STOPPED <--+             +--> FAILED
//! ```
//!
//! Records live in one map behind an async mutex. Every task that touches a
//! record after an await re-checks that the record is still registered under
//! the same generation; a record that was stopped and recreated in the
//! meantime is never mutated by the old task.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};

use rave_protocol::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentConfig, AgentExit, AgentIdentity, AgentSetup, LeaveGuard, SessionAgent};
use crate::api::{SessionApi, SessionInfo, SessionMode, SessionSummary};
use crate::backoff::RetryPolicy;
use crate::connection::ConnectionOptions;
use crate::error::concise;
use crate::metrics::{MetricsSnapshot, SupervisorMetrics};
use crate::registry::{CommandHandler, EventHandler, EventKind, Registry};
use crate::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Retrying,
    Failed,
    Stopped,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Stopped)
    }
}

/// The account the bot runs as.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub user_id: UserId,
    pub device_id: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub account: Account,
    pub discovery_interval: Duration,
    pub reaper_interval: Duration,
    /// Delay between consecutive agent starts within one reconcile pass.
    pub start_stagger: Duration,
    pub health_poll: Duration,
    pub retry: RetryPolicy,
    pub session_mode: SessionMode,
    pub session_limit: usize,
    pub lang: String,
    pub agent: AgentConfig,
    pub connection: ConnectionOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            account: Account::default(),
            discovery_interval: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(180),
            start_stagger: Duration::from_millis(500),
            health_poll: Duration::from_secs(2),
            retry: RetryPolicy::supervisor(),
            session_mode: SessionMode::Invited,
            session_limit: 20,
            lang: "en".to_string(),
            agent: AgentConfig::default(),
            connection: ConnectionOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StateChanged {
        session_id: String,
        from: Option<SessionState>,
        to: SessionState,
    },
    Removed {
        session_id: String,
    },
}

/// What one reconcile pass decided.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// New sessions, in desired-list order.
    pub start: Vec<SessionSummary>,
    /// Registered sessions no longer desired, sorted.
    pub stop: Vec<String>,
    /// Registered sessions still desired, sorted.
    pub keep: Vec<String>,
}

/// Diff the registered sessions against the desired list.
///
/// Duplicate ids in `desired` are started once. Sessions we were kicked
/// from are never started again.
pub fn plan_reconcile<'a>(
    registered: impl IntoIterator<Item = &'a String>,
    kicked: &HashSet<String>,
    desired: &[SessionSummary],
) -> ReconcilePlan {
    let registered: HashSet<&str> = registered.into_iter().map(String::as_str).collect();
    let wanted: HashSet<&str> = desired.iter().map(|s| s.session_id.as_str()).collect();

    let mut seen = HashSet::new();
    let start = desired
        .iter()
        .filter(|s| !registered.contains(s.session_id.as_str()))
        .filter(|s| !kicked.contains(&s.session_id))
        .filter(|s| seen.insert(s.session_id.clone()))
        .cloned()
        .collect();

    let mut stop: Vec<String> = registered
        .iter()
        .filter(|id| !wanted.contains(*id))
        .map(|id| id.to_string())
        .collect();
    stop.sort();

    let mut keep: Vec<String> = registered
        .iter()
        .filter(|id| wanted.contains(*id))
        .map(|id| id.to_string())
        .collect();
    keep.sort();

    ReconcilePlan { start, stop, keep }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: SessionState,
    pub retry_count: u32,
    pub kicked: bool,
    pub connected: bool,
    pub members: usize,
    pub last_error: Option<String>,
    /// Seconds spent in the current state.
    pub state_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub sessions: Vec<SessionStatus>,
    pub metrics: MetricsSnapshot,
}

struct SessionRecord {
    summary: SessionSummary,
    state: SessionState,
    state_since: Instant,
    retry_count: u32,
    kicked: bool,
    generation: u64,
    agent: Option<Arc<SessionAgent>>,
    cancel: CancellationToken,
    run_task: Option<JoinHandle<()>>,
    leave_guard: Arc<LeaveGuard>,
    last_error: Option<String>,
}

impl SessionRecord {
    fn status(&self, session_id: &str) -> SessionStatus {
        SessionStatus {
            session_id: session_id.to_string(),
            state: self.state,
            retry_count: self.retry_count,
            kicked: self.kicked,
            connected: self.agent.as_ref().is_some_and(|a| a.is_connected()),
            members: self.agent.as_ref().map(|a| a.members().len()).unwrap_or(0),
            last_error: self.last_error.clone(),
            state_secs: self.state_since.elapsed().as_secs(),
        }
    }
}

struct Inner {
    api: Arc<dyn SessionApi>,
    config: SupervisorConfig,
    records: Mutex<HashMap<String, SessionRecord>>,
    kicked: StdMutex<HashSet<String>>,
    registry: RwLock<Registry>,
    session_registries: StdMutex<HashMap<String, Registry>>,
    events: broadcast::Sender<SupervisorEvent>,
    metrics: Arc<SupervisorMetrics>,
    shutdown: CancellationToken,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    /// Removed sessions whose teardown was interrupted before the join.
    detached: StdMutex<Vec<Detached>>,
    generations: AtomicU64,
    started: AtomicBool,
}

/// Handle to the supervisor. Cloning shares it.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A session already removed from the table, with its run task not yet
/// joined.
struct Detached {
    session_id: String,
    last_state: SessionState,
    task: Option<JoinHandle<()>>,
}

/// Joins a [`Detached`] session and retires it. If dropped before the join
/// completes, the session is parked on the supervisor for `stop` to finish.
struct Teardown<'a> {
    sup: &'a Supervisor,
    pending: Option<Detached>,
}

impl Teardown<'_> {
    async fn finish(mut self) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if let Some(task) = pending.task.as_mut() {
            if let Err(e) = task.await {
                error!(session = %pending.session_id, "session task ended abnormally: {}", e);
            }
        }
        if let Some(done) = self.pending.take() {
            self.sup.retire(&done.session_id, done.last_state);
            info!(session = %done.session_id, "session stopped");
        }
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(session = %pending.session_id, "teardown interrupted, parking session task");
            lock(&self.sup.inner.detached).push(pending);
        }
    }
}

impl Supervisor {
    pub fn new(api: Arc<dyn SessionApi>, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                api,
                config,
                records: Mutex::new(HashMap::new()),
                kicked: StdMutex::new(HashSet::new()),
                registry: RwLock::new(Registry::with_builtins()),
                session_registries: StdMutex::new(HashMap::new()),
                events,
                metrics: Arc::new(SupervisorMetrics::new()),
                shutdown: CancellationToken::new(),
                loops: StdMutex::new(Vec::new()),
                detached: StdMutex::new(Vec::new()),
                generations: AtomicU64::new(1),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<SupervisorMetrics> {
        self.inner.metrics.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Start the discovery and reaper loops.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("supervisor already started");
            return;
        }
        let config = &self.inner.config;
        info!(
            mode = ?config.session_mode,
            discovery_secs = config.discovery_interval.as_secs(),
            reaper_secs = config.reaper_interval.as_secs(),
            "starting supervisor"
        );
        let shutdown = self.inner.shutdown.clone();
        let discovery = tokio::spawn(periodic(
            self.downgrade(),
            shutdown.clone(),
            Duration::ZERO,
            config.discovery_interval,
            |sup| async move {
                let _ = sup.discover_once().await;
            },
        ));
        let reaper = tokio::spawn(periodic(
            self.downgrade(),
            shutdown,
            config.reaper_interval,
            config.reaper_interval,
            |sup| async move {
                sup.reap_idle().await;
            },
        ));
        lock(&self.inner.loops).extend([discovery, reaper]);
    }

    /// Stop every loop and every session, and wait for all of their tasks.
    pub async fn stop(&self) {
        info!("stopping supervisor");
        self.inner.shutdown.cancel();
        let loops: Vec<_> = lock(&self.inner.loops).drain(..).collect();
        for handle in loops {
            let _ = handle.await;
        }

        // A loop cancelled mid-tick may have left a removed session unjoined.
        let detached: Vec<_> = lock(&self.inner.detached).drain(..).collect();
        for pending in detached {
            Teardown {
                sup: self,
                pending: Some(pending),
            }
            .finish()
            .await;
        }

        let ids: Vec<String> = self.inner.records.lock().await.keys().cloned().collect();
        for id in ids {
            self.stop_session(&id).await;
        }
        info!("supervisor stopped");
    }

    /// Run until `shutdown` resolves, then stop.
    pub async fn run_until<F: Future<Output = ()>>(&self, shutdown: F) {
        self.start();
        shutdown.await;
        self.stop().await;
    }

    /// Fetch the desired sessions and reconcile against them.
    pub async fn discover_once(&self) -> Result<ReconcilePlan, ApiError> {
        let config = &self.inner.config;
        let desired = self
            .inner
            .api
            .list_sessions(config.session_mode, config.session_limit, &config.lang)
            .await
            .map_err(|e| {
                warn!(kind = %e.kind(), "session discovery failed: {}", concise(&e.to_string()));
                e
            })?;
        debug!(count = desired.len(), "discovered sessions");
        Ok(self.reconcile(desired).await)
    }

    /// Stop sessions that are no longer desired and start new ones, one
    /// stagger interval apart.
    pub async fn reconcile(&self, desired: Vec<SessionSummary>) -> ReconcilePlan {
        let plan = {
            let records = self.inner.records.lock().await;
            let kicked = lock(&self.inner.kicked);
            plan_reconcile(records.keys(), &kicked, &desired)
        };
        if !plan.start.is_empty() || !plan.stop.is_empty() {
            info!(
                start = plan.start.len(),
                stop = plan.stop.len(),
                keep = plan.keep.len(),
                "reconciling sessions"
            );
        }

        for id in &plan.stop {
            self.stop_session(id).await;
        }

        let mut pending = Vec::with_capacity(plan.start.len());
        {
            let mut records = self.inner.records.lock().await;
            for summary in &plan.start {
                if records.contains_key(&summary.session_id) {
                    continue;
                }
                let generation = self.insert_record(&mut records, summary.clone());
                pending.push((summary.session_id.clone(), generation));
            }
        }

        for (i, (id, generation)) in pending.into_iter().enumerate() {
            if i > 0 {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.inner.config.start_stagger) => {}
                }
            }
            self.spawn_session(&id, generation).await;
        }
        plan
    }

    fn insert_record(
        &self,
        records: &mut HashMap<String, SessionRecord>,
        summary: SessionSummary,
    ) -> u64 {
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst);
        let id = summary.session_id.clone();
        records.insert(
            id.clone(),
            SessionRecord {
                summary,
                state: SessionState::Initializing,
                state_since: Instant::now(),
                retry_count: 0,
                kicked: false,
                generation,
                agent: None,
                cancel: self.inner.shutdown.child_token(),
                run_task: None,
                leave_guard: Arc::new(LeaveGuard::new()),
                last_error: None,
            },
        );
        self.inner.metrics.session_started();
        self.emit(SupervisorEvent::StateChanged {
            session_id: id,
            from: None,
            to: SessionState::Initializing,
        });
        generation
    }

    async fn spawn_session(&self, id: &str, generation: u64) {
        let mut records = self.inner.records.lock().await;
        let Some(record) = records.get_mut(id).filter(|r| r.generation == generation) else {
            debug!(session = %id, "record gone before start");
            return;
        };
        let sup = self.clone();
        let cancel = record.cancel.clone();
        let session_id = id.to_string();
        record.run_task = Some(tokio::spawn(async move {
            sup.run_session(session_id, generation, cancel).await;
        }));
    }

    /// Stop one session, wait for its tasks, and forget it.
    pub async fn stop_session(&self, id: &str) -> bool {
        let record = self.inner.records.lock().await.remove(id);
        let Some(mut record) = record else {
            return false;
        };
        record.cancel.cancel();
        Teardown {
            sup: self,
            pending: Some(Detached {
                session_id: id.to_string(),
                last_state: record.state,
                task: record.run_task.take(),
            }),
        }
        .finish()
        .await;
        true
    }

    /// Replace a session's agent with a fresh one and a fresh retry budget.
    /// Sessions we were kicked from are not restarted.
    pub async fn restart_session(&self, id: &str) -> bool {
        let summary = {
            let records = self.inner.records.lock().await;
            match records.get(id) {
                Some(r) if r.kicked => {
                    warn!(session = %id, "not restarting a session we were kicked from");
                    return false;
                }
                Some(r) => r.summary.clone(),
                None => return false,
            }
        };
        self.stop_session(id).await;
        let generation = {
            let mut records = self.inner.records.lock().await;
            if records.contains_key(id) {
                return false;
            }
            self.insert_record(&mut records, summary)
        };
        self.spawn_session(id, generation).await;
        info!(session = %id, "session restarted");
        true
    }

    fn retire(&self, id: &str, last_state: SessionState) {
        self.inner.metrics.session_stopped();
        if last_state != SessionState::Stopped {
            self.emit(SupervisorEvent::StateChanged {
                session_id: id.to_string(),
                from: Some(last_state),
                to: SessionState::Stopped,
            });
        }
        self.emit(SupervisorEvent::Removed {
            session_id: id.to_string(),
        });
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Apply `f` to the record if it is still registered under `generation`.
    /// State changes made by `f` are logged and broadcast.
    async fn with_record<R>(
        &self,
        id: &str,
        generation: u64,
        f: impl FnOnce(&mut SessionRecord) -> R,
    ) -> Option<R> {
        let mut records = self.inner.records.lock().await;
        let record = records.get_mut(id).filter(|r| r.generation == generation)?;
        let before = record.state;
        let out = f(record);
        if record.state != before {
            record.state_since = Instant::now();
            info!(session = %id, from = ?before, to = ?record.state, "session state changed");
            self.emit(SupervisorEvent::StateChanged {
                session_id: id.to_string(),
                from: Some(before),
                to: record.state,
            });
        }
        Some(out)
    }

    /// Remove the record if it is still ours.
    async fn remove_record(&self, id: &str, generation: u64) -> bool {
        let removed = {
            let mut records = self.inner.records.lock().await;
            let ours = records.get(id).is_some_and(|r| r.generation == generation);
            if ours { records.remove(id) } else { None }
        };
        match removed {
            Some(record) => {
                self.retire(id, record.state);
                true
            }
            None => false,
        }
    }

    fn session_registry(&self) -> Registry {
        self.inner
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn build_agent(&self, id: &str, endpoint: String, leave_guard: Arc<LeaveGuard>) -> Arc<SessionAgent> {
        let config = &self.inner.config;
        let mut registry = self.session_registry();
        if let Some(scoped) = lock(&self.inner.session_registries).get(id) {
            registry.merge(scoped);
        }
        let account = &config.account;
        SessionAgent::new(AgentSetup {
            session_id: id.to_string(),
            endpoint,
            identity: AgentIdentity::new(
                account.user_id,
                account.device_id.clone(),
                account.auth_token.clone(),
            ),
            config: config.agent.clone(),
            connection: config.connection.clone(),
            api: self.inner.api.clone(),
            registry,
            leave_guard,
            metrics: self.inner.metrics.clone(),
        })
    }

    /// The per-session retry loop.
    async fn run_session(&self, id: String, generation: u64, cancel: CancellationToken) {
        loop {
            let Some(exit) = self.attempt(&id, generation, &cancel).await else {
                return;
            };

            match exit {
                AgentExit::Cancelled => return,
                AgentExit::Kicked => {
                    lock(&self.inner.kicked).insert(id.clone());
                    self.with_record(&id, generation, |r| {
                        r.kicked = true;
                        r.agent = None;
                        r.state = SessionState::Stopped;
                    })
                    .await;
                    warn!(session = %id, "kicked, session will not be rejoined");
                    return;
                }
                AgentExit::LeftAsLastMember => {
                    self.with_record(&id, generation, |r| r.state = SessionState::Stopped)
                        .await;
                    self.remove_record(&id, generation).await;
                    info!(session = %id, "left as last member, session retired");
                    return;
                }
                AgentExit::Disconnected(_) | AgentExit::ConnectFailed(_) => {}
            }

            let failure = exit.failure();
            let policy = self.inner.config.retry;
            self.with_record(&id, generation, |r| {
                r.agent = None;
                r.state = SessionState::Disconnected;
            })
            .await;
            let delay = self
                .with_record(&id, generation, |r| {
                    if policy.exhausted(r.retry_count) {
                        r.state = SessionState::Failed;
                        return None;
                    }
                    let delay = policy.delay(r.retry_count, failure);
                    r.retry_count += 1;
                    r.state = SessionState::Retrying;
                    Some((delay, r.retry_count))
                })
                .await;

            let Some(delay) = delay else {
                return;
            };
            let Some((delay, attempt)) = delay else {
                self.inner.metrics.session_failed();
                error!(session = %id, attempts = policy.max_attempts, "retry budget exhausted, session failed");
                return;
            };

            self.inner.metrics.retry_scheduled();
            info!(
                session = %id,
                attempt,
                delay = ?delay,
                failure = ?failure,
                "retrying session"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One agent lifetime. `None` when the record disappeared or the session
    /// failed permanently.
    async fn attempt(&self, id: &str, generation: u64, cancel: &CancellationToken) -> Option<AgentExit> {
        let lookup = tokio::select! {
            _ = cancel.cancelled() => return Some(AgentExit::Cancelled),
            lookup = self.inner.api.get_session(id) => lookup,
        };
        let info = match lookup {
            Ok(info) => info,
            Err(e) => return self.lookup_failed(id, generation, e).await,
        };
        let SessionInfo {
            endpoint: Some(endpoint),
            ..
        } = info
        else {
            warn!(session = %id, "session has no endpoint");
            self.with_record(id, generation, |r| {
                r.last_error = Some("session has no endpoint".to_string());
                r.state = SessionState::Failed;
            })
            .await;
            self.inner.metrics.session_failed();
            return None;
        };

        let agent = self
            .with_record(id, generation, |r| {
                let agent = self.build_agent(id, endpoint, r.leave_guard.clone());
                r.agent = Some(agent.clone());
                r.state = SessionState::Connecting;
                agent
            })
            .await?;

        let health_cancel = cancel.child_token();
        let health = tokio::spawn({
            let sup = self.clone();
            let agent = agent.clone();
            let id = id.to_string();
            let token = health_cancel.clone();
            async move { sup.monitor_health(id, generation, agent, token).await }
        });

        let exit = agent.run(cancel.child_token()).await;

        health_cancel.cancel();
        let _ = health.await;

        if let Some(kind) = exit.failure() {
            self.with_record(id, generation, |r| {
                r.last_error = Some(format!("{exit:?}: {kind}"));
            })
            .await;
        }
        Some(exit)
    }

    async fn lookup_failed(&self, id: &str, generation: u64, err: ApiError) -> Option<AgentExit> {
        let kind = err.kind();
        warn!(session = %id, kind = %kind, "session lookup failed: {}", concise(&err.to_string()));
        self.with_record(id, generation, |r| r.last_error = Some(concise(&err.to_string())))
            .await?;
        Some(AgentExit::ConnectFailed(kind))
    }

    async fn monitor_health(
        &self,
        id: String,
        generation: u64,
        agent: Arc<SessionAgent>,
        cancel: CancellationToken,
    ) {
        let poll = self.inner.config.health_poll;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }
            let live = agent.is_connected();
            let still_ours = self
                .with_record(&id, generation, |r| match (r.state, live) {
                    (SessionState::Connecting | SessionState::Disconnected, true) => {
                        r.state = SessionState::Connected;
                        r.retry_count = 0;
                        r.last_error = None;
                    }
                    (SessionState::Connected, false) => {
                        r.state = SessionState::Disconnected;
                    }
                    _ => {}
                })
                .await;
            if still_ours.is_none() {
                break;
            }
        }
    }

    /// Leave and stop every connected session where we are the only member.
    /// Returns the sessions that were left.
    pub async fn reap_idle(&self) -> Vec<String> {
        let candidates: Vec<(String, u64, Arc<SessionAgent>)> = {
            let records = self.inner.records.lock().await;
            records
                .iter()
                .filter(|(_, r)| r.state == SessionState::Connected && !r.kicked)
                .filter_map(|(id, r)| Some((id.clone(), r.generation, r.agent.clone()?)))
                .collect()
        };

        let me = self.inner.config.account.user_id;
        let mut reaped = Vec::new();
        for (id, generation, agent) in candidates {
            let info = match self.inner.api.get_session(&id).await {
                Ok(info) => info,
                Err(e) => {
                    warn!(session = %id, "idle check failed: {}", concise(&e.to_string()));
                    continue;
                }
            };
            let alone = !info.members.is_empty() && info.members.iter().all(|m| *m == me);
            if !alone {
                continue;
            }
            let still_connected = self
                .with_record(&id, generation, |r| r.state == SessionState::Connected && !r.kicked)
                .await
                .unwrap_or(false);
            if !still_connected {
                continue;
            }
            info!(session = %id, "only member left, reaping session");
            if agent.leave_as_last_member().await {
                self.stop_session(&id).await;
                reaped.push(id);
            }
        }
        reaped
    }

    /// Register a command for every session, including running ones.
    pub async fn register_command(&self, name: &str, handler: Arc<dyn CommandHandler>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_command(name, handler.clone());
        for agent in self.running_agents(None).await {
            agent.register_command(name, handler.clone());
        }
    }

    /// Register an event handler for every session, including running ones.
    pub async fn register_event(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_event(kind, handler.clone());
        for agent in self.running_agents(None).await {
            agent.register_event(kind, handler.clone());
        }
    }

    /// Register a command for one session. Survives agent restarts.
    pub async fn register_session_command(&self, session_id: &str, name: &str, handler: Arc<dyn CommandHandler>) {
        lock(&self.inner.session_registries)
            .entry(session_id.to_string())
            .or_default()
            .register_command(name, handler.clone());
        for agent in self.running_agents(Some(session_id)).await {
            agent.register_command(name, handler.clone());
        }
    }

    pub async fn register_session_event(&self, session_id: &str, kind: EventKind, handler: Arc<dyn EventHandler>) {
        lock(&self.inner.session_registries)
            .entry(session_id.to_string())
            .or_default()
            .register_event(kind, handler.clone());
        for agent in self.running_agents(Some(session_id)).await {
            agent.register_event(kind, handler.clone());
        }
    }

    async fn running_agents(&self, only: Option<&str>) -> Vec<Arc<SessionAgent>> {
        let records = self.inner.records.lock().await;
        records
            .iter()
            .filter(|(id, _)| only.is_none_or(|o| o == id.as_str()))
            .filter_map(|(_, r)| r.agent.clone())
            .collect()
    }

    pub async fn agent(&self, session_id: &str) -> Option<Arc<SessionAgent>> {
        self.inner
            .records
            .lock()
            .await
            .get(session_id)
            .and_then(|r| r.agent.clone())
    }

    pub async fn state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.records.lock().await.get(session_id).map(|r| r.state)
    }

    pub async fn status(&self) -> SupervisorStatus {
        let mut sessions: Vec<SessionStatus> = {
            let records = self.inner.records.lock().await;
            records.iter().map(|(id, r)| r.status(id)).collect()
        };
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        SupervisorStatus {
            sessions,
            metrics: self.inner.metrics.snapshot(),
        }
    }
}

/// Run `tick` after `first`, then every `every`, until shutdown or until the
/// supervisor is dropped.
async fn periodic<F, Fut>(
    weak: Weak<Inner>,
    shutdown: CancellationToken,
    first: Duration,
    every: Duration,
    tick: F,
) where
    F: Fn(Supervisor) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut wait = first;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        let Some(inner) = weak.upgrade() else {
            break;
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tick(Supervisor { inner }) => {}
        }
        wait = every;
    }
}
