#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rave_manager::agent::AgentSetup;
use rave_manager::{
    AgentConfig, AgentIdentity, ApiError, ConnectionOptions, FailureKind, LeaveGuard, MediaFile,
    Registry, RetryPolicy, SessionApi, SessionInfo, SessionMode, SessionSummary,
    SupervisorMetrics, UserProfile,
};
use rave_protocol::{MediaAttachment, UserId};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;

pub const WAIT: Duration = Duration::from_secs(5);

pub enum ServerCommand {
    Text(String),
    Binary(Vec<u8>),
    Close,
    /// Drop the TCP stream without a close handshake.
    Drop,
}

#[derive(Debug, Clone, Default)]
pub struct Handshake {
    pub uri: String,
    pub protocol: Option<String>,
    pub authorization: Option<String>,
    pub api_version: Option<String>,
}

/// In-process protoo room. Answers every request with `ok` unless its
/// method is in the silent set, and reports every frame the client sends.
/// Close frames are reported as `{"close": code}`.
pub struct MockServer {
    pub addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<Value>,
    commands: mpsc::UnboundedSender<ServerCommand>,
    connections: Arc<AtomicUsize>,
    handshakes: Arc<StdMutex<Vec<Handshake>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::with_silent(&[]).await
    }

    pub async fn with_silent(methods: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let commands_rx = Arc::new(Mutex::new(commands_rx));
        let connections = Arc::new(AtomicUsize::new(0));
        let handshakes = Arc::new(StdMutex::new(Vec::new()));
        let silent: Arc<HashSet<String>> = Arc::new(methods.iter().map(|m| m.to_string()).collect());

        let task = tokio::spawn({
            let connections = connections.clone();
            let handshakes = handshakes.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        stream,
                        frames_tx.clone(),
                        commands_rx.clone(),
                        silent.clone(),
                        handshakes.clone(),
                    ));
                }
            }
        });

        Self {
            addr,
            frames,
            commands,
            connections,
            handshakes,
            task,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.commands.send(ServerCommand::Text(text.into()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        let _ = self.commands.send(ServerCommand::Binary(bytes));
    }

    pub fn close(&self) {
        let _ = self.commands.send(ServerCommand::Close);
    }

    pub fn drop_connection(&self) {
        let _ = self.commands.send(ServerCommand::Drop);
    }

    pub async fn next_frame(&mut self) -> Value {
        tokio::time::timeout(WAIT, self.frames.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("server stopped")
    }

    /// Next frame carrying `method`, skipping keepalives and anything else.
    pub async fn next_method(&mut self, method: &str) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame["method"] == method {
                return frame;
            }
        }
    }

    /// Next close frame the client sent, skipping everything else.
    pub async fn next_close(&mut self) -> Value {
        loop {
            let frame = self.next_frame().await;
            if frame.get("close").is_some() {
                return frame;
            }
        }
    }

    /// Frames received so far, without waiting.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            out.push(frame);
        }
        out
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    stream: tokio::net::TcpStream,
    frames: mpsc::UnboundedSender<Value>,
    commands: Arc<Mutex<mpsc::UnboundedReceiver<ServerCommand>>>,
    silent: Arc<HashSet<String>>,
    handshakes: Arc<StdMutex<Vec<Handshake>>>,
) {
    let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        handshakes.lock().unwrap().push(Handshake {
            uri: req.uri().to_string(),
            protocol: header("Sec-WebSocket-Protocol"),
            authorization: header("Authorization"),
            api_version: header("API-Version"),
        });
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("protoo"));
        Ok(resp)
    };
    let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let mut commands = commands.lock().await;

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
                    if value["request"] == true {
                        let method = value["method"].as_str().unwrap_or_default();
                        if !silent.contains(method) {
                            let reply = json!({"response": true, "id": value["id"], "ok": true, "data": {}});
                            let _ = sink.send(Message::Text(reply.to_string().into())).await;
                        }
                    }
                    let _ = frames.send(value);
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map(|f| u16::from(f.code));
                    let _ = frames.send(json!({"close": code}));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
            command = commands.recv() => match command {
                Some(ServerCommand::Text(text)) => {
                    let _ = sink.send(Message::Text(text.into())).await;
                }
                Some(ServerCommand::Binary(bytes)) => {
                    let _ = sink.send(Message::Binary(bytes.into())).await;
                }
                Some(ServerCommand::Close) => {
                    let _ = sink.send(Message::Close(None)).await;
                }
                Some(ServerCommand::Drop) | None => break,
            },
        }
    }
}

/// A port nothing listens on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}")
}

pub fn state_frame(users: &[UserId]) -> Value {
    let users: Vec<Value> = users
        .iter()
        .enumerate()
        .map(|(i, id)| json!({"user_id": id, "when_joined": 1700000000.0, "is_leader": i == 0, "order": i}))
        .collect();
    let state = json!({"mesh_state": {"status": "playing"}, "users": users, "votes": []});
    json!({
        "data": {"message": state.to_string()},
        "method": "stateMessage",
        "notification": true
    })
}

pub fn chat_frame(from: &str, id: &str, text: &str, reply: Option<&str>) -> Value {
    let mut data = json!({"chat": text, "from": from, "id": id});
    if let Some(reply) = reply {
        data["reply"] = json!(reply);
    }
    json!({"data": data, "method": "chatMessage", "notification": true})
}

pub fn kicked_frame() -> Value {
    json!({"data": {}, "method": "kicked", "notification": true})
}

/// In-memory stand-in for the REST collaborator.
#[derive(Default)]
pub struct FakeApi {
    pub sessions: StdMutex<Vec<SessionSummary>>,
    /// Session id to endpoint; unknown sessions have none.
    pub endpoints: StdMutex<HashMap<String, String>>,
    pub members: StdMutex<HashMap<String, Vec<UserId>>>,
    pub names: StdMutex<HashMap<UserId, String>>,
    pub leaves: StdMutex<Vec<(String, String)>>,
    pub lookups: StdMutex<Vec<(String, tokio::time::Instant)>>,
    pub fail_lookups: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_endpoint(&self, session: &str, endpoint: &str) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(session.to_string(), endpoint.to_string());
    }

    pub fn set_members(&self, session: &str, members: &[UserId]) {
        self.members
            .lock()
            .unwrap()
            .insert(session.to_string(), members.to_vec());
    }

    pub fn set_name(&self, user: UserId, name: &str) {
        self.names.lock().unwrap().insert(user, name.to_string());
    }

    pub fn leave_count(&self) -> usize {
        self.leaves.lock().unwrap().len()
    }

    pub fn lookups_for(&self, session: &str) -> Vec<tokio::time::Instant> {
        self.lookups
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == session)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl SessionApi for FakeApi {
    async fn list_sessions(
        &self,
        _mode: SessionMode,
        limit: usize,
        _lang: &str,
    ) -> Result<Vec<SessionSummary>, ApiError> {
        Ok(self.sessions.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ApiError> {
        self.lookups
            .lock()
            .unwrap()
            .push((session_id.to_string(), tokio::time::Instant::now()));
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(ApiError::Transport {
                kind: FailureKind::Timeout,
                message: "lookup timed out".into(),
            });
        }
        Ok(SessionInfo {
            endpoint: self.endpoints.lock().unwrap().get(session_id).cloned(),
            members: self
                .members
                .lock()
                .unwrap()
                .get(session_id)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>, ApiError> {
        let names = self.names.lock().unwrap();
        Ok(ids
            .iter()
            .filter_map(|id| {
                names.get(id).map(|name| UserProfile {
                    id: *id,
                    display_name: name.clone(),
                    raw: Value::Null,
                })
            })
            .collect())
    }

    async fn leave_session(&self, session_id: &str, device_id: &str) -> Result<bool, ApiError> {
        self.leaves
            .lock()
            .unwrap()
            .push((session_id.to_string(), device_id.to_string()));
        Ok(true)
    }

    async fn upload_media(
        &self,
        session_id: &str,
        files: Vec<MediaFile>,
    ) -> Result<Vec<MediaAttachment>, ApiError> {
        Ok(files
            .into_iter()
            .map(|f| MediaAttachment {
                url: format!("https://cdn.example.com/{session_id}/{}", f.file_name),
                mime: "image/png".into(),
                is_explicit: f.is_explicit,
                aspect_ratio: "1:1".into(),
                thumbnail_url: String::new(),
            })
            .collect())
    }
}

pub const SELF_ID: UserId = 1000;

pub fn fast_connection() -> ConnectionOptions {
    ConnectionOptions {
        ping_interval: Duration::from_secs(15),
        request_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_secs(2),
        reconnect: RetryPolicy::new(Duration::from_millis(20), Duration::from_millis(50), 3),
    }
}

pub fn agent_setup(api: Arc<FakeApi>, endpoint: String, registry: Registry) -> AgentSetup {
    AgentSetup {
        session_id: "room-1".into(),
        endpoint,
        identity: AgentIdentity::new(SELF_ID, "device-1", "token-1"),
        config: AgentConfig::default(),
        connection: fast_connection(),
        api,
        registry,
        leave_guard: Arc::new(LeaveGuard::new()),
        metrics: Arc::new(SupervisorMetrics::new()),
    }
}

/// Receive with a deadline.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("channel closed")
}

/// Poll `check` until it holds or the deadline passes.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
