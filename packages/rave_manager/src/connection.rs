//! One persistent socket to one session.
//!
//! A [`Connection`] owns the socket, a table of requests waiting for their
//! response, a keepalive task and a read task. Everything read off the socket
//! that is not a response to one of our requests is handed to the owner, in
//! arrival order, over the event channel returned by [`Connection::new`].
//!
//! Flags: `connected` is true while the socket is usable; `terminated` is a
//! one-way latch set by [`Connection::disconnect`]. The two are never both
//! true: `connected` is cleared before `terminated` is set, and a socket that
//! finishes its handshake after termination is closed instead of published.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rave_protocol::{
    IdGenerator, Message, Notification, PeerId, Request, Response, client_ping, decode, encode,
    fully_joined,
};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as HandshakeRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::concise;
use crate::metrics::SupervisorMetrics;
use crate::{ConnectError, FailureKind};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;

pub const SUBPROTOCOL: &str = "protoo";
pub const API_VERSION: &str = "4";
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code used when the room removed us.
pub const CLOSE_KICKED: u16 = 4003;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    /// Host name, `host:port`, or a full `ws://` / `wss://` URL.
    pub endpoint: String,
    pub session_id: String,
    pub peer_id: PeerId,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Delay before the first keepalive, and between keepalives.
    pub ping_interval: Duration,
    /// How long `send_request` waits for its response.
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Policy for [`Connection::reconnect`].
    pub reconnect: RetryPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            request_timeout: Duration::from_secs(8),
            handshake_timeout: Duration::from_secs(15),
            reconnect: RetryPolicy::connection(),
        }
    }
}

/// What the connection reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// A socket was opened and published.
    Connected,
    /// A frame that was not a response to one of our pending requests.
    Message(Message),
    /// A connect attempt failed.
    Error { kind: FailureKind, message: String },
    /// The socket dropped on its own. Never sent after `disconnect`.
    Closed { failure: Option<FailureKind> },
}

/// Result of [`Connection::send_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    Response(Response),
    TimedOut,
    /// The connection was not usable, or closed while waiting.
    Unavailable,
}

impl RequestOutcome {
    pub fn into_response(self) -> Option<Response> {
        match self {
            RequestOutcome::Response(r) => Some(r),
            _ => None,
        }
    }
}

/// Build the socket URL: `wss://{endpoint}:443/?roomId=..&peerId=..`.
///
/// An endpoint that already names a `ws`/`wss` scheme keeps it, and an
/// explicit port is kept as given.
pub fn build_url(endpoint: &str, session_id: &str, peer_id: &PeerId) -> Result<String, ConnectError> {
    let endpoint = endpoint.trim();
    let (scheme, rest) = match endpoint.split_once("://") {
        Some((scheme @ ("ws" | "wss"), rest)) => (scheme, rest),
        Some(_) => return Err(ConnectError::InvalidEndpoint(endpoint.to_string())),
        None => ("wss", endpoint),
    };
    let rest = rest.trim_end_matches('/');
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    if authority.is_empty() {
        return Err(ConnectError::InvalidEndpoint(endpoint.to_string()));
    }
    let port = if has_port(authority) { "" } else { ":443" };
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("roomId", session_id)
        .append_pair("peerId", peer_id.as_str())
        .finish();
    Ok(format!("{scheme}://{authority}{port}{path}/?{query}"))
}

fn has_port(authority: &str) -> bool {
    authority
        .rsplit_once(':')
        .is_some_and(|(_, port)| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()))
}

fn build_request(url: &str, auth_token: &str) -> Result<HandshakeRequest, ConnectError> {
    let mut request = url.into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(SUBPROTOCOL));
    headers.insert("API-Version", HeaderValue::from_static(API_VERSION));
    if !auth_token.is_empty() {
        let bearer = HeaderValue::from_str(&format!("Bearer {auth_token}"))
            .map_err(|e| ConnectError::InvalidHeader(e.to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
    }
    Ok(request)
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Tasks {
    cancel: CancellationToken,
    ping: Option<JoinHandle<()>>,
    read: Option<JoinHandle<()>>,
}

impl Tasks {
    /// Cancel and hand back the current tasks for awaiting.
    fn take(&mut self) -> Vec<JoinHandle<()>> {
        self.cancel.cancel();
        self.ping.take().into_iter().chain(self.read.take()).collect()
    }
}

type PendingTable = StdMutex<HashMap<u64, oneshot::Sender<Response>>>;

struct Inner {
    target: ConnectTarget,
    options: ConnectionOptions,
    ids: IdGenerator,
    connected: AtomicBool,
    terminated: AtomicBool,
    retry_count: AtomicU32,
    pending: PendingTable,
    sink: Mutex<Option<WsSink>>,
    tasks: StdMutex<Tasks>,
    /// Serializes teardown against itself and against publishing a new socket.
    teardown: Mutex<()>,
    /// Cancelled once `terminated` is latched.
    terminated_signal: CancellationToken,
    last_failure: StdMutex<Option<FailureKind>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    metrics: Arc<SupervisorMetrics>,
}

/// Handle to one session socket. Cloning shares the socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        target: ConnectTarget,
        options: ConnectionOptions,
        metrics: Arc<SupervisorMetrics>,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            target,
            options,
            ids: IdGenerator::new(),
            connected: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            pending: StdMutex::new(HashMap::new()),
            sink: Mutex::new(None),
            tasks: StdMutex::new(Tasks::default()),
            teardown: Mutex::new(()),
            terminated_signal: CancellationToken::new(),
            last_failure: StdMutex::new(None),
            events,
            metrics,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    pub fn session_id(&self) -> &str {
        &self.inner.target.session_id
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.inner.target.peer_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Resolves once the connection has been torn down by `disconnect`.
    pub async fn terminated(&self) {
        self.inner.terminated_signal.cancelled().await
    }

    /// Classification of the most recent connect or read failure.
    pub fn last_failure(&self) -> Option<FailureKind> {
        *lock(&self.inner.last_failure)
    }

    /// Requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Open the socket and perform the `fullyJoined` handshake.
    ///
    /// Never returns an error: failures are logged, classified into
    /// [`Connection::last_failure`], and reported as
    /// [`ConnectionEvent::Error`].
    pub async fn connect(&self) -> bool {
        if self.is_connected() {
            warn!(session = %self.session_id(), "already connected");
            return true;
        }
        if self.is_terminated() {
            error!(session = %self.session_id(), "connection terminated, cannot connect");
            return false;
        }

        if let Err(e) = self.open().await {
            self.report_failure(&e);
            return false;
        }

        let (method, data) = fully_joined();
        match self.send_request(method, data).await {
            RequestOutcome::Response(r) if r.ok => {
                debug!(session = %self.session_id(), "fullyJoined acknowledged");
            }
            RequestOutcome::Response(r) => {
                warn!(
                    session = %self.session_id(),
                    code = ?r.error_code,
                    reason = ?r.error_reason,
                    "fullyJoined rejected"
                );
            }
            RequestOutcome::TimedOut => {
                warn!(session = %self.session_id(), "fullyJoined timed out");
            }
            RequestOutcome::Unavailable => {
                warn!(session = %self.session_id(), "connection dropped during fullyJoined");
            }
        }
        true
    }

    async fn open(&self) -> Result<(), ConnectError> {
        let inner = &self.inner;
        let target = &inner.target;
        let url = build_url(&target.endpoint, &target.session_id, &target.peer_id)?;
        let request = build_request(&url, &target.auth_token)?;
        let connector = if url.starts_with("wss://") {
            Some(crate::tls::insecure_connector()?)
        } else {
            None
        };

        debug!(session = %target.session_id, url = %url, "connecting");
        let (socket, _) = tokio::time::timeout(
            inner.options.handshake_timeout,
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| ConnectError::HandshakeTimeout)??;
        let (mut sink, stream) = socket.split();

        let _teardown = inner.teardown.lock().await;
        if inner.terminated.load(Ordering::SeqCst) {
            let _ = sink.close().await;
            return Err(ConnectError::Terminated);
        }

        // Reap the tasks of a previous socket before publishing this one.
        let stale = lock(&inner.tasks).take();
        for handle in stale {
            let _ = handle.await;
        }

        *inner.sink.lock().await = Some(sink);
        let cancel = CancellationToken::new();
        inner.connected.store(true, Ordering::SeqCst);
        inner.retry_count.store(0, Ordering::SeqCst);
        *lock(&inner.last_failure) = None;

        let read = tokio::spawn(read_loop(inner.clone(), stream, cancel.clone()));
        let ping = tokio::spawn(ping_loop(inner.clone(), cancel.clone()));
        *lock(&inner.tasks) = Tasks {
            cancel,
            ping: Some(ping),
            read: Some(read),
        };

        inner.metrics.connection_opened();
        info!(session = %target.session_id, "connected");
        let _ = inner.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    fn report_failure(&self, err: &ConnectError) {
        let kind = err.kind();
        *lock(&self.inner.last_failure) = Some(kind);
        self.inner.metrics.connect_failed();
        let message = concise(&err.to_string());
        if kind.is_network() {
            warn!(session = %self.session_id(), kind = %kind, "connect failed: {}", message);
        } else {
            error!(session = %self.session_id(), kind = %kind, "connect failed: {}", message);
        }
        let _ = self
            .inner
            .events
            .send(ConnectionEvent::Error { kind, message });
    }

    /// Send a request and wait for its response.
    ///
    /// The waiter is removed from the pending table on every exit path,
    /// including when the returned future is dropped.
    pub async fn send_request(&self, method: &str, data: Value) -> RequestOutcome {
        let inner = &self.inner;
        if !inner.is_usable() {
            debug!(session = %self.session_id(), method, "not connected, request not sent");
            return RequestOutcome::Unavailable;
        }

        let id = inner.ids.next_id();
        let (tx, rx) = oneshot::channel();
        let _waiter = PendingGuard::register(&inner.pending, id, tx);

        if let Err(e) = inner.write_frame(&Request::new(id, method, data)).await {
            debug!(session = %self.session_id(), method, error = %e, "request not sent");
            return RequestOutcome::Unavailable;
        }
        inner.metrics.request_sent();

        match tokio::time::timeout(inner.options.request_timeout, rx).await {
            Ok(Ok(response)) => RequestOutcome::Response(response),
            Ok(Err(_)) => RequestOutcome::Unavailable,
            Err(_) => {
                warn!(session = %self.session_id(), method, id, "request timed out");
                inner.metrics.request_timed_out();
                RequestOutcome::TimedOut
            }
        }
    }

    /// Fire-and-forget. Returns whether the frame was written.
    pub async fn send_notification(&self, notification: &Notification) -> bool {
        let inner = &self.inner;
        if !inner.is_usable() {
            debug!(
                session = %self.session_id(),
                method = %notification.method,
                "not connected, notification dropped"
            );
            return false;
        }
        match inner.write_frame(notification).await {
            Ok(()) => {
                inner.metrics.notification_sent();
                true
            }
            Err(e) => {
                debug!(
                    session = %self.session_id(),
                    method = %notification.method,
                    error = %e,
                    "notification not sent"
                );
                false
            }
        }
    }

    /// Tear the connection down for good.
    ///
    /// Concurrent and repeated calls collapse into one teardown; the return
    /// value says whether this call performed it.
    pub async fn disconnect(&self, code: u16, reason: &str) -> bool {
        let inner = &self.inner;
        let _teardown = inner.teardown.lock().await;
        if inner.terminated.load(Ordering::SeqCst) {
            return false;
        }
        inner.connected.store(false, Ordering::SeqCst);
        inner.terminated.store(true, Ordering::SeqCst);
        inner.terminated_signal.cancel();

        let tasks = lock(&inner.tasks).take();
        for handle in tasks {
            let _ = handle.await;
        }
        lock(&inner.pending).clear();

        let sink = inner.sink.lock().await.take();
        if let Some(mut sink) = sink {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            };
            match sink.send(WsMessage::Close(Some(frame))).await {
                Ok(())
                | Err(tungstenite::Error::ConnectionClosed)
                | Err(tungstenite::Error::AlreadyClosed) => {}
                Err(e) => debug!(session = %self.session_id(), error = %e, "error closing socket"),
            }
        }

        inner.metrics.teardown();
        info!(session = %self.session_id(), code, reason, "disconnected");
        true
    }

    /// Reopen a dropped socket with backoff, until it succeeds, the attempt
    /// budget runs out, or the connection is terminated.
    pub async fn reconnect(&self) -> bool {
        let policy = self.inner.options.reconnect;
        loop {
            if self.is_terminated() {
                warn!(session = %self.session_id(), "connection terminated, cannot reconnect");
                return false;
            }
            if self.is_connected() {
                return true;
            }
            let attempt = self.inner.retry_count.load(Ordering::SeqCst);
            if policy.exhausted(attempt) {
                error!(session = %self.session_id(), attempts = attempt, "max reconnect attempts reached");
                return false;
            }
            let delay = policy.delay(attempt, None);
            self.inner.retry_count.fetch_add(1, Ordering::SeqCst);
            info!(
                session = %self.session_id(),
                attempt = attempt + 1,
                delay = ?delay,
                "reconnecting"
            );
            tokio::time::sleep(delay).await;
            if self.connect().await {
                return true;
            }
        }
    }
}

impl Inner {
    fn is_usable(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.terminated.load(Ordering::SeqCst)
    }

    async fn write_frame<T: Serialize>(&self, frame: &T) -> Result<(), ConnectError> {
        let text = encode(frame)?;
        let mut sink = self.sink.lock().await;
        if !self.is_usable() {
            return Err(ConnectError::NotConnected);
        }
        let Some(sink) = sink.as_mut() else {
            return Err(ConnectError::NotConnected);
        };
        sink.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    fn route(&self, text: &str) {
        self.metrics.frame_received();
        match decode(text) {
            Ok(Message::Response(response)) => {
                let waiter = lock(&self.pending).remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => {
                        let _ = self
                            .events
                            .send(ConnectionEvent::Message(Message::Response(response)));
                    }
                }
            }
            Ok(message) => {
                let _ = self.events.send(ConnectionEvent::Message(message));
            }
            Err(e) => {
                warn!(session = %self.target.session_id, "dropping malformed frame: {}", e);
                self.metrics.frame_dropped();
            }
        }
    }

    fn mark_dropped(&self, failure: Option<FailureKind>) {
        self.connected.store(false, Ordering::SeqCst);
        lock(&self.pending).clear();
        if let Some(kind) = failure {
            *lock(&self.last_failure) = Some(kind);
        }
        let _ = self.events.send(ConnectionEvent::Closed { failure });
    }
}

/// Removes a pending waiter when dropped.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl<'a> PendingGuard<'a> {
    fn register(table: &'a PendingTable, id: u64, tx: oneshot::Sender<Response>) -> Self {
        lock(table).insert(id, tx);
        Self { table, id }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

async fn read_loop(inner: Arc<Inner>, mut stream: SplitStream<WsStream>, cancel: CancellationToken) {
    let session = inner.target.session_id.clone();
    let failure = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(WsMessage::Text(text))) => inner.route(&text),
            Some(Ok(WsMessage::Binary(bytes))) => {
                warn!(session = %session, len = bytes.len(), "dropping binary frame");
                inner.metrics.frame_dropped();
            }
            Some(Ok(WsMessage::Close(frame))) => {
                info!(session = %session, frame = ?frame, "server closed the connection");
                break None;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                let kind = FailureKind::from_tungstenite(&e);
                warn!(session = %session, kind = %kind, "read failed: {}", concise(&e.to_string()));
                break Some(kind);
            }
            None => break None,
        }
    };
    if cancel.is_cancelled() {
        return;
    }
    inner.mark_dropped(failure);
}

async fn ping_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(inner.options.ping_interval) => {}
        }
        if !inner.is_usable() {
            break;
        }
        let (method, data) = client_ping();
        let request = Request::new(inner.ids.next_id(), method, data);
        if let Err(e) = inner.write_frame(&request).await {
            warn!(session = %inner.target.session_id, "ping failed: {}", e);
            break;
        }
        debug!(session = %inner.target.session_id, id = request.id, "sent ping");
    }
}
