use std::fmt;

use tokio_tungstenite::tungstenite;

/// Coarse class of a fault, used to scale retry backoff and to keep logs short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// DNS lookup failed; the network is probably down.
    NameResolution,
    Timeout,
    /// Refused, reset, aborted, TLS failure.
    Connection,
    /// The peer answered but not the way we expected.
    Protocol,
}

impl FailureKind {
    /// Whether this is a transient network fault rather than a protocol one.
    pub fn is_network(self) -> bool {
        !matches!(self, FailureKind::Protocol)
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => FailureKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::AddrNotAvailable => FailureKind::Connection,
            _ if looks_like_dns(&err.to_string()) => FailureKind::NameResolution,
            _ => FailureKind::Connection,
        }
    }

    pub fn from_tungstenite(err: &tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io_err) => Self::from_io(io_err),
            tungstenite::Error::Tls(_)
            | tungstenite::Error::ConnectionClosed
            | tungstenite::Error::AlreadyClosed => FailureKind::Connection,
            _ => FailureKind::Protocol,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::NameResolution => "name resolution",
            FailureKind::Timeout => "timeout",
            FailureKind::Connection => "connection",
            FailureKind::Protocol => "protocol",
        };
        f.write_str(s)
    }
}

fn looks_like_dns(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("lookup address")
        || lower.contains("name resolution")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("getaddrinfo")
        || lower.contains("dns")
}

/// Failure opening or using a session socket.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid request header: {0}")]
    InvalidHeader(String),

    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),

    #[error("opening handshake timed out")]
    HandshakeTimeout,

    #[error("connection has been terminated")]
    Terminated,

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Socket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] rave_protocol::ProtocolError),
}

impl ConnectError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ConnectError::HandshakeTimeout => FailureKind::Timeout,
            ConnectError::Socket(e) => FailureKind::from_tungstenite(e),
            ConnectError::Tls(_) | ConnectError::NotConnected | ConnectError::Terminated => {
                FailureKind::Connection
            }
            ConnectError::InvalidEndpoint(_)
            | ConnectError::InvalidHeader(_)
            | ConnectError::Protocol(_) => FailureKind::Protocol,
        }
    }
}

/// Failure talking to the metadata/action collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("request failed ({kind}): {message}")]
    Transport { kind: FailureKind, message: String },

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ApiError::Transport { kind, .. } => *kind,
            ApiError::Status { .. } | ApiError::Decode(_) => FailureKind::Protocol,
        }
    }
}

/// Shorten a fault description for one-line logging.
pub fn concise(message: &str) -> String {
    const LIMIT: usize = 200;
    match message.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}…", &message[..idx]),
        None => message.to_string(),
    }
}
