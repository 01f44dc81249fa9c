//! Rave Manager - keeps a bot present in many protoo sessions at once
//!
//! Layers, leaves first:
//!
//! - [`connection`]: one socket per session, request/response correlation,
//!   keepalive pings, idempotent teardown.
//! - [`agent`]: one connection plus membership tracking, reply correlation
//!   and command/event dispatch.
//! - [`registry`]: handler traits and the registration object copied into
//!   each agent.
//! - [`supervisor`]: discovery, per-session retry with backoff, health
//!   monitoring and the idle reaper.
//!
//! The REST side (listing sessions, resolving users, leaving, uploads) is the
//! [`SessionApi`] trait; the binary supplies the HTTP implementation.

pub mod agent;
pub mod api;
pub mod backoff;
pub mod connection;
mod error;
pub mod metrics;
pub mod registry;
pub mod supervisor;
pub mod tls;

pub use agent::{AgentConfig, AgentExit, AgentIdentity, LeaveGuard, MessageInfo, SessionAgent};
pub use api::{MediaFile, SessionApi, SessionInfo, SessionMode, SessionSummary, UserProfile};
pub use backoff::RetryPolicy;
pub use connection::{Connection, ConnectionEvent, ConnectionOptions, RequestOutcome};
pub use error::{ApiError, ConnectError, FailureKind, concise};
pub use metrics::{MetricsSnapshot, SupervisorMetrics};
pub use registry::{
    AgentEvent, CommandContext, CommandHandler, EventContext, EventHandler, EventKind, Registry,
    command_fn, event_fn, sync_command, sync_event,
};
pub use supervisor::{
    Account, SessionState, SessionStatus, Supervisor, SupervisorConfig, SupervisorEvent,
    SupervisorStatus,
};
