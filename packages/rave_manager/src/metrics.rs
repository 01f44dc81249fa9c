//! Supervisor metrics for observability
//!
//! Counters shared by the supervisor, its agents and their connections.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    // Session lifecycle
    /// Sessions with a live record
    pub active_sessions: AtomicU64,
    /// Records created since start
    pub sessions_started: AtomicU64,
    /// Records retired (stopped, kicked, left)
    pub sessions_stopped: AtomicU64,
    /// Records that ran out of retries
    pub sessions_failed: AtomicU64,
    /// Agent restarts scheduled
    pub retries_scheduled: AtomicU64,

    // Connection metrics
    /// Sockets opened successfully
    pub connections_opened: AtomicU64,
    /// Connect attempts that failed
    pub connect_failures: AtomicU64,
    /// Effective disconnect teardowns
    pub teardowns: AtomicU64,

    // Message metrics
    pub requests_sent: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub notifications_sent: AtomicU64,
    pub frames_received: AtomicU64,
    /// Malformed or non-text frames
    pub frames_dropped: AtomicU64,

    // Handler metrics
    pub commands_dispatched: AtomicU64,
    pub handler_errors: AtomicU64,

    start_time: Option<Instant>,
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_started(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    /// Failed records stay registered, so the active gauge is untouched.
    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retry_scheduled(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connect_failed(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn teardown(&self) {
        self.teardowns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_timed_out(&self) {
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notification_sent(&self) {
        self.notifications_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                started: self.sessions_started.load(Ordering::Relaxed),
                stopped: self.sessions_stopped.load(Ordering::Relaxed),
                failed: self.sessions_failed.load(Ordering::Relaxed),
                retries: self.retries_scheduled.load(Ordering::Relaxed),
            },
            connections: ConnectionMetrics {
                opened: self.connections_opened.load(Ordering::Relaxed),
                failed: self.connect_failures.load(Ordering::Relaxed),
                teardowns: self.teardowns.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                requests_sent: self.requests_sent.load(Ordering::Relaxed),
                requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
                notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
                frames_received: self.frames_received.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            handlers: HandlerMetrics {
                commands: self.commands_dispatched.load(Ordering::Relaxed),
                errors: self.handler_errors.load(Ordering::Relaxed),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub connections: ConnectionMetrics,
    pub messages: MessageMetrics,
    pub handlers: HandlerMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub started: u64,
    pub stopped: u64,
    pub failed: u64,
    pub retries: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub opened: u64,
    pub failed: u64,
    pub teardowns: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub requests_sent: u64,
    pub requests_timed_out: u64,
    pub notifications_sent: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerMetrics {
    pub commands: u64,
    pub errors: u64,
}
