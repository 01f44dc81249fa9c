use std::time::Duration;

use crate::FailureKind;

/// Exponential backoff with a hard cap: `min(base * 1.5^n, cap)`.
///
/// `base` and `cap` are both scaled up when the last failure was a network
/// fault: 5x for name resolution, 2x for timeouts and refused connections.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

const GROWTH: f64 = 1.5;

impl RetryPolicy {
    pub const fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// In-session socket reconnects.
    pub const fn connection() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_millis(12_500), 10)
    }

    /// Whole-agent restarts under the supervisor.
    pub const fn supervisor() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 10)
    }

    pub fn multiplier(failure: Option<FailureKind>) -> f64 {
        match failure {
            Some(FailureKind::NameResolution) => 5.0,
            Some(FailureKind::Timeout) | Some(FailureKind::Connection) => 2.0,
            Some(FailureKind::Protocol) | None => 1.0,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32, failure: Option<FailureKind>) -> Duration {
        let scale = Self::multiplier(failure);
        let cap = self.cap.as_secs_f64() * scale;
        let raw = self.base.as_secs_f64() * scale * GROWTH.powi(attempt.min(64) as i32);
        Duration::from_secs_f64(raw.min(cap))
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::supervisor()
    }
}
