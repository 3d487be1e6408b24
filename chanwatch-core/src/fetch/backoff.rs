//! Flood-wait penalty and rotation escalation.

use std::time::Duration;

use crate::config::RateLimitConfig;

/// What to do about one rate-limit signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloodDecision {
    /// Wait demanded by upstream
    pub mandated: Duration,
    /// Escalating extra wait
    pub penalty: Duration,
    /// Consecutive events including this one
    pub consecutive: u32,
    /// Escalate to a new connection path before waiting
    pub rotate: bool,
}

impl FloodDecision {
    pub fn total(&self) -> Duration {
        self.mandated + self.penalty
    }
}

/// Tracks consecutive rate-limit events for one fetch stream.
///
/// The penalty for the n-th consecutive event is `min(n * step, cap)`. Any
/// successful page resets the count.
#[derive(Debug, Clone)]
pub struct FloodBackoff {
    step: Duration,
    cap: Duration,
    rotate_after: u32,
    rotate_enabled: bool,
    rotated_wait_cap: Duration,
    consecutive: u32,
}

impl FloodBackoff {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            step: config.penalty_step(),
            cap: config.penalty_cap(),
            rotate_after: config.rotate_after.max(1),
            rotate_enabled: config.rotate_on_flood,
            rotated_wait_cap: config.rotated_wait_cap(),
            consecutive: 0,
        }
    }

    /// Register a rate-limit signal carrying `mandated`.
    pub fn register(&mut self, mandated: Duration) -> FloodDecision {
        self.consecutive = self.consecutive.saturating_add(1);
        let penalty = self.step.saturating_mul(self.consecutive).min(self.cap);
        FloodDecision {
            mandated,
            penalty,
            consecutive: self.consecutive,
            rotate: self.rotate_enabled && self.consecutive >= self.rotate_after,
        }
    }

    /// Wait to apply once a rotation succeeded.
    ///
    /// The new path has not been throttled yet, so the wait is capped and
    /// the escalation starts over.
    pub fn after_rotation(&mut self, decision: &FloodDecision) -> Duration {
        self.consecutive = 0;
        decision.total().min(self.rotated_wait_cap)
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}
