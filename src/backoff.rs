//! Bounded exponential backoff with jitter.
//!
//! A single policy type is shared by container operations, task resource
//! provisioning and the status sender so every retry loop in the agent has the
//! same shape: a capped number of attempts, exponentially growing delays
//! clamped to a ceiling, and a symmetric jitter band.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Retry policy: attempt budget plus delay curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor applied per failed attempt
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Policy for container runtime operations (pull/create/start/stop/remove)
    pub fn container_operations() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 15_000,
            ..Self::default()
        }
    }

    /// Policy for task resource provisioning and release
    pub fn task_resources() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 20_000,
            ..Self::default()
        }
    }

    /// Policy for state change delivery to the control plane
    pub fn status_delivery() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 250,
            max_delay_ms: 60_000,
            ..Self::default()
        }
    }

    /// Policy for resubscribing to the runtime event stream. Only the delay
    /// is used: resubscription never gives up.
    pub fn event_stream() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            ..Self::default()
        }
    }

    /// Whether `attempts` failed attempts have used up the budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts.max(1)
    }

    /// Delay to wait after the `attempt`-th failure (1-based), before jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let multiplier = self.multiplier.max(1.0).powi(exponent);
        let delay_ms = (self.base_delay_ms as f64 * multiplier).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Delay to wait after the `attempt`-th failure (1-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }

        let factor = 1.0 + (rand::random::<f64>() - 0.5) * 2.0 * jitter;
        let jittered = Duration::from_millis((delay.as_millis() as f64 * factor) as u64);
        jittered.min(Duration::from_millis(self.max_delay_ms))
    }
}

/// Per-entity retry bookkeeping.
///
/// Attempts are counted per target status: moving on to a new target (for
/// example from `Running` to `Stopped`) starts a fresh budget.
#[derive(Debug, Clone)]
pub struct RetryState<T> {
    target: Option<T>,
    attempts: u32,
    next_attempt_at: Option<Instant>,
}

impl<T> Default for RetryState<T> {
    fn default() -> Self {
        Self {
            target: None,
            attempts: 0,
            next_attempt_at: None,
        }
    }
}

impl<T: Copy + PartialEq> RetryState<T> {
    /// Record a failed attempt toward `target`, returning the attempt count
    pub fn record_failure(&mut self, target: T) -> u32 {
        if self.target != Some(target) {
            self.target = Some(target);
            self.attempts = 0;
        }
        self.attempts += 1;
        self.attempts
    }

    /// Hold off further attempts until `at`
    pub fn schedule(&mut self, at: Instant) {
        self.next_attempt_at = Some(at);
    }

    /// Whether a scheduled retry is still in the future
    pub fn is_waiting(&self, now: Instant) -> bool {
        self.next_attempt_at.is_some_and(|at| at > now)
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    pub fn clear_schedule(&mut self) {
        self.next_attempt_at = None;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
