//! Retry and backoff policy shared by the session manager and dispatcher.
//!
//! Failure handling in the control plane follows one rule: classify at the
//! point of occurrence, decide at the reconciler. This library provides the
//! pieces both ends need:
//!
//! - [`ErrorClass`]: the transient/permanent split every remote error maps
//!   into.
//! - [`BackoffPolicy`]: exponential delay schedule with a ceiling, after
//!   which a transient failure escalates (e.g., to "unreachable").
//! - [`BackoffState`] / [`RetryTracker`]: attempt bookkeeping for a single
//!   slot or a keyed set of resources.
//!
//! Delays are suggestions for requeueing, never inline sleeps: workers are
//! re-invoked after the delay rather than blocked.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand::Rng;

/// Classification of a failure for retry purposes.
///
/// Transient failures (timeouts, refused connections, transport resets) are
/// retried with backoff up to the policy ceiling. Permanent failures (auth
/// rejected, conflicting fault, malformed spec) are surfaced to status and
/// never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl ErrorClass {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Exponential backoff schedule.
///
/// `ceiling_attempts` is the number of consecutive transient failures after
/// which the caller escalates instead of retrying at full frequency. It is
/// operator-tunable configuration, never hardcoded at call sites.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub initial_delay: Duration,

    /// Cap applied to the exponential growth.
    pub max_delay: Duration,

    /// Multiplier applied per consecutive failure.
    pub multiplier: f64,

    /// Consecutive failures before escalation (0 = never escalate).
    pub ceiling_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            ceiling_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given 1-based attempt number, exponential and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(raw.min(self.max_delay.as_secs_f64()))
    }

    /// [`Self::delay_for`] with 0.5x–1.5x jitter to avoid thundering herds
    /// when many resources fail at once.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        let jitter = rand::rng().random_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter)
    }

    /// Whether the attempt count has reached the escalation ceiling.
    pub fn exhausted(&self, attempts: u32) -> bool {
        self.ceiling_attempts > 0 && attempts >= self.ceiling_attempts
    }
}

/// Consecutive-failure counter for a single slot (one machine's session).
#[derive(Debug, Clone, Default)]
pub struct BackoffState {
    attempts: u32,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; returns the new attempt count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Clear the counter on success.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Windowed failure tracker for a keyed set of resources.
///
/// Failures older than the window are forgotten, so a resource that fails
/// once an hour never escalates.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    window: Duration,
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a key; returns the attempt count within the
    /// current window.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let now = Instant::now();

        let (count, first) = self.failures.entry(key.to_string()).or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count
    }

    /// Attempt count within the current window, without recording.
    pub fn attempts(&self, key: &str) -> u32 {
        let Some((count, first)) = self.failures.get(key) else {
            return 0;
        };

        if Instant::now().duration_since(*first) > self.window {
            return 0;
        }

        *count
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}
