//! Shared types for the FSM Runtime (spec §4.5).

use std::time::Duration;

use chrono::{DateTime, Utc};

use pipeline_api::error::ManagerError;

/// The mutable working set a run carries through its state sequence: the
/// original request plus whatever the most recent transition produced.
#[derive(Clone)]
pub struct Req<R, W> {
    pub request: R,
    pub response: Option<W>,
}

impl<R, W> Req<R, W> {
    pub fn new(request: R) -> Self {
        Req { request, response: None }
    }
}

/// What a transition function returns (spec §4.5 "Terminal outcomes").
/// `Err(ManagerError)` from the transition itself is the "standard error"
/// case and is handled by the engine's retry loop, not represented here.
pub enum StepOutcome<W> {
    /// Advance to the next state, carrying the updated response forward.
    Advance(W),
    /// Complete the run immediately; remaining states are skipped.
    Handoff(W),
    /// Abort the run; no further transitions.
    Abort(ManagerError),
    /// Fail the run permanently; no further transitions.
    Unrecoverable(ManagerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Doing,
    Completed,
    Aborted,
    Failed,
}

impl RunStatus {
    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => RunStatus::Completed,
            "aborted" => RunStatus::Aborted,
            "failed" => RunStatus::Failed,
            _ => RunStatus::Doing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Doing)
    }
}

/// Options accepted by `start` (spec §4.5).
#[derive(Default)]
pub struct StartOptions {
    pub queue: Option<String>,
    pub delay_until: Option<DateTime<Utc>>,
    pub run_after: Option<i64>,
    pub parent: Option<i64>,
    pub transition_timeout: Option<Duration>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn delay_until(mut self, at: DateTime<Utc>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn run_after(mut self, run_id: i64) -> Self {
        self.run_after = Some(run_id);
        self
    }

    pub fn parent(mut self, run_id: i64) -> Self {
        self.parent = Some(run_id);
        self
    }

    pub fn timeout(mut self, d: Duration) -> Self {
        self.transition_timeout = Some(d);
        self
    }
}

/// Retry policy for the "standard error" terminal outcome (spec §4.5):
/// exponential back-off with jitter, up to a per-transition retry budget.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt);
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jitter = rand::random::<u64>() % (capped / 4 + 1);
        Duration::from_millis(capped.saturating_sub(jitter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_bounded_by_max() {
        let policy = RetryPolicy::default();
        for attempt in 0..20 {
            assert!(policy.delay_for(attempt) <= policy.max_delay);
        }
    }

    #[test]
    fn run_status_parses_known_strings() {
        assert_eq!(RunStatus::from_str("doing"), RunStatus::Doing);
        assert_eq!(RunStatus::from_str("completed"), RunStatus::Completed);
        assert!(RunStatus::from_str("completed").is_terminal());
        assert!(!RunStatus::from_str("doing").is_terminal());
    }
}
