//! Attempt outcomes returned by job handlers.
//!
//! Handlers report what should happen next as a value instead of
//! encoding retry decisions in error types. The runner maps the
//! outcome onto queue state transitions.

use std::time::Duration;

/// A handler's request to run the job again later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDecision {
    /// How long to wait before the retry attempt.
    pub delay: Duration,
    /// Human-readable reason, persisted on the failed attempt row.
    pub reason: String,
}

impl RetryDecision {
    pub fn after(delay: Duration, reason: impl Into<String>) -> Self {
        Self {
            delay,
            reason: reason.into(),
        }
    }
}

/// What a single job attempt decided.
///
/// `Completed` and `Failed` are terminal for the job; `Retry` asks the
/// queue for another attempt if the retry budget allows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The attempt finished its work.
    Completed,
    /// The attempt hit a transient condition and wants another try.
    Retry(RetryDecision),
    /// The attempt failed permanently. No retry regardless of budget.
    Failed { error: String },
}

impl AttemptOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        AttemptOutcome::Failed {
            error: error.into(),
        }
    }

    pub fn retry(delay: Duration, reason: impl Into<String>) -> Self {
        AttemptOutcome::Retry(RetryDecision::after(delay, reason))
    }
}
