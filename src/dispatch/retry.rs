//! Retry state machine.
//!
//! The only place retry bookkeeping is decided. Modeled as an immutable
//! value type with pure transition functions so the policy is testable
//! independent of storage; the dispatcher applies the resulting decision to
//! the task row in one update.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Retry bookkeeping carried on a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts consumed so far.
    pub count: u32,
    /// Attempt budget (3 by default).
    pub max_attempts: u32,
}

/// What to write back after a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `pending` with a due time; `started_at` is cleared.
    Reschedule {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error_message: String,
    },
    /// Budget exhausted — terminal `failed`.
    Exhausted {
        retry_count: u32,
        error_message: String,
    },
}

impl RetryState {
    pub fn new(count: u32, max_attempts: u32) -> Self {
        Self { count, max_attempts }
    }

    /// Decide the next state after a failed dispatch attempt.
    ///
    /// The error message embeds the retry history breadcrumb:
    /// `[Retry k/N] <reason>` while attempts remain, `[PERMANENT] After N
    /// attempts: <reason>` once the budget is gone.
    pub fn on_failure(&self, reason: &str, now: DateTime<Utc>, delay: Duration) -> RetryDecision {
        let new_count = self.count + 1;

        if new_count >= self.max_attempts {
            RetryDecision::Exhausted {
                retry_count: new_count,
                error_message: format!(
                    "[PERMANENT] After {} attempts: {reason}",
                    self.max_attempts
                ),
            }
        } else {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::minutes(5));
            RetryDecision::Reschedule {
                retry_count: new_count,
                next_retry_at: now + delay,
                error_message: format!("[Retry {new_count}/{}] {reason}", self.max_attempts),
            }
        }
    }
}
