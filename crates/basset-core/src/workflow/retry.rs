//! Retry handler: error classification and backoff computation.
//!
//! Provides stateless retry logic for step execution. Whether a failure is
//! retried depends only on its [`ErrorKind`] and on how many attempts the
//! active [`RetryPolicy`] allows; the delay before the next attempt grows
//! exponentially or linearly and is capped at `max_delay_ms`.

use std::collections::HashMap;
use std::time::Duration;

use basset_types::error::{ErrorKind, StepError};
use basset_types::execution::RetryRecord;
use basset_types::workflow::{BackoffStrategy, RetryPolicy};
use chrono::Utc;

// ---------------------------------------------------------------------------
// RetryDecision
// ---------------------------------------------------------------------------

/// What to do after a step attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    /// Backoff before the next attempt. Zero when not retrying.
    pub delay: Duration,
    /// Attempts made so far, including the one that just failed.
    pub attempt_count: u32,
}

// ---------------------------------------------------------------------------
// RetryHandler
// ---------------------------------------------------------------------------

/// Stateless retry handler for step failures.
///
/// No internal state: all logic is in associated functions that take the
/// policy and the per-step retry records as parameters.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether `error` is worth retrying at all.
    pub fn classify(error: &StepError) -> bool {
        error.is_retryable()
    }

    /// Backoff before retry number `attempt` (zero-based: the first retry
    /// waits `base_delay_ms`).
    ///
    /// Non-decreasing in `attempt` and never above `max_delay_ms`.
    pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
        let base = policy.base_delay_ms;
        let raw = match policy.strategy {
            BackoffStrategy::Exponential => {
                let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt) + 1),
        };
        Duration::from_millis(raw.min(policy.max_delay_ms))
    }

    /// Decide whether the failed step gets another attempt.
    ///
    /// Updates (or creates) the step's [`RetryRecord`]. When the error is
    /// permanent or the policy's attempts are exhausted the decision is
    /// terminal and the record is discarded.
    pub fn handle(
        error: &StepError,
        step_id: &str,
        records: &mut HashMap<String, RetryRecord>,
        policy: &RetryPolicy,
    ) -> RetryDecision {
        let attempt_count = records
            .get(step_id)
            .map_or(0, |record| record.attempt_count)
            + 1;

        if !Self::classify(error) || attempt_count >= policy.max_retries {
            records.remove(step_id);
            return RetryDecision {
                should_retry: false,
                delay: Duration::ZERO,
                attempt_count,
            };
        }

        let delay = Self::compute_delay(attempt_count - 1, policy);
        let next_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .map(|d| Utc::now() + d);
        records.insert(
            step_id.to_string(),
            RetryRecord {
                attempt_count,
                last_error: error.to_string(),
                next_retry_at,
            },
        );

        RetryDecision {
            should_retry: true,
            delay,
            attempt_count,
        }
    }

    /// Forget a step's retry record after it succeeded.
    pub fn reset(step_id: &str, records: &mut HashMap<String, RetryRecord>) {
        records.remove(step_id);
    }
}

// ---------------------------------------------------------------------------
// Message classification
// ---------------------------------------------------------------------------

/// Classify a free-text error message from a remote provider.
///
/// Matching is case-insensitive and ordered from most to least specific.
/// Messages that match nothing are internal errors (never retried).
pub fn classify_message(message: &str) -> ErrorKind {
    let msg = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| msg.contains(n));

    if has(&[
        "stale element",
        "stale reference",
        "detached from",
        "no longer attached",
    ]) {
        ErrorKind::StaleReference
    } else if has(&[
        "intercept",
        "not clickable",
        "obscured",
        "another element would receive",
    ]) {
        ErrorKind::ClickIntercepted
    } else if has(&[
        "element not found",
        "no such element",
        "could not find",
        "no element",
        "selector not found",
    ]) {
        ErrorKind::ElementNotFound
    } else if has(&["timeout", "timed out", "deadline"]) {
        ErrorKind::Timeout
    } else if has(&["navigation", "net::err", "page crashed", "frame was detached"]) {
        ErrorKind::Navigation
    } else if has(&[
        "network",
        "connection",
        "econnreset",
        "econnrefused",
        "dns",
        "socket",
        "unreachable",
    ]) {
        ErrorKind::Network
    } else if has(&["quota", "rate limit", "too many requests", "429"]) {
        ErrorKind::Quota
    } else if has(&["permission", "forbidden", "unauthorized", "not allowed", "403", "401"]) {
        ErrorKind::Permission
    } else if has(&["security", "blocked by", "csp", "cross-origin"]) {
        ErrorKind::Security
    } else if has(&["screenshot", "capture"]) {
        ErrorKind::Capture
    } else if has(&["invalid", "validation", "malformed", "required"]) {
        ErrorKind::Validation
    } else if has(&["configuration", "misconfigured", "not configured"]) {
        ErrorKind::Configuration
    } else {
        ErrorKind::Internal
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
