//! Retry planner.
//!
//! Decides, after a failed attempt, whether the occurrence gets another
//! attempt or is terminally failed. Every condition must hold for a retry.

use crate::attempt::SyncAttempt;
use crate::backoff::BackoffPolicy;
use crate::breaker::BreakerState;
use crate::classifier::ErrorCategory;
use crate::task::RetryPolicy;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;

/// Why an occurrence stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    NotAFailure,
    RetriesExhausted,
    RetryDisabled,
    TaskDisabled,
    CircuitOpen,
    NonRetryable(ErrorCategory),
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalReason::NotAFailure => f.write_str("attempt did not fail"),
            TerminalReason::RetriesExhausted => f.write_str("retries exhausted"),
            TerminalReason::RetryDisabled => f.write_str("retries disabled for integration"),
            TerminalReason::TaskDisabled => f.write_str("task disabled"),
            TerminalReason::CircuitOpen => f.write_str("circuit open"),
            TerminalReason::NonRetryable(c) => write!(f, "{c} is not retryable"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    ScheduleRetry { delay: Duration },
    Terminal { reason: TerminalReason },
}

/// State outside the attempt that gates a retry.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub retry_enabled: bool,
    pub task_enabled: bool,
    /// Breaker state *after* this attempt's outcome was applied.
    pub breaker: BreakerState,
    pub clamp_jitter: bool,
}

pub fn plan(attempt: &SyncAttempt, policy: &RetryPolicy, ctx: &RetryContext) -> RetryDecision {
    plan_with(attempt, policy, ctx, &mut rand::thread_rng())
}

pub fn plan_with<R: Rng + ?Sized>(
    attempt: &SyncAttempt,
    policy: &RetryPolicy,
    ctx: &RetryContext,
    rng: &mut R,
) -> RetryDecision {
    let terminal = |reason| RetryDecision::Terminal { reason };
    if !attempt.status.is_failure() {
        return terminal(TerminalReason::NotAFailure);
    }
    let category = attempt.error_category.unwrap_or(ErrorCategory::Unknown);
    if category.is_terminal() {
        return terminal(TerminalReason::NonRetryable(category));
    }
    if !ctx.retry_enabled {
        return terminal(TerminalReason::RetryDisabled);
    }
    if !ctx.task_enabled {
        return terminal(TerminalReason::TaskDisabled);
    }
    if ctx.breaker == BreakerState::Open {
        return terminal(TerminalReason::CircuitOpen);
    }
    if attempt.retry_attempt >= policy.max_retries {
        return terminal(TerminalReason::RetriesExhausted);
    }
    let backoff: BackoffPolicy = policy.backoff(ctx.clamp_jitter);
    RetryDecision::ScheduleRetry {
        delay: backoff.next_with(attempt.retry_attempt, rng),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
