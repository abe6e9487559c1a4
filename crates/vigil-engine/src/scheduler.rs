//! Scheduler tick.
//!
//! One pass: dispatch due tasks, then due retries, then wait for every
//! dispatched attempt. Admission is asked of the integration owner before
//! any claim, so a rejected task keeps its `next_run_at` and gets no
//! attempt row. Claims are compare-and-swap writes; a worker that loses
//! simply moves on.

use crate::error::Result;
use crate::executor::{execute_all, Execution};
use crate::state::EngineState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use vigil_core::breaker::Admission;
use vigil_core::event::OutcomeEvent;
use vigil_core::store::{Claim, RetryClaim};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub dispatched: usize,
    pub retries_dispatched: usize,
    pub circuit_skipped: usize,
    pub retries_skipped: usize,
    /// Claims lost to another worker or blocked by a held lease.
    pub contended: usize,
    pub completed: usize,
    pub retrying: usize,
    pub failed: usize,
}

impl TickReport {
    fn tally(&mut self, runs: &[Execution]) {
        for run in runs {
            if run.retry.is_some() {
                self.retrying += 1;
            } else if run.terminal.is_some() {
                self.failed += 1;
            } else {
                self.completed += 1;
            }
        }
    }
}

pub async fn tick(state: &EngineState, now: DateTime<Utc>) -> Result<TickReport> {
    let mut report = TickReport::default();
    let mut claims = claim_due_tasks(state, now, &mut report).await?;
    claims.extend(claim_due_retries(state, now, &mut report).await?);

    if !claims.is_empty() {
        tracing::debug!(count = claims.len(), "dispatching attempts");
    }
    let runs = execute_all(state, claims).await;
    report.tally(&runs);
    Ok(report)
}

async fn claim_due_tasks(state: &EngineState, now: DateTime<Utc>, report: &mut TickReport) -> Result<Vec<Claim>> {
    let lease = state.config.scheduler.lease();
    let due = state.with_store(move |s| s.due_tasks(now)).await?;
    let mut claims = Vec::new();

    for task in due {
        let owner = state.owner(&task.integration_id);
        let admission = owner.admit(now).await?;
        if admission == Admission::Rejected {
            tracing::debug!(task_id = %task.id, integration = %task.integration_id, "circuit open, dispatch skipped");
            report.circuit_skipped += 1;
            state.bus.publish(OutcomeEvent::CircuitSkipped {
                task_id: task.id,
                integration_id: task.integration_id.clone(),
                at: now,
            });
            continue;
        }

        let id = task.id;
        match state.with_store(move |s| s.claim_task(id, now, lease)).await? {
            Some(claim) => {
                tracing::info!(task_id = %id, integration = %task.integration_id, probe = admission == Admission::Probe, "task claimed");
                report.dispatched += 1;
                claims.push(claim);
            }
            None => {
                report.contended += 1;
                if admission == Admission::Probe {
                    owner.release_probe().await?;
                }
            }
        }
    }
    Ok(claims)
}

async fn claim_due_retries(state: &EngineState, now: DateTime<Utc>, report: &mut TickReport) -> Result<Vec<Claim>> {
    let lease = state.config.scheduler.lease();
    let due = state.with_store(move |s| s.due_retries(now)).await?;
    let mut claims = Vec::new();

    for attempt in due {
        let task_id = attempt.task_id;
        let task = state.with_store(move |s| s.get_task(task_id)).await?;

        // Disabled tasks are skipped by claim_retry without consulting the breaker.
        let admission = if task.enabled {
            let admission = state.owner(&task.integration_id).admit(now).await?;
            if admission == Admission::Rejected {
                tracing::debug!(task_id = %task.id, attempt = %attempt.id, "circuit open, retry waits");
                report.circuit_skipped += 1;
                continue;
            }
            Some(admission)
        } else {
            None
        };

        let attempt_id = attempt.id;
        let outcome = state
            .with_store(move |s| s.claim_retry(attempt_id, now, lease))
            .await?;
        match outcome {
            RetryClaim::Claimed(claim) => {
                tracing::info!(task_id = %task.id, attempt = claim.attempt.retry_attempt, "retry claimed");
                report.retries_dispatched += 1;
                claims.push(claim);
                continue;
            }
            RetryClaim::Skipped(skipped) => {
                tracing::info!(task_id = %task.id, attempt = %skipped.id, "retry skipped, task disabled");
                report.retries_skipped += 1;
            }
            RetryClaim::Busy | RetryClaim::Gone => report.contended += 1,
        }
        if admission == Some(Admission::Probe) {
            state.owner(&task.integration_id).release_probe().await?;
        }
    }
    Ok(claims)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
