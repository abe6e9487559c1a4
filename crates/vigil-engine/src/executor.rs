//! Executor: one attempt, end to end.
//!
//! Calls the provider under the integration's timeout, classifies any error,
//! hands the outcome to the integration's owner, plans a retry from the
//! breaker state the owner reports back, then persists the attempt (and
//! its follow-up retry) and releases the task lease in one store write.

use crate::error::Result;
use crate::state::EngineState;
use chrono::{DateTime, Utc};
use std::time::Instant;
use vigil_core::attempt::{AttemptStatus, SyncAttempt};
use vigil_core::classifier::RawError;
use vigil_core::event::{AttemptOutcome, AttemptResult, OutcomeEvent};
use vigil_core::retry::{self, RetryContext, RetryDecision, TerminalReason};
use vigil_core::store::{Claim, OutcomeWrite};
use vigil_core::task::{RunStatus, ScheduledTask};

/// Everything that happened to one claimed attempt.
#[derive(Debug, Clone)]
pub struct Execution {
    pub task: ScheduledTask,
    pub attempt: SyncAttempt,
    pub retry: Option<SyncAttempt>,
    pub terminal: Option<TerminalReason>,
}

pub async fn execute(state: &EngineState, claim: Claim) -> Result<Execution> {
    let Claim {
        task,
        token,
        mut attempt,
    } = claim;
    let settings = state.config.settings_for(&task.integration_id);

    let started = Instant::now();
    let call = match state.providers.get(&task.integration_id) {
        Ok(adapter) => match tokio::time::timeout(settings.timeout(), adapter.sync()).await {
            Ok(Ok(stats)) => Ok(stats),
            Ok(Err(raw)) => Err((raw, false)),
            Err(_) => Err((RawError::timeout(settings.timeout_seconds), true)),
        },
        Err(_) => Err((
            RawError::new(
                None,
                format!("missing required provider config for '{}'", task.integration_id),
            ),
            false,
        )),
    };
    let duration_ms = started.elapsed().as_millis() as u64;
    let now = Utc::now();

    let result = match call {
        Ok(stats) => AttemptResult::Success {
            duration_ms,
            items: stats.items,
            failed_checks: stats.failed_checks,
        },
        Err((raw, timed_out)) => AttemptResult::Failure {
            category: raw.category(),
            message: raw.message,
            timed_out,
            duration_ms,
        },
    };

    let outcome = AttemptOutcome {
        task_id: task.id,
        attempt_id: attempt.id,
        integration_id: task.integration_id.clone(),
        control_id: task.control_id.clone(),
        retry_attempt: attempt.retry_attempt,
        at: now,
        result: result.clone(),
    };
    let report = state.owner(&task.integration_id).report(outcome).await?;

    let mut retry = None;
    let mut terminal = None;
    let run_status = match &result {
        AttemptResult::Success {
            duration_ms, items, ..
        } => {
            tracing::info!(task_id = %task.id, integration = %task.integration_id, attempt = attempt.retry_attempt, items, duration_ms, "attempt completed");
            attempt.complete(now, *duration_ms, *items);
            RunStatus::Completed
        }
        AttemptResult::Failure {
            category,
            message,
            timed_out,
            duration_ms,
        } => {
            let status = if *timed_out {
                AttemptStatus::Timeout
            } else {
                AttemptStatus::Failed
            };
            attempt.fail(status, *category, message.clone(), now, *duration_ms);

            let task_id = task.id;
            let task_enabled = state
                .with_store(move |s| s.get_task(task_id))
                .await?
                .enabled;
            let ctx = RetryContext {
                retry_enabled: settings.retry_enabled,
                task_enabled,
                breaker: report.breaker,
                clamp_jitter: settings.backoff_clamp_jitter,
            };
            match retry::plan(&attempt, &task.retry, &ctx) {
                RetryDecision::ScheduleRetry { delay } => {
                    let backoff_ms = delay.as_millis() as u64;
                    let due = now + chrono::Duration::milliseconds(backoff_ms as i64);
                    attempt.next_retry_at = Some(due);
                    attempt.backoff_ms = Some(backoff_ms);
                    retry = Some(SyncAttempt::retry_of(&attempt, due, now));
                    tracing::info!(task_id = %task.id, integration = %task.integration_id, attempt = attempt.retry_attempt, category = %category, backoff_ms, "attempt failed, retry scheduled");
                    RunStatus::Retrying
                }
                RetryDecision::Terminal { reason } => {
                    tracing::warn!(task_id = %task.id, integration = %task.integration_id, attempt = attempt.retry_attempt, category = %category, %reason, "occurrence failed");
                    terminal = Some(reason);
                    RunStatus::Failed
                }
            }
        }
    };

    let (task, attempt, retry) = state
        .with_store(move |s| {
            let write = OutcomeWrite {
                attempt: &attempt,
                retry: retry.as_ref(),
                lease_token: token,
                run_status,
            };
            let task = s.record_outcome(write, now)?;
            Ok((task, attempt, retry))
        })
        .await?;

    if let Some(next) = &retry {
        publish_retry(state, &attempt, next);
    }
    if let (Some(reason), AttemptResult::Failure { category, message, .. }) = (terminal, &result) {
        state.bus.publish(OutcomeEvent::OccurrenceFailed {
            task_id: task.id,
            attempt_id: attempt.id,
            integration_id: task.integration_id.clone(),
            control_id: task.control_id.clone(),
            category: *category,
            message: message.clone(),
            reason,
            at: now,
        });
    }

    Ok(Execution {
        task,
        attempt,
        retry,
        terminal,
    })
}

fn publish_retry(state: &EngineState, failed: &SyncAttempt, next: &SyncAttempt) {
    let due_at: DateTime<Utc> = next.next_retry_at.unwrap_or(next.created_at);
    state.bus.publish(OutcomeEvent::RetryScheduled {
        task_id: next.task_id,
        attempt_id: next.id,
        retry_attempt: next.retry_attempt,
        delay_ms: failed.backoff_ms.unwrap_or(0),
        due_at,
    });
}

/// Execute claims concurrently and wait for all of them. Failures are
/// logged; the lease on a task whose outcome could not be stored expires.
pub async fn execute_all(state: &EngineState, claims: Vec<Claim>) -> Vec<Execution> {
    let runs = claims.into_iter().map(|claim| {
        let task_id = claim.task.id;
        async move {
            match execute(state, claim).await {
                Ok(done) => Some(done),
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "attempt could not be recorded");
                    None
                }
            }
        }
    });
    futures::future::join_all(runs).await.into_iter().flatten().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::provider::{ProviderAdapter, SyncStats};
    use crate::state::tests::engine_with;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use vigil_core::classifier::ErrorCategory;
    use vigil_core::config::Config;
    use vigil_core::task::{Frequency, RetryPolicy};

    /// Plays back a fixed script of results, then repeats the last one.
    pub(crate) struct Scripted {
        script: Mutex<VecDeque<std::result::Result<SyncStats, RawError>>>,
        pub(crate) calls: Mutex<u32>,
    }

    impl Scripted {
        pub(crate) fn new(script: Vec<std::result::Result<SyncStats, RawError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        pub(crate) fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl ProviderAdapter for Scripted {
        async fn sync(&self) -> std::result::Result<SyncStats, RawError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct Sleepy;

    #[async_trait]
    impl ProviderAdapter for Sleepy {
        async fn sync(&self) -> std::result::Result<SyncStats, RawError> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok(SyncStats::default())
        }
    }

    pub(crate) fn ok() -> std::result::Result<SyncStats, RawError> {
        Ok(SyncStats {
            items: 7,
            failed_checks: 0,
        })
    }

    pub(crate) fn err(code: u16) -> std::result::Result<SyncStats, RawError> {
        Err(RawError::new(Some(code), format!("HTTP {code}")))
    }

    pub(crate) fn add_task(state: &EngineState, integration: &str, control: Option<&str>) -> ScheduledTask {
        let now = Utc::now() - chrono::Duration::seconds(1);
        let task = ScheduledTask::new(
            integration,
            control.map(str::to_string),
            Frequency::Hourly,
            RetryPolicy::default(),
            now,
        );
        state.store.insert_task(&task).unwrap();
        task
    }

    async fn claim(state: &EngineState, task: &ScheduledTask) -> Claim {
        state
            .store
            .claim_task(task.id, Utc::now(), chrono::Duration::minutes(5))
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn success_releases_lease_and_counts() {
        let provider = Scripted::new(vec![ok()]);
        let (_dir, state) = engine_with(Config::default(), vec![("github", provider.clone())]);
        let task = add_task(&state, "github", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();

        assert_eq!(done.attempt.status, AttemptStatus::Completed);
        assert_eq!(done.attempt.items_processed, 7);
        assert!(done.retry.is_none());
        assert_eq!(done.task.success_count, 1);
        assert_eq!(done.task.last_status, Some(RunStatus::Completed));
        assert!(done.task.lease_token.is_none());
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failure_schedules_linked_retry() {
        let (_dir, state) = engine_with(
            Config::default(),
            vec![("github", Scripted::new(vec![err(503)]))],
        );
        let task = add_task(&state, "github", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();

        assert_eq!(done.attempt.status, AttemptStatus::Failed);
        assert_eq!(done.attempt.error_category, Some(ErrorCategory::Transient));
        let backoff = done.attempt.backoff_ms.unwrap();
        assert!((1000..1250).contains(&backoff));
        let retry = done.retry.unwrap();
        assert_eq!(retry.status, AttemptStatus::Scheduled);
        assert_eq!(retry.parent_attempt_id, Some(done.attempt.id));
        assert_eq!(retry.retry_attempt, 1);
        assert_eq!(done.task.last_status, Some(RunStatus::Retrying));

        let far = Utc::now() + chrono::Duration::seconds(5);
        let due = state.store.due_retries(far).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, retry.id);
    }

    #[tokio::test]
    async fn config_error_is_terminal_and_published() {
        let (_dir, state) = engine_with(
            Config::default(),
            vec![("github", Scripted::new(vec![err(404)]))],
        );
        let mut rx = state.bus.subscribe();
        let task = add_task(&state, "github", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();

        assert!(done.retry.is_none());
        assert_eq!(
            done.terminal,
            Some(TerminalReason::NonRetryable(ErrorCategory::ConfigError))
        );
        assert_eq!(done.task.last_status, Some(RunStatus::Failed));

        let mut failed = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, OutcomeEvent::OccurrenceFailed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn missing_provider_is_config_error() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let task = add_task(&state, "ghost", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();
        assert_eq!(done.attempt.error_category, Some(ErrorCategory::ConfigError));
        assert!(done.retry.is_none());
    }

    #[tokio::test]
    async fn slow_provider_times_out_as_transient() {
        let mut config = Config::default();
        config.defaults.timeout_seconds = 1;
        let (_dir, state) = engine_with(config, vec![("slow", Arc::new(Sleepy))]);
        let task = add_task(&state, "slow", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();
        assert_eq!(done.attempt.status, AttemptStatus::Timeout);
        assert_eq!(done.attempt.error_category, Some(ErrorCategory::Transient));
        assert!(done.retry.is_some());
    }

    #[tokio::test]
    async fn disabled_task_gets_no_retry() {
        let (_dir, state) = engine_with(
            Config::default(),
            vec![("github", Scripted::new(vec![err(503)]))],
        );
        let task = add_task(&state, "github", None);
        let claimed = claim(&state, &task).await;
        state.store.set_task_enabled(task.id, false, Utc::now()).unwrap();
        let done = execute(&state, claimed).await.unwrap();
        assert_eq!(done.terminal, Some(TerminalReason::TaskDisabled));
    }

    #[tokio::test]
    async fn retries_disabled_by_config() {
        let mut config = Config::default();
        config.defaults.retry_enabled = false;
        let (_dir, state) = engine_with(config, vec![("github", Scripted::new(vec![err(500)]))]);
        let task = add_task(&state, "github", None);
        let done = execute(&state, claim(&state, &task).await).await.unwrap();
        assert_eq!(done.terminal, Some(TerminalReason::RetryDisabled));
    }
}
