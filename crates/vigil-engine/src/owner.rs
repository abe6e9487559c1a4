//! Per-integration owner.
//!
//! Every change to an integration's health counters and breaker goes through
//! one task that drains a mailbox in order. Different integrations run
//! independently. Callers get answers back over a oneshot.
//!
//! ```text
//! scheduler ──Admit──────►┐
//! scheduler ──ReleaseProbe┤
//! executor  ──Outcome────►├─► Owner::run ─► store.update_health ─► Bus
//! daemon    ──Refresh────►┘                 store.update_control
//! ```

use crate::bus::Bus;
use crate::error::{EngineError, Result};
use crate::state::blocking;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use vigil_core::alert::advance_alert_status;
use vigil_core::breaker::{Admission, BreakerSettings, BreakerState};
use vigil_core::config::Config;
use vigil_core::event::{AttemptOutcome, AttemptResult, OutcomeEvent};
use vigil_core::health::{HealthStatus, HealthUpdate};
use vigil_core::store::Store;

const MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct OwnerSettings {
    pub breaker: BreakerSettings,
    pub expected_interval: chrono::Duration,
    pub alert_on_recovery: bool,
}

impl OwnerSettings {
    pub fn from_config(config: &Config, integration_id: &str) -> Self {
        let settings = config.settings_for(integration_id);
        Self {
            breaker: BreakerSettings {
                probe_lease: config.scheduler.lease(),
                ..settings.breaker()
            },
            expected_interval: settings.expected_interval(),
            alert_on_recovery: config.alerting.alert_on_recovery,
        }
    }
}

/// What the executor needs back after an outcome was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerReport {
    /// Breaker state after the outcome; feeds the retry planner.
    pub breaker: BreakerState,
    pub health: HealthStatus,
}

enum Command {
    Admit {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<Admission>>,
    },
    ReleaseProbe {
        reply: oneshot::Sender<Result<()>>,
    },
    Outcome {
        outcome: Box<AttemptOutcome>,
        reply: oneshot::Sender<Result<OwnerReport>>,
    },
    Refresh {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<HealthStatus>>,
    },
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct OwnerHandle {
    integration_id: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl OwnerHandle {
    /// Spawn the owner task. Must be called from within a Tokio runtime.
    pub fn spawn(integration_id: String, settings: OwnerSettings, store: Arc<Store>, bus: Bus) -> Self {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let owner = Owner {
            integration_id: integration_id.clone(),
            settings,
            store,
            bus,
        };
        tokio::spawn(owner.run(rx));
        Self {
            integration_id: integration_id.into(),
            tx,
        }
    }

    pub fn integration_id(&self) -> &str {
        &self.integration_id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn same_channel(&self, other: &OwnerHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn call<R>(&self, make: impl FnOnce(oneshot::Sender<Result<R>>) -> Command) -> Result<R> {
        let gone = || EngineError::OwnerGone(self.integration_id.to_string());
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Ask the breaker whether an attempt may run now. A `Probe` answer
    /// reserves the half-open slot until an outcome or `release_probe`.
    pub async fn admit(&self, now: DateTime<Utc>) -> Result<Admission> {
        self.call(|reply| Command::Admit { now, reply }).await
    }

    pub async fn release_probe(&self) -> Result<()> {
        self.call(|reply| Command::ReleaseProbe { reply }).await
    }

    pub async fn report(&self, outcome: AttemptOutcome) -> Result<OwnerReport> {
        self.call(|reply| Command::Outcome {
            outcome: Box::new(outcome),
            reply,
        })
        .await
    }

    /// Roll counters forward and recompute status without an attempt.
    pub async fn refresh(&self, now: DateTime<Utc>) -> Result<HealthStatus> {
        self.call(|reply| Command::Refresh { now, reply }).await
    }
}

// ---------------------------------------------------------------------------
// Owner task
// ---------------------------------------------------------------------------

struct Owner {
    integration_id: String,
    settings: OwnerSettings,
    store: Arc<Store>,
    bus: Bus,
}

impl Owner {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        tracing::debug!(integration = %self.integration_id, "owner started");
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Admit { now, reply } => {
                    let _ = reply.send(self.admit(now).await);
                }
                Command::ReleaseProbe { reply } => {
                    let _ = reply.send(self.release_probe().await);
                }
                Command::Outcome { outcome, reply } => {
                    let _ = reply.send(self.apply(*outcome).await);
                }
                Command::Refresh { now, reply } => {
                    let _ = reply.send(self.refresh(now).await);
                }
            }
        }
        tracing::debug!(integration = %self.integration_id, "owner stopped");
    }

    async fn admit(&self, now: DateTime<Utc>) -> Result<Admission> {
        let id = self.integration_id.clone();
        let settings = self.settings.breaker;
        let (admission, transition) = blocking(&self.store, move |store| {
            store.update_health(&id, now, |h| {
                let transition = h.breaker.poll(now, &settings);
                (h.breaker.admit(now, &settings), transition)
            })
        })
        .await?;
        if let Some(transition) = transition {
            tracing::info!(integration = %self.integration_id, from = %transition.from, to = %transition.to, "breaker transition");
            self.bus.publish(OutcomeEvent::BreakerChanged {
                integration_id: self.integration_id.clone(),
                transition,
            });
        }
        Ok(admission)
    }

    async fn release_probe(&self) -> Result<()> {
        let id = self.integration_id.clone();
        blocking(&self.store, move |store| {
            store.update_health(&id, Utc::now(), |h| h.breaker.release_probe())
        })
        .await
    }

    async fn refresh(&self, now: DateTime<Utc>) -> Result<HealthStatus> {
        let id = self.integration_id.clone();
        let interval = self.settings.expected_interval;
        let update = blocking(&self.store, move |store| {
            store.update_health(&id, now, |h| h.refresh(now, interval))
        })
        .await?;
        self.publish_health(&update, now);
        Ok(update.current)
    }

    async fn apply(&self, outcome: AttemptOutcome) -> Result<OwnerReport> {
        let at = outcome.at;
        let id = self.integration_id.clone();
        let settings = self.settings;
        let result = outcome.result.clone();
        let (update, breaker, recovered) = blocking(&self.store, move |store| {
            store.update_health(&id, at, |h| {
                let prior_failures = h.consecutive_failures;
                let update = match &result {
                    AttemptResult::Success { duration_ms, .. } => {
                        h.record_success(at, *duration_ms, settings.expected_interval)
                    }
                    AttemptResult::Failure {
                        category, message, ..
                    } => h.record_failure(
                        at,
                        *category,
                        message.clone(),
                        &settings.breaker,
                        settings.expected_interval,
                    ),
                };
                (update, h.breaker.state, result.is_success() && prior_failures > 0)
            })
        })
        .await?;

        self.bus.publish(OutcomeEvent::AttemptFinished(outcome.clone()));
        self.publish_health(&update, at);
        if let Some(transition) = update.breaker {
            tracing::info!(integration = %self.integration_id, from = %transition.from, to = %transition.to, "breaker transition");
            self.bus.publish(OutcomeEvent::BreakerChanged {
                integration_id: self.integration_id.clone(),
                transition,
            });
        }
        if recovered {
            self.bus.publish(OutcomeEvent::IntegrationRecovered {
                integration_id: self.integration_id.clone(),
                at,
            });
        }

        if let Some(control_id) = &outcome.control_id {
            self.apply_control(control_id, &outcome).await?;
        }

        Ok(OwnerReport {
            breaker,
            health: update.current,
        })
    }

    async fn apply_control(&self, control_id: &str, outcome: &AttemptOutcome) -> Result<()> {
        let at = outcome.at;
        let passed = outcome.result.control_passed();
        let reason = failure_reason(&outcome.result);
        let alert_on_recovery = self.settings.alert_on_recovery;
        let cid = control_id.to_string();
        let stored_reason = reason.clone();
        let applied = blocking(&self.store, move |store| {
            store.update_control(&cid, at, |c| {
                if !c.monitoring_enabled {
                    return None;
                }
                let update = c.record_result(passed, stored_reason, at);
                let action = advance_alert_status(c, &update, alert_on_recovery);
                Some((update, action))
            })
        })
        .await?;

        let Some((update, alert)) = applied else {
            tracing::debug!(control = control_id, "monitoring disabled, result ignored");
            return Ok(());
        };
        if update.previous != update.current {
            tracing::info!(control = control_id, from = %update.previous, to = %update.current, score = update.score, "control health changed");
        }
        self.bus.publish(OutcomeEvent::ControlUpdated {
            control_id: control_id.to_string(),
            integration_id: self.integration_id.clone(),
            update,
            alert,
            reason,
            at,
        });
        Ok(())
    }

    fn publish_health(&self, update: &HealthUpdate, at: DateTime<Utc>) {
        if !update.changed() {
            return;
        }
        tracing::info!(integration = %self.integration_id, from = %update.previous, to = %update.current, "health changed");
        self.bus.publish(OutcomeEvent::HealthChanged {
            integration_id: self.integration_id.clone(),
            previous: update.previous,
            current: update.current,
            at,
        });
    }
}

/// Why a control probe did not pass, if it did not.
fn failure_reason(result: &AttemptResult) -> Option<String> {
    match result {
        AttemptResult::Success { failed_checks: 0, .. } => None,
        AttemptResult::Success { failed_checks, .. } => {
            Some(format!("{failed_checks} control check(s) failed"))
        }
        AttemptResult::Failure {
            category, message, ..
        } => Some(format!("{category}: {message}")),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::engine_with;
    use uuid::Uuid;
    use vigil_core::alert::{AlertAction, AlertStatus};
    use vigil_core::classifier::ErrorCategory;
    use vigil_core::control::ControlHealth;

    fn outcome(control: Option<&str>, result: AttemptResult, at: DateTime<Utc>) -> AttemptOutcome {
        AttemptOutcome {
            task_id: Uuid::new_v4(),
            attempt_id: Uuid::new_v4(),
            integration_id: "github".into(),
            control_id: control.map(str::to_string),
            retry_attempt: 0,
            at,
            result,
        }
    }

    fn failure() -> AttemptResult {
        AttemptResult::Failure {
            category: ErrorCategory::Transient,
            message: "HTTP 503".into(),
            timed_out: false,
            duration_ms: 40,
        }
    }

    fn success(failed_checks: u32) -> AttemptResult {
        AttemptResult::Success {
            duration_ms: 20,
            items: 5,
            failed_checks,
        }
    }

    #[tokio::test]
    async fn breaker_opens_at_threshold_and_rejects() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let owner = state.owner("github");
        let now = Utc::now();
        for _ in 0..4 {
            let r = owner.report(outcome(None, failure(), now)).await.unwrap();
            assert_eq!(r.breaker, BreakerState::Closed);
        }
        let r = owner.report(outcome(None, failure(), now)).await.unwrap();
        assert_eq!(r.breaker, BreakerState::Open);
        assert_eq!(owner.admit(now).await.unwrap(), Admission::Rejected);

        let later = now + chrono::Duration::milliseconds(600_001);
        assert_eq!(owner.admit(later).await.unwrap(), Admission::Probe);
        assert_eq!(owner.admit(later).await.unwrap(), Admission::Rejected);
        owner.release_probe().await.unwrap();
        assert_eq!(owner.admit(later).await.unwrap(), Admission::Probe);
    }

    #[tokio::test]
    async fn unreported_half_open_slot_expires_with_scheduler_lease() {
        let mut config = Config::default();
        config.scheduler.lease_secs = 60;
        let (_dir, state) = engine_with(config, vec![]);
        let owner = state.owner("github");
        let now = Utc::now();
        for _ in 0..5 {
            owner.report(outcome(None, failure(), now)).await.unwrap();
        }
        let claimed = now + chrono::Duration::milliseconds(600_001);
        assert_eq!(owner.admit(claimed).await.unwrap(), Admission::Probe);

        let before = claimed + chrono::Duration::seconds(59);
        assert_eq!(owner.admit(before).await.unwrap(), Admission::Rejected);
        let after = claimed + chrono::Duration::seconds(60);
        assert_eq!(owner.admit(after).await.unwrap(), Admission::Probe);
    }

    #[tokio::test]
    async fn recovery_event_after_failure_streak() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let mut rx = state.bus.subscribe();
        let owner = state.owner("github");
        let now = Utc::now();
        owner.report(outcome(None, success(0), now)).await.unwrap();
        owner.report(outcome(None, failure(), now)).await.unwrap();
        let r = owner.report(outcome(None, success(0), now)).await.unwrap();
        assert_eq!(r.breaker, BreakerState::Closed);

        let mut recovered = 0;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, OutcomeEvent::IntegrationRecovered { .. }) {
                recovered += 1;
            }
        }
        assert_eq!(recovered, 1);
    }

    #[tokio::test]
    async fn control_alerts_exactly_once_when_failing() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let mut rx = state.bus.subscribe();
        let owner = state.owner("github");
        let now = Utc::now();
        for _ in 0..4 {
            owner.report(outcome(Some("cc-6.1"), success(2), now)).await.unwrap();
        }

        let mut healths = Vec::new();
        let mut raises = 0;
        while let Ok(ev) = rx.try_recv() {
            if let OutcomeEvent::ControlUpdated { update, alert, .. } = ev {
                healths.push(update.current);
                if alert == Some(AlertAction::RaiseFailure) {
                    raises += 1;
                }
            }
        }
        assert_eq!(
            healths,
            vec![
                ControlHealth::Degraded,
                ControlHealth::Degraded,
                ControlHealth::Failing,
                ControlHealth::Failing
            ]
        );
        assert_eq!(raises, 1);
        let status = state.store.require_control("cc-6.1").unwrap();
        assert_eq!(status.alert_status, AlertStatus::Alerting);
        // a sync that returned data keeps the integration healthy
        let health = state.store.get_health("github").unwrap().unwrap();
        assert_eq!(health.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn disabled_monitoring_ignores_results() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let now = Utc::now();
        state
            .store
            .update_control("cc-9", now, |c| c.monitoring_enabled = false)
            .unwrap();
        state
            .owner("github")
            .report(outcome(Some("cc-9"), failure(), now))
            .await
            .unwrap();
        let status = state.store.require_control("cc-9").unwrap();
        assert_eq!(status.consecutive_failures, 0);
        assert_eq!(status.current_health, ControlHealth::Unknown);
    }

    #[test]
    fn failure_reasons() {
        assert_eq!(failure_reason(&success(0)), None);
        assert_eq!(
            failure_reason(&success(3)).as_deref(),
            Some("3 control check(s) failed")
        );
        assert_eq!(
            failure_reason(&failure()).as_deref(),
            Some("transient: HTTP 503")
        );
    }
}
