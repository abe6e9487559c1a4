//! Alerting service.
//!
//! Subscribes to the outcome bus and turns terminal sync failures, control
//! alert actions, and recoveries into stored alerts plus notifications.
//! The escalation sweep runs separately on a timer.

use crate::error::Result;
use crate::notifier::{deliver, Notifier};
use crate::state::EngineState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use vigil_core::alert::{
    acknowledge_control, clear_control_alert, Alert, AlertAction, AlertKind, AlertSubject, Severity,
};
use vigil_core::config::AlertingConfig;
use vigil_core::event::OutcomeEvent;
use vigil_core::store::Store;
use vigil_core::VigilError;

#[derive(Clone)]
pub struct AlertingService {
    state: EngineState,
    notifier: Arc<dyn Notifier>,
}

impl AlertingService {
    pub fn new(state: EngineState, notifier: Arc<dyn Notifier>) -> Self {
        Self { state, notifier }
    }

    fn config(&self) -> &AlertingConfig {
        &self.state.config.alerting
    }

    /// Handle events until `shutdown` flips, then drain what is buffered.
    pub async fn run(self, mut rx: broadcast::Receiver<OutcomeEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                ev = rx.recv() => match ev {
                    Ok(ev) => self.handle_logged(&ev).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "alerting fell behind, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => break,
            }
        }
        loop {
            match rx.try_recv() {
                Ok(ev) => self.handle_logged(&ev).await,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "alerting fell behind, events dropped");
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_logged(&self, ev: &OutcomeEvent) {
        if let Err(e) = self.handle(ev).await {
            tracing::warn!(event = ev.name(), error = %e, "alert handling failed");
        }
    }

    pub async fn handle(&self, ev: &OutcomeEvent) -> Result<()> {
        match ev {
            OutcomeEvent::OccurrenceFailed {
                integration_id,
                category,
                message,
                reason,
                at,
                ..
            } => {
                let alert = Alert::new(
                    AlertKind::Failure,
                    Severity::for_category(*category),
                    AlertSubject::Integration(integration_id.clone()),
                    format!("Sync failing: {integration_id}"),
                    format!("{category}: {message} ({reason})"),
                    self.config().recipients.clone(),
                    *at,
                )
                .with_category(*category);
                self.raise(alert).await
            }
            OutcomeEvent::IntegrationRecovered { integration_id, at } => {
                self.recover(AlertSubject::Integration(integration_id.clone()), *at, self.config().alert_on_recovery)
                    .await
            }
            OutcomeEvent::ControlUpdated {
                control_id,
                alert: Some(action),
                reason,
                update,
                at,
                ..
            } => {
                let subject = AlertSubject::Control(control_id.clone());
                match action {
                    AlertAction::RaiseFailure => {
                        let detail = reason.clone().unwrap_or_else(|| "control test failed".to_string());
                        let alert = Alert::new(
                            AlertKind::Failure,
                            Severity::High,
                            subject,
                            format!("Control failing: {control_id}"),
                            format!("{detail} (health score {})", update.score),
                            self.config().recipients.clone(),
                            *at,
                        );
                        self.raise_new_streak(alert, *at).await
                    }
                    AlertAction::Recover { notify } => self.recover(subject, *at, *notify).await,
                }
            }
            _ => Ok(()),
        }
    }

    /// Store a failure alert unless its subject already has one open.
    async fn raise(&self, alert: Alert) -> Result<()> {
        let (stored, alert) = self
            .state
            .with_store(move |s| Ok((s.raise_failure_alert(&alert)?, alert)))
            .await?;
        self.announce(stored, alert).await;
        Ok(())
    }

    /// A control only asks for a failure alert when its status machine is
    /// back at `none`, so an acknowledged alert still open from an earlier
    /// streak is resolved rather than allowed to suppress this one.
    async fn raise_new_streak(&self, alert: Alert, at: DateTime<Utc>) -> Result<()> {
        let (stored, alert) = self
            .state
            .with_store(move |s| Ok((s.raise_failure_alert_over_acknowledged(&alert, at)?, alert)))
            .await?;
        self.announce(stored, alert).await;
        Ok(())
    }

    async fn announce(&self, stored: bool, alert: Alert) {
        if !stored {
            tracing::debug!(subject = %alert.subject, "failure alert already open");
            return;
        }
        tracing::warn!(alert = %alert.id, subject = %alert.subject, severity = %alert.severity, "failure alert raised");
        deliver(self.notifier.as_ref(), &alert).await;
    }

    async fn recover(&self, subject: AlertSubject, at: DateTime<Utc>, notify: bool) -> Result<()> {
        let recipients = self.config().recipients.clone();
        let target = subject.clone();
        let resolved = self
            .state
            .with_store(move |s| s.resolve_alerts_for(&target, at))
            .await?;
        if resolved.is_empty() {
            return Ok(());
        }
        tracing::info!(subject = %subject, resolved = resolved.len(), "alerts resolved on recovery");
        if !notify {
            return Ok(());
        }
        let alert = Alert::new(
            AlertKind::Recovery,
            Severity::Info,
            subject.clone(),
            format!("Recovered: {subject}"),
            format!("{} open alert(s) resolved", resolved.len()),
            recipients,
            at,
        );
        let alert = self
            .state
            .with_store(move |s| s.insert_alert(&alert).map(|_| alert))
            .await?;
        deliver(self.notifier.as_ref(), &alert).await;
        Ok(())
    }

    /// Escalate every alert that has stayed open and unacknowledged too long.
    /// Each alert escalates at most once. Returns the escalations sent.
    pub async fn escalate_due(&self, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        let Some(after) = self.config().escalation_after() else {
            return Ok(Vec::new());
        };
        let recipients = if self.config().escalation_recipients.is_empty() {
            self.config().recipients.clone()
        } else {
            self.config().escalation_recipients.clone()
        };
        let escalations = self
            .state
            .with_store(move |s| escalate(s, now, after, &recipients))
            .await?;
        for alert in &escalations {
            tracing::warn!(alert = %alert.id, subject = %alert.subject, "alert escalated");
            deliver(self.notifier.as_ref(), alert).await;
        }
        Ok(escalations)
    }
}

fn escalate(store: &Store, now: DateTime<Utc>, after: chrono::Duration, recipients: &[String]) -> vigil_core::Result<Vec<Alert>> {
    let mut out = Vec::new();
    for mut alert in store.list_alerts()? {
        if !alert.needs_escalation(now, after) {
            continue;
        }
        alert.escalated_at = Some(now);
        store.put_alert(&alert)?;
        let escalation = alert.escalation(recipients.to_vec(), now);
        store.insert_alert(&escalation)?;
        out.push(escalation);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Operator actions
// ---------------------------------------------------------------------------

/// Acknowledge an alert. A control failure alert also moves the control
/// to `acknowledged`, which suspends notifications until a fresh streak.
pub fn acknowledge_alert(store: &Store, id: &str, by: &str, now: DateTime<Utc>) -> vigil_core::Result<Alert> {
    let mut alert = store.find_alert(id)?;
    alert.acknowledge(by, now)?;
    store.put_alert(&alert)?;
    if let (AlertKind::Failure, AlertSubject::Control(control_id)) = (alert.kind, &alert.subject) {
        if store.get_control(control_id)?.is_some() {
            store.update_control(control_id, now, |c| {
                let _ = acknowledge_control(c, by, now);
            })?;
        }
    }
    Ok(alert)
}

/// Acknowledge a control and its open failure alert.
pub fn acknowledge_control_alert(store: &Store, control_id: &str, by: &str, now: DateTime<Utc>) -> vigil_core::Result<()> {
    store.require_control(control_id)?;
    store.update_control(control_id, now, |c| acknowledge_control(c, by, now))??;
    if let Some(mut alert) = store.open_failure_alert(&AlertSubject::Control(control_id.to_string()))? {
        alert.acknowledge(by, now)?;
        store.put_alert(&alert)?;
    }
    Ok(())
}

/// Manually resolve an alert. Resolving a control failure alert also returns
/// the control's alert status to `none`, so its next failing streak alerts.
pub fn resolve_alert(store: &Store, id: &str, now: DateTime<Utc>) -> vigil_core::Result<Alert> {
    let mut alert = store.find_alert(id)?;
    if !alert.is_open() {
        return Err(VigilError::InvalidTransition {
            from: "resolved".to_string(),
            to: "resolved".to_string(),
            reason: format!("alert {} is already resolved", alert.id),
        });
    }
    alert.resolve(now);
    store.put_alert(&alert)?;
    if let (AlertKind::Failure, AlertSubject::Control(control_id)) = (alert.kind, &alert.subject) {
        if store.get_control(control_id)?.is_some() {
            store.update_control(control_id, now, |c| clear_control_alert(c, now))?;
        }
    }
    Ok(alert)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
