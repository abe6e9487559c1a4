//! Alert records and the control alert-status state machine.
//!
//! ```text
//! none ──(health enters failing)──► alerting ──(ack)──► acknowledged
//!   ▲                                   │                    │
//!   └────────(recovery to healthy)──────┴────────────────────┘
//! acknowledged ──(fresh failure streak)──► none
//! muted: only changed by an operator
//! ```

use crate::classifier::ErrorCategory;
use crate::control::{ControlHealth, ControlMonitoringStatus, ControlUpdate};
use crate::error::{Result, VigilError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    /// Credential failures need a human; config/permanent errors will not heal.
    pub fn for_category(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::AuthFailure => Severity::Critical,
            ErrorCategory::ConfigError | ErrorCategory::Permanent => Severity::High,
            ErrorCategory::RateLimited | ErrorCategory::Transient | ErrorCategory::Unknown => {
                Severity::Medium
            }
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// AlertKind / AlertSubject
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Failure,
    Recovery,
    Escalation,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertKind::Failure => "failure",
            AlertKind::Recovery => "recovery",
            AlertKind::Escalation => "escalation",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum AlertSubject {
    Integration(String),
    Control(String),
}

impl std::fmt::Display for AlertSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSubject::Integration(id) => write!(f, "integration:{id}"),
            AlertSubject::Control(id) => write!(f, "control:{id}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    pub subject: AlertSubject,
    pub title: String,
    /// Classified category and provider message only; never a raw payload.
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
    #[serde(default)]
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    /// For escalations: the failure alert being escalated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalates: Option<Uuid>,
}

impl Alert {
    pub fn new(
        kind: AlertKind,
        severity: Severity,
        subject: AlertSubject,
        title: impl Into<String>,
        message: impl Into<String>,
        recipients: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            subject,
            title: title.into(),
            message: message.into(),
            category: None,
            recipients,
            created_at: now,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            escalated_at: None,
            escalates: None,
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Escalation of `self` to a separate recipient set.
    pub fn escalation(&self, recipients: Vec<String>, now: DateTime<Utc>) -> Alert {
        let hours = (now - self.created_at).num_hours();
        let mut esc = Alert::new(
            AlertKind::Escalation,
            Severity::Critical,
            self.subject.clone(),
            format!("Escalated: {}", self.title),
            format!("unresolved for {hours}h without acknowledgment: {}", self.message),
            recipients,
            now,
        );
        esc.category = self.category;
        esc.escalates = Some(self.id);
        esc
    }

    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    pub fn acknowledge(&mut self, by: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_open() {
            return Err(VigilError::InvalidTransition {
                from: "resolved".to_string(),
                to: "acknowledged".to_string(),
                reason: format!("alert {} is already resolved", self.id),
            });
        }
        if self.acknowledged_at.is_none() {
            self.acknowledged_at = Some(now);
            self.acknowledged_by = Some(by.into());
        }
        Ok(())
    }

    /// Idempotent; resolving twice keeps the first timestamp.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        if self.resolved_at.is_none() {
            self.resolved_at = Some(now);
        }
    }

    /// An open, unacknowledged failure alert older than `after` that has not escalated yet.
    pub fn needs_escalation(&self, now: DateTime<Utc>, after: Duration) -> bool {
        self.kind == AlertKind::Failure
            && self.is_open()
            && !self.is_acknowledged()
            && self.escalated_at.is_none()
            && now - self.created_at >= after
    }
}

// ---------------------------------------------------------------------------
// AlertStatus (per control)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    None,
    Alerting,
    Muted,
    Acknowledged,
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertStatus::None => "none",
            AlertStatus::Alerting => "alerting",
            AlertStatus::Muted => "muted",
            AlertStatus::Acknowledged => "acknowledged",
        };
        f.write_str(s)
    }
}

/// What the alerting service has to emit after a control update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AlertAction {
    RaiseFailure,
    /// Resolve open alerts; `notify` is false when recovery alerts are disabled.
    Recover { notify: bool },
}

/// Advance `status.alert_status` for one control outcome.
pub fn advance_alert_status(
    status: &mut ControlMonitoringStatus,
    update: &ControlUpdate,
    alert_on_recovery: bool,
) -> Option<AlertAction> {
    if update.fresh_failure_streak && status.alert_status == AlertStatus::Acknowledged {
        status.alert_status = AlertStatus::None;
        status.acknowledged_by = None;
        status.acknowledged_at = None;
    }

    let entered_failing =
        update.current == ControlHealth::Failing && update.previous != ControlHealth::Failing;
    if entered_failing && status.alert_status == AlertStatus::None {
        status.alert_status = AlertStatus::Alerting;
        return Some(AlertAction::RaiseFailure);
    }

    let recovered =
        update.current == ControlHealth::Healthy && update.previous != ControlHealth::Healthy;
    if recovered
        && matches!(
            status.alert_status,
            AlertStatus::Alerting | AlertStatus::Acknowledged
        )
    {
        status.alert_status = AlertStatus::None;
        status.acknowledged_by = None;
        status.acknowledged_at = None;
        return Some(AlertAction::Recover {
            notify: alert_on_recovery,
        });
    }
    None
}

/// Operator acknowledgment of a control that is alerting.
pub fn acknowledge_control(
    status: &mut ControlMonitoringStatus,
    by: impl Into<String>,
    now: DateTime<Utc>,
) -> Result<()> {
    match status.alert_status {
        AlertStatus::Alerting => {
            status.alert_status = AlertStatus::Acknowledged;
            status.acknowledged_by = Some(by.into());
            status.acknowledged_at = Some(now);
            status.updated_at = now;
            Ok(())
        }
        AlertStatus::Acknowledged => Ok(()),
        other => Err(VigilError::InvalidTransition {
            from: other.to_string(),
            to: AlertStatus::Acknowledged.to_string(),
            reason: format!("control '{}' is not alerting", status.control_id),
        }),
    }
}

/// A manually resolved failure alert ends the control's alerting episode.
/// Muted controls stay muted.
pub fn clear_control_alert(status: &mut ControlMonitoringStatus, now: DateTime<Utc>) {
    if matches!(
        status.alert_status,
        AlertStatus::Alerting | AlertStatus::Acknowledged
    ) {
        status.alert_status = AlertStatus::None;
        status.acknowledged_by = None;
        status.acknowledged_at = None;
        status.updated_at = now;
    }
}

pub fn set_muted(status: &mut ControlMonitoringStatus, muted: bool, now: DateTime<Utc>) {
    status.alert_status = if muted {
        AlertStatus::Muted
    } else {
        AlertStatus::None
    };
    status.updated_at = now;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy_control(now: DateTime<Utc>) -> ControlMonitoringStatus {
        let mut s = ControlMonitoringStatus::new("cc-7.2", now);
        for _ in 0..3 {
            s.record_result(true, None, now);
        }
        s
    }

    fn feed(
        s: &mut ControlMonitoringStatus,
        passed: bool,
        now: DateTime<Utc>,
    ) -> Option<AlertAction> {
        let u = s.record_result(passed, None, now);
        advance_alert_status(s, &u, true)
    }

    #[test]
    fn alerting_fires_once_on_entering_failing() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        assert_eq!(feed(&mut s, false, now), None);
        assert_eq!(feed(&mut s, false, now), None);
        assert_eq!(feed(&mut s, false, now), Some(AlertAction::RaiseFailure));
        assert_eq!(s.alert_status, AlertStatus::Alerting);
        for _ in 0..5 {
            assert_eq!(feed(&mut s, false, now), None);
        }
        assert_eq!(s.alert_status, AlertStatus::Alerting);
    }

    #[test]
    fn muted_never_alerts() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        set_muted(&mut s, true, now);
        for _ in 0..4 {
            assert_eq!(feed(&mut s, false, now), None);
        }
        assert_eq!(s.alert_status, AlertStatus::Muted);
    }

    #[test]
    fn recovery_returns_to_none() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        for _ in 0..3 {
            feed(&mut s, false, now);
        }
        assert_eq!(feed(&mut s, true, now), None);
        assert_eq!(feed(&mut s, true, now), None);
        assert_eq!(
            feed(&mut s, true, now),
            Some(AlertAction::Recover { notify: true })
        );
        assert_eq!(s.alert_status, AlertStatus::None);
    }

    #[test]
    fn acknowledged_suppresses_until_fresh_streak() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        for _ in 0..3 {
            feed(&mut s, false, now);
        }
        acknowledge_control(&mut s, "alice", now).unwrap();
        assert_eq!(s.alert_status, AlertStatus::Acknowledged);
        assert_eq!(feed(&mut s, false, now), None);
        assert_eq!(s.alert_status, AlertStatus::Acknowledged);

        // One pass breaks the streak; the next failure starts a fresh one.
        feed(&mut s, true, now);
        feed(&mut s, false, now);
        assert_eq!(s.alert_status, AlertStatus::None);
        feed(&mut s, false, now);
        assert_eq!(feed(&mut s, false, now), Some(AlertAction::RaiseFailure));
    }

    #[test]
    fn clearing_alert_ends_episode_but_keeps_mute() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        for _ in 0..3 {
            feed(&mut s, false, now);
        }
        acknowledge_control(&mut s, "alice", now).unwrap();
        clear_control_alert(&mut s, now);
        assert_eq!(s.alert_status, AlertStatus::None);
        assert!(s.acknowledged_by.is_none());

        set_muted(&mut s, true, now);
        clear_control_alert(&mut s, now);
        assert_eq!(s.alert_status, AlertStatus::Muted);
    }

    #[test]
    fn acknowledge_requires_alerting() {
        let now = Utc::now();
        let mut s = healthy_control(now);
        assert!(acknowledge_control(&mut s, "bob", now).is_err());
    }

    #[test]
    fn escalation_window() {
        let now = Utc::now();
        let alert = Alert::new(
            AlertKind::Failure,
            Severity::High,
            AlertSubject::Integration("jira".into()),
            "sync failing",
            "config_error: project not found",
            vec![],
            now,
        );
        assert!(!alert.needs_escalation(now + Duration::hours(23), Duration::hours(24)));
        assert!(alert.needs_escalation(now + Duration::hours(24), Duration::hours(24)));

        let mut acked = alert.clone();
        acked.acknowledge("ops", now).unwrap();
        assert!(!acked.needs_escalation(now + Duration::hours(48), Duration::hours(24)));

        let esc = alert.escalation(vec!["cto@example.com".into()], now + Duration::hours(24));
        assert_eq!(esc.kind, AlertKind::Escalation);
        assert_eq!(esc.escalates, Some(alert.id));
        assert_eq!(esc.severity, Severity::Critical);
    }

    #[test]
    fn acknowledge_resolved_alert_fails() {
        let now = Utc::now();
        let mut alert = Alert::new(
            AlertKind::Failure,
            Severity::Medium,
            AlertSubject::Control("cc-1".into()),
            "t",
            "m",
            vec![],
            now,
        );
        alert.resolve(now);
        assert!(alert.acknowledge("x", now).is_err());
    }

    #[test]
    fn subject_serializes_tagged() {
        let s = AlertSubject::Integration("aws".into());
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, r#"{"type":"integration","id":"aws"}"#);
    }
}
