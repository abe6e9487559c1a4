//! Outcome events.
//!
//! Each stage publishes what happened as an explicit event; breaker, health,
//! retry planning, and alerting are independent handlers of these values.

use crate::alert::AlertAction;
use crate::breaker::BreakerTransition;
use crate::classifier::ErrorCategory;
use crate::control::ControlUpdate;
use crate::health::HealthStatus;
use crate::retry::TerminalReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Result of one adapter call, as routed to the integration owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AttemptResult {
    Success {
        duration_ms: u64,
        items: u64,
        /// Control checks that did not hold; a probe passes only when zero.
        failed_checks: u32,
    },
    Failure {
        category: ErrorCategory,
        message: String,
        timed_out: bool,
        duration_ms: u64,
    },
}

impl AttemptResult {
    pub fn is_success(&self) -> bool {
        matches!(self, AttemptResult::Success { .. })
    }

    /// Whether a control probe counts this as a pass.
    pub fn control_passed(&self) -> bool {
        matches!(self, AttemptResult::Success { failed_checks: 0, .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptOutcome {
    pub task_id: Uuid,
    pub attempt_id: Uuid,
    pub integration_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    pub retry_attempt: u32,
    pub at: DateTime<Utc>,
    pub result: AttemptResult,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OutcomeEvent {
    AttemptFinished(AttemptOutcome),
    HealthChanged {
        integration_id: String,
        previous: HealthStatus,
        current: HealthStatus,
        at: DateTime<Utc>,
    },
    BreakerChanged {
        integration_id: String,
        transition: BreakerTransition,
    },
    /// First success after a failure streak.
    IntegrationRecovered {
        integration_id: String,
        at: DateTime<Utc>,
    },
    ControlUpdated {
        control_id: String,
        integration_id: String,
        update: ControlUpdate,
        #[serde(skip_serializing_if = "Option::is_none")]
        alert: Option<AlertAction>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    RetryScheduled {
        task_id: Uuid,
        attempt_id: Uuid,
        retry_attempt: u32,
        delay_ms: u64,
        due_at: DateTime<Utc>,
    },
    OccurrenceFailed {
        task_id: Uuid,
        attempt_id: Uuid,
        integration_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        control_id: Option<String>,
        category: ErrorCategory,
        message: String,
        reason: TerminalReason,
        at: DateTime<Utc>,
    },
    /// Dispatch skipped because the breaker rejected admission.
    CircuitSkipped {
        task_id: Uuid,
        integration_id: String,
        at: DateTime<Utc>,
    },
}

impl OutcomeEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutcomeEvent::AttemptFinished(_) => "attempt_finished",
            OutcomeEvent::HealthChanged { .. } => "health_changed",
            OutcomeEvent::BreakerChanged { .. } => "breaker_changed",
            OutcomeEvent::IntegrationRecovered { .. } => "integration_recovered",
            OutcomeEvent::ControlUpdated { .. } => "control_updated",
            OutcomeEvent::RetryScheduled { .. } => "retry_scheduled",
            OutcomeEvent::OccurrenceFailed { .. } => "occurrence_failed",
            OutcomeEvent::CircuitSkipped { .. } => "circuit_skipped",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_pass_requires_zero_failed_checks() {
        let ok = AttemptResult::Success {
            duration_ms: 1,
            items: 4,
            failed_checks: 0,
        };
        let partial = AttemptResult::Success {
            duration_ms: 1,
            items: 4,
            failed_checks: 1,
        };
        let failed = AttemptResult::Failure {
            category: ErrorCategory::Transient,
            message: "503".into(),
            timed_out: false,
            duration_ms: 9,
        };
        assert!(ok.control_passed());
        assert!(!partial.control_passed());
        assert!(partial.is_success());
        assert!(!failed.control_passed());
    }

    #[test]
    fn events_serialize_with_tag() {
        let e = OutcomeEvent::IntegrationRecovered {
            integration_id: "github".into(),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["event"], "integration_recovered");
        assert_eq!(e.name(), "integration_recovered");
    }
}
