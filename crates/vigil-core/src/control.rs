//! Monitored control status.
//!
//! Driven by control-test outcomes: each probe occurrence yields one pass or
//! one failure. Health and score are a step function of the current streaks.

use crate::alert::AlertStatus;
use crate::health::RollingCounters;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Failure streak at which a control is failing.
pub const FAILING_STREAK: u32 = 3;
/// Pass streak at which a control is healthy again.
pub const HEALTHY_STREAK: u32 = 3;

// ---------------------------------------------------------------------------
// ControlHealth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlHealth {
    Healthy,
    Degraded,
    Failing,
    #[default]
    Unknown,
}

impl std::fmt::Display for ControlHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ControlHealth::Healthy => "healthy",
            ControlHealth::Degraded => "degraded",
            ControlHealth::Failing => "failing",
            ControlHealth::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Health and score for the given streaks.
///
/// Only one streak is ever non-zero. A short pass streak (1–2) keeps a healthy
/// control healthy and leaves any other control degraded until the third pass.
pub fn control_health(previous: ControlHealth, failures: u32, passes: u32) -> (ControlHealth, u8) {
    if failures >= FAILING_STREAK {
        let score = 100u32.saturating_sub(20 * failures.min(5));
        return (ControlHealth::Failing, score as u8);
    }
    if failures > 0 {
        let score = 100u32.saturating_sub(15 * failures).max(50);
        return (ControlHealth::Degraded, score as u8);
    }
    if passes >= HEALTHY_STREAK {
        return (ControlHealth::Healthy, 100);
    }
    if passes > 0 {
        let score = (80 + 5 * passes).min(100) as u8;
        let health = if previous == ControlHealth::Healthy {
            ControlHealth::Healthy
        } else {
            ControlHealth::Degraded
        };
        return (health, score);
    }
    (previous, 0)
}

// ---------------------------------------------------------------------------
// ControlMonitoringStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMonitoringStatus {
    pub control_id: String,
    pub monitoring_enabled: bool,
    pub consecutive_failures: u32,
    pub consecutive_passes: u32,
    pub current_health: ControlHealth,
    pub health_score: u8,
    pub alert_status: AlertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub counters: RollingCounters,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ControlUpdate {
    pub passed: bool,
    pub previous: ControlHealth,
    pub current: ControlHealth,
    pub score: u8,
    /// This failure started a new failure streak.
    pub fresh_failure_streak: bool,
}

impl ControlMonitoringStatus {
    pub fn new(control_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            control_id: control_id.into(),
            monitoring_enabled: true,
            consecutive_failures: 0,
            consecutive_passes: 0,
            current_health: ControlHealth::Unknown,
            health_score: 0,
            alert_status: AlertStatus::None,
            acknowledged_by: None,
            acknowledged_at: None,
            counters: RollingCounters::new(now),
            last_tested_at: None,
            last_result: None,
            last_failure_reason: None,
            updated_at: now,
        }
    }

    pub fn record_result(
        &mut self,
        passed: bool,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> ControlUpdate {
        let previous = self.current_health;
        self.counters.record(passed, now);
        if passed {
            self.consecutive_passes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_passes = 0;
            self.last_failure_reason = reason;
        }
        let (health, score) =
            control_health(previous, self.consecutive_failures, self.consecutive_passes);
        self.current_health = health;
        self.health_score = score;
        self.last_tested_at = Some(now);
        self.last_result = Some(passed);
        self.updated_at = now;
        ControlUpdate {
            passed,
            previous,
            current: health,
            score,
            fresh_failure_streak: !passed && self.consecutive_failures == 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_scores() {
        assert_eq!(control_health(ControlHealth::Healthy, 1, 0), (ControlHealth::Degraded, 85));
        assert_eq!(control_health(ControlHealth::Healthy, 2, 0), (ControlHealth::Degraded, 70));
        assert_eq!(control_health(ControlHealth::Healthy, 3, 0), (ControlHealth::Failing, 40));
        assert_eq!(control_health(ControlHealth::Failing, 4, 0), (ControlHealth::Failing, 20));
        assert_eq!(control_health(ControlHealth::Failing, 5, 0), (ControlHealth::Failing, 0));
        assert_eq!(control_health(ControlHealth::Failing, 9, 0), (ControlHealth::Failing, 0));
    }

    #[test]
    fn pass_scores() {
        assert_eq!(control_health(ControlHealth::Failing, 0, 1), (ControlHealth::Degraded, 85));
        assert_eq!(control_health(ControlHealth::Degraded, 0, 2), (ControlHealth::Degraded, 90));
        assert_eq!(control_health(ControlHealth::Degraded, 0, 3), (ControlHealth::Healthy, 100));
        assert_eq!(control_health(ControlHealth::Healthy, 0, 1), (ControlHealth::Healthy, 85));
    }

    #[test]
    fn health_is_pure() {
        for f in 0..6 {
            for p in 0..6 {
                if f > 0 && p > 0 {
                    continue;
                }
                let a = control_health(ControlHealth::Degraded, f, p);
                let b = control_health(ControlHealth::Degraded, f, p);
                assert_eq!(a, b);
            }
        }
    }

    #[test]
    fn three_failures_walk_healthy_degraded_failing() {
        let now = Utc::now();
        let mut s = ControlMonitoringStatus::new("cc-6.1", now);
        for _ in 0..3 {
            s.record_result(true, None, now);
        }
        assert_eq!(s.current_health, ControlHealth::Healthy);

        let u1 = s.record_result(false, Some("mfa disabled".into()), now);
        assert_eq!((u1.previous, u1.current), (ControlHealth::Healthy, ControlHealth::Degraded));
        assert!(u1.fresh_failure_streak);

        let u2 = s.record_result(false, None, now);
        assert_eq!(u2.current, ControlHealth::Degraded);
        assert!(!u2.fresh_failure_streak);

        let u3 = s.record_result(false, None, now);
        assert_eq!((u3.previous, u3.current), (ControlHealth::Degraded, ControlHealth::Failing));
        assert_eq!(s.health_score, 40);
        assert_eq!(s.consecutive_passes, 0);
    }
}
