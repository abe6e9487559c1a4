//! Integration health aggregation.
//!
//! `IntegrationHealth` is created lazily on the first attempt for an
//! integration and mutated only by its owner in response to outcome events.
//! The discrete status is always recomputed from the stored inputs by
//! [`integration_status`], so two evaluations over the same record agree.

use crate::breaker::{BreakerSettings, BreakerTransition, CircuitBreaker};
use crate::classifier::ErrorCategory;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Streak at which an integration is unhealthy regardless of error rate.
pub const UNHEALTHY_STREAK: u32 = 3;
/// 24h error rate above which an integration is unhealthy.
pub const UNHEALTHY_ERROR_RATE: f64 = 0.20;
/// 24h error rate at or above which an integration is degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.05;
/// Multiple of the expected sync interval after which silence is degraded.
pub const STALE_INTERVAL_FACTOR: f64 = 1.25;

// ---------------------------------------------------------------------------
// HealthStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// RollingCounters
// ---------------------------------------------------------------------------

/// 24h and 7d success/failure counters.
///
/// At rollover the 24h counts fold into the 7d counts and reset; the 7d
/// counts reset once their window is a week old. Totals for the 7d window
/// therefore include the current 24h window (see [`RollingCounters::successes_7d`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingCounters {
    pub success_count_24h: u64,
    pub failure_count_24h: u64,
    pub success_count_7d: u64,
    pub failure_count_7d: u64,
    pub window_24h_started_at: DateTime<Utc>,
    pub window_7d_started_at: DateTime<Utc>,
}

impl RollingCounters {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            success_count_24h: 0,
            failure_count_24h: 0,
            success_count_7d: 0,
            failure_count_7d: 0,
            window_24h_started_at: now,
            window_7d_started_at: now,
        }
    }

    /// Apply any due rollovers. Returns true if anything changed.
    pub fn roll(&mut self, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if now - self.window_7d_started_at >= Duration::days(7) {
            self.success_count_7d = 0;
            self.failure_count_7d = 0;
            self.window_7d_started_at = now;
            changed = true;
        }
        if now - self.window_24h_started_at >= Duration::hours(24) {
            self.success_count_7d += self.success_count_24h;
            self.failure_count_7d += self.failure_count_24h;
            self.success_count_24h = 0;
            self.failure_count_24h = 0;
            self.window_24h_started_at = now;
            changed = true;
        }
        changed
    }

    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        self.roll(now);
        if success {
            self.success_count_24h += 1;
        } else {
            self.failure_count_24h += 1;
        }
    }

    /// Failures over all outcomes in the current 24h window; 0 when empty.
    pub fn error_rate_24h(&self) -> f64 {
        let total = self.success_count_24h + self.failure_count_24h;
        if total == 0 {
            return 0.0;
        }
        self.failure_count_24h as f64 / total as f64
    }

    pub fn successes_7d(&self) -> u64 {
        self.success_count_7d + self.success_count_24h
    }

    pub fn failures_7d(&self) -> u64 {
        self.failure_count_7d + self.failure_count_24h
    }
}

// ---------------------------------------------------------------------------
// Status derivation
// ---------------------------------------------------------------------------

/// Inputs to [`integration_status`], split out so the rule is testable alone.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub error_rate_24h: f64,
    pub now: DateTime<Utc>,
    pub expected_interval: Duration,
}

pub fn integration_status(inputs: &HealthInputs) -> HealthStatus {
    let Some(last_success) = inputs.last_successful_sync_at else {
        return HealthStatus::Unknown;
    };
    if inputs.consecutive_failures >= UNHEALTHY_STREAK
        || inputs.error_rate_24h > UNHEALTHY_ERROR_RATE
    {
        return HealthStatus::Unhealthy;
    }
    let silence_ms = (inputs.now - last_success).num_milliseconds() as f64;
    let stale_after_ms = inputs.expected_interval.num_milliseconds() as f64 * STALE_INTERVAL_FACTOR;
    if inputs.error_rate_24h >= DEGRADED_ERROR_RATE || silence_ms > stale_after_ms {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

// ---------------------------------------------------------------------------
// IntegrationHealth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub category: ErrorCategory,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationHealth {
    pub integration_id: String,
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_successful_sync_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub counters: RollingCounters,
    #[serde(default)]
    pub average_duration_ms: u64,
    #[serde(default)]
    pub total_successes: u64,
    #[serde(flatten)]
    pub breaker: CircuitBreaker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<LastError>,
    pub updated_at: DateTime<Utc>,
}

/// What changed as a result of one outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthUpdate {
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub breaker: Option<BreakerTransition>,
}

impl HealthUpdate {
    pub fn changed(&self) -> bool {
        self.previous != self.current
    }
}

impl IntegrationHealth {
    pub fn new(integration_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            integration_id: integration_id.into(),
            status: HealthStatus::Unknown,
            last_successful_sync_at: None,
            last_attempt_at: None,
            consecutive_failures: 0,
            counters: RollingCounters::new(now),
            average_duration_ms: 0,
            total_successes: 0,
            breaker: CircuitBreaker::default(),
            last_error: None,
            updated_at: now,
        }
    }

    pub fn inputs(&self, now: DateTime<Utc>, expected_interval: Duration) -> HealthInputs {
        HealthInputs {
            last_successful_sync_at: self.last_successful_sync_at,
            consecutive_failures: self.consecutive_failures,
            error_rate_24h: self.counters.error_rate_24h(),
            now,
            expected_interval,
        }
    }

    /// Recompute `status` from the stored inputs.
    pub fn refresh(&mut self, now: DateTime<Utc>, expected_interval: Duration) -> HealthUpdate {
        let previous = self.status;
        self.counters.roll(now);
        self.status = integration_status(&self.inputs(now, expected_interval));
        self.updated_at = now;
        HealthUpdate {
            previous,
            current: self.status,
            breaker: None,
        }
    }

    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        duration_ms: u64,
        expected_interval: Duration,
    ) -> HealthUpdate {
        self.counters.record(true, now);
        self.consecutive_failures = 0;
        self.last_successful_sync_at = Some(now);
        self.last_attempt_at = Some(now);
        self.average_duration_ms = running_mean(self.average_duration_ms, self.total_successes, duration_ms);
        self.total_successes += 1;
        let breaker = self.breaker.on_success(now);
        let mut update = self.refresh(now, expected_interval);
        update.breaker = breaker;
        update
    }

    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        category: ErrorCategory,
        message: impl Into<String>,
        settings: &BreakerSettings,
        expected_interval: Duration,
    ) -> HealthUpdate {
        self.counters.record(false, now);
        self.consecutive_failures += 1;
        self.last_attempt_at = Some(now);
        self.last_error = Some(LastError {
            category,
            message: message.into(),
            at: now,
        });
        let breaker = self
            .breaker
            .on_failure(self.consecutive_failures, now, settings);
        let mut update = self.refresh(now, expected_interval);
        update.breaker = breaker;
        update
    }
}

fn running_mean(mean: u64, count: u64, sample: u64) -> u64 {
    let total = mean as u128 * count as u128 + sample as u128;
    (total / (count as u128 + 1)) as u64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
