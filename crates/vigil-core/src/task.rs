//! Scheduled task definitions.
//!
//! A `ScheduledTask` is a recurring sync job (or control-test probe) against one
//! integration. The scheduler claims a task through its lease fields; only the
//! holder of an unexpired lease may run an attempt for it.

use crate::backoff::BackoffPolicy;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Frequency
// ---------------------------------------------------------------------------

/// How often a task recurs. Parsed from `hourly`, `daily`, `weekly`, or
/// `every <n><s|m|h|d>` (e.g. `every 15m`).
/// Longest `every` interval accepted: one year.
pub const MAX_EVERY_SECS: u64 = 365 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
    Every { secs: u64 },
}

impl Frequency {
    pub fn interval(self) -> Duration {
        match self {
            Frequency::Hourly => Duration::hours(1),
            Frequency::Daily => Duration::days(1),
            Frequency::Weekly => Duration::weeks(1),
            Frequency::Every { secs } => Duration::seconds(secs.min(MAX_EVERY_SECS) as i64),
        }
    }

    /// The next occurrence strictly after `now`.
    pub fn next_after(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.interval())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Frequency::Hourly => f.write_str("hourly"),
            Frequency::Daily => f.write_str("daily"),
            Frequency::Weekly => f.write_str("weekly"),
            Frequency::Every { secs } => {
                if secs % 86_400 == 0 {
                    write!(f, "every {}d", secs / 86_400)
                } else if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = VigilError;
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_ascii_lowercase();
        match trimmed.as_str() {
            "hourly" => return Ok(Frequency::Hourly),
            "daily" => return Ok(Frequency::Daily),
            "weekly" => return Ok(Frequency::Weekly),
            _ => {}
        }
        let invalid = || VigilError::InvalidFrequency(s.to_string());
        let spec = trimmed.strip_prefix("every").ok_or_else(invalid)?.trim();
        let (at, unit) = spec.char_indices().last().ok_or_else(invalid)?;
        let unit_secs: u64 = match unit {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86_400,
            _ => return Err(invalid()),
        };
        let n: u64 = spec[..at].trim().parse().map_err(|_| invalid())?;
        let secs = n
            .checked_mul(unit_secs)
            .filter(|secs| (1..=MAX_EVERY_SECS).contains(secs))
            .ok_or_else(invalid)?;
        Ok(Frequency::Every { secs })
    }
}

impl TryFrom<String> for Frequency {
    type Error = VigilError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Frequency> for String {
    fn from(f: Frequency) -> Self {
        f.to_string()
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, clamp_jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            clamp_jitter,
            ..BackoffPolicy::from_millis(self.backoff_base_ms, self.backoff_max_ms)
        }
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Outcome of the most recent occurrence, as shown on the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Retrying,
    Failed,
    Skipped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Retrying => "retrying",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ScheduledTask
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub integration_id: String,
    /// Set for control-test probes; sync jobs leave it empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_id: Option<String>,
    pub frequency: Frequency,
    pub enabled: bool,
    pub retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_token: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Create an enabled task whose first occurrence is due at `first_run_at`.
    pub fn new(
        integration_id: impl Into<String>,
        control_id: Option<String>,
        frequency: Frequency,
        retry: RetryPolicy,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            integration_id: integration_id.into(),
            control_id,
            frequency,
            enabled: true,
            retry,
            last_run_at: None,
            last_status: None,
            next_run_at: first_run_at,
            success_count: 0,
            error_count: 0,
            lease_token: None,
            lease_expiry: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_control_probe(&self) -> bool {
        self.control_id.is_some()
    }

    /// No lease is held, or the held lease has expired.
    pub fn lease_free(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry.map_or(true, |exp| exp <= now)
    }

    /// `enabled AND next_run_at <= now AND lease_expiry <= now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.next_run_at <= now && self.lease_free(now)
    }

    /// Take the lease until `now + lease`. Returns the fresh token.
    pub fn take_lease(&mut self, now: DateTime<Utc>, lease: Duration) -> Uuid {
        let token = Uuid::new_v4();
        self.lease_token = Some(token);
        self.lease_expiry = Some(now + lease);
        self.updated_at = now;
        token
    }

    /// Drop the lease if `token` still owns it. Returns whether it was released.
    pub fn release_lease(&mut self, token: Uuid, now: DateTime<Utc>) -> bool {
        if self.lease_token != Some(token) {
            return false;
        }
        self.lease_token = None;
        self.lease_expiry = None;
        self.updated_at = now;
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn task_due_at(ts: DateTime<Utc>) -> ScheduledTask {
        ScheduledTask::new("aws-prod", None, Frequency::Daily, RetryPolicy::default(), ts)
    }

    #[test]
    fn frequency_parses_keywords_and_intervals() {
        assert_eq!("hourly".parse::<Frequency>().unwrap(), Frequency::Hourly);
        assert_eq!(" Daily ".parse::<Frequency>().unwrap(), Frequency::Daily);
        assert_eq!(
            "every 15m".parse::<Frequency>().unwrap(),
            Frequency::Every { secs: 900 }
        );
        assert_eq!(
            "every 2d".parse::<Frequency>().unwrap(),
            Frequency::Every { secs: 172_800 }
        );
    }

    #[test]
    fn frequency_rejects_garbage() {
        for s in ["", "sometimes", "every", "every 0m", "every 5y", "every xm"] {
            assert!(s.parse::<Frequency>().is_err(), "expected error for {s:?}");
        }
    }

    #[test]
    fn frequency_rejects_multibyte_unit_without_panicking() {
        for s in ["every 5é", "every é", "every 5日"] {
            let err = s.parse::<Frequency>().unwrap_err();
            assert!(matches!(err, VigilError::InvalidFrequency(_)), "{s:?}: {err}");
        }
    }

    #[test]
    fn frequency_rejects_intervals_beyond_a_year() {
        for s in ["every 999999999999d", "every 18446744073709551615s", "every 366d"] {
            let err = s.parse::<Frequency>().unwrap_err();
            assert!(matches!(err, VigilError::InvalidFrequency(_)), "{s:?}: {err}");
        }
        assert_eq!(
            "every 365d".parse::<Frequency>().unwrap(),
            Frequency::Every { secs: MAX_EVERY_SECS }
        );
    }

    #[test]
    fn oversized_interval_saturates_instead_of_overflowing() {
        let f = Frequency::Every { secs: u64::MAX };
        assert_eq!(f.interval(), Duration::seconds(MAX_EVERY_SECS as i64));
        let late = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert_eq!(f.next_after(late), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn frequency_display_roundtrips_through_yaml() {
        let f = Frequency::Every { secs: 1800 };
        assert_eq!(f.to_string(), "every 30m");
        let yaml = serde_yaml::to_string(&f).unwrap();
        let parsed: Frequency = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, f);
    }

    #[test]
    fn due_requires_enabled_time_and_free_lease() {
        let now = Utc::now();
        let mut task = task_due_at(now - Duration::seconds(1));
        assert!(task.is_due(now));

        task.take_lease(now, Duration::minutes(5));
        assert!(!task.is_due(now));
        assert!(task.is_due(now + Duration::minutes(5)));

        let mut disabled = task_due_at(now - Duration::seconds(1));
        disabled.enabled = false;
        assert!(!disabled.is_due(now));

        let future = task_due_at(now + Duration::seconds(30));
        assert!(!future.is_due(now));
    }

    #[test]
    fn release_lease_requires_matching_token() {
        let now = Utc::now();
        let mut task = task_due_at(now);
        let token = task.take_lease(now, Duration::minutes(5));
        assert!(!task.release_lease(Uuid::new_v4(), now));
        assert!(task.lease_token.is_some());
        assert!(task.release_lease(token, now));
        assert!(task.lease_free(now));
    }
}
