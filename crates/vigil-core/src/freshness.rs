//! Artifact freshness scoring against SLA tables.
//!
//! Scores are recomputed in batch and are a pure function of
//! `(collected_at, valid_until, sla, now)`, so rescoring is idempotent.

use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Placeholder for an unset key component.
pub const WILDCARD: &str = "*";

// ---------------------------------------------------------------------------
// SLA
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessSla {
    pub max_age_days: u32,
    /// Age in days at which an artifact is in the warning band.
    pub warning_days: u32,
    /// Age in days at which an artifact is critical.
    pub critical_days: u32,
}

impl Default for FreshnessSla {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            warning_days: 60,
            critical_days: 80,
        }
    }
}

/// `(org, type, source)` with `None` as a wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlaKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl SlaKey {
    pub fn new(org: Option<&str>, artifact_type: Option<&str>, source: Option<&str>) -> Self {
        Self {
            org: org.map(str::to_string),
            artifact_type: artifact_type.map(str::to_string),
            source: source.map(str::to_string),
        }
    }

    pub fn global() -> Self {
        Self::new(None, None, None)
    }

    /// Store key: `org|type|source` with `*` for wildcards.
    pub fn encode(&self) -> String {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| WILDCARD.to_string());
        format!(
            "{}|{}|{}",
            part(&self.org),
            part(&self.artifact_type),
            part(&self.source)
        )
    }

    pub fn decode(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('|').collect();
        let [org, ty, source] = parts.as_slice() else {
            return Err(VigilError::Store(format!("malformed sla key '{key}'")));
        };
        let part = |p: &str| (p != WILDCARD).then(|| p.to_string());
        Ok(Self {
            org: part(*org),
            artifact_type: part(*ty),
            source: part(*source),
        })
    }

    /// Candidate keys for an artifact, most specific first.
    pub fn lookup_order(org: &str, artifact_type: &str, source: &str) -> [SlaKey; 5] {
        [
            SlaKey::new(Some(org), Some(artifact_type), Some(source)),
            SlaKey::new(Some(org), Some(artifact_type), None),
            SlaKey::new(Some(org), None, Some(source)),
            SlaKey::new(Some(org), None, None),
            SlaKey::global(),
        ]
    }
}

impl std::fmt::Display for SlaKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Most specific SLA for the artifact, falling back to `default`.
pub fn resolve_sla(
    table: &HashMap<SlaKey, FreshnessSla>,
    artifact: &Artifact,
    default: FreshnessSla,
) -> FreshnessSla {
    SlaKey::lookup_order(&artifact.org, &artifact.artifact_type, &artifact.source)
        .iter()
        .find_map(|k| table.get(k).copied())
        .unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessLevel {
    Fresh,
    Warning,
    Critical,
    Stale,
    Expired,
}

impl std::fmt::Display for FreshnessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FreshnessLevel::Fresh => "fresh",
            FreshnessLevel::Warning => "warning",
            FreshnessLevel::Critical => "critical",
            FreshnessLevel::Stale => "stale",
            FreshnessLevel::Expired => "expired",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessRecord {
    pub freshness_score: u8,
    pub days_stale: u32,
    pub level: FreshnessLevel,
    pub sla: FreshnessSla,
    pub scored_at: DateTime<Utc>,
}

const DAY_SECS: i64 = 86_400;

fn whole_days(secs: i64) -> i64 {
    secs.div_euclid(DAY_SECS)
}

fn clamp_score(v: i64) -> u8 {
    v.clamp(0, 100) as u8
}

/// `100 - floor(age * 100 / max)`, in whole days.
fn age_score(age: i64, max: i64) -> i64 {
    100 - age.min(max) * 100 / max.max(1)
}

/// Score one artifact.
pub fn score(
    collected_at: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
    sla: FreshnessSla,
    now: DateTime<Utc>,
) -> FreshnessRecord {
    let age = whole_days((now - collected_at).num_seconds()).max(0);
    let max = i64::from(sla.max_age_days);

    let (score, days_stale, level) = match valid_until {
        Some(until) => {
            let d = whole_days((until - now).num_seconds());
            if d < 0 {
                (0, -d, FreshnessLevel::Expired)
            } else if d <= 7 {
                (25 + 5 * d, 0, FreshnessLevel::Critical)
            } else if d <= 30 {
                (50 + 2 * (d - 7), 0, FreshnessLevel::Warning)
            } else {
                (age_score(age, max), 0, age_level(age, &sla))
            }
        }
        None if age > max => {
            let s = (100 - (age - max) * 10).max(0);
            (s, age - max, FreshnessLevel::Stale)
        }
        None => (age_score(age, max), 0, age_level(age, &sla)),
    };

    FreshnessRecord {
        freshness_score: clamp_score(score),
        days_stale: days_stale.clamp(0, i64::from(u32::MAX)) as u32,
        level,
        sla,
        scored_at: now,
    }
}

fn age_level(age: i64, sla: &FreshnessSla) -> FreshnessLevel {
    if age > i64::from(sla.max_age_days) {
        FreshnessLevel::Stale
    } else if age >= i64::from(sla.critical_days) {
        FreshnessLevel::Critical
    } else if age >= i64::from(sla.warning_days) {
        FreshnessLevel::Warning
    } else {
        FreshnessLevel::Fresh
    }
}

// ---------------------------------------------------------------------------
// Artifact
// ---------------------------------------------------------------------------

/// A piece of collected evidence whose age is tracked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub org: String,
    pub artifact_type: String,
    pub source: String,
    pub collected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<FreshnessRecord>,
}

impl Artifact {
    pub fn rescore(
        &mut self,
        table: &HashMap<SlaKey, FreshnessSla>,
        default: FreshnessSla,
        now: DateTime<Utc>,
    ) -> &FreshnessRecord {
        let sla = resolve_sla(table, self, default);
        self.freshness.insert(score(self.collected_at, self.valid_until, sla, now))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
