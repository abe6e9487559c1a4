//! Per-integration circuit breaker.
//!
//! ```text
//! Closed ──(consecutive_failures >= threshold)──► Open
//! Open ──(now > opened_at + reset_interval)──► HalfOpen
//! HalfOpen ──(probe ok)──► Closed      HalfOpen ──(probe fails)──► Open
//! ```
//!
//! The breaker only moves in response to attempt outcomes and admission
//! checks. Admission rejections are not attempts: they never touch the
//! failure streak. A half-open probe that produces no outcome within
//! `probe_lease` is treated as abandoned and its slot is handed out again.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BreakerState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// BreakerSettings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub threshold: u32,
    pub reset_interval: Duration,
    /// How long a claimed probe may stay outstanding before it is abandoned.
    pub probe_lease: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_interval: Duration::milliseconds(600_000),
            probe_lease: Duration::seconds(300),
        }
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Whether the scheduler may dispatch an attempt right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    Allowed,
    /// The single half-open probe. The caller owns it until an outcome arrives
    /// or it hands it back with [`CircuitBreaker::release_probe`].
    Probe,
    Rejected,
}

impl Admission {
    pub fn permits(self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// CircuitBreaker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    #[serde(rename = "circuit_breaker_state")]
    pub state: BreakerState,
    #[serde(
        rename = "circuit_breaker_opened_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "circuit_breaker_half_open_at",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub half_open_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub probe_in_flight: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_started_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    fn transition(&mut self, to: BreakerState, now: DateTime<Utc>) -> BreakerTransition {
        let from = self.state;
        self.state = to;
        BreakerTransition { from, to, at: now }
    }

    fn clear_probe(&mut self) {
        self.probe_in_flight = false;
        self.probe_started_at = None;
    }

    /// An outstanding probe whose lease ran out, or one with no start time.
    pub fn probe_abandoned(&self, now: DateTime<Utc>, settings: &BreakerSettings) -> bool {
        self.probe_in_flight
            && self
                .probe_started_at
                .map_or(true, |started| now >= started + settings.probe_lease)
    }

    /// Open → HalfOpen once the cool-down has strictly elapsed.
    pub fn poll(&mut self, now: DateTime<Utc>, settings: &BreakerSettings) -> Option<BreakerTransition> {
        if self.state != BreakerState::Open {
            return None;
        }
        let opened_at = self.opened_at.unwrap_or(now);
        if now > opened_at + settings.reset_interval {
            self.half_open_at = Some(now);
            self.clear_probe();
            return Some(self.transition(BreakerState::HalfOpen, now));
        }
        None
    }

    /// Decide whether an attempt may run, claiming the probe slot when half-open.
    pub fn admit(&mut self, now: DateTime<Utc>, settings: &BreakerSettings) -> Admission {
        self.poll(now, settings);
        match self.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => Admission::Rejected,
            BreakerState::HalfOpen
                if self.probe_in_flight && !self.probe_abandoned(now, settings) =>
            {
                Admission::Rejected
            }
            BreakerState::HalfOpen => {
                self.probe_in_flight = true;
                self.probe_started_at = Some(now);
                Admission::Probe
            }
        }
    }

    /// Hand back an unused probe slot (the dispatch lost its claim race, or
    /// the process that held it is gone).
    pub fn release_probe(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.clear_probe();
        }
    }

    pub fn on_success(&mut self, now: DateTime<Utc>) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::HalfOpen => {
                self.opened_at = None;
                self.half_open_at = None;
                self.clear_probe();
                Some(self.transition(BreakerState::Closed, now))
            }
            // A straggler that started before the breaker opened does not end the cool-down.
            BreakerState::Open | BreakerState::Closed => None,
        }
    }

    /// `consecutive_failures` is the streak *including* this failure.
    pub fn on_failure(
        &mut self,
        consecutive_failures: u32,
        now: DateTime<Utc>,
        settings: &BreakerSettings,
    ) -> Option<BreakerTransition> {
        match self.state {
            BreakerState::Closed if consecutive_failures >= settings.threshold.max(1) => {
                self.opened_at = Some(now);
                Some(self.transition(BreakerState::Open, now))
            }
            BreakerState::HalfOpen => {
                self.opened_at = Some(now);
                self.clear_probe();
                Some(self.transition(BreakerState::Open, now))
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
