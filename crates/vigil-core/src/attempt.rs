//! Sync attempt log.
//!
//! Every execution of a task is one `SyncAttempt`. Retries of the same
//! occurrence point back at the attempt they retry through `parent_attempt_id`,
//! so an occurrence is a singly-linked chain rooted at a `retry_attempt == 0` row.
//!
//! Transitions: `Scheduled → Running → Completed | Failed | Timeout`,
//! `Scheduled → Skipped` (task disabled before the retry was dispatched).

use crate::classifier::ErrorCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// AttemptStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// A planned retry waiting for `next_retry_at`.
    Scheduled,
    Running,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Scheduled | AttemptStatus::Running)
    }

    /// Failed or timed out; the statuses eligible for a retry.
    pub fn is_failure(self) -> bool {
        matches!(self, AttemptStatus::Failed | AttemptStatus::Timeout)
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttemptStatus::Scheduled => "scheduled",
            AttemptStatus::Running => "running",
            AttemptStatus::Completed => "completed",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Timeout => "timeout",
            AttemptStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// SyncAttempt
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAttempt {
    pub id: Uuid,
    pub task_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_attempt_id: Option<Uuid>,
    pub status: AttemptStatus,
    /// 0 for the first attempt of an occurrence.
    pub retry_attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(default)]
    pub items_processed: u64,
    pub created_at: DateTime<Utc>,
}

impl SyncAttempt {
    /// The first attempt of a fresh occurrence, already running.
    pub fn first(task_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            parent_attempt_id: None,
            status: AttemptStatus::Running,
            retry_attempt: 0,
            started_at: Some(now),
            completed_at: None,
            duration_ms: None,
            error_category: None,
            error_message: None,
            next_retry_at: None,
            backoff_ms: None,
            items_processed: 0,
            created_at: now,
        }
    }

    /// A retry of `parent`, due at `due_at`. The parent keeps `next_retry_at`
    /// and `backoff_ms` so the chain is readable from either end.
    pub fn retry_of(parent: &SyncAttempt, due_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: parent.task_id,
            parent_attempt_id: Some(parent.id),
            status: AttemptStatus::Scheduled,
            retry_attempt: parent.retry_attempt + 1,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_category: None,
            error_message: None,
            next_retry_at: Some(due_at),
            backoff_ms: None,
            items_processed: 0,
            created_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        self.status = AttemptStatus::Running;
        self.started_at = Some(now);
    }

    pub fn complete(&mut self, now: DateTime<Utc>, duration_ms: u64, items: u64) {
        self.status = AttemptStatus::Completed;
        self.completed_at = Some(now);
        self.duration_ms = Some(duration_ms);
        self.items_processed = items;
    }

    pub fn fail(
        &mut self,
        status: AttemptStatus,
        category: ErrorCategory,
        message: impl Into<String>,
        now: DateTime<Utc>,
        duration_ms: u64,
    ) {
        self.status = status;
        self.completed_at = Some(now);
        self.duration_ms = Some(duration_ms);
        self.error_category = Some(category);
        self.error_message = Some(message.into());
    }

    pub fn skip(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = AttemptStatus::Skipped;
        self.completed_at = Some(now);
        self.error_message = Some(reason.into());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
