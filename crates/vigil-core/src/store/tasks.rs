use super::{db_err, load_json, put_json, queue_key, Store, ATTEMPTS, RETRY_QUEUE, TASKS};
use crate::attempt::{AttemptStatus, SyncAttempt};
use crate::error::{Result, VigilError};
use crate::task::{RunStatus, ScheduledTask};
use chrono::{DateTime, Duration, Utc};
use redb::WriteTransaction;
use uuid::Uuid;

/// A won claim: the task as stored after the claim, the lease token, and the
/// attempt that now runs under it.
#[derive(Debug, Clone)]
pub struct Claim {
    pub task: ScheduledTask,
    pub token: Uuid,
    pub attempt: SyncAttempt,
}

#[derive(Debug, Clone)]
pub enum RetryClaim {
    Claimed(Claim),
    /// The task was disabled; the retry was marked skipped.
    Skipped(SyncAttempt),
    /// Another attempt holds the task lease; try again on a later tick.
    Busy,
    /// The retry is no longer scheduled (dispatched elsewhere or removed).
    Gone,
}

fn load_task(wt: &WriteTransaction, id: Uuid) -> Result<ScheduledTask> {
    load_json(wt, TASKS, &id.to_string())?.ok_or_else(|| VigilError::TaskNotFound(id.to_string()))
}

fn save_task(wt: &WriteTransaction, task: &ScheduledTask) -> Result<()> {
    put_json(wt, TASKS, &task.id.to_string(), task)
}

fn dequeue(wt: &WriteTransaction, attempt: &SyncAttempt) -> Result<()> {
    if let Some(due) = attempt.next_retry_at {
        let mut queue = wt.open_table(RETRY_QUEUE).map_err(db_err)?;
        queue
            .remove(queue_key(due, attempt.id).as_slice())
            .map_err(db_err)?;
    }
    Ok(())
}

/// Everything the executor persists when an attempt reaches a terminal status.
#[derive(Debug, Clone, Copy)]
pub struct OutcomeWrite<'a> {
    pub attempt: &'a SyncAttempt,
    /// The follow-up `scheduled` attempt when a retry was planned.
    pub retry: Option<&'a SyncAttempt>,
    pub lease_token: Uuid,
    pub run_status: RunStatus,
}

impl Store {
    // -----------------------------------------------------------------------
    // CRUD
    // -----------------------------------------------------------------------

    pub fn insert_task(&self, task: &ScheduledTask) -> Result<()> {
        self.write(|wt| save_task(wt, task))
    }

    pub fn get_task(&self, id: Uuid) -> Result<ScheduledTask> {
        self.read_one(TASKS, &id.to_string())?
            .ok_or_else(|| VigilError::TaskNotFound(id.to_string()))
    }

    /// All tasks, oldest first.
    pub fn list_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self.read_all(TASKS)?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(tasks)
    }

    /// Resolve a full id or a unique prefix of one.
    pub fn find_task(&self, id_or_prefix: &str) -> Result<ScheduledTask> {
        if let Ok(id) = id_or_prefix.parse::<Uuid>() {
            return self.get_task(id);
        }
        let matches: Vec<ScheduledTask> = self
            .list_tasks()?
            .into_iter()
            .filter(|t| t.id.to_string().starts_with(id_or_prefix))
            .collect();
        match <[ScheduledTask; 1]>::try_from(matches) {
            Ok([task]) => Ok(task),
            Err(_) => Err(VigilError::TaskNotFound(id_or_prefix.to_string())),
        }
    }

    /// Enable or disable a task. In-flight attempts finish; disabled tasks are
    /// neither scheduled nor retried afterwards.
    pub fn set_task_enabled(&self, id: Uuid, enabled: bool, now: DateTime<Utc>) -> Result<ScheduledTask> {
        self.write(|wt| {
            let mut task = load_task(wt, id)?;
            task.enabled = enabled;
            task.updated_at = now;
            save_task(wt, &task)?;
            Ok(task)
        })
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Tasks where `enabled AND next_run_at <= now AND lease_expiry <= now`,
    /// earliest first.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let mut due: Vec<ScheduledTask> = self
            .read_all::<ScheduledTask>(TASKS)?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect();
        due.sort_by(|a, b| a.next_run_at.cmp(&b.next_run_at));
        Ok(due)
    }

    /// Claim a due task for a fresh occurrence.
    ///
    /// Re-checks due-ness inside the write transaction; returns `None` if
    /// another worker won. On success the lease is taken, `next_run_at`
    /// advances past `now`, and a `running` attempt is recorded.
    pub fn claim_task(&self, id: Uuid, now: DateTime<Utc>, lease: Duration) -> Result<Option<Claim>> {
        self.write(|wt| {
            let mut task = load_task(wt, id)?;
            if !task.is_due(now) {
                return Ok(None);
            }
            let token = task.take_lease(now, lease);
            task.next_run_at = task.frequency.next_after(now);
            task.last_run_at = Some(now);
            task.last_status = Some(RunStatus::Running);
            save_task(wt, &task)?;

            let attempt = SyncAttempt::first(task.id, now);
            put_json(wt, ATTEMPTS, &attempt.id.to_string(), &attempt)?;
            Ok(Some(Claim {
                task,
                token,
                attempt,
            }))
        })
    }

    /// Claim the task lease for a due retry without moving `next_run_at`.
    pub fn claim_retry(&self, attempt_id: Uuid, now: DateTime<Utc>, lease: Duration) -> Result<RetryClaim> {
        self.write(|wt| {
            let Some(mut attempt) =
                load_json::<SyncAttempt>(wt, ATTEMPTS, &attempt_id.to_string())?
            else {
                return Ok(RetryClaim::Gone);
            };
            if attempt.status != AttemptStatus::Scheduled {
                return Ok(RetryClaim::Gone);
            }
            let mut task = load_task(wt, attempt.task_id)?;
            if !task.enabled {
                dequeue(wt, &attempt)?;
                attempt.skip("task disabled before retry", now);
                put_json(wt, ATTEMPTS, &attempt.id.to_string(), &attempt)?;
                return Ok(RetryClaim::Skipped(attempt));
            }
            if !task.lease_free(now) {
                return Ok(RetryClaim::Busy);
            }
            let token = task.take_lease(now, lease);
            task.last_run_at = Some(now);
            task.last_status = Some(RunStatus::Running);
            save_task(wt, &task)?;

            dequeue(wt, &attempt)?;
            attempt.start(now);
            put_json(wt, ATTEMPTS, &attempt.id.to_string(), &attempt)?;
            Ok(RetryClaim::Claimed(Claim {
                task,
                token,
                attempt,
            }))
        })
    }

    /// Persist a terminal attempt, queue its retry if one was planned, and
    /// release the lease. Counters and `last_status` update in the same
    /// transaction. A lease that expired and was re-claimed is left alone.
    pub fn record_outcome(&self, outcome: OutcomeWrite<'_>, now: DateTime<Utc>) -> Result<ScheduledTask> {
        self.write(|wt| {
            let attempt = outcome.attempt;
            put_json(wt, ATTEMPTS, &attempt.id.to_string(), attempt)?;

            if let Some(retry) = outcome.retry {
                put_json(wt, ATTEMPTS, &retry.id.to_string(), retry)?;
                if let Some(due) = retry.next_retry_at {
                    let empty: &[u8] = &[];
                    let mut queue = wt.open_table(RETRY_QUEUE).map_err(db_err)?;
                    queue
                        .insert(queue_key(due, retry.id).as_slice(), empty)
                        .map_err(db_err)?;
                }
            }

            let mut task = load_task(wt, attempt.task_id)?;
            if attempt.status == AttemptStatus::Completed {
                task.success_count += 1;
            } else if attempt.status.is_failure() {
                task.error_count += 1;
            }
            task.last_status = Some(outcome.run_status);
            task.updated_at = now;
            task.release_lease(outcome.lease_token, now);
            save_task(wt, &task)?;
            Ok(task)
        })
    }

    /// Release a lease without recording an outcome.
    pub fn release_lease(&self, task_id: Uuid, token: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.write(|wt| {
            let mut task = load_task(wt, task_id)?;
            let released = task.release_lease(token, now);
            if released {
                save_task(wt, &task)?;
            }
            Ok(released)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
