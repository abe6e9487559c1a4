use super::{db_err, decode, due_upper_bound, id_from_queue_key, put_json, Store, ATTEMPTS, RETRY_QUEUE};
use crate::attempt::SyncAttempt;
use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

impl Store {
    pub fn insert_attempt(&self, attempt: &SyncAttempt) -> Result<()> {
        self.write(|wt| put_json(wt, ATTEMPTS, &attempt.id.to_string(), attempt))
    }

    pub fn get_attempt(&self, id: Uuid) -> Result<SyncAttempt> {
        self.read_one(ATTEMPTS, &id.to_string())?
            .ok_or_else(|| VigilError::AttemptNotFound(id.to_string()))
    }

    /// Every attempt of `task_id`, oldest first.
    pub fn attempts_for_task(&self, task_id: Uuid) -> Result<Vec<SyncAttempt>> {
        let mut attempts: Vec<SyncAttempt> = self
            .read_all::<SyncAttempt>(ATTEMPTS)?
            .into_iter()
            .filter(|a| a.task_id == task_id)
            .collect();
        attempts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.retry_attempt.cmp(&b.retry_attempt)));
        Ok(attempts)
    }

    /// The retry chain ending at `id`, from the first attempt of the
    /// occurrence to `id` itself.
    pub fn attempt_chain(&self, id: Uuid) -> Result<Vec<SyncAttempt>> {
        let mut chain = vec![self.get_attempt(id)?];
        while let Some(parent) = chain.last().and_then(|a| a.parent_attempt_id) {
            if chain.iter().any(|a| a.id == parent) {
                return Err(VigilError::Store(format!("attempt chain cycle at {parent}")));
            }
            chain.push(self.get_attempt(parent)?);
        }
        chain.reverse();
        Ok(chain)
    }

    /// Scheduled retries whose `next_retry_at <= now`, earliest first.
    pub fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<SyncAttempt>> {
        let upper = due_upper_bound(now);
        let rt = self.db.begin_read().map_err(db_err)?;
        let queue = rt.open_table(RETRY_QUEUE).map_err(db_err)?;
        let attempts = rt.open_table(ATTEMPTS).map_err(db_err)?;

        let mut result = Vec::new();
        for entry in queue.range(..=upper.as_slice()).map_err(db_err)? {
            let (k, _) = entry.map_err(db_err)?;
            let key = id_from_queue_key(k.value())?.to_string();
            let Some(v) = attempts.get(key.as_str()).map_err(db_err)? else {
                continue;
            };
            result.push(decode::<SyncAttempt>(v.value())?);
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
