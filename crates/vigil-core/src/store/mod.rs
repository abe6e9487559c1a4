//! Durable store backed by redb.
//!
//! # Table design
//!
//! Every table except `retry_queue` maps a string id to a JSON-encoded
//! record. `retry_queue` uses a 24-byte composite key:
//! ```text
//! [ next_retry_at_ms: u64 big-endian (8 bytes) | attempt uuid: 16 bytes ]
//! ```
//! Byte ordering equals timestamp ordering, so a single range scan
//! `..=due_upper_bound(now)` returns every retry due by `now`.
//!
//! redb serializes write transactions. Every claim reads and writes its rows
//! inside one write transaction, which makes it a compare-and-swap against
//! all other writers sharing the database handle.

mod alerts;
mod attempts;
mod freshness;
mod state;
mod tasks;

pub use freshness::RescoreSummary;
pub use tasks::{Claim, OutcomeWrite, RetryClaim};

use crate::error::{Result, VigilError};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

const TASKS: JsonTable = TableDefinition::new("tasks");
const ATTEMPTS: JsonTable = TableDefinition::new("attempts");
const INTEGRATION_HEALTH: JsonTable = TableDefinition::new("integration_health");
const CONTROL_STATUS: JsonTable = TableDefinition::new("control_status");
const ALERTS: JsonTable = TableDefinition::new("alerts");
/// Key: `org|type|source` with `*` wildcards.
const SLAS: JsonTable = TableDefinition::new("slas");
const ARTIFACTS: JsonTable = TableDefinition::new("artifacts");

/// Key: 24-byte composite (next_retry_at ms big-endian ++ attempt uuid).
/// Value: empty; the attempt id is recovered from the key.
const RETRY_QUEUE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("retry_queue");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn queue_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

/// Upper bound for a range scan returning all retries due by `now`.
///
/// The UUID suffix is `0xff` × 16, which sorts after any real UUID.
fn due_upper_bound(now: DateTime<Utc>) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = now.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].fill(0xff);
    key
}

fn id_from_queue_key(key: &[u8]) -> Result<Uuid> {
    Uuid::from_slice(key.get(8..24).unwrap_or_default())
        .map_err(|e| VigilError::Store(format!("corrupt retry_queue key: {e}")))
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn db_err<E: std::fmt::Display>(e: E) -> VigilError {
    VigilError::Store(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(db_err)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(db_err)
}

fn get_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> Result<Option<T>> {
    let Some(guard) = table.get(key).map_err(db_err)? else {
        return Ok(None);
    };
    decode(guard.value()).map(Some)
}

fn scan_json<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for entry in table.iter().map_err(db_err)? {
        let (_, v) = entry.map_err(db_err)?;
        out.push(decode(v.value())?);
    }
    Ok(out)
}

fn load_json<T: DeserializeOwned>(wt: &WriteTransaction, def: JsonTable, key: &str) -> Result<Option<T>> {
    let table = wt.open_table(def).map_err(db_err)?;
    get_json(&table, key)
}

fn put_json<T: Serialize>(wt: &WriteTransaction, def: JsonTable, key: &str, value: &T) -> Result<()> {
    let bytes = encode(value)?;
    let mut table = wt.open_table(def).map_err(db_err)?;
    table.insert(key, bytes.as_slice()).map_err(db_err)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistent store for tasks, attempts, health, alerts, and freshness data.
pub struct Store {
    db: Database,
}

impl Store {
    /// Open or create the redb database at `path`, creating every table.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(db_err)?;
        let store = Self { db };
        store.write(|wt| {
            for def in [TASKS, ATTEMPTS, INTEGRATION_HEALTH, CONTROL_STATUS, ALERTS, SLAS, ARTIFACTS] {
                wt.open_table(def).map_err(db_err)?;
            }
            wt.open_table(RETRY_QUEUE).map_err(db_err)?;
            Ok(())
        })?;
        Ok(store)
    }

    /// Run `f` inside one write transaction and commit it. An `Err` from `f`
    /// drops the transaction, which aborts it.
    fn write<R>(&self, f: impl FnOnce(&WriteTransaction) -> Result<R>) -> Result<R> {
        let wt = self.db.begin_write().map_err(db_err)?;
        let out = f(&wt)?;
        wt.commit().map_err(db_err)?;
        Ok(out)
    }

    fn read_one<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> Result<Option<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(def).map_err(db_err)?;
        get_json(&table, key)
    }

    fn read_all<T: DeserializeOwned>(&self, def: JsonTable) -> Result<Vec<T>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(def).map_err(db_err)?;
        scan_json(&table)
    }

    /// On startup, fail every `running` attempt that started more than
    /// `max_age` ago and release the lease its task still holds. Half-open
    /// slots held by those attempts, or claimed before the cutoff, are
    /// released so the breaker can admit again.
    ///
    /// Returns the number of attempts recovered.
    pub fn startup_recovery(&self, max_age: Duration, now: DateTime<Utc>) -> Result<u32> {
        let cutoff = now - max_age;
        self.write(|wt| {
            let attempts: Vec<crate::attempt::SyncAttempt> = {
                let table = wt.open_table(ATTEMPTS).map_err(db_err)?;
                scan_json(&table)?
            };
            let mut orphaned: HashSet<String> = HashSet::new();
            let mut count = 0u32;
            for mut attempt in attempts {
                let stale = attempt.status == crate::attempt::AttemptStatus::Running
                    && attempt.started_at.unwrap_or(attempt.created_at) < cutoff;
                if !stale {
                    continue;
                }
                attempt.fail(
                    crate::attempt::AttemptStatus::Failed,
                    crate::classifier::ErrorCategory::Unknown,
                    "recovered from restart",
                    now,
                    0,
                );
                put_json(wt, ATTEMPTS, &attempt.id.to_string(), &attempt)?;

                let task_key = attempt.task_id.to_string();
                if let Some(mut task) = load_json::<crate::task::ScheduledTask>(wt, TASKS, &task_key)? {
                    task.lease_token = None;
                    task.lease_expiry = None;
                    task.last_status = Some(crate::task::RunStatus::Failed);
                    task.error_count += 1;
                    task.updated_at = now;
                    put_json(wt, TASKS, &task_key, &task)?;
                    orphaned.insert(task.integration_id);
                }
                count += 1;
            }

            let health: Vec<crate::health::IntegrationHealth> = {
                let table = wt.open_table(INTEGRATION_HEALTH).map_err(db_err)?;
                scan_json(&table)?
            };
            for mut h in health {
                if !h.breaker.probe_in_flight {
                    continue;
                }
                let claimed_before_cutoff = h.breaker.probe_started_at.map_or(true, |at| at < cutoff);
                if !claimed_before_cutoff && !orphaned.contains(&h.integration_id) {
                    continue;
                }
                h.breaker.release_probe();
                h.updated_at = now;
                put_json(wt, INTEGRATION_HEALTH, &h.integration_id, &h)?;
            }
            Ok(count)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
