use super::{db_err, put_json, scan_json, Store, ALERTS};
use crate::alert::{Alert, AlertKind, AlertSubject};
use crate::error::{Result, VigilError};
use chrono::{DateTime, Utc};
use uuid::Uuid;

fn is_open_failure_for(alert: &Alert, subject: &AlertSubject) -> bool {
    alert.kind == AlertKind::Failure && alert.is_open() && &alert.subject == subject
}

impl Store {
    pub fn insert_alert(&self, alert: &Alert) -> Result<()> {
        self.write(|wt| put_json(wt, ALERTS, &alert.id.to_string(), alert))
    }

    /// Insert a failure alert unless its subject already has an open one.
    /// Returns whether the alert was stored.
    pub fn raise_failure_alert(&self, alert: &Alert) -> Result<bool> {
        self.write(|wt| {
            let existing: Vec<Alert> = {
                let table = wt.open_table(ALERTS).map_err(db_err)?;
                scan_json(&table)?
            };
            if existing.iter().any(|a| is_open_failure_for(a, &alert.subject)) {
                return Ok(false);
            }
            put_json(wt, ALERTS, &alert.id.to_string(), alert)?;
            Ok(true)
        })
    }

    /// Like [`Store::raise_failure_alert`], but first resolves open failure
    /// alerts for the subject that were already acknowledged. Used when a
    /// control starts a new failing streak after an acknowledgment, so the
    /// stale acknowledged alert cannot suppress the new one.
    pub fn raise_failure_alert_over_acknowledged(&self, alert: &Alert, now: DateTime<Utc>) -> Result<bool> {
        self.write(|wt| {
            let existing: Vec<Alert> = {
                let table = wt.open_table(ALERTS).map_err(db_err)?;
                scan_json(&table)?
            };
            let mut blocked = false;
            for mut open in existing.into_iter().filter(|a| is_open_failure_for(a, &alert.subject)) {
                if !open.is_acknowledged() {
                    blocked = true;
                    continue;
                }
                open.resolve(now);
                put_json(wt, ALERTS, &open.id.to_string(), &open)?;
            }
            if blocked {
                return Ok(false);
            }
            put_json(wt, ALERTS, &alert.id.to_string(), alert)?;
            Ok(true)
        })
    }

    pub fn put_alert(&self, alert: &Alert) -> Result<()> {
        self.insert_alert(alert)
    }

    pub fn get_alert(&self, id: Uuid) -> Result<Alert> {
        self.read_one(ALERTS, &id.to_string())?
            .ok_or_else(|| VigilError::AlertNotFound(id.to_string()))
    }

    /// Resolve a full id or a unique prefix of one.
    pub fn find_alert(&self, id_or_prefix: &str) -> Result<Alert> {
        if let Ok(id) = id_or_prefix.parse::<Uuid>() {
            return self.get_alert(id);
        }
        let matches: Vec<Alert> = self
            .list_alerts()?
            .into_iter()
            .filter(|a| a.id.to_string().starts_with(id_or_prefix))
            .collect();
        match <[Alert; 1]>::try_from(matches) {
            Ok([alert]) => Ok(alert),
            Err(_) => Err(VigilError::AlertNotFound(id_or_prefix.to_string())),
        }
    }

    /// All alerts, newest first.
    pub fn list_alerts(&self) -> Result<Vec<Alert>> {
        let mut all: Vec<Alert> = self.read_all(ALERTS)?;
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    pub fn open_failure_alert(&self, subject: &AlertSubject) -> Result<Option<Alert>> {
        Ok(self
            .list_alerts()?
            .into_iter()
            .find(|a| is_open_failure_for(a, subject)))
    }

    /// Resolve every open failure alert for `subject`. Returns the resolved alerts.
    pub fn resolve_alerts_for(&self, subject: &AlertSubject, now: DateTime<Utc>) -> Result<Vec<Alert>> {
        self.write(|wt| {
            let all: Vec<Alert> = {
                let table = wt.open_table(ALERTS).map_err(db_err)?;
                scan_json(&table)?
            };
            let mut resolved = Vec::new();
            for mut alert in all.into_iter().filter(|a| is_open_failure_for(a, subject)) {
                alert.resolve(now);
                put_json(wt, ALERTS, &alert.id.to_string(), &alert)?;
                resolved.push(alert);
            }
            Ok(resolved)
        })
    }
}
