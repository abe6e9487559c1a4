use super::{load_json, put_json, Store, CONTROL_STATUS, INTEGRATION_HEALTH};
use crate::control::ControlMonitoringStatus;
use crate::error::{Result, VigilError};
use crate::health::IntegrationHealth;
use chrono::{DateTime, Utc};

impl Store {
    // -----------------------------------------------------------------------
    // Integration health
    // -----------------------------------------------------------------------

    pub fn get_health(&self, integration_id: &str) -> Result<Option<IntegrationHealth>> {
        self.read_one(INTEGRATION_HEALTH, integration_id)
    }

    pub fn put_health(&self, health: &IntegrationHealth) -> Result<()> {
        self.write(|wt| put_json(wt, INTEGRATION_HEALTH, &health.integration_id, health))
    }

    /// Read-modify-write of one integration's health in a single write
    /// transaction. The record is created on first use.
    pub fn update_health<R>(
        &self,
        integration_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut IntegrationHealth) -> R,
    ) -> Result<R> {
        self.write(|wt| {
            let mut health = load_json(wt, INTEGRATION_HEALTH, integration_id)?
                .unwrap_or_else(|| IntegrationHealth::new(integration_id, now));
            let out = f(&mut health);
            put_json(wt, INTEGRATION_HEALTH, integration_id, &health)?;
            Ok(out)
        })
    }

    /// All integration health records, sorted by id.
    pub fn list_health(&self) -> Result<Vec<IntegrationHealth>> {
        let mut all: Vec<IntegrationHealth> = self.read_all(INTEGRATION_HEALTH)?;
        all.sort_by(|a, b| a.integration_id.cmp(&b.integration_id));
        Ok(all)
    }

    // -----------------------------------------------------------------------
    // Control monitoring status
    // -----------------------------------------------------------------------

    pub fn get_control(&self, control_id: &str) -> Result<Option<ControlMonitoringStatus>> {
        self.read_one(CONTROL_STATUS, control_id)
    }

    pub fn require_control(&self, control_id: &str) -> Result<ControlMonitoringStatus> {
        self.get_control(control_id)?
            .ok_or_else(|| VigilError::ControlNotFound(control_id.to_string()))
    }

    pub fn put_control(&self, status: &ControlMonitoringStatus) -> Result<()> {
        self.write(|wt| put_json(wt, CONTROL_STATUS, &status.control_id, status))
    }

    /// Read-modify-write of one control's status; created on first use.
    pub fn update_control<R>(
        &self,
        control_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut ControlMonitoringStatus) -> R,
    ) -> Result<R> {
        self.write(|wt| {
            let mut status = load_json(wt, CONTROL_STATUS, control_id)?
                .unwrap_or_else(|| ControlMonitoringStatus::new(control_id, now));
            let out = f(&mut status);
            put_json(wt, CONTROL_STATUS, control_id, &status)?;
            Ok(out)
        })
    }

    pub fn list_controls(&self) -> Result<Vec<ControlMonitoringStatus>> {
        let mut all: Vec<ControlMonitoringStatus> = self.read_all(CONTROL_STATUS)?;
        all.sort_by(|a, b| a.control_id.cmp(&b.control_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use crate::breaker::BreakerState;
    use crate::control::ControlMonitoringStatus;
    use crate::health::IntegrationHealth;
    use crate::store::tests::open_tmp;
    use chrono::Utc;

    #[test]
    fn health_roundtrip_keeps_breaker_fields() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let mut h = IntegrationHealth::new("okta", now);
        h.breaker.state = BreakerState::Open;
        h.breaker.opened_at = Some(now);
        store.put_health(&h).unwrap();

        let loaded = store.get_health("okta").unwrap().unwrap();
        assert_eq!(loaded.breaker.state, BreakerState::Open);
        assert_eq!(loaded.breaker.opened_at, Some(now));
        assert!(store.get_health("missing").unwrap().is_none());
    }

    #[test]
    fn controls_list_sorted() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        for id in ["cc-8.1", "cc-6.1"] {
            store.put_control(&ControlMonitoringStatus::new(id, now)).unwrap();
        }
        let ids: Vec<String> = store
            .list_controls()
            .unwrap()
            .into_iter()
            .map(|c| c.control_id)
            .collect();
        assert_eq!(ids, vec!["cc-6.1", "cc-8.1"]);
        assert!(store.require_control("cc-9.9").is_err());
    }

    #[test]
    fn update_health_creates_lazily() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        let streak = store
            .update_health("vanta", now, |h| {
                h.consecutive_failures += 1;
                h.consecutive_failures
            })
            .unwrap();
        assert_eq!(streak, 1);
        let streak = store
            .update_health("vanta", now, |h| {
                h.consecutive_failures += 1;
                h.consecutive_failures
            })
            .unwrap();
        assert_eq!(streak, 2);
    }

    #[test]
    fn update_control_persists_result() {
        let (_dir, store) = open_tmp();
        let now = Utc::now();
        store
            .update_control("cc-7.1", now, |c| c.record_result(false, Some("drift".into()), now))
            .unwrap();
        let c = store.require_control("cc-7.1").unwrap();
        assert_eq!(c.consecutive_failures, 1);
        assert_eq!(c.last_failure_reason.as_deref(), Some("drift"));
    }
}
