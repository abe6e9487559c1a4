use super::{db_err, decode, put_json, scan_json, Store, ARTIFACTS, SLAS};
use crate::error::{Result, VigilError};
use crate::freshness::{Artifact, FreshnessLevel, FreshnessSla, SlaKey};
use chrono::{DateTime, Utc};
use redb::ReadableTable;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Outcome of one batch rescore.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescoreSummary {
    pub scored: usize,
    pub by_level: BTreeMap<String, usize>,
}

impl RescoreSummary {
    pub fn count(&self, level: FreshnessLevel) -> usize {
        self.by_level.get(&level.to_string()).copied().unwrap_or(0)
    }
}

impl Store {
    // -----------------------------------------------------------------------
    // SLA table
    // -----------------------------------------------------------------------

    pub fn put_sla(&self, key: &SlaKey, sla: &FreshnessSla) -> Result<()> {
        self.write(|wt| put_json(wt, SLAS, &key.encode(), sla))
    }

    pub fn sla_table(&self) -> Result<HashMap<SlaKey, FreshnessSla>> {
        let rt = self.db.begin_read().map_err(db_err)?;
        let table = rt.open_table(SLAS).map_err(db_err)?;
        let mut out = HashMap::new();
        for entry in table.iter().map_err(db_err)? {
            let (k, v) = entry.map_err(db_err)?;
            out.insert(SlaKey::decode(k.value())?, decode(v.value())?);
        }
        Ok(out)
    }

    /// SLA rows sorted by encoded key.
    pub fn list_slas(&self) -> Result<Vec<(SlaKey, FreshnessSla)>> {
        let mut rows: Vec<(SlaKey, FreshnessSla)> = self.sla_table()?.into_iter().collect();
        rows.sort_by_key(|(k, _)| k.encode());
        Ok(rows)
    }

    // -----------------------------------------------------------------------
    // Artifacts
    // -----------------------------------------------------------------------

    pub fn put_artifact(&self, artifact: &Artifact) -> Result<()> {
        self.write(|wt| put_json(wt, ARTIFACTS, &artifact.id, artifact))
    }

    pub fn get_artifact(&self, id: &str) -> Result<Artifact> {
        self.read_one(ARTIFACTS, id)?
            .ok_or_else(|| VigilError::ArtifactNotFound(id.to_string()))
    }

    pub fn list_artifacts(&self) -> Result<Vec<Artifact>> {
        let mut all: Vec<Artifact> = self.read_all(ARTIFACTS)?;
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Recompute freshness for every artifact in one write transaction.
    /// Running it twice at the same `now` yields identical records.
    pub fn rescore_artifacts(&self, default: FreshnessSla, now: DateTime<Utc>) -> Result<RescoreSummary> {
        let slas = self.sla_table()?;
        self.write(|wt| {
            let artifacts: Vec<Artifact> = {
                let table = wt.open_table(ARTIFACTS).map_err(db_err)?;
                scan_json(&table)?
            };
            let mut summary = RescoreSummary::default();
            for mut artifact in artifacts {
                let level = artifact.rescore(&slas, default, now).level;
                *summary.by_level.entry(level.to_string()).or_default() += 1;
                summary.scored += 1;
                put_json(wt, ARTIFACTS, &artifact.id, &artifact)?;
            }
            Ok(summary)
        })
    }
}
