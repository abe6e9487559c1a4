use super::{load_config, open_store};
use crate::output::{print_json, print_table, when};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use std::path::Path;
use vigil_core::freshness::{Artifact, FreshnessSla, SlaKey};

#[derive(Subcommand)]
pub enum FreshnessSubcommand {
    /// Rescore every artifact now
    Run,
    /// Set the SLA for an (org, type, source) scope; omitted parts match anything
    SlaSet {
        #[arg(long)]
        org: Option<String>,
        #[arg(long = "type")]
        artifact_type: Option<String>,
        #[arg(long)]
        source: Option<String>,
        /// Days until stale
        #[arg(long)]
        max: u32,
        #[arg(long)]
        warning: u32,
        #[arg(long)]
        critical: u32,
    },
    /// List configured SLAs
    SlaList,
    /// Record a collected evidence artifact and score it
    ArtifactAdd {
        id: String,
        #[arg(long)]
        org: String,
        #[arg(long = "type")]
        artifact_type: String,
        #[arg(long)]
        source: String,
        /// Collection time (RFC 3339). Defaults to now.
        #[arg(long)]
        collected_at: Option<String>,
        /// Hard expiry (RFC 3339)
        #[arg(long)]
        valid_until: Option<String>,
    },
    /// List artifacts with their freshness
    List,
}

pub fn run(root: &Path, subcmd: FreshnessSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        FreshnessSubcommand::Run => rescore(root, json),
        FreshnessSubcommand::SlaSet {
            org,
            artifact_type,
            source,
            max,
            warning,
            critical,
        } => {
            let key = SlaKey::new(org.as_deref(), artifact_type.as_deref(), source.as_deref());
            let sla = FreshnessSla {
                max_age_days: max,
                warning_days: warning,
                critical_days: critical,
            };
            sla_set(root, key, sla, json)
        }
        FreshnessSubcommand::SlaList => sla_list(root, json),
        FreshnessSubcommand::ArtifactAdd {
            id,
            org,
            artifact_type,
            source,
            collected_at,
            valid_until,
        } => {
            let artifact = Artifact {
                id,
                org,
                artifact_type,
                source,
                collected_at: match collected_at {
                    Some(s) => parse_time("--collected-at", &s)?,
                    None => Utc::now(),
                },
                valid_until: valid_until
                    .map(|s| parse_time("--valid-until", &s))
                    .transpose()?,
                freshness: None,
            };
            artifact_add(root, artifact, json)
        }
        FreshnessSubcommand::List => list(root, json),
    }
}

fn parse_time(flag: &str, s: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("invalid {flag} '{s}'"))?
        .with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

fn rescore(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let summary = open_store(root)?.rescore_artifacts(config.freshness.default_sla, Utc::now())?;
    if json {
        return print_json(&summary);
    }
    let levels: Vec<String> = summary
        .by_level
        .iter()
        .map(|(level, n)| format!("{level} {n}"))
        .collect();
    if levels.is_empty() {
        println!("Rescored {} artifacts", summary.scored);
    } else {
        println!("Rescored {} artifacts: {}", summary.scored, levels.join(", "));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SLAs
// ---------------------------------------------------------------------------

fn sla_set(root: &Path, key: SlaKey, sla: FreshnessSla, json: bool) -> anyhow::Result<()> {
    if sla.max_age_days == 0 {
        anyhow::bail!("--max must be > 0");
    }
    if sla.warning_days > sla.critical_days || sla.critical_days > sla.max_age_days {
        anyhow::bail!(
            "thresholds must satisfy warning <= critical <= max (got {} / {} / {})",
            sla.warning_days,
            sla.critical_days,
            sla.max_age_days
        );
    }
    open_store(root)?.put_sla(&key, &sla)?;
    if json {
        print_json(&serde_json::json!({ "key": key, "sla": sla }))?;
    } else {
        println!(
            "SLA for {key}: max {}d, warning {}d, critical {}d",
            sla.max_age_days, sla.warning_days, sla.critical_days
        );
    }
    Ok(())
}

fn sla_list(root: &Path, json: bool) -> anyhow::Result<()> {
    let rows = open_store(root)?.list_slas()?;
    if json {
        let out: Vec<_> = rows
            .iter()
            .map(|(key, sla)| serde_json::json!({ "key": key, "sla": sla }))
            .collect();
        return print_json(&out);
    }
    if rows.is_empty() {
        println!("No SLAs set; the configured default applies everywhere.");
        return Ok(());
    }
    let table = rows
        .iter()
        .map(|(key, sla)| {
            vec![
                key.to_string(),
                sla.max_age_days.to_string(),
                sla.warning_days.to_string(),
                sla.critical_days.to_string(),
            ]
        })
        .collect();
    print_table(&["SCOPE", "MAX", "WARNING", "CRITICAL"], table);
    Ok(())
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

fn artifact_add(root: &Path, mut artifact: Artifact, json: bool) -> anyhow::Result<()> {
    vigil_core::paths::validate_id(&artifact.id)?;
    let config = load_config(root)?;
    let store = open_store(root)?;
    let table = store.sla_table()?;
    let record = artifact
        .rescore(&table, config.freshness.default_sla, Utc::now())
        .clone();
    store.put_artifact(&artifact)?;

    if json {
        print_json(&artifact)?;
    } else {
        println!(
            "Recorded artifact '{}': {} (score {}, {} days stale)",
            artifact.id, record.level, record.freshness_score, record.days_stale
        );
    }
    Ok(())
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let artifacts = open_store(root)?.list_artifacts()?;
    if json {
        return print_json(&artifacts);
    }
    if artifacts.is_empty() {
        println!("No artifacts.");
        return Ok(());
    }
    let rows = artifacts
        .iter()
        .map(|a| {
            let (level, score, stale) = match &a.freshness {
                Some(f) => (
                    f.level.to_string(),
                    f.freshness_score.to_string(),
                    f.days_stale.to_string(),
                ),
                None => ("-".to_string(), "-".to_string(), "-".to_string()),
            };
            vec![
                a.id.clone(),
                a.org.clone(),
                a.artifact_type.clone(),
                a.source.clone(),
                when(Some(a.collected_at)),
                level,
                score,
                stale,
            ]
        })
        .collect();
    print_table(
        &["ID", "ORG", "TYPE", "SOURCE", "COLLECTED", "LEVEL", "SCORE", "DAYS STALE"],
        rows,
    );
    Ok(())
}
