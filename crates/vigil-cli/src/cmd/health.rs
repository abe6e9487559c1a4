use super::{load_config, open_store};
use crate::output::{print_json, print_table, when};
use chrono::Utc;
use std::path::Path;
use vigil_core::health::IntegrationHealth;

pub fn run(root: &Path, integration: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = load_config(root)?;
    let store = open_store(root)?;
    let now = Utc::now();

    let mut ids: Vec<String> = match integration {
        Some(id) => vec![id.to_string()],
        None => {
            let mut ids: Vec<String> = config.integrations.keys().cloned().collect();
            ids.extend(store.list_health()?.into_iter().map(|h| h.integration_id));
            ids
        }
    };
    ids.sort();
    ids.dedup();

    // Status is recomputed for display so staleness shows without a daemon pass.
    let mut records: Vec<IntegrationHealth> = Vec::with_capacity(ids.len());
    for id in &ids {
        let mut h = store
            .get_health(id)?
            .unwrap_or_else(|| IntegrationHealth::new(id.as_str(), now));
        h.refresh(now, config.settings_for(id).expected_interval());
        records.push(h);
    }

    if json {
        return match (integration, records.first()) {
            (Some(_), Some(h)) => print_json(h),
            _ => print_json(&records),
        };
    }

    if records.is_empty() {
        println!("No integrations configured.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|h| {
            vec![
                h.integration_id.clone(),
                h.status.to_string(),
                h.breaker.state.to_string(),
                h.consecutive_failures.to_string(),
                format!("{:.0}%", h.counters.error_rate_24h() * 100.0),
                when(h.last_successful_sync_at),
                h.last_error
                    .as_ref()
                    .map(|e| format!("{}: {}", e.category, e.message))
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &["INTEGRATION", "STATUS", "BREAKER", "FAILS", "ERR 24H", "LAST SUCCESS", "LAST ERROR"],
        rows,
    );
    Ok(())
}
