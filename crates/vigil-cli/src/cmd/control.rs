use super::open_store;
use crate::output::{or_dash, print_json, print_table, when};
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;
use vigil_core::{
    alert::{set_muted, AlertStatus},
    paths,
};
use vigil_engine::alerting::acknowledge_control_alert;

#[derive(Subcommand)]
pub enum ControlSubcommand {
    /// List monitored controls with health and alert status
    List,
    /// Show one control
    Show { id: String },
    /// Suppress alerts for a control
    Mute { id: String },
    /// Resume alerts for a muted control
    Unmute { id: String },
    /// Acknowledge an alerting control and its open alert
    Ack {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        by: String,
    },
    /// Resume recording test results for a control
    Enable { id: String },
    /// Stop recording test results for a control
    Disable { id: String },
}

pub fn run(root: &Path, subcmd: ControlSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ControlSubcommand::List => list(root, json),
        ControlSubcommand::Show { id } => show(root, &id, json),
        ControlSubcommand::Mute { id } => mute(root, &id, true, json),
        ControlSubcommand::Unmute { id } => mute(root, &id, false, json),
        ControlSubcommand::Ack { id, by } => ack(root, &id, &by, json),
        ControlSubcommand::Enable { id } => monitoring(root, &id, true, json),
        ControlSubcommand::Disable { id } => monitoring(root, &id, false, json),
    }
}

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let controls = open_store(root)?.list_controls()?;
    if json {
        return print_json(&controls);
    }
    if controls.is_empty() {
        println!("No controls monitored yet.");
        return Ok(());
    }
    let rows = controls
        .iter()
        .map(|c| {
            vec![
                c.control_id.clone(),
                c.current_health.to_string(),
                c.health_score.to_string(),
                c.alert_status.to_string(),
                c.consecutive_failures.to_string(),
                c.consecutive_passes.to_string(),
                when(c.last_tested_at),
                if c.monitoring_enabled { "yes" } else { "no" }.to_string(),
            ]
        })
        .collect();
    print_table(
        &["CONTROL", "HEALTH", "SCORE", "ALERT", "FAILS", "PASSES", "LAST TEST", "MONITORED"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let c = open_store(root)?.require_control(id)?;
    if json {
        return print_json(&c);
    }
    println!("Control:       {}", c.control_id);
    println!("Monitored:     {}", c.monitoring_enabled);
    println!("Health:        {} (score {})", c.current_health, c.health_score);
    println!("Alert status:  {}", c.alert_status);
    if let Some(by) = &c.acknowledged_by {
        println!("Acknowledged:  by {by} at {}", when(c.acknowledged_at));
    }
    println!(
        "Streaks:       {} failing / {} passing",
        c.consecutive_failures, c.consecutive_passes
    );
    let result = c.last_result.map(|p| if p { "pass" } else { "fail" });
    println!("Last test:     {} ({})", when(c.last_tested_at), or_dash(result));
    if let Some(reason) = &c.last_failure_reason {
        println!("Last failure:  {reason}");
    }
    Ok(())
}

fn mute(root: &Path, id: &str, muted: bool, json: bool) -> anyhow::Result<()> {
    paths::validate_id(id)?;
    let store = open_store(root)?;
    let now = Utc::now();
    let status = store.update_control(id, now, |c| {
        // Unmuting only lifts a mute; it never clears an active alert.
        if muted || c.alert_status == AlertStatus::Muted {
            set_muted(c, muted, now);
        }
        c.clone()
    })?;
    if json {
        print_json(&status)?;
    } else {
        println!("Control '{}' alert status: {}", status.control_id, status.alert_status);
    }
    Ok(())
}

fn ack(root: &Path, id: &str, by: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    acknowledge_control_alert(&store, id, by, Utc::now())?;
    let status = store.require_control(id)?;
    if json {
        print_json(&status)?;
    } else {
        println!("Acknowledged control '{}' as {by}", status.control_id);
    }
    Ok(())
}

fn monitoring(root: &Path, id: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    paths::validate_id(id)?;
    let store = open_store(root)?;
    let now = Utc::now();
    let status = store.update_control(id, now, |c| {
        c.monitoring_enabled = enabled;
        c.updated_at = now;
        c.clone()
    })?;
    if json {
        print_json(&status)?;
    } else {
        let verb = if enabled { "Enabled" } else { "Disabled" };
        println!("{verb} monitoring for control '{}'", status.control_id);
    }
    Ok(())
}
