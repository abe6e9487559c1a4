use super::open_store;
use crate::output::{print_json, print_table, short_id, when};
use chrono::Utc;
use clap::Subcommand;
use std::path::Path;
use vigil_core::alert::Alert;
use vigil_engine::alerting::{acknowledge_alert, resolve_alert};

#[derive(Subcommand)]
pub enum AlertSubcommand {
    /// List alerts, newest first
    List {
        /// Only unresolved alerts
        #[arg(long)]
        open: bool,
    },
    /// Show one alert
    Show { id: String },
    /// Acknowledge an alert (id or unique prefix); stops its escalation
    Ack {
        id: String,
        #[arg(long, env = "USER", default_value = "operator")]
        by: String,
    },
    /// Resolve an alert by hand
    Resolve { id: String },
}

pub fn run(root: &Path, subcmd: AlertSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        AlertSubcommand::List { open } => list(root, open, json),
        AlertSubcommand::Show { id } => show(root, &id, json),
        AlertSubcommand::Ack { id, by } => {
            let alert = acknowledge_alert(&open_store(root)?, &id, &by, Utc::now())?;
            report(&alert, &format!("Acknowledged alert {} as {by}", alert.id), json)
        }
        AlertSubcommand::Resolve { id } => {
            let alert = resolve_alert(&open_store(root)?, &id, Utc::now())?;
            report(&alert, &format!("Resolved alert {}", alert.id), json)
        }
    }
}

fn report(alert: &Alert, message: &str, json: bool) -> anyhow::Result<()> {
    if json {
        print_json(alert)
    } else {
        println!("{message}");
        Ok(())
    }
}

fn list(root: &Path, open: bool, json: bool) -> anyhow::Result<()> {
    let alerts: Vec<Alert> = open_store(root)?
        .list_alerts()?
        .into_iter()
        .filter(|a| !open || a.is_open())
        .collect();
    if json {
        return print_json(&alerts);
    }
    if alerts.is_empty() {
        println!("No alerts.");
        return Ok(());
    }
    let rows = alerts
        .iter()
        .map(|a| {
            vec![
                short_id(a.id),
                a.kind.to_string(),
                a.severity.to_string(),
                a.subject.to_string(),
                state(a).to_string(),
                when(Some(a.created_at)),
                a.title.clone(),
            ]
        })
        .collect();
    print_table(
        &["ID", "KIND", "SEVERITY", "SUBJECT", "STATE", "CREATED", "TITLE"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let a = open_store(root)?.find_alert(id)?;
    if json {
        return print_json(&a);
    }
    println!("Alert:      {}", a.id);
    println!("Kind:       {} ({})", a.kind, a.severity);
    println!("Subject:    {}", a.subject);
    if let Some(category) = a.category {
        println!("Category:   {category}");
    }
    println!("Title:      {}", a.title);
    println!("Message:    {}", a.message);
    println!("State:      {}", state(&a));
    println!("Created:    {}", when(Some(a.created_at)));
    if let Some(by) = &a.acknowledged_by {
        println!("Acked:      by {by} at {}", when(a.acknowledged_at));
    }
    if a.escalated_at.is_some() {
        println!("Escalated:  {}", when(a.escalated_at));
    }
    if a.resolved_at.is_some() {
        println!("Resolved:   {}", when(a.resolved_at));
    }
    if !a.recipients.is_empty() {
        println!("Recipients: {}", a.recipients.join(", "));
    }
    Ok(())
}

fn state(a: &Alert) -> &'static str {
    if !a.is_open() {
        "resolved"
    } else if a.is_acknowledged() {
        "acknowledged"
    } else {
        "open"
    }
}
