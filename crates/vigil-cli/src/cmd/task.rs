use super::{load_config, open_store};
use crate::output::{or_dash, print_json, print_table, short_id, when};
use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use std::path::Path;
use vigil_core::{
    paths,
    task::{Frequency, ScheduledTask},
};

#[derive(Subcommand)]
pub enum TaskSubcommand {
    /// Schedule a sync (or, with --control, a control test) for an integration
    Add {
        /// Integration id; must exist in config.yaml
        integration: String,
        /// Control id; makes this a control-test probe
        #[arg(long)]
        control: Option<String>,
        /// hourly, daily, weekly, or "every <n><s|m|h|d>"
        #[arg(long, default_value = "daily")]
        frequency: String,
        /// First occurrence (RFC 3339). Defaults to now.
        #[arg(long)]
        first_run_at: Option<String>,
    },
    /// List all tasks
    List,
    /// Show one task
    Show { id: String },
    /// Enable a task
    Enable { id: String },
    /// Disable a task; queued retries are skipped
    Disable { id: String },
}

pub fn run(root: &Path, subcmd: TaskSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        TaskSubcommand::Add {
            integration,
            control,
            frequency,
            first_run_at,
        } => add(
            root,
            &integration,
            control,
            &frequency,
            first_run_at.as_deref(),
            json,
        ),
        TaskSubcommand::List => list(root, json),
        TaskSubcommand::Show { id } => show(root, &id, json),
        TaskSubcommand::Enable { id } => set_enabled(root, &id, true, json),
        TaskSubcommand::Disable { id } => set_enabled(root, &id, false, json),
    }
}

// ---------------------------------------------------------------------------
// add
// ---------------------------------------------------------------------------

fn add(
    root: &Path,
    integration: &str,
    control: Option<String>,
    frequency: &str,
    first_run_at: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    paths::validate_id(integration)?;
    if let Some(c) = &control {
        paths::validate_id(c)?;
    }
    let frequency: Frequency = frequency.parse()?;
    let first_run_at = match first_run_at {
        Some(s) => DateTime::parse_from_rfc3339(s)
            .with_context(|| format!("invalid --first-run-at '{s}'"))?
            .with_timezone(&Utc),
        None => Utc::now(),
    };

    let config = load_config(root)?;
    config
        .integration(integration)
        .context("add the integration under `integrations:` in .vigil/config.yaml")?;
    let retry = config.settings_for(integration).retry_policy();

    let task = ScheduledTask::new(integration, control, frequency, retry, first_run_at);
    open_store(root)?.insert_task(&task)?;

    if json {
        print_json(&task)?;
    } else {
        println!(
            "Scheduled {} for '{}' ({}), first run {}",
            task.id,
            task.integration_id,
            task.frequency,
            when(Some(task.next_run_at))
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// list / show
// ---------------------------------------------------------------------------

fn list(root: &Path, json: bool) -> anyhow::Result<()> {
    let tasks = open_store(root)?.list_tasks()?;
    if json {
        return print_json(&tasks);
    }
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    let rows = tasks
        .iter()
        .map(|t| {
            vec![
                short_id(t.id),
                t.integration_id.clone(),
                or_dash(t.control_id.as_deref()),
                t.frequency.to_string(),
                if t.enabled { "yes" } else { "no" }.to_string(),
                or_dash(t.last_status),
                when(Some(t.next_run_at)),
            ]
        })
        .collect();
    print_table(
        &["ID", "INTEGRATION", "CONTROL", "FREQUENCY", "ENABLED", "LAST", "NEXT RUN"],
        rows,
    );
    Ok(())
}

fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let task = open_store(root)?.find_task(id)?;
    if json {
        return print_json(&task);
    }
    print_task(&task);
    Ok(())
}

fn print_task(t: &ScheduledTask) {
    println!("Task:         {}", t.id);
    println!("Integration:  {}", t.integration_id);
    if let Some(c) = &t.control_id {
        println!("Control:      {c}");
    }
    println!("Frequency:    {}", t.frequency);
    println!("Enabled:      {}", t.enabled);
    println!(
        "Retry:        max {} / base {}ms / cap {}ms",
        t.retry.max_retries, t.retry.backoff_base_ms, t.retry.backoff_max_ms
    );
    println!("Last run:     {} ({})", when(t.last_run_at), or_dash(t.last_status));
    println!("Next run:     {}", when(Some(t.next_run_at)));
    println!("Successes:    {}", t.success_count);
    println!("Errors:       {}", t.error_count);
    if let Some(exp) = t.lease_expiry {
        println!("Leased until: {}", when(Some(exp)));
    }
}

// ---------------------------------------------------------------------------
// enable / disable
// ---------------------------------------------------------------------------

fn set_enabled(root: &Path, id: &str, enabled: bool, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let task = store.find_task(id)?;
    let task = store.set_task_enabled(task.id, enabled, Utc::now())?;
    if json {
        print_json(&task)?;
    } else {
        let verb = if enabled { "Enabled" } else { "Disabled" };
        println!("{verb} task {}", task.id);
    }
    Ok(())
}
