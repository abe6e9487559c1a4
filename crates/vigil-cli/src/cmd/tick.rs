use super::engine_state;
use crate::output::print_json;
use std::path::Path;
use std::sync::Arc;
use vigil_engine::{daemon, notifier::FanOut};

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = engine_state(root)?;
    let notifier = Arc::new(FanOut::from_webhook(state.config.alerting.webhook_url.as_deref()));

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(daemon::tick_once(&state, notifier))?;

    if json {
        return print_json(&report);
    }
    println!(
        "dispatched {} (retries {}), completed {}, retrying {}, failed {}",
        report.dispatched,
        report.retries_dispatched,
        report.completed,
        report.retrying,
        report.failed
    );
    if report.circuit_skipped > 0 {
        println!("skipped {} on open circuit", report.circuit_skipped);
    }
    if report.retries_skipped > 0 {
        println!("skipped {} retries of disabled tasks", report.retries_skipped);
    }
    if report.contended > 0 {
        println!("{} already claimed elsewhere", report.contended);
    }
    Ok(())
}
