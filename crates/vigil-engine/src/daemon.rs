//! Daemon runner: scheduler workers plus the periodic jobs around them.

use crate::alerting::AlertingService;
use crate::error::Result;
use crate::notifier::Notifier;
use crate::scheduler::{self, TickReport};
use crate::state::EngineState;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use vigil_core::store::RescoreSummary;

const ROLLOVER_SWEEP: Duration = Duration::from_secs(3600);

/// Run until `shutdown` resolves. In-flight attempts finish before return.
pub async fn run(state: EngineState, notifier: Arc<dyn Notifier>, shutdown: impl Future<Output = ()>) -> Result<()> {
    let max_age = state.config.scheduler.recovery_max_age();
    let recovered = state
        .with_store(move |s| s.startup_recovery(max_age, Utc::now()))
        .await?;
    if recovered > 0 {
        tracing::warn!(recovered, "failed attempts left running by a previous process");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let alerting = AlertingService::new(state.clone(), notifier);
    let alerting_task = tokio::spawn(alerting.clone().run(state.bus.subscribe(), stop_rx.clone()));

    let tick = state.config.scheduler.tick();
    let workers = state.config.scheduler.workers.max(1);
    let mut jobs: Vec<JoinHandle<()>> = Vec::new();
    for worker in 0..workers {
        let s = state.clone();
        jobs.push(every("scheduler", tick, stop_rx.clone(), move || {
            let s = s.clone();
            async move {
                let report = scheduler::tick(&s, Utc::now()).await?;
                log_tick(worker, &report);
                Ok(())
            }
        }));
    }

    let freshness = Duration::from_secs(state.config.freshness.interval_secs.max(1));
    let s = state.clone();
    jobs.push(every("freshness", freshness, stop_rx.clone(), move || {
        let s = s.clone();
        async move { rescore_freshness(&s).await.map(|_| ()) }
    }));

    let a = alerting.clone();
    jobs.push(every("escalation", tick, stop_rx.clone(), move || {
        let a = a.clone();
        async move { a.escalate_due(Utc::now()).await.map(|_| ()) }
    }));

    let s = state.clone();
    jobs.push(every("rollover", ROLLOVER_SWEEP, stop_rx.clone(), move || {
        let s = s.clone();
        async move { rollover_sweep(&s).await }
    }));

    tracing::info!(workers, tick_secs = tick.as_secs(), "vigil running");
    shutdown.await;
    tracing::info!("shutting down");
    let _ = stop_tx.send(true);
    for job in futures::future::join_all(jobs).await {
        job?;
    }
    alerting_task.await?;
    Ok(())
}

/// One scheduler pass plus an escalation sweep, with alerting attached so
/// every alert the pass causes is stored and delivered before returning.
pub async fn tick_once(state: &EngineState, notifier: Arc<dyn Notifier>) -> Result<TickReport> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let alerting = AlertingService::new(state.clone(), notifier);
    let handle = tokio::spawn(alerting.clone().run(state.bus.subscribe(), stop_rx));

    let now = Utc::now();
    let report = scheduler::tick(state, now).await;
    let escalated = alerting.escalate_due(now).await;

    let _ = stop_tx.send(true);
    handle.await?;
    escalated?;
    report
}

pub async fn rescore_freshness(state: &EngineState) -> Result<RescoreSummary> {
    let default = state.config.freshness.default_sla;
    let summary = state
        .with_store(move |s| s.rescore_artifacts(default, Utc::now()))
        .await?;
    tracing::info!(scored = summary.scored, levels = ?summary.by_level, "freshness rescored");
    Ok(summary)
}

/// Roll 24h/7d windows forward for every integration and control so idle
/// ones do not keep stale counts.
pub async fn rollover_sweep(state: &EngineState) -> Result<()> {
    let now = Utc::now();
    let health = state.with_store(|s| s.list_health()).await?;
    for h in health {
        state.owner(&h.integration_id).refresh(now).await?;
    }
    let controls = state.with_store(|s| s.list_controls()).await?;
    for c in controls {
        let id = c.control_id;
        state
            .with_store(move |s| s.update_control(&id, now, |c| c.counters.roll(now)))
            .await?;
    }
    Ok(())
}

fn log_tick(worker: usize, report: &TickReport) {
    let busy = report.dispatched + report.retries_dispatched + report.circuit_skipped + report.retries_skipped;
    if busy == 0 {
        return;
    }
    tracing::info!(
        worker,
        dispatched = report.dispatched,
        retries = report.retries_dispatched,
        circuit_skipped = report.circuit_skipped,
        completed = report.completed,
        retrying = report.retrying,
        failed = report.failed,
        "tick"
    );
}

/// Spawn `f` on a fixed period until `stop` flips. A run in progress when
/// the stop arrives completes first.
fn every<F, Fut>(name: &'static str, period: Duration, mut stop: watch::Receiver<bool>, mut f: F) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = f().await {
                        tracing::warn!(job = name, error = %e, "periodic job failed");
                    }
                }
                _ = stop.changed() => break,
            }
        }
        tracing::debug!(job = name, "stopped");
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::tests::{add_task, err, ok, Scripted};
    use crate::notifier::tests::Recording;
    use crate::state::tests::engine_with;
    use vigil_core::alert::AlertKind;
    use vigil_core::config::Config;
    use vigil_core::freshness::{Artifact, FreshnessLevel};

    #[tokio::test]
    async fn tick_once_delivers_terminal_alert() {
        let mut config = Config::default();
        config.defaults.retry_enabled = false;
        let (_dir, state) = engine_with(config, vec![("github", Scripted::new(vec![err(401), ok()]))]);
        add_task(&state, "github", None);

        let rec = Arc::new(Recording::default());
        let report = tick_once(&state, rec.clone()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(rec.kinds(), vec![AlertKind::Failure]);
    }

    #[tokio::test]
    async fn daemon_runs_until_shutdown() {
        let mut config = Config::default();
        config.scheduler.tick_secs = 1;
        let provider = Scripted::new(vec![ok()]);
        let (_dir, state) = engine_with(config, vec![("github", provider.clone())]);
        add_task(&state, "github", None);

        let shutdown = tokio::time::sleep(Duration::from_millis(300));
        run(state.clone(), Arc::new(Recording::default()), shutdown)
            .await
            .unwrap();
        assert_eq!(provider.calls(), 1);
        assert!(state.store.get_health("github").unwrap().is_some());
    }

    #[tokio::test]
    async fn freshness_pass_scores_artifacts() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        state
            .store
            .put_artifact(&Artifact {
                id: "soc2-policy".into(),
                org: "acme".into(),
                artifact_type: "policy".into(),
                source: "manual".into(),
                collected_at: Utc::now() - chrono::Duration::days(100),
                valid_until: None,
                freshness: None,
            })
            .unwrap();
        let summary = rescore_freshness(&state).await.unwrap();
        assert_eq!(summary.count(FreshnessLevel::Stale), 1);
    }

    #[tokio::test]
    async fn rollover_sweep_touches_known_integrations() {
        let (_dir, state) = engine_with(Config::default(), vec![]);
        let old = Utc::now() - chrono::Duration::hours(2);
        state.store.update_health("okta", old, |_| ()).unwrap();
        rollover_sweep(&state).await.unwrap();
        let h = state.store.get_health("okta").unwrap().unwrap();
        assert!(h.updated_at > old);
    }
}
