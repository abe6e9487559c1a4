use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use vigil_core::alert::{Alert, AlertKind, AlertStatus, AlertSubject};
use vigil_core::breaker::{Admission, BreakerState};
use vigil_core::classifier::RawError;
use vigil_core::config::Config;
use vigil_core::control::ControlHealth;
use vigil_core::paths;
use vigil_core::store::Store;
use vigil_core::task::{Frequency, RetryPolicy, ScheduledTask};
use vigil_engine::alerting::acknowledge_control_alert;
use vigil_engine::notifier::Notifier;
use vigil_engine::provider::{ProviderAdapter, ProviderRegistry, SyncStats};
use vigil_engine::{daemon, scheduler, EngineState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type SyncResult = Result<SyncStats, RawError>;

/// Adapter that plays back results in order, repeating the last one.
struct Script(Mutex<VecDeque<SyncResult>>);

impl Script {
    fn new(results: Vec<SyncResult>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(results.into())))
    }

    fn push(&self, result: SyncResult) {
        let mut q = self.0.lock().unwrap();
        q.clear();
        q.push_back(result);
    }
}

#[async_trait]
impl ProviderAdapter for Script {
    async fn sync(&self) -> SyncResult {
        let mut q = self.0.lock().unwrap();
        if q.len() > 1 {
            q.pop_front().unwrap()
        } else {
            q.front().cloned().unwrap()
        }
    }
}

#[derive(Default)]
struct Inbox(Mutex<Vec<Alert>>);

impl Inbox {
    fn kinds(&self) -> Vec<AlertKind> {
        self.0.lock().unwrap().iter().map(|a| a.kind).collect()
    }
}

#[async_trait]
impl Notifier for Inbox {
    fn name(&self) -> &'static str {
        "inbox"
    }

    async fn notify(&self, alert: &Alert) -> vigil_engine::Result<()> {
        self.0.lock().unwrap().push(alert.clone());
        Ok(())
    }
}

fn boot(config: Config, id: &str, adapter: Arc<Script>) -> (TempDir, EngineState) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&paths::db_path(dir.path())).unwrap();
    let mut providers = ProviderRegistry::default();
    providers.insert(id, adapter);
    (dir, EngineState::new(store, config, providers))
}

fn schedule(state: &EngineState, integration: &str, control: Option<&str>) -> ScheduledTask {
    let task = ScheduledTask::new(
        integration,
        control.map(str::to_string),
        Frequency::Every { secs: 60 },
        RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        },
        Utc::now() - Duration::seconds(1),
    );
    state.store.insert_task(&task).unwrap();
    task
}

fn make_due(state: &EngineState, task: &ScheduledTask) {
    let mut t = state.store.get_task(task.id).unwrap();
    t.next_run_at = Utc::now() - Duration::seconds(1);
    state.store.insert_task(&t).unwrap();
}

fn failing() -> SyncResult {
    Err(RawError::new(Some(503), "service unavailable"))
}

fn passing(failed_checks: u32) -> SyncResult {
    Ok(SyncStats {
        items: 10,
        failed_checks,
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn breaker_opens_skips_and_recovers_through_one_probe() {
    let mut config = Config::default();
    config.defaults.circuit_breaker_threshold = 3;
    config.defaults.circuit_breaker_reset_ms = 500;
    let script = Script::new(vec![failing()]);
    let (_dir, state) = boot(config, "github", script.clone());
    let task = schedule(&state, "github", None);
    let inbox = Arc::new(Inbox::default());

    for _ in 0..3 {
        make_due(&state, &task);
        daemon::tick_once(&state, inbox.clone()).await.unwrap();
    }
    let health = state.store.get_health("github").unwrap().unwrap();
    assert_eq!(health.breaker.state, BreakerState::Open);
    assert_eq!(health.consecutive_failures, 3);

    // open: skipped, no attempt row, next_run_at untouched
    make_due(&state, &task);
    let before = state.store.get_task(task.id).unwrap();
    let rows = state.store.attempts_for_task(task.id).unwrap().len();
    let report = scheduler::tick(&state, Utc::now()).await.unwrap();
    assert_eq!(report.circuit_skipped, 1);
    assert_eq!(state.store.attempts_for_task(task.id).unwrap().len(), rows);
    assert_eq!(state.store.get_task(task.id).unwrap().next_run_at, before.next_run_at);
    assert_eq!(
        state.store.get_health("github").unwrap().unwrap().consecutive_failures,
        3
    );

    // after the cool-down a single probe succeeds and closes the breaker
    tokio::time::sleep(std::time::Duration::from_millis(600)).await;
    script.push(passing(0));
    let report = daemon::tick_once(&state, inbox.clone()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    let health = state.store.get_health("github").unwrap().unwrap();
    assert_eq!(health.breaker.state, BreakerState::Closed);
    assert_eq!(health.consecutive_failures, 0);

    // one failure alert while failing, then a recovery
    assert_eq!(inbox.kinds(), vec![AlertKind::Failure, AlertKind::Recovery]);
}

#[tokio::test]
async fn failed_probe_reopens_at_probe_time() {
    let mut config = Config::default();
    config.defaults.circuit_breaker_threshold = 1;
    config.defaults.circuit_breaker_reset_ms = 300;
    let (_dir, state) = boot(config, "jira", Script::new(vec![failing()]));
    let task = schedule(&state, "jira", None);

    scheduler::tick(&state, Utc::now()).await.unwrap();
    let first_open = state
        .store
        .get_health("jira")
        .unwrap()
        .unwrap()
        .breaker
        .opened_at
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    make_due(&state, &task);
    let report = scheduler::tick(&state, Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    let health = state.store.get_health("jira").unwrap().unwrap();
    assert_eq!(health.breaker.state, BreakerState::Open);
    assert!(health.breaker.opened_at.unwrap() > first_open);
}

#[tokio::test]
async fn control_probe_fails_three_times_then_recovers() {
    let script = Script::new(vec![passing(2)]);
    let (_dir, state) = boot(Config::default(), "aws", script.clone());
    let task = schedule(&state, "aws", Some("cc-6.1"));
    let inbox = Arc::new(Inbox::default());

    let mut seen = Vec::new();
    for _ in 0..3 {
        make_due(&state, &task);
        daemon::tick_once(&state, inbox.clone()).await.unwrap();
        seen.push(state.store.require_control("cc-6.1").unwrap().current_health);
    }
    assert_eq!(
        seen,
        vec![ControlHealth::Degraded, ControlHealth::Degraded, ControlHealth::Failing]
    );
    let status = state.store.require_control("cc-6.1").unwrap();
    assert_eq!(status.alert_status, AlertStatus::Alerting);
    assert_eq!(status.health_score, 40);

    make_due(&state, &task);
    daemon::tick_once(&state, inbox.clone()).await.unwrap();
    assert_eq!(inbox.kinds(), vec![AlertKind::Failure]);

    script.push(passing(0));
    for _ in 0..3 {
        make_due(&state, &task);
        daemon::tick_once(&state, inbox.clone()).await.unwrap();
    }
    let status = state.store.require_control("cc-6.1").unwrap();
    assert_eq!(status.current_health, ControlHealth::Healthy);
    assert_eq!(status.alert_status, AlertStatus::None);
    assert_eq!(inbox.kinds(), vec![AlertKind::Failure, AlertKind::Recovery]);
}

#[tokio::test]
async fn acknowledged_control_alerts_again_on_a_fresh_streak() {
    let script = Script::new(vec![passing(2)]);
    let (_dir, state) = boot(Config::default(), "aws", script.clone());
    let task = schedule(&state, "aws", Some("cc-6.1"));
    let inbox = Arc::new(Inbox::default());
    let tick = |n: usize| {
        let (state, task, inbox) = (state.clone(), task.clone(), inbox.clone());
        async move {
            for _ in 0..n {
                make_due(&state, &task);
                daemon::tick_once(&state, inbox.clone()).await.unwrap();
            }
        }
    };

    tick(3).await;
    assert_eq!(inbox.kinds(), vec![AlertKind::Failure]);
    acknowledge_control_alert(&state.store, "cc-6.1", "dana", Utc::now()).unwrap();
    let first = state
        .store
        .open_failure_alert(&AlertSubject::Control("cc-6.1".into()))
        .unwrap()
        .unwrap();

    // One pass ends the streak without recovering the control.
    script.push(passing(0));
    tick(1).await;
    assert_eq!(
        state.store.require_control("cc-6.1").unwrap().current_health,
        ControlHealth::Degraded
    );

    script.push(passing(2));
    tick(3).await;
    let status = state.store.require_control("cc-6.1").unwrap();
    assert_eq!(status.current_health, ControlHealth::Failing);
    assert_eq!(status.alert_status, AlertStatus::Alerting);
    assert_eq!(inbox.kinds(), vec![AlertKind::Failure, AlertKind::Failure]);
    assert!(!state.store.get_alert(first.id).unwrap().is_open());
}

#[tokio::test]
async fn restart_releases_half_open_slot_left_by_crashed_dispatch() {
    let mut config = Config::default();
    config.defaults.circuit_breaker_threshold = 1;
    config.defaults.circuit_breaker_reset_ms = 200;
    config.scheduler.recovery_max_age_secs = 0;
    let script = Script::new(vec![failing()]);
    let (_dir, state) = boot(config, "jira", script.clone());
    let task = schedule(&state, "jira", None);

    scheduler::tick(&state, Utc::now()).await.unwrap();
    assert_eq!(
        state.store.get_health("jira").unwrap().unwrap().breaker.state,
        BreakerState::Open
    );

    // The slot is handed out and the task claimed, then the process dies
    // before the attempt reports back.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    make_due(&state, &task);
    let now = Utc::now();
    assert_eq!(state.owner("jira").admit(now).await.unwrap(), Admission::Probe);
    let lease = state.config.scheduler.lease();
    state.store.claim_task(task.id, now, lease).unwrap().unwrap();
    assert_eq!(
        state.owner("jira").admit(Utc::now()).await.unwrap(),
        Admission::Rejected
    );

    let max_age = state.config.scheduler.recovery_max_age();
    assert_eq!(state.store.startup_recovery(max_age, Utc::now()).unwrap(), 1);
    let health = state.store.get_health("jira").unwrap().unwrap();
    assert_eq!(health.breaker.state, BreakerState::HalfOpen);
    assert!(!health.breaker.probe_in_flight);

    script.push(passing(0));
    make_due(&state, &task);
    let report = scheduler::tick(&state, Utc::now()).await.unwrap();
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.circuit_skipped, 0);
    let health = state.store.get_health("jira").unwrap().unwrap();
    assert_eq!(health.breaker.state, BreakerState::Closed);
}

#[tokio::test]
async fn muted_control_raises_nothing() {
    let (_dir, state) = boot(Config::default(), "aws", Script::new(vec![passing(1)]));
    let task = schedule(&state, "aws", Some("cc-7.2"));
    state
        .store
        .update_control("cc-7.2", Utc::now(), |c| {
            vigil_core::alert::set_muted(c, true, Utc::now())
        })
        .unwrap();
    let inbox = Arc::new(Inbox::default());
    for _ in 0..4 {
        make_due(&state, &task);
        daemon::tick_once(&state, inbox.clone()).await.unwrap();
    }
    let status = state.store.require_control("cc-7.2").unwrap();
    assert_eq!(status.current_health, ControlHealth::Failing);
    assert_eq!(status.alert_status, AlertStatus::Muted);
    assert!(inbox.kinds().is_empty());
}

#[tokio::test]
async fn two_workers_never_double_dispatch() {
    let (_dir, state) = boot(Config::default(), "okta", Script::new(vec![passing(0)]));
    for _ in 0..5 {
        schedule(&state, "okta", None);
    }
    let now = Utc::now();
    let (a, b) = tokio::join!(scheduler::tick(&state, now), scheduler::tick(&state, now));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.dispatched + b.dispatched, 5);
    for task in state.store.list_tasks().unwrap() {
        assert_eq!(task.success_count, 1);
        assert_eq!(state.store.attempts_for_task(task.id).unwrap().len(), 1);
    }
}
