//! End-to-end triggering passes against an in-memory ProwJob store

use chrono::{Duration, Utc};
use prow_lib::{
    config::{ConfigAgent, ProwConfig},
    controller_loop::ControllerLoop,
    health::{components, ComponentStatus, HealthRegistry},
    horologium::{CronScheduler, Horologium},
    store::MemoryStore,
    ProwJob, ProwJobState, ProwJobType,
};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const CONFIG: &str = r#"
prowjob_namespace: prow
scheduler:
  enabled: true
periodics:
  - name: nightly-e2e
    cron: "0 3 * * *"
  - name: hourly-lint
    interval: 1h
  - name: cooldown-soak
    minimum_interval: 2h
"#;

fn agent() -> Arc<ConfigAgent> {
    Arc::new(ConfigAgent::from_config(ProwConfig::from_yaml(CONFIG).unwrap()))
}

#[tokio::test]
async fn test_first_pass_starts_every_periodic() {
    let store = Arc::new(MemoryStore::<ProwJob>::new());
    let horologium = Horologium::new(store.clone(), agent(), Arc::new(CronScheduler::new()));

    let report = horologium.sync().await.unwrap();

    let mut triggered: Vec<_> = report.triggered.iter().map(|(job, _)| job.as_str()).collect();
    triggered.sort();
    assert_eq!(triggered, vec!["cooldown-soak", "hourly-lint", "nightly-e2e"]);

    let jobs = store.items();
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|j| j.namespace == "prow"));
    assert!(jobs.iter().all(|j| j.status.state == ProwJobState::Scheduling));
}

#[tokio::test]
async fn test_second_pass_is_quiet() {
    let store = Arc::new(MemoryStore::<ProwJob>::new());
    let horologium = Horologium::new(store.clone(), agent(), Arc::new(CronScheduler::new()));

    horologium.sync().await.unwrap();
    let report = horologium.sync().await.unwrap();

    assert!(report.triggered.is_empty());
    assert_eq!(store.len(), 3);
}

#[tokio::test]
async fn test_due_runs_from_existing_history() {
    let now = Utc::now();
    let mut lint = ProwJob::new(
        "lint-old",
        "prow",
        ProwJobType::Periodic,
        "hourly-lint",
        now - Duration::minutes(90),
    );
    lint.finish(ProwJobState::Success, now - Duration::minutes(80));
    let mut soak = ProwJob::new(
        "soak-old",
        "prow",
        ProwJobType::Periodic,
        "cooldown-soak",
        now - Duration::hours(5),
    );
    soak.finish(ProwJobState::Failure, now - Duration::hours(1));

    let mut nightly = ProwJob::new(
        "nightly-old",
        "prow",
        ProwJobType::Periodic,
        "nightly-e2e",
        now - Duration::hours(30),
    );
    nightly.finish(ProwJobState::Success, now - Duration::hours(29));

    let store = Arc::new(MemoryStore::with_items([lint, soak, nightly]));
    let horologium = Horologium::new(store.clone(), agent(), Arc::new(CronScheduler::new()));

    let report = horologium.sync().await.unwrap();

    let triggered: Vec<_> = report.triggered.iter().map(|(job, _)| job.as_str()).collect();
    assert_eq!(triggered, vec!["hourly-lint"]);
    assert_eq!(store.len(), 4);
}

#[tokio::test]
async fn test_loop_pass_reports_health() {
    let store = Arc::new(MemoryStore::<ProwJob>::new());
    let horologium = Arc::new(Horologium::new(
        store.clone(),
        agent(),
        Arc::new(CronScheduler::new()),
    ));
    let health = HealthRegistry::new();
    health.register(components::HOROLOGIUM).await;

    let controller = ControllerLoop::new(horologium).with_health(health.clone());
    assert_ok!(controller.run_once().await);
    assert_eq!(health.health().await.status, ComponentStatus::Healthy);

    store.fail_all("apiserver down");
    assert_err!(controller.run_once().await);
    assert_eq!(health.health().await.status, ComponentStatus::Degraded);
}
