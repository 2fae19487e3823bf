use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use harvester_core::{
    AttemptOutcome, FailureKind, HarvestRun, RetryPolicy, UnitFailure, UnitRecord, UnitStatus,
    UnitSummary,
};
use harvester_engine::{
    stores_in, HarvestError, HarvestUnit, Orchestrator, ProgressStore, ProxyEndpoint,
    UnitExecutor,
};
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio::time::Instant;

fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

#[derive(Debug, Clone)]
enum Step {
    Succeed(u64),
    Fail(FailureKind),
    Block,
    Hang,
}

/// Plays back a per-unit script; units without a script succeed.
#[derive(Default)]
struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, String)>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    pause: Duration,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn with_pause(pause: Duration) -> Self {
        Self {
            pause,
            ..Self::default()
        }
    }

    fn script(self, unit: &str, steps: &[Step]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(unit.to_string(), steps.iter().cloned().collect());
        self
    }

    fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, unit: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == unit)
            .map(|(_, proxy)| proxy)
            .collect()
    }
}

#[async_trait::async_trait]
impl UnitExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        unit: &HarvestUnit,
        proxy: &ProxyEndpoint,
        _deadline: Instant,
    ) -> AttemptOutcome {
        self.calls
            .lock()
            .unwrap()
            .push((unit.id.clone(), proxy.identity.clone()));
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_in_flight, Ordering::SeqCst);

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&unit.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed(1));
        if !self.pause.is_zero() {
            tokio::time::sleep(self.pause).await;
        }
        let outcome = match step {
            Step::Succeed(items) => AttemptOutcome::Success {
                summary: UnitSummary {
                    items_collected: items,
                    bytes: 100,
                },
                response_time_ms: 200,
                cookie_verified: false,
            },
            Step::Fail(kind) => AttemptOutcome::Failure {
                failure: UnitFailure::new(kind, "scripted"),
                response_time_ms: 500,
            },
            Step::Block => AttemptOutcome::Blocked {
                reason: "captcha".to_string(),
            },
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                unreachable!("the orchestrator enforces the deadline");
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

fn units(ids: &[&str]) -> Vec<HarvestUnit> {
    ids.iter()
        .map(|id| HarvestUnit::new(*id, format!("https://shop.example/{id}")))
        .collect()
}

fn proxies(count: usize) -> Vec<ProxyEndpoint> {
    (1..=count)
        .map(|n| ProxyEndpoint::parse(&format!("10.0.0.{n}:8080")).unwrap())
        .collect()
}

fn run_with(budget: u32, concurrency: usize) -> HarvestRun {
    HarvestRun {
        concurrency,
        retry: RetryPolicy::immediate(budget),
        ..HarvestRun::default()
    }
}

fn orchestrator(
    dir: &Path,
    run: HarvestRun,
    unit_ids: &[&str],
    proxy_count: usize,
    executor: &Arc<ScriptedExecutor>,
) -> Orchestrator {
    let executor: Arc<dyn UnitExecutor> = executor.clone();
    Orchestrator::new(
        run,
        units(unit_ids),
        proxies(proxy_count),
        stores_in(dir),
        executor,
    )
    .unwrap()
}

fn seed_progress(dir: &Path, records: &[(&str, UnitStatus, u32)]) {
    let when = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let units: BTreeMap<_, _> = records
        .iter()
        .map(|(id, status, attempts)| {
            let mut record = UnitRecord::new(*id, when);
            record.status = *status;
            record.attempt_count = *attempts;
            (id.to_string(), record)
        })
        .collect();
    ProgressStore::new(dir).save(&units).unwrap();
}

#[tokio::test]
async fn three_units_two_proxies_one_retry() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("a", &[Step::Succeed(5)])
            .script("b", &[Step::Fail(FailureKind::Network), Step::Succeed(7)])
            .script("c", &[Step::Block, Step::Block]),
    );
    let orchestrator = orchestrator(temp.path(), run_with(1, 2), &["a", "b", "c"], 2, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.total, 3);
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 0);
    assert_eq!(report.items_collected, 12);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].unit_id, "c");
    assert_eq!(report.failures[0].attempts, 2);
    assert_eq!(
        report.failures[0].last_error.as_deref(),
        Some("blocked: captcha")
    );

    let b_proxies = executor.calls_for("b");
    assert_eq!(b_proxies.len(), 2);
    assert_ne!(b_proxies[0], b_proxies[1]);
    assert_eq!(executor.calls_for("a").len(), 1);

    let stored = ProgressStore::new(temp.path()).load().unwrap();
    assert_eq!(stored["a"].status, UnitStatus::Completed);
    assert_eq!(stored["b"].status, UnitStatus::Completed);
    assert_eq!(stored["b"].attempt_count, 2);
    assert_eq!(stored["c"].status, UnitStatus::Failed);
}

#[tokio::test]
async fn resume_skips_completed_units() {
    init_logging();
    let temp = TempDir::new().unwrap();
    seed_progress(
        temp.path(),
        &[
            ("a", UnitStatus::Completed, 1),
            ("b", UnitStatus::Failed, 3),
            ("c", UnitStatus::Pending, 0),
        ],
    );
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(temp.path(), run_with(2, 3), &["a", "b", "c"], 3, &executor);

    let status = orchestrator.status().unwrap();
    assert_eq!(status.plan.skip, vec!["a".to_string()]);
    assert_eq!(status.plan.retry, vec!["b".to_string()]);
    assert_eq!(status.plan.attempt, vec!["c".to_string()]);
    assert!(executor.calls().is_empty());

    let report = orchestrator.run().await.unwrap();
    let mut called: Vec<_> = executor.calls().into_iter().map(|(unit, _)| unit).collect();
    called.sort();
    assert_eq!(called, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(report.completed, 3);

    let stored = ProgressStore::new(temp.path()).load().unwrap();
    // The earlier completion is left as it was.
    assert_eq!(stored["a"].attempt_count, 1);
    assert_eq!(stored["b"].attempt_count, 1);
}

#[tokio::test]
async fn unit_interrupted_mid_attempt_is_retried_once() {
    init_logging();
    let temp = TempDir::new().unwrap();
    seed_progress(
        temp.path(),
        &[
            ("a", UnitStatus::Completed, 1),
            ("b", UnitStatus::InProgress, 1),
        ],
    );
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(temp.path(), run_with(2, 2), &["a", "b"], 2, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(executor.calls_for("a").len(), 0);
    assert_eq!(executor.calls_for("b").len(), 1);
    assert_eq!(report.completed, 2);
    let stored = ProgressStore::new(temp.path()).load().unwrap();
    assert_eq!(stored["b"].status, UnitStatus::Completed);
}

#[tokio::test]
async fn retries_stop_when_the_budget_is_spent() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script(
        "a",
        &[
            Step::Fail(FailureKind::Network),
            Step::Fail(FailureKind::Network),
            Step::Fail(FailureKind::Network),
            Step::Succeed(1),
        ],
    ));
    let orchestrator = orchestrator(temp.path(), run_with(2, 1), &["a"], 3, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(executor.calls_for("a").len(), 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].attempts, 3);
    assert_eq!(
        report.failures[0].last_error.as_deref(),
        Some("network failure: scripted")
    );
}

#[tokio::test]
async fn empty_pool_fails_units_without_attempts() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(temp.path(), run_with(2, 2), &["a", "b"], 0, &executor);

    let report = orchestrator.run().await.unwrap();

    assert!(executor.calls().is_empty());
    assert_eq!(report.failed, 2);
    for failure in &report.failures {
        assert_eq!(failure.attempts, 0);
        assert_eq!(failure.last_error.as_deref(), Some("no proxy available"));
    }
}

#[tokio::test]
async fn hung_attempt_times_out_and_is_charged_to_the_proxy() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script("a", &[Step::Hang]));
    let run = HarvestRun {
        per_unit_timeout: Duration::from_millis(50),
        ..run_with(0, 1)
    };
    let orchestrator = orchestrator(temp.path(), run, &["a"], 1, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.failed, 1);
    assert!(report.failures[0]
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("timeout"));
    let proxies = orchestrator.proxy_snapshot();
    assert_eq!(proxies[0].failures, 1);
    assert_eq!(proxies[0].successes, 0);
}

#[tokio::test]
async fn timeout_too_large_for_the_clock_still_runs() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let run = HarvestRun {
        per_unit_timeout: Duration::from_secs(u64::MAX),
        ..run_with(0, 1)
    };
    let orchestrator = orchestrator(temp.path(), run, &["a"], 1, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(executor.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn retries_wait_out_the_backoff_delay() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script(
        "a",
        &[
            Step::Fail(FailureKind::Network),
            Step::Fail(FailureKind::Network),
            Step::Succeed(3),
        ],
    ));
    let run = HarvestRun {
        retry: RetryPolicy {
            retry_budget: 2,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        },
        ..run_with(2, 1)
    };
    let orchestrator = orchestrator(temp.path(), run, &["a"], 3, &executor);

    let started = Instant::now();
    let report = orchestrator.run().await.unwrap();
    let waited = started.elapsed();

    assert_eq!(report.completed, 1);
    assert_eq!(executor.calls_for("a").len(), 3);
    // 10s after the first failure, 20s after the second.
    assert!(waited >= Duration::from_secs(30), "waited only {waited:?}");
    assert!(waited < Duration::from_secs(31), "waited {waited:?}");
}

#[tokio::test]
async fn unreachable_proxy_is_blacklisted_and_the_unit_moves_on() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script(
        "a",
        &[Step::Fail(FailureKind::ProxyUnreachable), Step::Succeed(3)],
    ));
    let orchestrator = orchestrator(temp.path(), run_with(1, 1), &["a"], 2, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(
        executor.calls_for("a"),
        vec!["10.0.0.1:8080".to_string(), "10.0.0.2:8080".to_string()]
    );
    let proxies = orchestrator.proxy_snapshot();
    let dead = proxies
        .iter()
        .find(|p| p.identity == "10.0.0.1:8080")
        .unwrap();
    assert!(dead.blacklisted_until.unwrap() > Utc::now());
    assert_eq!(dead.failures, 1);
}

#[tokio::test]
async fn blocked_attempts_do_not_count_against_the_proxy() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new().script("a", &[Step::Block]));
    let orchestrator = orchestrator(temp.path(), run_with(0, 1), &["a"], 1, &executor);

    orchestrator.run().await.unwrap();

    let proxy = &orchestrator.proxy_snapshot()[0];
    assert_eq!(proxy.failures, 0);
    assert!(proxy.last_used_at.is_some());
}

#[tokio::test]
async fn proxy_history_survives_into_the_next_run() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    orchestrator(temp.path(), run_with(0, 1), &["a"], 1, &executor)
        .run()
        .await
        .unwrap();

    let next = orchestrator(temp.path(), run_with(0, 1), &["b"], 1, &executor);
    let proxies = next.proxy_snapshot();
    assert_eq!(proxies[0].successes, 1);
}

#[tokio::test]
async fn concurrency_limit_is_respected() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::with_pause(Duration::from_millis(20)));
    let orchestrator = orchestrator(
        temp.path(),
        run_with(0, 2),
        &["a", "b", "c", "d", "e"],
        5,
        &executor,
    );

    let report = orchestrator.run().await.unwrap();

    assert_eq!(report.completed, 5);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn unwritable_state_dir_aborts_the_run() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let not_a_dir = temp.path().join("state");
    std::fs::write(&not_a_dir, "x").unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(&not_a_dir, run_with(0, 1), &["a"], 1, &executor);

    let result = orchestrator.run().await;

    assert!(matches!(result, Err(HarvestError::Persistence(_))));
    assert!(executor.calls().is_empty());
}

#[tokio::test]
async fn fresh_start_redoes_completed_units() {
    init_logging();
    let temp = TempDir::new().unwrap();
    seed_progress(temp.path(), &[("a", UnitStatus::Completed, 1)]);
    let executor = Arc::new(ScriptedExecutor::new());
    let run = HarvestRun {
        resume: false,
        ..run_with(0, 1)
    };
    let orchestrator = orchestrator(temp.path(), run, &["a"], 1, &executor);

    orchestrator.run().await.unwrap();

    assert_eq!(executor.calls_for("a").len(), 1);
}

#[tokio::test]
async fn unit_filter_limits_the_run() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new());
    let run = HarvestRun {
        unit_filter: ["b".to_string()].into_iter().collect(),
        ..run_with(0, 2)
    };
    let orchestrator = orchestrator(temp.path(), run, &["a", "b"], 1, &executor);

    let report = orchestrator.run().await.unwrap();

    assert_eq!(orchestrator.selected_units(), &["b".to_string()]);
    assert_eq!(report.total, 1);
    assert_eq!(executor.calls_for("a").len(), 0);
}

#[tokio::test]
async fn reset_clears_stored_progress() {
    init_logging();
    let temp = TempDir::new().unwrap();
    seed_progress(temp.path(), &[("a", UnitStatus::Completed, 1)]);
    let executor = Arc::new(ScriptedExecutor::new());
    let orchestrator = orchestrator(temp.path(), run_with(0, 1), &["a"], 1, &executor);

    orchestrator.reset().unwrap();

    let status = orchestrator.status().unwrap();
    assert_eq!(status.plan.attempt, vec!["a".to_string()]);
    assert_eq!(status.report.remaining, 1);
    assert_eq!(status.last_updated, None);
}

#[test]
fn duplicate_units_are_a_config_error() {
    init_logging();
    let temp = TempDir::new().unwrap();
    let executor: Arc<dyn UnitExecutor> = Arc::new(ScriptedExecutor::new());
    let result = Orchestrator::new(
        HarvestRun::default(),
        units(&["a", "a"]),
        proxies(1),
        stores_in(temp.path()),
        executor,
    );
    assert!(matches!(result, Err(HarvestError::Config(_))));
}
