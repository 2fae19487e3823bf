use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use engine_logging::{engine_debug, engine_error, engine_info, engine_warn};
use harvester_core::{
    update, AttemptOutcome, Effect, FailureKind, HarvestRun, HarvestState, Msg, ProxyId,
    ProxyPick, ProxyPool, ProxyRecord, RunPlan, RunReport, UnitFailure, UnitId,
};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::store::{ProgressStore, ProxyStatsStore};
use crate::{HarvestError, HarvestUnit, ProxyEndpoint, UnitExecutor};

/// Upper bound on how long a worker waits for a leased proxy to come back
/// before looking at the pool again.
const BUSY_POLL: Duration = Duration::from_millis(250);

/// Deadline used when the per-unit timeout does not fit on the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// What `--status` shows: the plan for the next run and the stored counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub plan: RunPlan,
    pub report: RunReport,
    pub last_updated: Option<DateTime<Utc>>,
}

struct Roster {
    pool: ProxyPool,
    endpoints: BTreeMap<ProxyId, ProxyEndpoint>,
}

struct Shared {
    run: HarvestRun,
    units: BTreeMap<UnitId, HarvestUnit>,
    ledger: Mutex<HarvestState>,
    roster: Mutex<Roster>,
    released: Notify,
    queue: Mutex<VecDeque<UnitId>>,
    progress: ProgressStore,
    proxy_stats: ProxyStatsStore,
    executor: Arc<dyn UnitExecutor>,
}

/// Drives every selected unit to a terminal status with a bounded pool of
/// workers, persisting each transition before the next one is taken.
pub struct Orchestrator {
    shared: Arc<Shared>,
    selected: Vec<UnitId>,
}

impl Orchestrator {
    pub fn new(
        run: HarvestRun,
        catalogue: Vec<HarvestUnit>,
        endpoints: Vec<ProxyEndpoint>,
        stores: (ProgressStore, ProxyStatsStore),
        executor: Arc<dyn UnitExecutor>,
    ) -> Result<Self, HarvestError> {
        if run.concurrency == 0 {
            return Err(HarvestError::Config("concurrency must be at least 1".into()));
        }
        if run.per_unit_timeout.is_zero() {
            return Err(HarvestError::Config(
                "per-unit timeout must be positive".into(),
            ));
        }

        let mut units = BTreeMap::new();
        let mut selected = Vec::new();
        for unit in catalogue {
            if units.contains_key(&unit.id) {
                return Err(HarvestError::Config(format!(
                    "unit {:?} is configured twice",
                    unit.id
                )));
            }
            if run.includes(&unit.id) {
                selected.push(unit.id.clone());
            }
            units.insert(unit.id.clone(), unit);
        }
        for wanted in &run.unit_filter {
            if !units.contains_key(wanted) {
                engine_warn!("Requested unit {:?} is not configured; ignoring it", wanted);
            }
        }

        let (progress, proxy_stats) = stores;
        let endpoints: BTreeMap<ProxyId, ProxyEndpoint> = endpoints
            .into_iter()
            .map(|endpoint| (endpoint.identity.clone(), endpoint))
            .collect();
        let pool = ProxyPool::restore(
            endpoints.keys().cloned(),
            proxy_stats.load_or_default(),
            run.weights.clone(),
        );
        if pool.is_empty() {
            engine_warn!("No proxies configured; every unit will fail with no proxy available");
        } else {
            engine_info!("Proxy pool holds {} proxies", pool.len());
        }

        let shared = Shared {
            ledger: Mutex::new(HarvestState::new(run.retry.clone())),
            run,
            units,
            roster: Mutex::new(Roster { pool, endpoints }),
            released: Notify::new(),
            queue: Mutex::new(VecDeque::new()),
            progress,
            proxy_stats,
            executor,
        };
        Ok(Self {
            shared: Arc::new(shared),
            selected,
        })
    }

    /// Units this orchestrator works on, in configuration order.
    pub fn selected_units(&self) -> &[UnitId] {
        &self.selected
    }

    /// Runs every selected unit that is not already completed.
    ///
    /// Per-unit failures end up in the returned report; only failures that
    /// make progress untrustworthy (the state file cannot be written, a worker
    /// panicked) are returned as errors.
    pub async fn run(&self) -> Result<RunReport, HarvestError> {
        let shared = &self.shared;
        let resume = shared.run.resume;
        if !resume {
            engine_info!("Fresh start requested; discarding earlier progress");
            shared.progress.reset()?;
        }
        let records = shared.progress.load()?;
        *shared.lock_ledger() = HarvestState::restore(records, shared.run.retry.clone());

        let effects = shared.apply(Msg::Enumerate {
            unit_ids: self.selected.clone(),
            resume,
            now: Utc::now(),
        })?;
        let queued: VecDeque<UnitId> = effects
            .into_iter()
            .filter_map(|effect| match effect {
                Effect::Enqueue { unit_id } => Some(unit_id),
                _ => None,
            })
            .collect();
        engine_info!(
            "{} of {} unit(s) to process, {} already completed",
            queued.len(),
            self.selected.len(),
            self.selected.len() - queued.len()
        );

        let workers = shared.run.worker_count(queued.len());
        *shared.lock_queue() = queued;

        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let shared = Arc::clone(&self.shared);
            tasks.spawn(async move { worker_loop(shared, worker).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|err| Err(HarvestError::Worker(err.to_string())));
            if let Err(err) = result {
                if outcome.is_ok() {
                    engine_error!("Aborting run: {}", err);
                    tasks.abort_all();
                    outcome = Err(err);
                }
            }
        }
        shared.save_proxy_stats();
        outcome?;

        let report = shared.lock_ledger().report();
        engine_info!(
            "Run finished: {} completed, {} failed, {} remaining",
            report.completed,
            report.failed,
            report.remaining
        );
        Ok(report)
    }

    /// Counts over the selected units as currently known, whether or not a run
    /// has finished.
    pub fn report(&self) -> RunReport {
        let ledger = self.shared.lock_ledger();
        RunReport::from_records(self.selected.iter().filter_map(|id| ledger.record(id)))
    }

    /// Reads the stored progress and reports what a run would do, without
    /// dispatching anything.
    pub fn status(&self) -> Result<StatusReport, HarvestError> {
        let progress = &self.shared.progress;
        let state = HarvestState::restore(progress.load()?, self.shared.run.retry.clone());
        let plan = state.plan(&self.selected, self.shared.run.resume);
        let mut report =
            RunReport::from_records(self.selected.iter().filter_map(|id| state.record(id)));
        // Units never seen before still have to be done.
        let unseen = self
            .selected
            .iter()
            .filter(|id| state.record(id).is_none())
            .count();
        report.total += unseen;
        report.remaining += unseen;
        Ok(StatusReport {
            plan,
            report,
            last_updated: progress.last_updated()?,
        })
    }

    /// Forgets all progress and proxy history.
    pub fn reset(&self) -> Result<(), HarvestError> {
        self.shared.progress.reset()?;
        self.shared.proxy_stats.reset()?;
        *self.shared.lock_ledger() = HarvestState::new(self.shared.run.retry.clone());
        Ok(())
    }

    pub fn proxy_snapshot(&self) -> Vec<ProxyRecord> {
        self.shared.lock_roster().pool.records().cloned().collect()
    }
}

async fn worker_loop(shared: Arc<Shared>, worker: usize) -> Result<(), HarvestError> {
    while let Some(unit_id) = shared.next_unit() {
        let Some(unit) = shared.units.get(&unit_id).cloned() else {
            engine_warn!("Worker {} skipped unknown unit {}", worker, unit_id);
            continue;
        };
        engine_debug!("Worker {} took unit {}", worker, unit.id);
        shared.work_unit(&unit).await?;
    }
    engine_debug!("Worker {} found the queue empty", worker);
    Ok(())
}

impl Shared {
    fn lock_ledger(&self) -> MutexGuard<'_, HarvestState> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_roster(&self) -> MutexGuard<'_, Roster> {
        self.roster.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<UnitId>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_unit(&self) -> Option<UnitId> {
        self.lock_queue().pop_front()
    }

    /// Feeds one message through the state machine. The progress file is
    /// rewritten before the lock is released, so no transition is acted on
    /// before it is durable.
    fn apply(&self, msg: Msg) -> Result<Vec<Effect>, HarvestError> {
        let mut ledger = self.lock_ledger();
        let state = std::mem::take(&mut *ledger);
        let (state, effects) = update(state, msg);
        *ledger = state;
        if effects.contains(&Effect::Persist) {
            self.progress.save(ledger.units())?;
        }
        Ok(effects)
    }

    async fn work_unit(&self, unit: &HarvestUnit) -> Result<(), HarvestError> {
        let max_attempts = self.run.retry.max_attempts();
        let mut avoid = BTreeSet::new();
        loop {
            let Some(endpoint) = self.lease_proxy(&avoid).await else {
                engine_warn!("No proxy available for {}", unit.display_name());
                self.apply(Msg::NoProxyAvailable {
                    unit_id: unit.id.clone(),
                    now: Utc::now(),
                })?;
                return Ok(());
            };

            let effects = match self.apply(Msg::Dispatched {
                unit_id: unit.id.clone(),
                proxy: endpoint.identity.clone(),
                now: Utc::now(),
            }) {
                Ok(effects) => effects,
                Err(err) => {
                    self.return_proxy(&endpoint.identity);
                    return Err(err);
                }
            };
            if !effects
                .iter()
                .any(|effect| matches!(effect, Effect::Execute { .. }))
            {
                self.return_proxy(&endpoint.identity);
                return Ok(());
            }

            let attempt = self
                .lock_ledger()
                .record(&unit.id)
                .map_or(0, |record| record.attempt_count);
            engine_info!(
                "Processing {} (attempt {}/{}) via proxy {}",
                unit.display_name(),
                attempt,
                max_attempts,
                endpoint.identity
            );

            let outcome = self.attempt(unit, &endpoint).await;
            self.settle_proxy(&endpoint.identity, &outcome);

            let now = Utc::now();
            let msg = match outcome.into_result() {
                Ok(summary) => {
                    engine_info!(
                        "Completed {}: {} item(s), {} bytes",
                        unit.display_name(),
                        summary.items_collected,
                        summary.bytes
                    );
                    Msg::AttemptSucceeded {
                        unit_id: unit.id.clone(),
                        summary,
                        now,
                    }
                }
                Err(failure) => {
                    engine_warn!(
                        "Attempt {} for {} failed: {}",
                        attempt,
                        unit.display_name(),
                        failure
                    );
                    Msg::AttemptFailed {
                        unit_id: unit.id.clone(),
                        failure,
                        now,
                    }
                }
            };

            let retry = self.apply(msg)?.into_iter().find_map(|effect| match effect {
                Effect::Retry { delay, avoid, .. } => Some((delay, avoid)),
                Effect::Abandon { unit_id } => {
                    engine_error!("Giving up on {} after {} attempt(s)", unit_id, attempt);
                    None
                }
                _ => None,
            });
            let Some((delay, last_proxy)) = retry else {
                return Ok(());
            };
            avoid.extend(last_proxy);
            if !delay.is_zero() {
                engine_info!("Retrying {} in {:?}", unit.display_name(), delay);
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Leases the best proxy not in `avoid`. Waits while every usable proxy is
    /// leased to another unit; `None` once no proxy is usable at all.
    async fn lease_proxy(&self, avoid: &BTreeSet<ProxyId>) -> Option<ProxyEndpoint> {
        loop {
            // Registered before looking so a release in between is not missed.
            let released = self.released.notified();
            {
                let mut roster = self.lock_roster();
                match roster
                    .pool
                    .acquire(avoid, self.run.exclusive_proxies, Utc::now())
                {
                    ProxyPick::Picked(identity) => {
                        if let Some(score) = roster.pool.score_of(&identity, Utc::now()) {
                            engine_debug!("Leased proxy {} (score {:.3})", identity, score);
                        }
                        let endpoint = roster.endpoints.get(&identity).cloned();
                        if endpoint.is_none() {
                            roster.pool.release(&identity);
                            engine_error!("Proxy {} has no endpoint", identity);
                        }
                        return endpoint;
                    }
                    ProxyPick::Exhausted => return None,
                    ProxyPick::Busy => {}
                }
            }
            let _ = tokio::time::timeout(BUSY_POLL, released).await;
        }
    }

    async fn attempt(&self, unit: &HarvestUnit, endpoint: &ProxyEndpoint) -> AttemptOutcome {
        let timeout = self.run.per_unit_timeout;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        match tokio::time::timeout_at(deadline, self.executor.execute(unit, endpoint, deadline))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Failure {
                failure: UnitFailure::new(
                    FailureKind::Timeout,
                    format!("no result within {timeout:?}"),
                ),
                response_time_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
        }
    }

    /// Charges the attempt to the proxy and hands the lease back.
    fn settle_proxy(&self, identity: &str, outcome: &AttemptOutcome) {
        let now = Utc::now();
        {
            let mut roster = self.lock_roster();
            let pool = &mut roster.pool;
            match outcome {
                AttemptOutcome::Success {
                    response_time_ms,
                    cookie_verified,
                    ..
                } => pool.record_outcome(identity, true, *response_time_ms, *cookie_verified, now),
                AttemptOutcome::Failure {
                    failure,
                    response_time_ms,
                } => {
                    if failure.kind.counts_against_proxy() {
                        pool.record_outcome(identity, false, *response_time_ms, false, now);
                    } else {
                        pool.touch(identity, now);
                    }
                    if failure.kind.condemns_proxy() {
                        engine_warn!(
                            "Proxy {} is unreachable; out of rotation for {:?}",
                            identity,
                            self.run.dead_proxy_cooldown
                        );
                        pool.blacklist(identity, self.run.dead_proxy_cooldown, now);
                    }
                }
                AttemptOutcome::Blocked { .. } => pool.touch(identity, now),
            }
            pool.release(identity);
            if let Err(err) = self.proxy_stats.save(roster.pool.records()) {
                engine_warn!("Could not save proxy statistics: {}", err);
            }
        }
        self.released.notify_waiters();
    }

    fn return_proxy(&self, identity: &str) {
        self.lock_roster().pool.release(identity);
        self.released.notify_waiters();
    }

    fn save_proxy_stats(&self) {
        let roster = self.lock_roster();
        if roster.pool.is_empty() {
            return;
        }
        if let Err(err) = self.proxy_stats.save(roster.pool.records()) {
            engine_warn!("Could not save proxy statistics: {}", err);
        }
    }
}
