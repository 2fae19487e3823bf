use std::collections::BTreeSet;
use std::time::Duration;

use crate::{RetryPolicy, ScoreWeights, UnitId};

/// Parameters of one invocation. Rebuilt from configuration on every start.
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestRun {
    /// Number of units worked on at the same time.
    pub concurrency: usize,
    pub per_unit_timeout: Duration,
    pub retry: RetryPolicy,
    /// Keep completed units from previous invocations.
    pub resume: bool,
    /// Units to work on; empty means every configured unit.
    pub unit_filter: BTreeSet<UnitId>,
    /// How long a proxy that refused connections stays out of rotation.
    pub dead_proxy_cooldown: Duration,
    /// At most one unit per proxy at a time.
    pub exclusive_proxies: bool,
    pub weights: ScoreWeights,
}

impl Default for HarvestRun {
    fn default() -> Self {
        Self {
            concurrency: 3,
            per_unit_timeout: Duration::from_secs(5 * 60),
            retry: RetryPolicy::default(),
            resume: true,
            unit_filter: BTreeSet::new(),
            dead_proxy_cooldown: Duration::from_secs(30 * 60),
            exclusive_proxies: true,
            weights: ScoreWeights::default(),
        }
    }
}

impl HarvestRun {
    pub fn includes(&self, unit_id: &str) -> bool {
        self.unit_filter.is_empty() || self.unit_filter.contains(unit_id)
    }

    /// Worker count for `pending` units: never zero, never above the limit.
    pub fn worker_count(&self, pending: usize) -> usize {
        self.concurrency.max(1).min(pending.max(1))
    }
}
