use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::report::{RunPlan, RunReport};
use crate::{RetryPolicy, UnitId, UnitRecord};

/// Progress of every known unit plus the retry policy of this invocation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HarvestState {
    units: BTreeMap<UnitId, UnitRecord>,
    scope: Vec<UnitId>,
    retry: RetryPolicy,
}

impl HarvestState {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            retry,
            ..Self::default()
        }
    }

    /// Rebuilds state from persisted records. Attempts interrupted by a crash
    /// are put back to `Pending`.
    pub fn restore(mut units: BTreeMap<UnitId, UnitRecord>, retry: RetryPolicy) -> Self {
        for record in units.values_mut() {
            record.recover_after_crash();
        }
        Self {
            units,
            scope: Vec::new(),
            retry,
        }
    }

    pub fn units(&self) -> &BTreeMap<UnitId, UnitRecord> {
        &self.units
    }

    pub fn record(&self, unit_id: &str) -> Option<&UnitRecord> {
        self.units.get(unit_id)
    }

    /// Units enumerated for this invocation, in enumeration order.
    pub fn scope(&self) -> &[UnitId] {
        &self.scope
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Counts over the units in scope, or over every record before enumeration.
    pub fn report(&self) -> RunReport {
        if self.scope.is_empty() {
            RunReport::from_records(self.units.values())
        } else {
            RunReport::from_records(self.scope.iter().filter_map(|id| self.units.get(id)))
        }
    }

    pub fn plan(&self, unit_ids: &[UnitId], resume: bool) -> RunPlan {
        RunPlan::classify(&self.units, unit_ids, resume)
    }

    pub(crate) fn clear(&mut self) {
        self.units.clear();
    }

    pub(crate) fn set_scope(&mut self, scope: Vec<UnitId>) {
        self.scope = scope;
    }

    pub(crate) fn record_mut(&mut self, unit_id: &str) -> Option<&mut UnitRecord> {
        self.units.get_mut(unit_id)
    }

    /// Returns the record for `unit_id`, creating a `Pending` one if needed.
    pub(crate) fn ensure(&mut self, unit_id: &str, now: DateTime<Utc>) -> &mut UnitRecord {
        self.units
            .entry(unit_id.to_string())
            .or_insert_with(|| UnitRecord::new(unit_id, now))
    }
}
