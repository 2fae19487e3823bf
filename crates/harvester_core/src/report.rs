use std::collections::BTreeMap;

use crate::{UnitId, UnitRecord, UnitStatus};

/// A unit that ended this invocation in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    pub unit_id: UnitId,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Run-level status: the externally observable result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunReport {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// Units still `Pending` or `InProgress`.
    pub remaining: usize,
    pub items_collected: u64,
    pub failures: Vec<FailedUnit>,
}

impl RunReport {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a UnitRecord>) -> Self {
        let mut report = RunReport::default();
        for record in records {
            report.total += 1;
            match record.status {
                UnitStatus::Completed => {
                    report.completed += 1;
                    report.items_collected += record
                        .result_summary
                        .as_ref()
                        .map_or(0, |summary| summary.items_collected);
                }
                UnitStatus::Failed => {
                    report.failed += 1;
                    report.failures.push(FailedUnit {
                        unit_id: record.unit_id.clone(),
                        attempts: record.attempt_count,
                        last_error: record.last_error.clone(),
                    });
                }
                UnitStatus::Pending | UnitStatus::InProgress => report.remaining += 1,
            }
        }
        report
    }
}

/// What the next run would do with each configured unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunPlan {
    /// Already completed; not dispatched.
    pub skip: Vec<UnitId>,
    /// Failed in an earlier invocation; dispatched with a fresh budget.
    pub retry: Vec<UnitId>,
    /// Never finished (or never seen); dispatched.
    pub attempt: Vec<UnitId>,
}

impl RunPlan {
    pub fn classify(
        records: &BTreeMap<UnitId, UnitRecord>,
        unit_ids: &[UnitId],
        resume: bool,
    ) -> Self {
        let mut plan = RunPlan::default();
        for unit_id in unit_ids {
            let status = if resume {
                records.get(unit_id).map(|record| record.status)
            } else {
                None
            };
            match status {
                Some(UnitStatus::Completed) => plan.skip.push(unit_id.clone()),
                Some(UnitStatus::Failed) => plan.retry.push(unit_id.clone()),
                Some(UnitStatus::Pending | UnitStatus::InProgress) | None => {
                    plan.attempt.push(unit_id.clone())
                }
            }
        }
        plan
    }

    /// Units that would be dispatched.
    pub fn dispatched(&self) -> impl Iterator<Item = &UnitId> {
        self.retry.iter().chain(self.attempt.iter())
    }
}
