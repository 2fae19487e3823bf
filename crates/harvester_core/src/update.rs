use std::collections::BTreeSet;

use crate::{Effect, FailureKind, HarvestState, Msg, UnitFailure, UnitId, UnitStatus};

/// Pure update function: applies a message to state and returns any effects.
///
/// Messages that do not fit the unit's current status are ignored and
/// produce no effects; this is what keeps completed and abandoned units from
/// being dispatched again.
pub fn update(mut state: HarvestState, msg: Msg) -> (HarvestState, Vec<Effect>) {
    let effects = match msg {
        Msg::Enumerate {
            unit_ids,
            resume,
            now,
        } => {
            if !resume {
                state.clear();
            }
            let mut seen = BTreeSet::new();
            let scope: Vec<UnitId> = unit_ids
                .into_iter()
                .filter(|id| seen.insert(id.clone()))
                .collect();

            let mut effects = Vec::with_capacity(scope.len() + 1);
            effects.push(Effect::Persist);
            for unit_id in &scope {
                let record = state.ensure(unit_id, now);
                if record.status == UnitStatus::Completed {
                    continue;
                }
                // Every invocation grants a fresh retry budget.
                record.status = UnitStatus::Pending;
                record.attempt_count = 0;
                record.updated_at = now;
                effects.push(Effect::Enqueue {
                    unit_id: unit_id.clone(),
                });
            }
            state.set_scope(scope);
            effects
        }
        Msg::Dispatched {
            unit_id,
            proxy,
            now,
        } => {
            let max_attempts = state.retry().max_attempts();
            match state.record_mut(&unit_id) {
                Some(record)
                    if record.status == UnitStatus::Pending
                        && record.attempt_count < max_attempts =>
                {
                    record.status = UnitStatus::InProgress;
                    record.attempt_count += 1;
                    record.last_proxy = Some(proxy.clone());
                    record.updated_at = now;
                    vec![Effect::Persist, Effect::Execute { unit_id, proxy }]
                }
                _ => Vec::new(),
            }
        }
        Msg::AttemptSucceeded {
            unit_id,
            summary,
            now,
        } => match state.record_mut(&unit_id) {
            Some(record) if record.status == UnitStatus::InProgress => {
                record.status = UnitStatus::Completed;
                record.result_summary = Some(summary);
                record.last_error = None;
                record.updated_at = now;
                vec![Effect::Persist]
            }
            _ => Vec::new(),
        },
        Msg::AttemptFailed {
            unit_id,
            failure,
            now,
        } => {
            let retry = state.retry().clone();
            match state.record_mut(&unit_id) {
                Some(record) if record.status == UnitStatus::InProgress => {
                    record.status = UnitStatus::Failed;
                    record.last_error = Some(failure.to_string());
                    record.updated_at = now;
                    let effect = if retry.should_retry(record) {
                        record.status = UnitStatus::Pending;
                        Effect::Retry {
                            unit_id,
                            delay: retry.next_delay(record.attempt_count),
                            avoid: record.last_proxy.clone(),
                        }
                    } else {
                        Effect::Abandon { unit_id }
                    };
                    vec![Effect::Persist, effect]
                }
                _ => Vec::new(),
            }
        }
        Msg::NoProxyAvailable { unit_id, now } => match state.record_mut(&unit_id) {
            Some(record) if record.status == UnitStatus::Pending => {
                record.status = UnitStatus::Failed;
                record.last_error =
                    Some(UnitFailure::new(FailureKind::NoProxyAvailable, "").to_string());
                record.updated_at = now;
                vec![Effect::Persist, Effect::Abandon { unit_id }]
            }
            _ => Vec::new(),
        },
    };

    (state, effects)
}
