use chrono::{DateTime, Utc};

use crate::{ProxyId, UnitFailure, UnitId, UnitSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Msg {
    /// The units of this invocation, after filtering. Without `resume` all
    /// previous progress is discarded first.
    Enumerate {
        unit_ids: Vec<UnitId>,
        resume: bool,
        now: DateTime<Utc>,
    },
    /// A worker picked up the unit and leased `proxy` for it.
    Dispatched {
        unit_id: UnitId,
        proxy: ProxyId,
        now: DateTime<Utc>,
    },
    /// The executor finished the unit.
    AttemptSucceeded {
        unit_id: UnitId,
        summary: UnitSummary,
        now: DateTime<Utc>,
    },
    /// The attempt failed, timed out or was blocked.
    AttemptFailed {
        unit_id: UnitId,
        failure: UnitFailure,
        now: DateTime<Utc>,
    },
    /// No proxy could be selected, so the unit was never dispatched.
    NoProxyAvailable {
        unit_id: UnitId,
        now: DateTime<Utc>,
    },
}
