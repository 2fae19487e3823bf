use std::time::Duration;

use crate::{ProxyId, UnitId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Unit records changed and must be written out before going on.
    Persist,
    /// Queue the unit for a worker.
    Enqueue { unit_id: UnitId },
    /// Run the executor for the unit through `proxy`.
    Execute { unit_id: UnitId, proxy: ProxyId },
    /// Dispatch the unit again after `delay`, preferably not through `avoid`.
    Retry {
        unit_id: UnitId,
        delay: Duration,
        avoid: Option<ProxyId>,
    },
    /// The unit stays failed for the rest of this invocation.
    Abandon { unit_id: UnitId },
}
