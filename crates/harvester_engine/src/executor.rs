use harvester_core::AttemptOutcome;
use tokio::time::Instant;

use crate::{HarvestUnit, ProxyEndpoint};

/// Performs one attempt of one unit through one proxy.
///
/// Implementations report every problem through [`AttemptOutcome`]; the
/// orchestrator also enforces `deadline` on its own and treats a missed
/// deadline as a timeout.
#[async_trait::async_trait]
pub trait UnitExecutor: Send + Sync {
    async fn execute(
        &self,
        unit: &HarvestUnit,
        proxy: &ProxyEndpoint,
        deadline: Instant,
    ) -> AttemptOutcome;
}
