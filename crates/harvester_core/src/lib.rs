//! Harvester core: unit state machine, retry policy and proxy scoring.
//!
//! Everything here is synchronous and free of IO; time is always passed in.
mod effect;
mod msg;
mod outcome;
mod pool;
mod proxy;
mod report;
mod retry;
mod run;
pub mod score;
mod state;
mod unit;
mod update;

pub use effect::Effect;
pub use msg::Msg;
pub use outcome::{AttemptOutcome, FailureKind, UnitFailure};
pub use pool::{ProxyPick, ProxyPool};
pub use proxy::{ProxyId, ProxyRecord};
pub use report::{FailedUnit, RunPlan, RunReport};
pub use retry::RetryPolicy;
pub use run::HarvestRun;
pub use score::{score, ScoreWeights};
pub use state::HarvestState;
pub use unit::{UnitId, UnitRecord, UnitStatus, UnitSummary};
pub use update::update;
