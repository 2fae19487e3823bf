//! Harvester engine: persistence, proxy endpoints and the worker pool that
//! carries out the effects decided by `harvester_core`.
mod executor;
mod fetch;
mod orchestrator;
mod persist;
mod proxy_list;
mod store;
mod types;

pub use executor::UnitExecutor;
pub use fetch::{FetchSettings, ReqwestExecutor};
pub use orchestrator::{Orchestrator, StatusReport};
pub use persist::{ensure_state_dir, read_json, AtomicFileWriter, PersistError};
pub use proxy_list::{load_proxy_list, parse_proxy_list, ProxyEndpoint, ProxyListError};
pub use store::{
    stores_in, ProgressStore, ProxyStatsStore, PROGRESS_FILENAME, PROXY_STATS_FILENAME,
};
pub use types::{HarvestError, HarvestUnit};
