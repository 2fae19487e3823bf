use harvester_core::UnitId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persist::PersistError;

/// One configured harvest unit, e.g. a country storefront or a brand page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestUnit {
    pub id: UnitId,
    /// Entry URL handed to the executor.
    pub target: String,
    #[serde(default)]
    pub label: Option<String>,
}

impl HarvestUnit {
    pub fn new(id: impl Into<UnitId>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            label: None,
        }
    }

    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.id)
    }
}

/// Errors that end a run. Per-unit failures never show up here.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("progress could not be persisted: {0}")]
    Persistence(#[from] PersistError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("worker task failed: {0}")]
    Worker(String),
}
