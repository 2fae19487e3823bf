use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ProxyId;

/// Key of one harvest unit, e.g. a country or brand.
pub type UnitId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// What a completed unit produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UnitSummary {
    pub items_collected: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit_id: UnitId,
    pub status: UnitStatus,
    pub attempt_count: u32,
    #[serde(default)]
    pub result_summary: Option<UnitSummary>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_proxy: Option<ProxyId>,
    pub updated_at: DateTime<Utc>,
}

impl UnitRecord {
    pub fn new(unit_id: impl Into<UnitId>, now: DateTime<Utc>) -> Self {
        Self {
            unit_id: unit_id.into(),
            status: UnitStatus::Pending,
            attempt_count: 0,
            result_summary: None,
            last_error: None,
            last_proxy: None,
            updated_at: now,
        }
    }

    /// An attempt that was cut short by a crash never finished: it goes back
    /// to `Pending`. Returns whether the record changed.
    pub fn recover_after_crash(&mut self) -> bool {
        if self.status == UnitStatus::InProgress {
            self.status = UnitStatus::Pending;
            true
        } else {
            false
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == UnitStatus::Completed
    }
}
