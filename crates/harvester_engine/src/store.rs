use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use engine_logging::{engine_debug, engine_info, engine_warn};
use harvester_core::{ProxyRecord, UnitId, UnitRecord};
use serde::{Deserialize, Serialize};

use crate::persist::{read_json, AtomicFileWriter, PersistError};

pub const PROGRESS_FILENAME: &str = "harvest_progress.json";
pub const PROXY_STATS_FILENAME: &str = "proxy_stats.json";

#[derive(Debug, Deserialize)]
struct ProgressDocument {
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    units: BTreeMap<UnitId, UnitRecord>,
}

#[derive(Debug, Serialize)]
struct ProgressDocumentRef<'a> {
    last_updated: DateTime<Utc>,
    units: &'a BTreeMap<UnitId, UnitRecord>,
}

/// Durable record of every unit's status. The only authority on whether a
/// unit has been completed.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    writer: AtomicFileWriter,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            writer: AtomicFileWriter::new(dir.into()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.writer.dir().join(PROGRESS_FILENAME)
    }

    /// Reads every unit record. Units left `InProgress` by an interrupted run
    /// come back as `Pending`; the file itself is not touched.
    pub fn load(&self) -> Result<BTreeMap<UnitId, UnitRecord>, PersistError> {
        let Some(document) = self.read()? else {
            engine_debug!("No progress file at {:?}", self.path());
            return Ok(BTreeMap::new());
        };
        let mut units = document.units;
        let recovered = units
            .values_mut()
            .map(UnitRecord::recover_after_crash)
            .filter(|changed| *changed)
            .count();
        if recovered > 0 {
            engine_warn!(
                "Recovered {} unit(s) interrupted mid-attempt; they will be retried",
                recovered
            );
        }
        engine_info!("Loaded {} unit record(s) from {:?}", units.len(), self.path());
        Ok(units)
    }

    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>, PersistError> {
        Ok(self.read()?.and_then(|document| document.last_updated))
    }

    pub fn save(&self, units: &BTreeMap<UnitId, UnitRecord>) -> Result<(), PersistError> {
        let document = ProgressDocumentRef {
            last_updated: Utc::now(),
            units,
        };
        self.writer.write_json(PROGRESS_FILENAME, &document)?;
        Ok(())
    }

    /// Forgets all progress.
    pub fn reset(&self) -> Result<(), PersistError> {
        if self.writer.remove(PROGRESS_FILENAME)? {
            engine_info!("Progress reset: removed {:?}", self.path());
        }
        Ok(())
    }

    fn read(&self) -> Result<Option<ProgressDocument>, PersistError> {
        read_json(&self.path())
    }
}

#[derive(Debug, Deserialize)]
struct ProxyStatsDocument {
    #[serde(default)]
    proxies: Vec<ProxyRecord>,
}

#[derive(Debug, Serialize)]
struct ProxyStatsDocumentRef<'a> {
    last_updated: DateTime<Utc>,
    proxies: Vec<&'a ProxyRecord>,
}

/// Proxy performance history carried from one run to the next.
#[derive(Debug, Clone)]
pub struct ProxyStatsStore {
    writer: AtomicFileWriter,
}

impl ProxyStatsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            writer: AtomicFileWriter::new(dir.into()),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.writer.dir().join(PROXY_STATS_FILENAME)
    }

    pub fn load(&self) -> Result<Vec<ProxyRecord>, PersistError> {
        let path = self.path();
        Ok(read_json::<ProxyStatsDocument>(&path)?
            .map(|document| document.proxies)
            .unwrap_or_default())
    }

    /// Like [`ProxyStatsStore::load`], but a broken file only costs the history.
    pub fn load_or_default(&self) -> Vec<ProxyRecord> {
        self.load().unwrap_or_else(|err| {
            engine_warn!("Ignoring proxy statistics: {}", err);
            Vec::new()
        })
    }

    pub fn save<'a>(
        &self,
        records: impl IntoIterator<Item = &'a ProxyRecord>,
    ) -> Result<(), PersistError> {
        let document = ProxyStatsDocumentRef {
            last_updated: Utc::now(),
            proxies: records.into_iter().collect(),
        };
        self.writer.write_json(PROXY_STATS_FILENAME, &document)?;
        Ok(())
    }

    pub fn reset(&self) -> Result<(), PersistError> {
        if self.writer.remove(PROXY_STATS_FILENAME)? {
            engine_info!("Proxy statistics reset: removed {:?}", self.path());
        }
        Ok(())
    }
}

/// Both stores rooted in one state directory.
pub fn stores_in(dir: &Path) -> (ProgressStore, ProxyStatsStore) {
    (ProgressStore::new(dir), ProxyStatsStore::new(dir))
}
