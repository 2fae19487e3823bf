use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use harvester_core::{HarvestRun, RetryPolicy, ScoreWeights, UnitId};
use harvester_engine::{FetchSettings, HarvestUnit};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Contents of the RON run configuration. Every field has a default, so an
/// empty `()` file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarvestConfig {
    pub state_dir: PathBuf,
    pub proxy_file: Option<PathBuf>,
    /// Proxies listed inline, in addition to the proxy file.
    pub proxies: Vec<String>,
    pub concurrency: usize,
    pub retry_budget: u32,
    pub per_unit_timeout_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_multiplier: f64,
    pub dead_proxy_cooldown_secs: u64,
    pub exclusive_proxies: bool,
    pub resume: bool,
    pub log_level: String,
    /// Restricts the run to these unit ids; empty runs every unit.
    pub only: Vec<UnitId>,
    pub fetch: FetchConfig,
    pub units: Vec<HarvestUnit>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let run = HarvestRun::default();
        Self {
            state_dir: PathBuf::from("."),
            proxy_file: Some(PathBuf::from("proxies.txt")),
            proxies: Vec::new(),
            concurrency: run.concurrency,
            retry_budget: run.retry.retry_budget,
            per_unit_timeout_secs: run.per_unit_timeout.as_secs(),
            backoff_base_secs: run.retry.base_delay.as_secs(),
            backoff_max_secs: run.retry.max_delay.as_secs(),
            backoff_multiplier: run.retry.multiplier,
            dead_proxy_cooldown_secs: run.dead_proxy_cooldown.as_secs(),
            exclusive_proxies: run.exclusive_proxies,
            resume: run.resume,
            log_level: "info".to_string(),
            only: Vec::new(),
            fetch: FetchConfig::default(),
            units: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchConfig {
    pub connect_timeout_secs: u64,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    pub block_statuses: Vec<u16>,
    pub block_markers: Vec<String>,
    pub item_marker: Option<String>,
    pub verified_cookie: Option<String>,
    pub user_agent: Option<String>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        let settings = FetchSettings::default();
        Self {
            connect_timeout_secs: settings.connect_timeout.as_secs(),
            redirect_limit: settings.redirect_limit,
            max_bytes: settings.max_bytes,
            block_statuses: settings.block_statuses,
            block_markers: settings.block_markers,
            item_marker: settings.item_marker,
            verified_cookie: settings.verified_cookie,
            user_agent: settings.user_agent,
        }
    }
}

impl FetchConfig {
    pub fn settings(&self) -> FetchSettings {
        FetchSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            redirect_limit: self.redirect_limit,
            max_bytes: self.max_bytes,
            block_statuses: self.block_statuses.clone(),
            block_markers: self.block_markers.clone(),
            item_marker: self.item_marker.clone(),
            verified_cookie: self.verified_cookie.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

impl HarvestConfig {
    /// Reads `path`, or returns the defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, ron::error::SpannedError> {
        ron::from_str(text)
    }

    /// Validates the numbers and builds the parameters of one invocation.
    pub fn harvest_run(&self) -> Result<HarvestRun, ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.per_unit_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "per_unit_timeout_secs must be at least 1".into(),
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "backoff_multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(ConfigError::Invalid(
                "backoff_max_secs is below backoff_base_secs".into(),
            ));
        }

        Ok(HarvestRun {
            concurrency: self.concurrency,
            per_unit_timeout: Duration::from_secs(self.per_unit_timeout_secs),
            retry: RetryPolicy {
                retry_budget: self.retry_budget,
                base_delay: Duration::from_secs(self.backoff_base_secs),
                max_delay: Duration::from_secs(self.backoff_max_secs),
                multiplier: self.backoff_multiplier,
            },
            resume: self.resume,
            unit_filter: self.only.iter().cloned().collect::<BTreeSet<_>>(),
            dead_proxy_cooldown: Duration::from_secs(self.dead_proxy_cooldown_secs),
            exclusive_proxies: self.exclusive_proxies,
            weights: ScoreWeights::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = HarvestConfig::parse("()").unwrap();
        assert_eq!(config, HarvestConfig::default());
        let run = config.harvest_run().unwrap();
        assert_eq!(run, HarvestRun::default());
    }

    #[test]
    fn units_and_overrides_are_read() {
        let config = HarvestConfig::parse(
            r#"(
                state_dir: "state",
                concurrency: 5,
                retry_budget: 1,
                fetch: (item_marker: Some("data-asin="), verified_cookie: Some("session-id")),
                units: [
                    (id: "uk", target: "https://shop.example/uk"),
                    (id: "se", target: "https://shop.example/se", label: Some("Sweden")),
                ],
            )"#,
        )
        .unwrap();

        assert_eq!(config.state_dir, PathBuf::from("state"));
        assert_eq!(config.units.len(), 2);
        assert_eq!(config.units[1].display_name(), "Sweden");
        assert_eq!(config.fetch.settings().item_marker.as_deref(), Some("data-asin="));
        assert_eq!(
            config.fetch.settings().verified_cookie.as_deref(),
            Some("session-id")
        );
        assert_eq!(config.fetch.block_statuses, vec![403, 429, 503]);

        let run = config.harvest_run().unwrap();
        assert_eq!(run.concurrency, 5);
        assert_eq!(run.retry.max_attempts(), 2);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let config = HarvestConfig {
            concurrency: 0,
            ..HarvestConfig::default()
        };
        assert!(matches!(config.harvest_run(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn unknown_fields_are_a_parse_error() {
        assert!(HarvestConfig::parse("(concurency: 2)").is_err());
    }

    #[test]
    fn load_reads_the_file_and_names_it_in_errors() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("harvest.ron");
        fs::write(&path, "(concurrency: 2)").unwrap();
        assert_eq!(HarvestConfig::load(Some(path.as_path())).unwrap().concurrency, 2);

        let missing = temp.path().join("missing.ron");
        let err = HarvestConfig::load(Some(missing.as_path())).unwrap_err();
        assert!(matches!(err, ConfigError::Read { ref path, .. } if *path == missing));

        assert_eq!(HarvestConfig::load(None).unwrap(), HarvestConfig::default());
    }
}
