use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable key of one network egress credential, e.g. `10.0.0.1:8080`.
pub type ProxyId = String;

/// Rolling performance history of one proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub identity: ProxyId,
    pub successes: u64,
    pub failures: u64,
    pub avg_response_time_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cookie_verified: bool,
    pub blacklisted_until: Option<DateTime<Utc>>,
}

impl ProxyRecord {
    pub fn new(identity: impl Into<ProxyId>) -> Self {
        Self {
            identity: identity.into(),
            successes: 0,
            failures: 0,
            avg_response_time_ms: 0.0,
            last_success_at: None,
            last_used_at: None,
            cookie_verified: false,
            blacklisted_until: None,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    /// Folds one observation into the record.
    pub fn observe(
        &mut self,
        succeeded: bool,
        response_time_ms: u64,
        cookie_verified: bool,
        now: DateTime<Utc>,
    ) {
        if succeeded {
            self.successes += 1;
            self.last_success_at = Some(now);
            self.cookie_verified |= cookie_verified;
        } else {
            self.failures += 1;
        }
        // Simple running mean over every observation, including failures.
        let n = self.attempts() as f64;
        let sample = response_time_ms as f64;
        self.avg_response_time_ms += (sample - self.avg_response_time_ms) / n;
        if !self.avg_response_time_ms.is_finite() || self.avg_response_time_ms < 0.0 {
            self.avg_response_time_ms = 0.0;
        }
        self.last_used_at = Some(now);
    }

    /// A past `blacklisted_until` no longer blocks the proxy; nothing clears it.
    pub fn is_blacklisted(&self, now: DateTime<Utc>) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }
}
