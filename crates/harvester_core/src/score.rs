//! Proxy ranking.
//!
//! The weights are tunable; only the orderings they induce are relied upon.
use std::cmp::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ProxyRecord;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreWeights {
    /// Weight of `successes / max(1, attempts)`.
    pub success_ratio: f64,
    /// Weight of `1 / (1 + avg_ms / latency_scale_ms)`.
    pub latency: f64,
    /// Weight of `1 / (1 + idle / recency_scale)`, idle measured from the last success.
    pub recency: f64,
    /// Flat bonus for a proxy whose session already passed a challenge.
    pub cookie_bonus: f64,
    pub latency_scale_ms: f64,
    pub recency_scale: Duration,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            success_ratio: 0.6,
            latency: 0.2,
            recency: 0.2,
            cookie_bonus: 0.1,
            latency_scale_ms: 1000.0,
            recency_scale: Duration::from_secs(60 * 60),
        }
    }
}

/// Desirability of a proxy at `now`. Higher is better.
pub fn score(record: &ProxyRecord, weights: &ScoreWeights, now: DateTime<Utc>) -> f64 {
    let ratio = record.successes as f64 / record.attempts().max(1) as f64;

    let latency_scale = weights.latency_scale_ms.max(f64::EPSILON);
    let latency = 1.0 / (1.0 + record.avg_response_time_ms.max(0.0) / latency_scale);

    let recency = match record.last_success_at {
        Some(at) => {
            let idle_secs = (now - at).num_milliseconds().max(0) as f64 / 1000.0;
            let scale_secs = weights.recency_scale.as_secs_f64().max(f64::EPSILON);
            1.0 / (1.0 + idle_secs / scale_secs)
        }
        None => 0.0,
    };

    let bonus = if record.cookie_verified {
        weights.cookie_bonus
    } else {
        0.0
    };

    ratio * weights.success_ratio + latency * weights.latency + recency * weights.recency + bonus
}

/// Best-first total order over scored proxies: score, then fewer failures,
/// then identity.
pub fn rank(a: (&ProxyRecord, f64), b: (&ProxyRecord, f64)) -> Ordering {
    b.1.total_cmp(&a.1)
        .then_with(|| a.0.failures.cmp(&b.0.failures))
        .then_with(|| a.0.identity.cmp(&b.0.identity))
}
