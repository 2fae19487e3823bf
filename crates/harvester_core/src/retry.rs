use std::time::Duration;

use crate::{UnitRecord, UnitStatus};

/// Retry budget and backoff for failed units.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub retry_budget: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 2,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(5 * 60),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn with_budget(retry_budget: u32) -> Self {
        Self {
            retry_budget,
            ..Self::default()
        }
    }

    /// Same budget, no waiting between attempts.
    pub fn immediate(retry_budget: u32) -> Self {
        Self {
            retry_budget,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_budget.saturating_add(1)
    }

    pub fn should_retry(&self, record: &UnitRecord) -> bool {
        record.status == UnitStatus::Failed && record.attempt_count < self.max_attempts()
    }

    /// Delay before the attempt following attempt number `attempt_count`.
    ///
    /// `base * multiplier^(attempt_count - 1)`, capped at `max_delay`. Never
    /// decreases as `attempt_count` grows.
    pub fn next_delay(&self, attempt_count: u32) -> Duration {
        let base = self.base_delay.min(self.max_delay);
        let exponent = attempt_count.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let secs = base.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs).max(base)
    }
}
