use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::score::{rank, score, ScoreWeights};
use crate::{ProxyId, ProxyRecord};

/// Result of asking the pool for a proxy to lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPick {
    Picked(ProxyId),
    /// Eligible proxies exist but every one of them is leased right now.
    Busy,
    /// Nothing is eligible: every proxy is blacklisted (or the pool is empty).
    Exhausted,
}

/// Performance records for every known proxy plus the set currently leased
/// to a unit.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    records: BTreeMap<ProxyId, ProxyRecord>,
    leased: BTreeSet<ProxyId>,
    weights: ScoreWeights,
}

impl ProxyPool {
    pub fn new(weights: ScoreWeights) -> Self {
        Self {
            records: BTreeMap::new(),
            leased: BTreeSet::new(),
            weights,
        }
    }

    /// Builds a pool for `identities`, carrying over any history found in
    /// `history`. History for identities no longer listed is dropped.
    pub fn restore<I, H>(identities: I, history: H, weights: ScoreWeights) -> Self
    where
        I: IntoIterator<Item = ProxyId>,
        H: IntoIterator<Item = ProxyRecord>,
    {
        let mut known: BTreeMap<ProxyId, ProxyRecord> = history
            .into_iter()
            .map(|record| (record.identity.clone(), record))
            .collect();
        let mut pool = Self::new(weights);
        for identity in identities {
            let record = known
                .remove(&identity)
                .unwrap_or_else(|| ProxyRecord::new(identity.clone()));
            pool.records.insert(identity, record);
        }
        pool
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&ProxyRecord> {
        self.records.get(identity)
    }

    pub fn records(&self) -> impl Iterator<Item = &ProxyRecord> {
        self.records.values()
    }

    pub fn score_of(&self, identity: &str, now: DateTime<Utc>) -> Option<f64> {
        self.get(identity)
            .map(|record| score(record, &self.weights, now))
    }

    /// Applies the outcome of one attempt. Unknown identities are created first.
    pub fn record_outcome(
        &mut self,
        identity: &str,
        succeeded: bool,
        response_time_ms: u64,
        cookie_verified: bool,
        now: DateTime<Utc>,
    ) {
        self.entry(identity)
            .observe(succeeded, response_time_ms, cookie_verified, now);
    }

    /// Marks the proxy as used without judging it.
    pub fn touch(&mut self, identity: &str, now: DateTime<Utc>) {
        self.entry(identity).last_used_at = Some(now);
    }

    /// Takes a dead proxy out of rotation until `now + duration`.
    pub fn blacklist(&mut self, identity: &str, duration: Duration, now: DateTime<Utc>) {
        let until = TimeDelta::from_std(duration)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.entry(identity).blacklisted_until = Some(until);
    }

    pub fn is_eligible(&self, identity: &str, now: DateTime<Utc>) -> bool {
        self.records
            .get(identity)
            .is_some_and(|record| !record.is_blacklisted(now))
    }

    /// Highest ranked proxy that is neither blacklisted nor excluded.
    /// Leases are not considered.
    pub fn select(&self, excluded: &BTreeSet<ProxyId>, now: DateTime<Utc>) -> Option<ProxyId> {
        self.best(now, |record| !excluded.contains(&record.identity))
    }

    /// Leases a proxy for one attempt.
    ///
    /// `excluded` is a preference: when it rules out every eligible proxy it
    /// is ignored. With `exclusive` set, proxies already leased are skipped and
    /// `Busy` is returned when that leaves nothing.
    pub fn acquire(
        &mut self,
        excluded: &BTreeSet<ProxyId>,
        exclusive: bool,
        now: DateTime<Utc>,
    ) -> ProxyPick {
        let any_eligible = self.records.values().any(|r| !r.is_blacklisted(now));
        if !any_eligible {
            return ProxyPick::Exhausted;
        }
        let honours_exclusion = self
            .records
            .values()
            .any(|r| !r.is_blacklisted(now) && !excluded.contains(&r.identity));

        let leased = &self.leased;
        let picked = self.best(now, |record| {
            (!honours_exclusion || !excluded.contains(&record.identity))
                && (!exclusive || !leased.contains(&record.identity))
        });

        match picked {
            Some(identity) => {
                self.leased.insert(identity.clone());
                ProxyPick::Picked(identity)
            }
            None => ProxyPick::Busy,
        }
    }

    /// Returns a leased proxy to the pool.
    pub fn release(&mut self, identity: &str) -> bool {
        self.leased.remove(identity)
    }

    fn best<F>(&self, now: DateTime<Utc>, admit: F) -> Option<ProxyId>
    where
        F: Fn(&ProxyRecord) -> bool,
    {
        self.records
            .values()
            .filter(|record| !record.is_blacklisted(now) && admit(record))
            .map(|record| (record, score(record, &self.weights, now)))
            .min_by(|a, b| rank(*a, *b))
            .map(|(record, _)| record.identity.clone())
    }

    fn entry(&mut self, identity: &str) -> &mut ProxyRecord {
        self.records
            .entry(identity.to_string())
            .or_insert_with(|| ProxyRecord::new(identity))
    }
}
