//! The long-lived, per-stop-pair journey-time state.
//!
//! Each stop pair owns one global [`RunningEstimate`] plus a sparse set of
//! hour-of-week buckets. Entries live behind their own mutex so concurrent
//! feeds only contend when they touch the same pair; the outer map lock is
//! taken for writing only when a never-seen pair is inserted.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::estimate::{Bucket, BucketClock, RunningEstimate, UpdateRule};
use crate::types::StopPairKey;

/// Global and hourly estimates for one stop pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StopPairEstimate {
    pub global: RunningEstimate,
    #[serde(default)]
    pub hourly: BTreeMap<Bucket, RunningEstimate>,
}

impl StopPairEstimate {
    /// Estimate for `bucket`, `None` when that bucket never received a sample.
    pub fn bucket(&self, bucket: Bucket) -> Option<&RunningEstimate> {
        self.hourly.get(&bucket).filter(|e| !e.is_empty())
    }

    /// Sum of sample counts across all hourly buckets.
    pub fn hourly_count(&self) -> u64 {
        self.hourly.values().map(|e| e.count).sum()
    }
}

/// Point-in-time copy of the accumulator, ordered by stop pair.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatorSnapshot {
    pub entries: BTreeMap<StopPairKey, StopPairEstimate>,
}

impl AccumulatorSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &StopPairKey) -> Option<&StopPairEstimate> {
        self.entries.get(key)
    }
}

type Entry = Arc<Mutex<StopPairEstimate>>;

/// Owns every [`StopPairEstimate`] for the lifetime of the process.
pub struct Accumulator {
    entries: RwLock<HashMap<StopPairKey, Entry>>,
    clock: BucketClock,
    hourly_rule: UpdateRule,
}

impl Accumulator {
    pub fn new(clock: BucketClock, hourly_rule: UpdateRule) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            hourly_rule,
        }
    }

    /// Rebuilds an accumulator from a previously taken snapshot.
    pub fn restore(snapshot: AccumulatorSnapshot, clock: BucketClock, hourly_rule: UpdateRule) -> Self {
        let entries = snapshot
            .entries
            .into_iter()
            .map(|(key, estimate)| (key, Arc::new(Mutex::new(estimate))))
            .collect();
        Self {
            entries: RwLock::new(entries),
            clock,
            hourly_rule,
        }
    }

    pub fn clock(&self) -> &BucketClock {
        &self.clock
    }

    /// Folds one accepted sample into the pair's global estimate and into the
    /// bucket of `observed_at`. Both updates happen under the pair's lock.
    ///
    /// Callers filter outliers first; a non-finite or non-positive delta is
    /// ignored here rather than corrupting the running mean.
    pub fn record_sample(&self, key: &StopPairKey, delta_seconds: f64, observed_at: DateTime<Utc>) {
        if !delta_seconds.is_finite() || delta_seconds <= 0.0 {
            warn!(pair = %key, delta_seconds, "Ignoring unfiltered sample");
            return;
        }

        let bucket = self.clock.bucket_of(observed_at);
        let entry = self.entry(key);
        let mut estimate = entry.lock().unwrap_or_else(PoisonError::into_inner);
        estimate.global.push(delta_seconds);
        estimate
            .hourly
            .entry(bucket)
            .or_default()
            .push_with(delta_seconds, self.hourly_rule);

        debug!(
            pair = %key,
            bucket = %bucket,
            delta_seconds,
            mean = estimate.global.mean,
            count = estimate.global.count,
            "Recorded sample"
        );
    }

    /// Copy of the pair's global estimate, if the pair has been seen.
    pub fn global_estimate(&self, key: &StopPairKey) -> Option<RunningEstimate> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|entry| entry.lock().unwrap_or_else(PoisonError::into_inner).global)
    }

    /// Copy of the pair's estimate for the bucket `at` falls in.
    pub fn bucket_estimate(&self, key: &StopPairKey, at: DateTime<Utc>) -> Option<RunningEstimate> {
        let bucket = self.clock.bucket_of(at);
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get(key)?;
        let estimate = entry.lock().unwrap_or_else(PoisonError::into_inner);
        estimate.bucket(bucket).copied()
    }

    /// Consistent copy of every pair. Each pair is copied under its own lock,
    /// so its global and hourly figures always come from the same update.
    pub fn snapshot(&self) -> AccumulatorSnapshot {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let entries = entries
            .iter()
            .map(|(key, entry)| {
                let estimate = entry.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (key.clone(), estimate)
            })
            .collect();
        AccumulatorSnapshot { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &StopPairKey) -> Entry {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(key.clone()).or_default())
    }
}

impl Default for Accumulator {
    fn default() -> Self {
        Self::new(BucketClock::utc(), UpdateRule::Cumulative)
    }
}
