//! Running estimates and the hour-of-week buckets they are kept in.
//!
//! A [`RunningEstimate`] is an online mean maintained with Welford's update,
//! so no sample history is ever buffered. [`Bucket`] identifies one of the
//! 7 × 24 hour-of-week partitions and [`BucketClock`] maps an observation
//! instant onto it in service-area local time.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, Offset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Number of hour-of-week buckets tracked per stop pair.
pub const BUCKETS_PER_WEEK: usize = 7 * 24;

/// Online mean and variance of a stream of journey-time samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningEstimate {
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from the mean (M2).
    #[serde(default)]
    pub m2: f64,
}

impl RunningEstimate {
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Mean of all samples seen so far, `None` when there is no evidence.
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 { None } else { Some(self.mean) }
    }

    /// Adds one sample with equal weight to every previous one.
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Adds one sample under `rule`.
    ///
    /// The exponential rule weights the new sample by `max(1/count, alpha)`,
    /// which is identical to [`push`](Self::push) until `1/count` drops
    /// below `alpha`.
    pub fn push_with(&mut self, value: f64, rule: UpdateRule) {
        let alpha = match rule {
            UpdateRule::Cumulative => return self.push(value),
            UpdateRule::Exponential { alpha } => alpha,
        };

        let previous_variance = self.variance();
        self.count += 1;
        let weight = (1.0 / self.count as f64).max(alpha).min(1.0);
        let delta = value - self.mean;
        self.mean += weight * delta;
        let variance = (1.0 - weight) * (previous_variance + weight * delta * delta);
        self.m2 = variance * self.count as f64;
    }

    /// Population variance of the samples.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn stddev(&self) -> f64 {
        self.variance().max(0.0).sqrt()
    }
}

/// How hourly buckets weight new samples against their history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateRule {
    /// Every sample counts equally, forever.
    #[default]
    Cumulative,
    /// Recent samples dominate once the bucket holds more than `1/alpha` samples.
    Exponential { alpha: f64 },
}

/// One hour-of-week partition: `day * 24 + hour`, day 0 being Monday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bucket(u8);

impl Bucket {
    /// Returns `None` unless `day < 7` and `hour < 24`.
    pub fn new(day: u8, hour: u8) -> Option<Self> {
        if day < 7 && hour < 24 {
            Some(Bucket(day * 24 + hour))
        } else {
            None
        }
    }

    /// Day of week, 0 = Monday … 6 = Sunday.
    pub fn day(self) -> u8 {
        self.0 / 24
    }

    pub fn hour(self) -> u8 {
        self.0 % 24
    }

    /// Day of week as published in output paths, 1 = Monday … 7 = Sunday.
    pub fn published_day(self) -> u8 {
        self.day() + 1
    }

    pub fn is_valid(self) -> bool {
        (self.0 as usize) < BUCKETS_PER_WEEK
    }

    /// All 168 buckets in week order.
    pub fn all() -> impl Iterator<Item = Bucket> {
        (0..BUCKETS_PER_WEEK as u8).map(Bucket)
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "D{}H{:02}", self.published_day(), self.hour())
    }
}

/// Maps instants onto buckets in the service area's local time.
///
/// Public holidays run Sunday timetables, so they land in Sunday's buckets.
#[derive(Debug, Clone)]
pub struct BucketClock {
    offset: FixedOffset,
    holidays: HashSet<NaiveDate>,
}

impl Default for BucketClock {
    fn default() -> Self {
        Self::utc()
    }
}

impl BucketClock {
    pub fn utc() -> Self {
        Self::new(Utc.fix(), [])
    }

    pub fn new(offset: FixedOffset, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            offset,
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn bucket_of(&self, at: DateTime<Utc>) -> Bucket {
        let local = at.with_timezone(&self.offset);
        let weekday = if self.holidays.contains(&local.date_naive()) {
            Weekday::Sun
        } else {
            local.weekday()
        };
        // Both components are range-checked by chrono.
        Bucket(weekday.num_days_from_monday() as u8 * 24 + local.hour() as u8)
    }
}
