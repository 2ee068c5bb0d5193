//! Data types shared across the estimation pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directed pair of stops served consecutively by one trip.
///
/// `(A, B)` and `(B, A)` are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StopPairKey {
    pub from: String,
    pub to: String,
}

impl StopPairKey {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl fmt::Display for StopPairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {}", self.from, self.to)
    }
}

/// One normalized ETA: `trip_id` is predicted to reach `stop_id` at `predicted_arrival`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub stop_id: String,
    pub trip_id: String,
    pub predicted_arrival: DateTime<Utc>,
}

/// Every prediction taken from one poll of one feed.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub observed_at: DateTime<Utc>,
    pub predictions: Vec<Prediction>,
    /// Entries dropped while normalizing (missing ids, unparsable times).
    pub dropped: usize,
}

/// A candidate journey time for one stop pair, derived from a single poll.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservationSample {
    pub key: StopPairKey,
    pub trip_id: String,
    pub observed_at: DateTime<Utc>,
    pub delta_seconds: f64,
}
