//! One feed poll through the estimation pipeline.
//!
//! Normalized snapshot → stop-pair index → delta extraction → outlier filter
//! → accumulator. Every stage is counted in [`CycleStats`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::accumulator::Accumulator;
use crate::extract::{Extraction, PollPredictions};
use crate::filter::{OutlierFilter, Verdict};
use crate::topology::{PollWindow, TopologySource, stop_pairs};
use crate::types::Snapshot;

/// Telemetry for one poll of one feed.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CycleStats {
    pub timestamp: DateTime<Utc>,
    pub feed_id: Option<String>,

    pub predictions: usize,
    pub dropped_entries: usize,
    pub trips: usize,
    pub inferred_trips: usize,
    pub pairs: usize,

    // extraction
    pub missing: usize,
    pub inconsistent: usize,
    /// Samples raised to the feed's floor.
    pub floored: usize,

    // filtering
    pub below_minimum: usize,
    pub above_ceiling: usize,
    pub deviant: usize,
    pub accepted: usize,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl CycleStats {
    /// A record for a poll that produced no snapshot.
    pub fn from_error(error_type: &str, error_message: &str) -> Self {
        CycleStats {
            timestamp: Utc::now(),
            error_type: Some(error_type.to_string()),
            error_message: Some(error_message.to_string()),
            ..Default::default()
        }
    }

    pub fn with_feed(mut self, feed_id: &str) -> Self {
        self.feed_id = Some(feed_id.to_string());
        self
    }

    pub fn rejected(&self) -> usize {
        self.below_minimum + self.above_ceiling + self.deviant
    }

    /// Folds another feed's stats into a cycle total.
    pub fn absorb(&mut self, other: &CycleStats) {
        self.predictions += other.predictions;
        self.dropped_entries += other.dropped_entries;
        self.trips += other.trips;
        self.inferred_trips += other.inferred_trips;
        self.pairs += other.pairs;
        self.missing += other.missing;
        self.inconsistent += other.inconsistent;
        self.floored += other.floored;
        self.below_minimum += other.below_minimum;
        self.above_ceiling += other.above_ceiling;
        self.deviant += other.deviant;
        self.accepted += other.accepted;
    }
}

/// Pushes `snapshot` into the feed's window and records every accepted
/// sample of its newest poll.
///
/// `floor_seconds` raises every extracted sample of the feed to at least
/// that value before filtering.
pub fn process_snapshot(
    window: &mut PollWindow,
    snapshot: Snapshot,
    topology: &dyn TopologySource,
    filter: &OutlierFilter,
    accumulator: &Accumulator,
    floor_seconds: Option<f64>,
) -> CycleStats {
    let mut stats = CycleStats {
        timestamp: snapshot.observed_at,
        predictions: snapshot.predictions.len(),
        dropped_entries: snapshot.dropped,
        ..Default::default()
    };

    window.push(snapshot);
    let Some(current) = window.current() else {
        return stats;
    };

    let trips = stop_pairs(window, topology);
    let poll = PollPredictions::new(current);

    for trip in &trips {
        stats.trips += 1;
        if trip.inferred {
            stats.inferred_trips += 1;
        }
        stats.pairs += trip.pairs.len();

        for extraction in poll.extract_trip(trip) {
            let mut sample = match extraction {
                Extraction::Sample(sample) => sample,
                Extraction::MissingPrediction => {
                    stats.missing += 1;
                    continue;
                }
                Extraction::Inconsistent { delta_seconds } => {
                    debug!(trip_id = %trip.trip_id, delta_seconds, "Inconsistent prediction pair");
                    stats.inconsistent += 1;
                    continue;
                }
            };

            if let Some(floor) = floor_seconds.filter(|floor| sample.delta_seconds < *floor) {
                sample.delta_seconds = floor;
                stats.floored += 1;
            }

            let max_plausible = filter.max_plausible(&sample.key, topology);
            let bucket_estimate = accumulator.bucket_estimate(&sample.key, sample.observed_at);
            match filter.check(&sample.key, sample.delta_seconds, max_plausible, bucket_estimate.as_ref()) {
                Verdict::Accept => {
                    accumulator.record_sample(&sample.key, sample.delta_seconds, sample.observed_at);
                    stats.accepted += 1;
                }
                verdict => {
                    debug!(
                        pair = %sample.key,
                        trip_id = %sample.trip_id,
                        delta_seconds = sample.delta_seconds,
                        max_plausible,
                        ?verdict,
                        "Sample rejected"
                    );
                    match verdict {
                        Verdict::BelowMinimum => stats.below_minimum += 1,
                        Verdict::AboveCeiling => stats.above_ceiling += 1,
                        _ => stats.deviant += 1,
                    }
                }
            }
        }
    }

    info!(
        predictions = stats.predictions,
        trips = stats.trips,
        pairs = stats.pairs,
        accepted = stats.accepted,
        rejected = stats.rejected(),
        inconsistent = stats.inconsistent,
        missing = stats.missing,
        "Snapshot processed"
    );
    stats
}
