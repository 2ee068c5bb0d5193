//! Turns same-poll prediction pairs into journey-time samples.
//!
//! Both predictions are forward-looking from the same instant, so
//! `arrival(to) - arrival(from)` approximates the travel time between the two
//! stops without tracking the vehicle itself.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::topology::TripPairs;
use crate::types::{ObservationSample, Snapshot, StopPairKey};

/// Result of extracting one stop pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Sample(ObservationSample),
    /// One of the stops has no prediction for the trip in this poll.
    MissingPrediction,
    /// `to` is not predicted after `from`: the vehicle already passed a stop,
    /// the feed lags, or a trip id was reused.
    Inconsistent { delta_seconds: f64 },
}

/// Lookup of one poll's predictions by (trip, stop).
pub struct PollPredictions<'a> {
    observed_at: DateTime<Utc>,
    arrivals: HashMap<&'a str, HashMap<&'a str, DateTime<Utc>>>,
}

impl<'a> PollPredictions<'a> {
    pub fn new(snapshot: &'a Snapshot) -> Self {
        let mut arrivals: HashMap<&str, HashMap<&str, DateTime<Utc>>> = HashMap::new();
        for p in &snapshot.predictions {
            arrivals
                .entry(p.trip_id.as_str())
                .or_default()
                .insert(p.stop_id.as_str(), p.predicted_arrival);
        }
        Self {
            observed_at: snapshot.observed_at,
            arrivals,
        }
    }

    pub fn arrival(&self, trip_id: &str, stop_id: &str) -> Option<DateTime<Utc>> {
        self.arrivals.get(trip_id)?.get(stop_id).copied()
    }

    /// Derives the journey-time sample for `key` on `trip_id`.
    pub fn extract(&self, trip_id: &str, key: &StopPairKey) -> Extraction {
        let (Some(from), Some(to)) = (self.arrival(trip_id, &key.from), self.arrival(trip_id, &key.to))
        else {
            return Extraction::MissingPrediction;
        };

        let delta_seconds = (to - from).num_milliseconds() as f64 / 1000.0;
        if delta_seconds <= 0.0 {
            return Extraction::Inconsistent { delta_seconds };
        }

        Extraction::Sample(ObservationSample {
            key: key.clone(),
            trip_id: trip_id.to_string(),
            observed_at: self.observed_at,
            delta_seconds,
        })
    }

    /// Extracts every pair of one trip.
    pub fn extract_trip<'s>(&'s self, trip: &'s TripPairs) -> impl Iterator<Item = Extraction> + 's {
        trip.pairs.iter().map(move |key| self.extract(&trip.trip_id, key))
    }
}
