//! Per-cycle stop-pair index.
//!
//! Stops do not report on every poll, so "both stops reported" is judged
//! across a short [`PollWindow`]. The index is rebuilt every cycle because
//! trip-to-route assignments can change between polls.

use std::collections::{BTreeMap, HashSet, VecDeque};

use crate::topology::TopologySource;
use crate::types::{Prediction, Snapshot, StopPairKey};

/// The most recent polls of one feed, oldest first.
#[derive(Debug, Clone)]
pub struct PollWindow {
    capacity: usize,
    polls: VecDeque<Snapshot>,
}

impl PollWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            polls: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends the newest poll, evicting the oldest when full.
    pub fn push(&mut self, snapshot: Snapshot) {
        if self.polls.len() == self.capacity {
            self.polls.pop_front();
        }
        self.polls.push_back(snapshot);
    }

    /// The newest poll.
    pub fn current(&self) -> Option<&Snapshot> {
        self.polls.back()
    }

    pub fn len(&self) -> usize {
        self.polls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polls.is_empty()
    }

    /// Stops that reported `trip_id` in any poll of the window.
    fn reported_stops(&self, trip_id: &str) -> HashSet<&str> {
        self.polls
            .iter()
            .flat_map(|poll| poll.predictions.iter())
            .filter(|p| p.trip_id == trip_id)
            .map(|p| p.stop_id.as_str())
            .collect()
    }
}

/// Stop pairs one trip traverses in this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct TripPairs {
    pub trip_id: String,
    pub pairs: Vec<StopPairKey>,
    /// `true` when the order came from predicted arrivals rather than the schedule.
    pub inferred: bool,
}

/// Builds the stop pairs of every trip present in the window's newest poll.
///
/// With a scheduled sequence, a pair is two adjacent scheduled stops that
/// both reported within the window. Without one, the trip's current
/// predictions are ordered by arrival time and adjacent stops are paired.
/// Trips reporting a single stop yield no pairs and are omitted.
pub fn stop_pairs(window: &PollWindow, topology: &dyn TopologySource) -> Vec<TripPairs> {
    let Some(current) = window.current() else {
        return Vec::new();
    };

    let mut by_trip: BTreeMap<&str, Vec<&Prediction>> = BTreeMap::new();
    for p in &current.predictions {
        by_trip.entry(p.trip_id.as_str()).or_default().push(p);
    }

    by_trip
        .into_iter()
        .filter_map(|(trip_id, predictions)| {
            let (pairs, inferred) = match topology.stop_sequence(trip_id) {
                Some(sequence) => (scheduled_pairs(sequence, &window.reported_stops(trip_id)), false),
                None => (observed_pairs(predictions), true),
            };
            if pairs.is_empty() {
                None
            } else {
                Some(TripPairs {
                    trip_id: trip_id.to_string(),
                    pairs,
                    inferred,
                })
            }
        })
        .collect()
}

fn scheduled_pairs(sequence: &[String], reported: &HashSet<&str>) -> Vec<StopPairKey> {
    sequence
        .windows(2)
        .filter(|w| w[0] != w[1])
        .filter(|w| reported.contains(w[0].as_str()) && reported.contains(w[1].as_str()))
        .map(|w| StopPairKey::new(w[0].as_str(), w[1].as_str()))
        .collect()
}

fn observed_pairs(mut predictions: Vec<&Prediction>) -> Vec<StopPairKey> {
    predictions.sort_by(|a, b| {
        a.predicted_arrival
            .cmp(&b.predicted_arrival)
            .then_with(|| a.stop_id.cmp(&b.stop_id))
    });
    predictions
        .windows(2)
        .map(|w| StopPairKey::new(w[0].stop_id.as_str(), w[1].stop_id.as_str()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{EmptyTopology, StaticTopology};
    use chrono::{DateTime, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap()
    }

    fn snapshot(offset: i64, entries: &[(&str, &str, i64)]) -> Snapshot {
        Snapshot {
            observed_at: t0() + chrono::Duration::seconds(offset),
            predictions: entries
                .iter()
                .map(|(stop, trip, secs)| Prediction {
                    stop_id: stop.to_string(),
                    trip_id: trip.to_string(),
                    predicted_arrival: t0() + chrono::Duration::seconds(*secs),
                })
                .collect(),
            dropped: 0,
        }
    }

    #[test]
    fn test_scheduled_pairs_need_both_stops() {
        let topo = StaticTopology::new().with_trip("T1", ["A", "B", "C", "D"]);
        let mut window = PollWindow::new(1);
        window.push(snapshot(0, &[("A", "T1", 100), ("B", "T1", 250), ("D", "T1", 600)]));

        let pairs = stop_pairs(&window, &topo);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].pairs, vec![StopPairKey::new("A", "B")]);
        assert!(!pairs[0].inferred);
    }

    #[test]
    fn test_window_tolerates_missing_reports() {
        let topo = StaticTopology::new().with_trip("T1", ["A", "B", "C"]);
        let mut window = PollWindow::new(3);
        window.push(snapshot(0, &[("C", "T1", 400)]));
        window.push(snapshot(60, &[("A", "T1", 100), ("B", "T1", 250)]));

        let pairs = stop_pairs(&window, &topo);
        assert_eq!(
            pairs[0].pairs,
            vec![StopPairKey::new("A", "B"), StopPairKey::new("B", "C")]
        );
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut window = PollWindow::new(2);
        window.push(snapshot(0, &[]));
        window.push(snapshot(60, &[]));
        window.push(snapshot(120, &[]));

        assert_eq!(window.len(), 2);
        assert_eq!(window.current().unwrap().observed_at, t0() + chrono::Duration::seconds(120));
    }

    #[test]
    fn test_observed_order_fallback() {
        let mut window = PollWindow::new(1);
        window.push(snapshot(0, &[("C", "T9", 500), ("A", "T9", 100), ("B", "T9", 250)]));

        let pairs = stop_pairs(&window, &EmptyTopology);
        assert_eq!(
            pairs[0].pairs,
            vec![StopPairKey::new("A", "B"), StopPairKey::new("B", "C")]
        );
        assert!(pairs[0].inferred);
    }

    #[test]
    fn test_single_stop_trip_contributes_nothing() {
        let topo = StaticTopology::new().with_trip("T1", ["A", "B"]);
        let mut window = PollWindow::new(1);
        window.push(snapshot(0, &[("A", "T1", 100), ("Q", "T2", 100)]));

        assert!(stop_pairs(&window, &topo).is_empty());
        assert!(stop_pairs(&PollWindow::new(1), &topo).is_empty());
    }
}
