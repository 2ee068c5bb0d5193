//! Stop topology: which stops a trip serves, in which order, and where.
//!
//! [`TopologySource`] abstracts the static schedule. [`StaticTopology`] is
//! the in-memory implementation, loaded from a GTFS directory by
//! [`gtfs::load_dir`]. [`index`] turns a window of polls into the stop pairs
//! each trip traverses.

pub mod gtfs;
pub mod index;

use std::collections::HashMap;

pub use index::{PollWindow, TripPairs, stop_pairs};

/// Mean Earth radius in kilometres.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Scheduled stop order and stop coordinates.
pub trait TopologySource: Send + Sync {
    /// Stops of `trip_id` in scheduled order, `None` for unknown trips.
    fn stop_sequence(&self, trip_id: &str) -> Option<&[String]>;

    /// `(lat, lon)` of `stop_id` in degrees.
    fn stop_location(&self, stop_id: &str) -> Option<(f64, f64)>;

    /// Great-circle distance between two stops in kilometres.
    fn distance_km(&self, from: &str, to: &str) -> Option<f64> {
        let (lat1, lon1) = self.stop_location(from)?;
        let (lat2, lon2) = self.stop_location(to)?;
        Some(haversine_km(lat1, lon1, lat2, lon2))
    }
}

/// No schedule knowledge: every trip falls back to observed order.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyTopology;

impl TopologySource for EmptyTopology {
    fn stop_sequence(&self, _trip_id: &str) -> Option<&[String]> {
        None
    }

    fn stop_location(&self, _stop_id: &str) -> Option<(f64, f64)> {
        None
    }
}

/// In-memory topology keyed by trip and stop id.
#[derive(Debug, Default, Clone)]
pub struct StaticTopology {
    sequences: HashMap<String, Vec<String>>,
    locations: HashMap<String, (f64, f64)>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_trip<I, S>(mut self, trip_id: &str, stops: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sequences
            .insert(trip_id.to_string(), stops.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_stop(mut self, stop_id: &str, lat: f64, lon: f64) -> Self {
        self.locations.insert(stop_id.to_string(), (lat, lon));
        self
    }

    pub fn trip_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn stop_count(&self) -> usize {
        self.locations.len()
    }
}

impl TopologySource for StaticTopology {
    fn stop_sequence(&self, trip_id: &str) -> Option<&[String]> {
        self.sequences.get(trip_id).map(Vec::as_slice)
    }

    fn stop_location(&self, stop_id: &str) -> Option<(f64, f64)> {
        self.locations.get(stop_id).copied()
    }
}

/// Haversine distance in kilometres between two points given in degrees.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lat2) = (lat1.to_radians(), lat2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = (lon2 - lon1).to_radians();
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}
