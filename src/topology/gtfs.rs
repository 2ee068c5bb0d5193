//! Loads a [`StaticTopology`] from a static GTFS directory.
//!
//! Only `stop_times.txt` (trip stop order) and `stops.txt` (coordinates) are
//! read; every other GTFS file is ignored.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::StaticTopology;

#[derive(Debug, Deserialize)]
struct StopTimeRow {
    trip_id: String,
    stop_id: String,
    stop_sequence: u32,
}

#[derive(Debug, Deserialize)]
struct StopRow {
    stop_id: String,
    stop_lat: Option<f64>,
    stop_lon: Option<f64>,
}

/// Reads `stop_times.txt` and `stops.txt` under `dir`.
///
/// `stops.txt` is optional; without it the outlier filter falls back to its
/// fixed ceiling.
pub fn load_dir(dir: &Path) -> Result<StaticTopology> {
    let stop_times_path = dir.join("stop_times.txt");
    let file = File::open(&stop_times_path)
        .with_context(|| format!("Failed to open {}", stop_times_path.display()))?;
    let sequences = read_stop_times(file)?;

    let stops_path = dir.join("stops.txt");
    let locations = if stops_path.exists() {
        let file = File::open(&stops_path)
            .with_context(|| format!("Failed to open {}", stops_path.display()))?;
        read_stops(file)?
    } else {
        warn!(path = %stops_path.display(), "stops.txt missing, distance bounds disabled");
        HashMap::new()
    };

    let mut topology = StaticTopology::new();
    for (trip_id, stops) in sequences {
        topology = topology.with_trip(&trip_id, stops);
    }
    for (stop_id, (lat, lon)) in locations {
        topology = topology.with_stop(&stop_id, lat, lon);
    }

    info!(
        trips = topology.trip_count(),
        stops = topology.stop_count(),
        "Static topology loaded"
    );
    Ok(topology)
}

/// Groups stop times by trip and orders each trip by `stop_sequence`.
fn read_stop_times<R: Read>(reader: R) -> Result<HashMap<String, Vec<String>>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut by_trip: HashMap<String, Vec<(u32, String)>> = HashMap::new();
    let mut skipped = 0usize;

    for result in rdr.deserialize::<StopTimeRow>() {
        match result {
            Ok(row) => by_trip
                .entry(row.trip_id)
                .or_default()
                .push((row.stop_sequence, row.stop_id)),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        warn!(skipped, "Skipped malformed stop_times rows");
    }

    Ok(by_trip
        .into_iter()
        .map(|(trip_id, mut stops)| {
            stops.sort_by_key(|(seq, _)| *seq);
            (trip_id, stops.into_iter().map(|(_, stop)| stop).collect())
        })
        .collect())
}

fn read_stops<R: Read>(reader: R) -> Result<HashMap<String, (f64, f64)>> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let mut locations = HashMap::new();

    for result in rdr.deserialize::<StopRow>() {
        let Ok(row) = result else { continue };
        if let (Some(lat), Some(lon)) = (row.stop_lat, row.stop_lon) {
            locations.insert(row.stop_id, (lat, lon));
        }
    }

    Ok(locations)
}
