//! Normalizes one poll's raw payload into a [`Snapshot`] of predictions.
//!
//! Bad entries are dropped one at a time; only an undecodable payload fails
//! the poll.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gtfs_rt::FeedMessage;
use crate::gtfs_rt::trip_update::stop_time_update::ScheduleRelationship;
use crate::parser::{EtaDocument, parse_datetime, parse_eta_json, parse_feed};
use crate::types::{Prediction, Snapshot};

/// Wire format of a configured feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeedFormat {
    #[default]
    GtfsRt,
    EtaJson,
}

/// Decodes `bytes` in `format` and normalizes it.
///
/// `server_time` is the observation instant when the payload carries none.
pub fn decode(format: FeedFormat, bytes: &[u8], server_time: DateTime<Utc>) -> Result<Snapshot> {
    match format {
        FeedFormat::GtfsRt => Ok(from_trip_updates(&parse_feed(bytes)?, server_time)),
        FeedFormat::EtaJson => Ok(from_eta_document(&parse_eta_json(bytes)?, server_time)),
    }
}

/// Decodes a saved payload file.
///
/// The file's modification time stands in for the server time, so a replayed
/// poll without its own timestamp lands in the bucket it was captured in.
pub fn decode_file(format: FeedFormat, path: &Path) -> Result<Snapshot> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let captured_at = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .with_context(|| format!("Failed to read modification time of {}", path.display()))?;
    decode(format, &bytes, captured_at)
}

/// Normalizes the trip updates of a GTFS-RT feed.
pub fn from_trip_updates(feed: &FeedMessage, server_time: DateTime<Utc>) -> Snapshot {
    let observed_at = feed
        .header
        .timestamp
        .and_then(|ts| DateTime::from_timestamp(ts as i64, 0))
        .unwrap_or(server_time);

    let mut builder = SnapshotBuilder::new(observed_at);

    for entity in &feed.entity {
        if entity.is_deleted == Some(true) {
            continue;
        }
        let Some(update) = &entity.trip_update else {
            continue;
        };
        let trip_id = update.trip.trip_id.as_deref().unwrap_or_default();

        for stu in &update.stop_time_update {
            if matches!(
                stu.schedule_relationship(),
                ScheduleRelationship::Skipped | ScheduleRelationship::NoData
            ) {
                builder.drop_entry();
                continue;
            }
            let time = stu
                .arrival
                .as_ref()
                .and_then(|e| e.time)
                .or_else(|| stu.departure.as_ref().and_then(|e| e.time))
                .and_then(|t| DateTime::from_timestamp(t, 0));

            builder.push(stu.stop_id.as_deref(), Some(trip_id), time);
        }
    }

    builder.finish()
}

/// Normalizes a JSON ETA document (`{"stop", "trip", "eta"}` entries).
pub fn from_eta_document(doc: &EtaDocument, server_time: DateTime<Utc>) -> Snapshot {
    let observed_at = doc
        .generated_timestamp
        .as_deref()
        .and_then(parse_datetime)
        .unwrap_or(server_time);

    let mut builder = SnapshotBuilder::new(observed_at);

    for entry in &doc.data {
        let time = entry["eta"].as_str().and_then(parse_datetime);
        builder.push(entry["stop"].as_str(), entry["trip"].as_str(), time);
    }

    builder.finish()
}

/// Collects predictions, keeping the earliest one per (trip, stop).
struct SnapshotBuilder {
    observed_at: DateTime<Utc>,
    by_trip_stop: HashMap<(String, String), DateTime<Utc>>,
    order: Vec<(String, String)>,
    dropped: usize,
}

impl SnapshotBuilder {
    fn new(observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_at,
            by_trip_stop: HashMap::new(),
            order: Vec::new(),
            dropped: 0,
        }
    }

    fn drop_entry(&mut self) {
        self.dropped += 1;
    }

    fn push(&mut self, stop_id: Option<&str>, trip_id: Option<&str>, time: Option<DateTime<Utc>>) {
        let (Some(stop_id), Some(trip_id), Some(time)) = (stop_id, trip_id, time) else {
            self.dropped += 1;
            return;
        };
        if stop_id.is_empty() || trip_id.is_empty() {
            self.dropped += 1;
            return;
        }

        let key = (trip_id.to_string(), stop_id.to_string());
        match self.by_trip_stop.get_mut(&key) {
            Some(existing) => {
                if time < *existing {
                    *existing = time;
                }
            }
            None => {
                self.by_trip_stop.insert(key.clone(), time);
                self.order.push(key);
            }
        }
    }

    fn finish(mut self) -> Snapshot {
        let predictions: Vec<Prediction> = self
            .order
            .drain(..)
            .filter_map(|key| {
                let time = *self.by_trip_stop.get(&key)?;
                let (trip_id, stop_id) = key;
                Some(Prediction {
                    stop_id,
                    trip_id,
                    predicted_arrival: time,
                })
            })
            .collect();

        debug!(
            predictions = predictions.len(),
            dropped = self.dropped,
            observed_at = %self.observed_at,
            "Snapshot normalized"
        );

        Snapshot {
            observed_at: self.observed_at,
            predictions,
            dropped: self.dropped,
        }
    }
}
