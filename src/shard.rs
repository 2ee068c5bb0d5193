//! Projection of an accumulator snapshot into prefix-sharded JSON documents.
//!
//! Every stop pair is filed under the shard of its origin stop, so a client
//! fetches a single file per origin. Output is deterministic: origins,
//! destinations and shards are emitted in sorted order.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::accumulator::AccumulatorSnapshot;
use crate::estimate::{Bucket, RunningEstimate};

/// Name of the document holding every shard's entries.
pub const AGGREGATE_SHARD: &str = "all";

/// Shard of a stop id: its first two characters, or the whole id if shorter.
pub fn shard_key(stop_id: &str) -> &str {
    match stop_id.char_indices().nth(2) {
        Some((end, _)) => &stop_id[..end],
        None => stop_id,
    }
}

/// File stem for a shard, escaping every byte outside `[A-Za-z0-9_-]` as
/// `%XX` so no stop id can address a path outside the output directory.
pub fn file_stem(shard: &str) -> String {
    let mut stem = String::with_capacity(shard.len());
    for byte in shard.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}

/// One published journey-time estimate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeEntry {
    pub destination_stop_id: String,
    pub average_seconds: f64,
    pub sample_count: u64,
}

/// Origin stop id to its outbound estimates.
pub type TimesDocument = BTreeMap<String, Vec<TimeEntry>>;

/// Which estimate of each stop pair a document is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Hourly(Bucket),
}

impl Scope {
    /// Directory the scope's documents are published under.
    pub fn directory(self) -> String {
        match self {
            Scope::Global => "times".to_string(),
            Scope::Hourly(bucket) => format!("times_hourly/{}/{:02}", bucket.published_day(), bucket.hour()),
        }
    }
}

/// A rendered document and its path relative to the publish root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFile {
    pub path: String,
    pub body: Vec<u8>,
}

/// Groups the snapshot into per-shard documents plus the aggregate.
///
/// Pairs without evidence in `scope` are omitted; shards that would be empty
/// are not produced. The aggregate is always produced.
pub fn build_documents(snapshot: &AccumulatorSnapshot, scope: Scope) -> BTreeMap<String, TimesDocument> {
    let mut documents: BTreeMap<String, TimesDocument> = BTreeMap::new();
    let mut all = TimesDocument::new();

    for (key, estimate) in &snapshot.entries {
        let running: Option<&RunningEstimate> = match scope {
            Scope::Global => Some(&estimate.global),
            Scope::Hourly(bucket) => estimate.bucket(bucket),
        };
        let Some(running) = running.filter(|r| !r.is_empty()) else {
            continue;
        };

        let entry = TimeEntry {
            destination_stop_id: key.to.clone(),
            average_seconds: running.mean,
            sample_count: running.count,
        };
        // Snapshot entries are sorted by (from, to), so each list stays sorted.
        documents
            .entry(shard_key(&key.from).to_string())
            .or_default()
            .entry(key.from.clone())
            .or_default()
            .push(entry.clone());
        all.entry(key.from.clone()).or_default().push(entry);
    }

    documents.insert(AGGREGATE_SHARD.to_string(), all);
    documents
}

/// Renders every document of `scope` to JSON bytes with its publish path.
pub fn render(snapshot: &AccumulatorSnapshot, scope: Scope) -> Result<Vec<ShardFile>> {
    let dir = scope.directory();
    build_documents(snapshot, scope)
        .into_iter()
        .map(|(shard, document)| {
            let stem = if shard == AGGREGATE_SHARD {
                shard
            } else {
                file_stem(&shard)
            };
            Ok(ShardFile {
                path: format!("{dir}/{stem}.json"),
                body: serde_json::to_vec(&document)?,
            })
        })
        .collect()
}
