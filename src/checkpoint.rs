//! Durable accumulator state.
//!
//! The whole state is rewritten on every checkpoint: serialized to a sibling
//! temp file, then renamed over the previous checkpoint, so a crash mid-write
//! leaves the old file intact. A mutex serializes concurrent savers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accumulator::{Accumulator, AccumulatorSnapshot, StopPairEstimate};
use crate::estimate::{Bucket, RunningEstimate};
use crate::types::StopPairKey;

const SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    schema_version: u8,
    saved_at: DateTime<Utc>,
    pairs: Vec<PairRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PairRecord {
    from: String,
    to: String,
    global: RunningEstimate,
    #[serde(default)]
    hourly: BTreeMap<Bucket, RunningEstimate>,
}

/// Reads and writes the checkpoint file at one path.
pub struct CheckpointStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last checkpoint. A missing file is an empty state; an
    /// unreadable one is an error so history is never silently discarded.
    pub fn load(&self) -> Result<AccumulatorSnapshot> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "No checkpoint found, starting empty");
                return Ok(AccumulatorSnapshot::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read checkpoint {}", self.path.display()));
            }
        };

        let file: CheckpointFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("Checkpoint {} is corrupt", self.path.display()))?;
        if file.schema_version != SCHEMA_VERSION {
            bail!(
                "Checkpoint {} has schema version {}, expected {}",
                self.path.display(),
                file.schema_version,
                SCHEMA_VERSION
            );
        }

        let mut snapshot = AccumulatorSnapshot::default();
        for record in file.pairs {
            let mut estimate = StopPairEstimate {
                global: record.global,
                hourly: record.hourly,
            };
            let before = estimate.hourly.len();
            estimate.hourly.retain(|bucket, _| bucket.is_valid());
            if estimate.hourly.len() != before {
                warn!(from = %record.from, to = %record.to, "Dropped out-of-range hourly buckets");
            }
            snapshot
                .entries
                .insert(StopPairKey::new(record.from, record.to), estimate);
        }

        info!(
            path = %self.path.display(),
            pairs = snapshot.len(),
            saved_at = %file.saved_at,
            "Checkpoint loaded"
        );
        Ok(snapshot)
    }

    /// Atomically replaces the checkpoint with `snapshot`.
    pub fn save(&self, snapshot: &AccumulatorSnapshot) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(snapshot)
    }

    /// Snapshots `accumulator` once the write lock is held, so a slow saver
    /// can never replace a newer checkpoint with older state.
    pub fn save_accumulator(&self, accumulator: &Accumulator) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.write(&accumulator.snapshot())
    }

    fn write(&self, snapshot: &AccumulatorSnapshot) -> Result<()> {
        let file = CheckpointFile {
            schema_version: SCHEMA_VERSION,
            saved_at: Utc::now(),
            pairs: snapshot
                .entries
                .iter()
                .map(|(key, estimate)| PairRecord {
                    from: key.from.clone(),
                    to: key.to.clone(),
                    global: estimate.global,
                    hourly: estimate.hourly.clone(),
                })
                .collect(),
        };
        let body = serde_json::to_vec(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        write_atomic(&self.path, &body)?;

        info!(path = %self.path.display(), pairs = snapshot.len(), bytes = body.len(), "Checkpoint saved");
        Ok(())
    }
}

/// Writes `body` to a temp sibling of `path`, then renames it into place.
pub fn write_atomic(path: &Path, body: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, body).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to rename into {}", path.display()))?;
    Ok(())
}
