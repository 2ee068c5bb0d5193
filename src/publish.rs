//! Publication of rendered shard files to a directory or an S3 bucket.
//!
//! A failed file is logged and counted; the rest of the run continues and
//! the next scheduled publish rewrites everything from current state.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{error, info};

use crate::accumulator::AccumulatorSnapshot;
use crate::checkpoint::write_atomic;
use crate::estimate::{Bucket, BucketClock};
use crate::shard::{Scope, ShardFile, render};

/// Destination for published documents.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Stores `body` at `path`, relative to the publication root.
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()>;
}

/// Writes documents under a local directory, one atomic rename per file.
pub struct DirPublisher {
    root: PathBuf,
}

impl DirPublisher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Publisher for DirPublisher {
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let target = self.root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        write_atomic(&target, &body)
    }
}

/// Uploads documents to an S3 bucket with `application/json` content type,
/// optionally gzip-compressed.
pub struct S3Publisher {
    client: aws_sdk_s3::Client,
    bucket: String,
    gzip: bool,
}

impl S3Publisher {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>, gzip: bool) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            gzip,
        }
    }
}

#[async_trait]
impl Publisher for S3Publisher {
    async fn put(&self, path: &str, body: Vec<u8>) -> Result<()> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .content_type("application/json");

        let request = if self.gzip {
            request
                .content_encoding("gzip")
                .body(ByteStream::from(gzip(&body)?))
        } else {
            request.body(ByteStream::from(body))
        };

        request
            .send()
            .await
            .with_context(|| format!("S3 put failed for s3://{}/{}", self.bucket, path))?;
        Ok(())
    }
}

fn gzip(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

/// Files written and failed in one publish run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub written: usize,
    pub failed: usize,
}

impl PublishReport {
    fn absorb(&mut self, other: PublishReport) {
        self.written += other.written;
        self.failed += other.failed;
    }
}

/// Publishes the global documents and those of the bucket elapsing at `now`.
#[tracing::instrument(skip_all, fields(pairs = snapshot.len(), now = %now))]
pub async fn publish_current(
    snapshot: &AccumulatorSnapshot,
    clock: &BucketClock,
    now: DateTime<Utc>,
    publisher: &dyn Publisher,
) -> Result<PublishReport> {
    let bucket = clock.bucket_of(now);
    let mut report = publish_scope(snapshot, Scope::Global, publisher).await?;
    report.absorb(publish_scope(snapshot, Scope::Hourly(bucket), publisher).await?);

    info!(bucket = %bucket, written = report.written, failed = report.failed, "Publish complete");
    Ok(report)
}

/// Publishes the global documents and every one of the 168 buckets.
#[tracing::instrument(skip_all, fields(pairs = snapshot.len()))]
pub async fn publish_all_buckets(
    snapshot: &AccumulatorSnapshot,
    publisher: &dyn Publisher,
) -> Result<PublishReport> {
    let mut report = publish_scope(snapshot, Scope::Global, publisher).await?;
    for bucket in Bucket::all() {
        report.absorb(publish_scope(snapshot, Scope::Hourly(bucket), publisher).await?);
    }

    info!(written = report.written, failed = report.failed, "Backfill publish complete");
    Ok(report)
}

async fn publish_scope(
    snapshot: &AccumulatorSnapshot,
    scope: Scope,
    publisher: &dyn Publisher,
) -> Result<PublishReport> {
    let files = render(snapshot, scope)?;
    let mut report = PublishReport::default();

    for ShardFile { path, body } in files {
        match publisher.put(&path, body).await {
            Ok(()) => report.written += 1,
            Err(e) => {
                error!(path = %path, error = %e, "Failed to publish document");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}
