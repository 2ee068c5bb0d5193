//! CLI entry point for the transit interval estimator.
//!
//! Provides subcommands for the long-running poll/publish loop, replaying
//! saved feed payloads into the checkpoint, and publishing on demand.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;
use tracing::{error, info, warn};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};
use transit_intervals::{
    accumulator::Accumulator,
    checkpoint::CheckpointStore,
    config::{EngineConfig, FeedConfig},
    estimate::Bucket,
    fetch::{Authenticated, BasicClient, fetch_bytes},
    filter::OutlierFilter,
    output::append_record,
    pipeline::{CycleStats, process_snapshot},
    publish::{DirPublisher, Publisher, S3Publisher, publish_all_buckets, publish_current},
    snapshot::{self, FeedFormat},
    topology::{EmptyTopology, PollWindow, TopologySource, gtfs},
};

#[derive(Parser)]
#[command(name = "transit_intervals")]
#[command(about = "Estimates stop-to-stop travel times from live ETA feeds", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(short, long, global = true, default_value = "config.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll every configured feed, publish hourly and checkpoint periodically
    Run,
    /// Replay saved feed payloads, oldest first, into the checkpoint
    Ingest {
        /// Payload files, one poll each
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,

        /// Wire format of the payloads
        #[arg(short, long, value_enum, default_value_t = PayloadFormat::GtfsRt)]
        format: PayloadFormat,

        /// Configured feed the payloads came from, for its per-feed settings
        #[arg(long)]
        feed: Option<String>,
    },
    /// Publish documents from the checkpoint once
    Publish {
        /// Write all 168 hourly buckets instead of the current one
        #[arg(long, default_value_t = false)]
        all_buckets: bool,

        /// Instant whose bucket is published (RFC 3339, defaults to now)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PayloadFormat {
    GtfsRt,
    EtaJson,
}

impl From<PayloadFormat> for FeedFormat {
    fn from(value: PayloadFormat) -> Self {
        match value {
            PayloadFormat::GtfsRt => FeedFormat::GtfsRt,
            PayloadFormat::EtaJson => FeedFormat::EtaJson,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/transit_intervals.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("transit_intervals.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run => run(config).await?,
        Commands::Ingest { files, format, feed } => ingest(&config, &files, format.into(), feed.as_deref())?,
        Commands::Publish { all_buckets, at } => publish(&config, all_buckets, at).await?,
    }

    Ok(())
}

/// Everything a polling cycle shares across feeds.
struct CycleContext {
    topology: Arc<dyn TopologySource>,
    filter: OutlierFilter,
    accumulator: Arc<Accumulator>,
    semaphore: Semaphore,
}

/// A configured feed and its recent polls.
struct FeedState {
    config: FeedConfig,
    client: Authenticated<BasicClient>,
    window: Mutex<PollWindow>,
}

fn load_topology(config: &EngineConfig) -> Result<Arc<dyn TopologySource>> {
    match &config.gtfs_dir {
        Some(dir) => Ok(Arc::new(gtfs::load_dir(dir)?)),
        None => {
            warn!("No gtfs_dir configured, ordering stops by predicted arrival");
            Ok(Arc::new(EmptyTopology))
        }
    }
}

fn load_accumulator(config: &EngineConfig, store: &CheckpointStore) -> Result<Accumulator> {
    let clock = config.clock.build()?;
    Ok(Accumulator::restore(store.load()?, clock, config.hourly_rule))
}

async fn build_publisher(config: &EngineConfig) -> Arc<dyn Publisher> {
    match &config.s3_bucket {
        Some(bucket) => {
            info!(bucket = %bucket, gzip = config.gzip, "Publishing to S3");
            let sdk_config = aws_config::load_from_env().await;
            Arc::new(S3Publisher::new(
                aws_sdk_s3::Client::new(&sdk_config),
                bucket.clone(),
                config.gzip,
            ))
        }
        None => {
            info!(dir = %config.output_dir.display(), "Publishing to local directory");
            Arc::new(DirPublisher::new(config.output_dir.clone()))
        }
    }
}

/// Polls all feeds on a fixed interval until Ctrl+C, publishing whenever the
/// local hour changes and checkpointing on its own interval.
#[tracing::instrument(skip_all, fields(feeds = config.feeds.len(), poll_seconds = config.poll_seconds))]
async fn run(config: EngineConfig) -> Result<()> {
    let store = Arc::new(CheckpointStore::new(config.checkpoint.clone()));
    let accumulator = Arc::new(load_accumulator(&config, &store)?);
    let publisher = build_publisher(&config).await;

    let ctx = Arc::new(CycleContext {
        topology: load_topology(&config)?,
        filter: OutlierFilter::new(config.filter.clone()),
        accumulator: accumulator.clone(),
        semaphore: Semaphore::new(config.concurrency),
    });

    let http = BasicClient::new(config.fetch_timeout())?;
    let feeds: Vec<Arc<FeedState>> = config
        .feeds
        .iter()
        .map(|feed| {
            Arc::new(FeedState {
                config: feed.clone(),
                client: Authenticated::new(http.clone(), feed.auth.clone()),
                window: Mutex::new(PollWindow::new(config.window_polls)),
            })
        })
        .collect();

    info!(pairs = accumulator.len(), "Starting poll loop. Press Ctrl+C to stop.");

    let mut poll_tick = tokio::time::interval(config.poll_interval());
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut checkpoint_tick = tokio::time::interval(config.checkpoint_interval());
    checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    checkpoint_tick.tick().await;

    let mut published_bucket: Option<Bucket> = None;
    let mut pending_checkpoint: Option<JoinHandle<()>> = None;
    let mut cycle = 0u64;

    loop {
        tokio::select! {
            _ = poll_tick.tick() => {
                cycle += 1;
                let totals = run_cycle(&feeds, &ctx, config.stats_csv.as_deref())
                    .instrument(tracing::info_span!("cycle", cycle))
                    .await;
                info!(
                    cycle,
                    accepted = totals.accepted,
                    rejected = totals.rejected(),
                    inconsistent = totals.inconsistent,
                    pairs_known = accumulator.len(),
                    "Cycle complete"
                );

                let now = Utc::now();
                let bucket = accumulator.clock().bucket_of(now);
                if published_bucket != Some(bucket) {
                    published_bucket = Some(bucket);
                    spawn_publish(&accumulator, &publisher, now);
                }
            }
            _ = checkpoint_tick.tick() => {
                if pending_checkpoint.as_ref().is_some_and(|h| !h.is_finished()) {
                    warn!("Previous checkpoint still running, skipping this one");
                } else {
                    pending_checkpoint = Some(spawn_checkpoint(&accumulator, &store));
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    if let Some(handle) = pending_checkpoint.take() {
        if let Err(e) = handle.await {
            error!(error = %e, "Periodic checkpoint task failed");
        }
    }
    tokio::task::spawn_blocking(move || store.save_accumulator(&accumulator))
        .await
        .context("Final checkpoint task failed")??;

    info!("Stopped");
    Ok(())
}

/// Polls every feed once, concurrently, and waits for all of them.
async fn run_cycle(
    feeds: &[Arc<FeedState>],
    ctx: &Arc<CycleContext>,
    stats_csv: Option<&Path>,
) -> CycleStats {
    let mut tasks = Vec::with_capacity(feeds.len());

    for feed in feeds {
        let feed = feed.clone();
        let ctx = ctx.clone();
        let span = tracing::info_span!("poll_feed", feed_id = %feed.config.id);

        tasks.push(tokio::spawn(
            async move {
                let Ok(_permit) = ctx.semaphore.acquire().await else {
                    return CycleStats::from_error("shutdown", "semaphore closed").with_feed(&feed.config.id);
                };
                poll_feed(&feed, &ctx).await
            }
            .instrument(span),
        ));
    }

    let mut totals = CycleStats {
        timestamp: Utc::now(),
        ..Default::default()
    };
    for task in tasks {
        match task.await {
            Ok(stats) => {
                totals.absorb(&stats);
                if let Some(path) = stats_csv {
                    if let Err(e) = append_record(path, &stats) {
                        error!(error = %e, "Failed to write cycle stats");
                    }
                }
            }
            Err(e) => error!(error = %e, "Feed task failed"),
        }
    }
    totals
}

/// Fetches, normalizes and processes one poll of one feed. Fetch and decode
/// failures only cost this feed this cycle.
async fn poll_feed(feed: &FeedState, ctx: &CycleContext) -> CycleStats {
    let server_time = Utc::now();
    let fetch_start = std::time::Instant::now();

    let bytes = match fetch_bytes(&feed.client, &feed.config.url).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Feed fetch failed");
            return CycleStats::from_error("fetch_error", &e.to_string()).with_feed(&feed.config.id);
        }
    };
    let elapsed = fetch_start.elapsed();
    if elapsed.as_secs() > 15 {
        warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
    }

    let snapshot = match snapshot::decode(feed.config.format, &bytes, server_time) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!(error = %e, bytes = bytes.len(), "Feed parse failed");
            return CycleStats::from_error("parse_error", &e.to_string()).with_feed(&feed.config.id);
        }
    };

    let mut window = feed.window.lock().unwrap_or_else(PoisonError::into_inner);
    process_snapshot(
        &mut window,
        snapshot,
        ctx.topology.as_ref(),
        &ctx.filter,
        &ctx.accumulator,
        feed.config.min_seconds,
    )
    .with_feed(&feed.config.id)
}

fn spawn_publish(accumulator: &Arc<Accumulator>, publisher: &Arc<dyn Publisher>, now: DateTime<Utc>) {
    let snapshot = accumulator.snapshot();
    let clock = accumulator.clock().clone();
    let publisher = publisher.clone();
    tokio::spawn(async move {
        match publish_current(&snapshot, &clock, now, publisher.as_ref()).await {
            Ok(report) if report.failed > 0 => {
                warn!(failed = report.failed, "Publish incomplete, next run retries")
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Publish failed"),
        }
    });
}

fn spawn_checkpoint(accumulator: &Arc<Accumulator>, store: &Arc<CheckpointStore>) -> JoinHandle<()> {
    let accumulator = accumulator.clone();
    let store = store.clone();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = store.save_accumulator(&accumulator) {
            error!(error = %e, "Checkpoint failed, state kept in memory");
        }
    })
}

/// Replays payload files as successive polls of a single feed.
#[tracing::instrument(skip_all, fields(files = files.len(), feed = feed_id))]
fn ingest(config: &EngineConfig, files: &[PathBuf], format: FeedFormat, feed_id: Option<&str>) -> Result<()> {
    let floor_seconds = match feed_id {
        Some(id) => {
            let feed = config
                .feeds
                .iter()
                .find(|feed| feed.id == id)
                .with_context(|| format!("No feed '{id}' in config"))?;
            feed.min_seconds
        }
        None => None,
    };

    let store = CheckpointStore::new(config.checkpoint.clone());
    let accumulator = load_accumulator(config, &store)?;
    let topology = load_topology(config)?;
    let filter = OutlierFilter::new(config.filter.clone());
    let mut window = PollWindow::new(config.window_polls);
    let mut totals = CycleStats::default();

    for path in files {
        match snapshot::decode_file(format, path) {
            Ok(snapshot) => {
                let stats = process_snapshot(
                    &mut window,
                    snapshot,
                    topology.as_ref(),
                    &filter,
                    &accumulator,
                    floor_seconds,
                );
                totals.absorb(&stats);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable payload"),
        }
    }

    store.save_accumulator(&accumulator)?;
    info!(
        accepted = totals.accepted,
        rejected = totals.rejected(),
        inconsistent = totals.inconsistent,
        pairs_known = accumulator.len(),
        "Ingest complete"
    );
    Ok(())
}

async fn publish(config: &EngineConfig, all_buckets: bool, at: Option<DateTime<Utc>>) -> Result<()> {
    let store = CheckpointStore::new(config.checkpoint.clone());
    let accumulator = load_accumulator(config, &store)?;
    let publisher = build_publisher(config).await;
    let snapshot = accumulator.snapshot();

    let report = if all_buckets {
        publish_all_buckets(&snapshot, publisher.as_ref()).await?
    } else {
        let now = at.unwrap_or_else(Utc::now);
        publish_current(&snapshot, accumulator.clock(), now, publisher.as_ref()).await?
    };

    if report.failed > 0 {
        anyhow::bail!("{} of {} documents failed to publish", report.failed, report.written + report.failed);
    }
    Ok(())
}
