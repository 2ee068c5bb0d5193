//! Engine configuration, stored as a JSON file on disk.
//!
//! ```json
//! {
//!   "feeds": [
//!     { "id": "kmb", "url": "https://example.org/eta.json", "format": "eta-json" },
//!     { "id": "mtr", "url": "https://example.org/trip-updates.pb",
//!       "auth": { "type": "header", "name": "x-api-key", "key": "..." } }
//!   ],
//!   "clock": { "utc_offset": "+08:00", "holidays": ["2024-12-25"] },
//!   "hourly_rule": { "kind": "cumulative" },
//!   "gtfs_dir": "gtfs"
//! }
//! ```
//!
//! Every field except `feeds` has a default.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::estimate::{BucketClock, UpdateRule};
use crate::fetch::FeedAuth;
use crate::filter::FilterConfig;
use crate::snapshot::FeedFormat;

/// One upstream ETA feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default)]
    pub auth: Option<FeedAuth>,
    /// Floor applied to every journey time of this feed, e.g. `120` for light
    /// rail whose ETAs only resolve to whole platform arrivals.
    #[serde(default)]
    pub min_seconds: Option<f64>,
}

/// Local time used for day-of-week and hour-of-day bucketing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockConfig {
    /// Fixed UTC offset of the service area, e.g. `+08:00`.
    pub utc_offset: String,
    /// Dates bucketed as Sunday.
    pub holidays: Vec<NaiveDate>,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            utc_offset: "+00:00".to_string(),
            holidays: Vec::new(),
        }
    }
}

impl ClockConfig {
    pub fn build(&self) -> Result<BucketClock> {
        let offset = FixedOffset::from_str(&self.utc_offset)
            .map_err(|e| anyhow::anyhow!("Invalid utc_offset '{}': {}", self.utc_offset, e))?;
        Ok(BucketClock::new(offset, self.holidays.iter().copied()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub feeds: Vec<FeedConfig>,
    pub filter: FilterConfig,
    pub clock: ClockConfig,
    pub hourly_rule: UpdateRule,
    /// Polls of each feed considered when deciding whether a stop reported.
    pub window_polls: usize,
    pub poll_seconds: u64,
    pub checkpoint_seconds: u64,
    pub fetch_timeout_seconds: u64,
    /// Maximum feeds fetched at once.
    pub concurrency: usize,
    pub checkpoint: PathBuf,
    pub output_dir: PathBuf,
    pub gtfs_dir: Option<PathBuf>,
    /// CSV file receiving one row of telemetry per feed poll.
    pub stats_csv: Option<PathBuf>,
    pub s3_bucket: Option<String>,
    pub gzip: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            filter: FilterConfig::default(),
            clock: ClockConfig::default(),
            hourly_rule: UpdateRule::Cumulative,
            window_polls: 3,
            poll_seconds: 60,
            checkpoint_seconds: 300,
            fetch_timeout_seconds: 20,
            concurrency: 4,
            checkpoint: PathBuf::from("state/checkpoint.json"),
            output_dir: PathBuf::from("public"),
            gtfs_dir: None,
            stats_csv: None,
            s3_bucket: None,
            gzip: false,
        }
    }
}

impl EngineConfig {
    /// Loads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_seconds == 0 {
            bail!("poll_seconds must be positive");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be positive");
        }
        if let UpdateRule::Exponential { alpha } = self.hourly_rule {
            if !(alpha > 0.0 && alpha <= 1.0) {
                bail!("hourly_rule alpha must be in (0, 1], got {alpha}");
            }
        }
        self.filter.validate()?;
        for feed in &self.feeds {
            if let Some(floor) = feed.min_seconds {
                if !(floor >= 0.0 && floor <= self.filter.ceiling_seconds) {
                    bail!("feed '{}' min_seconds must be within [0, filter.ceiling_seconds], got {floor}", feed.id);
                }
            }
        }
        let mut ids: Vec<&str> = self.feeds.iter().map(|f| f.id.as_str()).collect();
        ids.sort_unstable();
        if ids.windows(2).any(|w| w[0] == w[1]) {
            bail!("feed ids must be unique");
        }
        self.clock.build()?;
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_seconds.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"feeds": [{"id": "a", "url": "http://x/feed.pb"}]}"#).unwrap();

        assert_eq!(config.feeds[0].format, FeedFormat::GtfsRt);
        assert!(config.feeds[0].auth.is_none());
        assert_eq!(config.feeds[0].min_seconds, None);
        assert_eq!(config.poll_seconds, 60);
        assert_eq!(config.window_polls, 3);
        assert_eq!(config.filter.ceiling_seconds, 3600.0);
        assert_eq!(config.hourly_rule, UpdateRule::Cumulative);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_config() {
        let config: EngineConfig = serde_json::from_str(
            r#"{
                "feeds": [{"id": "a", "url": "http://x", "format": "eta-json", "min_seconds": 120,
                           "auth": {"type": "url_param", "name": "api_key", "key": "k"}}],
                "filter": {"ceiling_seconds": 1800},
                "clock": {"utc_offset": "+08:00", "holidays": ["2024-01-01"]},
                "hourly_rule": {"kind": "exponential", "alpha": 0.05},
                "s3_bucket": "bucket"
            }"#,
        )
        .unwrap();

        assert_eq!(config.feeds[0].format, FeedFormat::EtaJson);
        assert_eq!(
            config.feeds[0].auth,
            Some(FeedAuth::UrlParam {
                name: "api_key".to_string(),
                key: "k".to_string()
            })
        );
        assert_eq!(config.feeds[0].min_seconds, Some(120.0));
        assert_eq!(config.filter.ceiling_seconds, 1800.0);
        assert_eq!(config.filter.warmup_count, 20);
        assert_eq!(config.hourly_rule, UpdateRule::Exponential { alpha: 0.05 });
        config.validate().unwrap();

        let clock = config.clock.build().unwrap();
        // Holiday Monday 2024-01-01 10:00 local is bucketed as Sunday.
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        let bucket = clock.bucket_of(at);
        assert_eq!((bucket.day(), bucket.hour()), (6, 10));
    }

    #[test]
    fn test_validation_failures() {
        let mut config = EngineConfig::default();
        config.clock.utc_offset = "eight".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.hourly_rule = UpdateRule::Exponential { alpha: 0.0 };
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        let feed = FeedConfig {
            id: "dup".to_string(),
            url: "http://x".to_string(),
            format: FeedFormat::GtfsRt,
            auth: None,
            min_seconds: None,
        };
        config.feeds = vec![feed.clone(), feed];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.filter.deviation_k = -3.0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.filter.min_band_ratio = -0.25;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.feeds = vec![FeedConfig {
            id: "lrt".to_string(),
            url: "http://x".to_string(),
            format: FeedFormat::EtaJson,
            auth: None,
            min_seconds: Some(-1.0),
        }];
        assert!(config.validate().is_err());
    }
}
