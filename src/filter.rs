//! Plausibility bounds applied before a sample reaches the accumulator.
//!
//! Rejections are silent apart from telemetry: the next polls bring fresh
//! evidence, so nothing is retried.
//!
//! The deviation band is judged against the estimate of the sample's own
//! hour bucket. A pair whose last `release_after` checks were all deviant
//! accepts the next deviant sample, so a lasting change in travel time
//! drags the estimate along instead of being rejected forever.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::estimate::RunningEstimate;
use crate::topology::TopologySource;
use crate::types::StopPairKey;

/// Outlier filter parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Shortest journey time accepted between two stops.
    pub min_seconds: f64,
    /// Longest journey time accepted between any two stops.
    pub ceiling_seconds: f64,
    /// Slowest believable average speed; bounds pairs with known coordinates.
    pub min_speed_kmh: f64,
    /// Added to the distance bound to cover dwell time and traffic lights.
    pub distance_slack_seconds: f64,
    /// Samples a pair needs before deviation checks apply.
    pub warmup_count: u64,
    /// Accepted distance from the running mean, in standard deviations.
    pub deviation_k: f64,
    /// Accepted distance from the running mean as a fraction of it, whichever
    /// of the two tolerances is wider.
    pub min_band_ratio: f64,
    /// Consecutive deviant samples of one pair after which the next deviant
    /// sample is accepted.
    pub release_after: u32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_seconds: 5.0,
            ceiling_seconds: 3600.0,
            min_speed_kmh: 3.0,
            distance_slack_seconds: 300.0,
            warmup_count: 20,
            deviation_k: 3.0,
            min_band_ratio: 0.25,
            release_after: 5,
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        let non_negative = [
            ("min_seconds", self.min_seconds),
            ("min_speed_kmh", self.min_speed_kmh),
            ("distance_slack_seconds", self.distance_slack_seconds),
            ("deviation_k", self.deviation_k),
            ("min_band_ratio", self.min_band_ratio),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0 && value.is_finite()) {
                bail!("filter.{name} must be a non-negative number, got {value}");
            }
        }
        if !(self.ceiling_seconds > 0.0) {
            bail!("filter.ceiling_seconds must be positive");
        }
        if self.min_seconds > self.ceiling_seconds {
            bail!("filter.min_seconds exceeds filter.ceiling_seconds");
        }
        if self.release_after == 0 {
            bail!("filter.release_after must be at least 1");
        }
        Ok(())
    }
}

/// Outcome of filtering one candidate sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    BelowMinimum,
    AboveCeiling,
    Deviant,
}

#[derive(Debug, Default)]
pub struct OutlierFilter {
    config: FilterConfig,
    /// Consecutive deviant verdicts per pair.
    deviant_streaks: Mutex<HashMap<StopPairKey, u32>>,
}

impl OutlierFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            config,
            deviant_streaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Upper bound for `key`: the ceiling, tightened by stop distance when
    /// both stops have coordinates.
    pub fn max_plausible(&self, key: &StopPairKey, topology: &dyn TopologySource) -> f64 {
        let ceiling = self.config.ceiling_seconds;
        if self.config.min_speed_kmh <= 0.0 {
            return ceiling;
        }
        match topology.distance_km(&key.from, &key.to) {
            Some(km) => {
                let bound = km / self.config.min_speed_kmh * 3600.0 + self.config.distance_slack_seconds;
                bound.min(ceiling)
            }
            None => ceiling,
        }
    }

    /// Judges a sample of `key` against the fixed bounds and, once `bucket`
    /// (the estimate of the sample's hour bucket) is warmed up, against the
    /// deviation band.
    pub fn check(
        &self,
        key: &StopPairKey,
        delta_seconds: f64,
        max_plausible: f64,
        bucket: Option<&RunningEstimate>,
    ) -> Verdict {
        match self.bounds_verdict(delta_seconds, max_plausible, bucket) {
            Verdict::Deviant => self.note_deviant(key),
            Verdict::Accept => {
                self.streaks().remove(key);
                Verdict::Accept
            }
            verdict => verdict,
        }
    }

    fn bounds_verdict(&self, delta_seconds: f64, max_plausible: f64, bucket: Option<&RunningEstimate>) -> Verdict {
        if !delta_seconds.is_finite() || delta_seconds <= 0.0 || delta_seconds < self.config.min_seconds {
            return Verdict::BelowMinimum;
        }
        if delta_seconds > max_plausible {
            return Verdict::AboveCeiling;
        }

        if let Some(estimate) = bucket.filter(|e| e.count >= self.config.warmup_count) {
            let tolerance = (self.config.deviation_k * estimate.stddev())
                .max(self.config.min_band_ratio * estimate.mean);
            if (delta_seconds - estimate.mean).abs() > tolerance {
                return Verdict::Deviant;
            }
        }

        Verdict::Accept
    }

    fn note_deviant(&self, key: &StopPairKey) -> Verdict {
        let mut streaks = self.streaks();
        let streak = streaks.entry(key.clone()).or_default();
        if *streak >= self.config.release_after {
            streaks.remove(key);
            return Verdict::Accept;
        }
        *streak += 1;
        Verdict::Deviant
    }

    fn streaks(&self) -> std::sync::MutexGuard<'_, HashMap<StopPairKey, u32>> {
        self.deviant_streaks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::Accumulator;
    use crate::topology::{EmptyTopology, StaticTopology};
    use chrono::{TimeZone, Utc};

    fn pair() -> StopPairKey {
        StopPairKey::new("A", "B")
    }

    fn warmed(values: &[f64]) -> RunningEstimate {
        let mut est = RunningEstimate::default();
        for v in values {
            est.push(*v);
        }
        est
    }

    #[test]
    fn test_non_positive_is_rejected() {
        let filter = OutlierFilter::default();
        assert_eq!(filter.check(&pair(), 0.0, 3600.0, None), Verdict::BelowMinimum);
        assert_eq!(filter.check(&pair(), -5.0, 3600.0, None), Verdict::BelowMinimum);
        assert_eq!(filter.check(&pair(), f64::NAN, 3600.0, None), Verdict::BelowMinimum);
    }

    #[test]
    fn test_non_positive_is_rejected_without_floor() {
        let filter = OutlierFilter::new(FilterConfig {
            min_seconds: 0.0,
            ..Default::default()
        });
        assert_eq!(filter.check(&pair(), 0.0, 3600.0, None), Verdict::BelowMinimum);
        assert_eq!(filter.check(&pair(), 0.5, 3600.0, None), Verdict::Accept);
    }

    #[test]
    fn test_ceiling_is_inclusive() {
        let filter = OutlierFilter::default();
        assert_eq!(filter.check(&pair(), 3600.0, 3600.0, None), Verdict::Accept);
        assert_eq!(filter.check(&pair(), 3600.5, 3600.0, None), Verdict::AboveCeiling);
    }

    #[test]
    fn test_distance_tightens_bound() {
        let filter = OutlierFilter::default();
        // ~1.11 km apart: 1.11 / 3 km/h = ~1334 s, plus 300 s slack.
        let topo = StaticTopology::new()
            .with_stop("A", 0.0, 0.0)
            .with_stop("B", 0.01, 0.0);
        let bound = filter.max_plausible(&StopPairKey::new("A", "B"), &topo);
        assert!((bound - 1634.3).abs() < 1.0);

        assert_eq!(filter.max_plausible(&StopPairKey::new("A", "B"), &EmptyTopology), 3600.0);
    }

    #[test]
    fn test_far_apart_stops_keep_ceiling() {
        let filter = OutlierFilter::default();
        let topo = StaticTopology::new()
            .with_stop("A", 0.0, 0.0)
            .with_stop("B", 1.0, 0.0);
        assert_eq!(filter.max_plausible(&StopPairKey::new("A", "B"), &topo), 3600.0);
    }

    #[test]
    fn test_deviation_only_after_warmup() {
        let filter = OutlierFilter::default();
        let cold = warmed(&[100.0; 5]);
        assert_eq!(filter.check(&pair(), 1000.0, 3600.0, Some(&cold)), Verdict::Accept);

        let warm = warmed(&[100.0; 20]);
        assert_eq!(filter.check(&pair(), 1000.0, 3600.0, Some(&warm)), Verdict::Deviant);
        // Zero variance still leaves a 25% band around the mean.
        assert_eq!(filter.check(&pair(), 120.0, 3600.0, Some(&warm)), Verdict::Accept);
        assert_eq!(filter.check(&pair(), 130.0, 3600.0, Some(&warm)), Verdict::Deviant);
    }

    #[test]
    fn test_wide_variance_widens_band() {
        let filter = OutlierFilter::default();
        let values: Vec<f64> = (0..40).map(|i| if i % 2 == 0 { 60.0 } else { 140.0 }).collect();
        let warm = warmed(&values);
        // mean 100, stddev 40: tolerance 120.
        assert_eq!(filter.check(&pair(), 210.0, 3600.0, Some(&warm)), Verdict::Accept);
        assert_eq!(filter.check(&pair(), 230.0, 3600.0, Some(&warm)), Verdict::Deviant);
    }

    #[test]
    fn test_deviant_streak_releases_next_sample() {
        let filter = OutlierFilter::default();
        let warm = warmed(&[100.0; 20]);

        for _ in 0..5 {
            assert_eq!(filter.check(&pair(), 200.0, 3600.0, Some(&warm)), Verdict::Deviant);
        }
        assert_eq!(filter.check(&pair(), 200.0, 3600.0, Some(&warm)), Verdict::Accept);
        assert_eq!(filter.check(&pair(), 200.0, 3600.0, Some(&warm)), Verdict::Deviant);
    }

    #[test]
    fn test_accepted_sample_resets_streak() {
        let filter = OutlierFilter::default();
        let warm = warmed(&[100.0; 20]);
        let other = StopPairKey::new("B", "A");

        for _ in 0..4 {
            filter.check(&pair(), 200.0, 3600.0, Some(&warm));
        }
        // Streaks are per pair.
        assert_eq!(filter.check(&other, 200.0, 3600.0, Some(&warm)), Verdict::Deviant);
        assert_eq!(filter.check(&pair(), 100.0, 3600.0, Some(&warm)), Verdict::Accept);
        for _ in 0..5 {
            assert_eq!(filter.check(&pair(), 200.0, 3600.0, Some(&warm)), Verdict::Deviant);
        }
    }

    #[test]
    fn test_permanent_shift_is_learned() {
        let filter = OutlierFilter::default();
        let acc = Accumulator::default();
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap();

        for _ in 0..20 {
            acc.record_sample(&pair(), 100.0, at);
        }

        let mut accepted = 0;
        for _ in 0..1000 {
            let current = acc.bucket_estimate(&pair(), at);
            if filter.check(&pair(), 200.0, 3600.0, current.as_ref()) == Verdict::Accept {
                acc.record_sample(&pair(), 200.0, at);
                accepted += 1;
            }
        }

        let est = acc.global_estimate(&pair()).unwrap();
        assert!(accepted > 950, "accepted {accepted}");
        assert!(est.mean > 190.0, "mean {}", est.mean);
    }

    #[test]
    fn test_validate_rejects_negative_settings() {
        FilterConfig::default().validate().unwrap();

        let negative_k = FilterConfig {
            deviation_k: -1.0,
            ..Default::default()
        };
        assert!(negative_k.validate().is_err());

        let negative_band = FilterConfig {
            min_band_ratio: -0.1,
            ..Default::default()
        };
        assert!(negative_band.validate().is_err());

        let no_release = FilterConfig {
            release_after: 0,
            ..Default::default()
        };
        assert!(no_release.validate().is_err());

        let inverted = FilterConfig {
            min_seconds: 4000.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
