use chrono::{DateTime, Datelike, Duration, Utc};
use itertools::Itertools;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ThresholdConfig;

/// Published threshold pair. `critical_charge` never exceeds `high_price`.
#[derive(Debug, Clone, Serialize)]
pub struct Thresholds {
    pub high_price_pln_kwh: f64,
    pub critical_charge_pln_kwh: f64,
    pub computed_at: DateTime<Utc>,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

fn season_of(ts: DateTime<Utc>) -> Season {
    match ts.month() {
        12 | 1 | 2 => Season::Winter,
        3..=5 => Season::Spring,
        6..=8 => Season::Summer,
        _ => Season::Autumn,
    }
}

/// Rolling buffer of observed effective prices and the percentile-derived
/// thresholds computed from it.
///
/// Writes happen only from the control loop (bounded to one refresh per
/// configured interval); reads clone an `Arc` and never block the writer.
pub struct ThresholdEngine {
    history: RwLock<BTreeMap<DateTime<Utc>, f64>>,
    published: RwLock<Arc<Thresholds>>,
    last_refresh: RwLock<Option<DateTime<Utc>>>,
    last_fallback_log: RwLock<Option<DateTime<Utc>>>,
}

impl ThresholdEngine {
    pub fn new(cfg: &ThresholdConfig) -> Self {
        let fallback = Arc::new(Thresholds {
            high_price_pln_kwh: cfg.fallback_high_pln_kwh,
            critical_charge_pln_kwh: cfg.fallback_critical_pln_kwh,
            computed_at: DateTime::<Utc>::MIN_UTC,
            sample_count: 0,
        });
        Self {
            history: RwLock::new(BTreeMap::new()),
            published: RwLock::new(fallback),
            last_refresh: RwLock::new(None),
            last_fallback_log: RwLock::new(None),
        }
    }

    /// Current thresholds; the fallback pair until enough samples exist.
    pub fn current(&self) -> Arc<Thresholds> {
        Arc::clone(&self.published.read())
    }

    pub fn high_price_threshold(&self) -> f64 {
        self.current().high_price_pln_kwh
    }

    pub fn critical_charge_threshold(&self) -> f64 {
        self.current().critical_charge_pln_kwh
    }

    pub fn sample_count(&self) -> usize {
        self.history.read().len()
    }

    /// Record observed effective prices (unique by timestamp) and drop
    /// history beyond the retention window.
    pub fn observe(&self, cfg: &ThresholdConfig, points: &[(DateTime<Utc>, f64)], now: DateTime<Utc>) {
        let mut history = self.history.write();
        for &(ts, price) in points {
            history.insert(ts, price);
        }
        let cutoff = now - Duration::days(cfg.history_days);
        *history = history.split_off(&cutoff);
    }

    /// Recompute and publish both thresholds when the refresh is due.
    ///
    /// Idempotent within the refresh interval: calling again before the
    /// interval elapses leaves the published pair untouched.
    pub fn refresh(&self, cfg: &ThresholdConfig, now: DateTime<Utc>) {
        if !cfg.enabled {
            return;
        }

        let interval = Duration::hours(cfg.update_interval_hours as i64);
        {
            let last = self.last_refresh.read();
            if let Some(last) = *last {
                if now - last < interval {
                    return;
                }
            }
        }

        let prices: Vec<f64> = self.history.read().values().copied().collect();
        if prices.len() < cfg.min_samples {
            // keep fallback/previous; complain at most once per interval
            let mut last_log = self.last_fallback_log.write();
            let due = last_log.map_or(true, |t| now - t >= interval);
            if due {
                warn!(
                    samples = prices.len(),
                    needed = cfg.min_samples,
                    "insufficient price samples, keeping fallback thresholds"
                );
                *last_log = Some(now);
            }
            return;
        }

        let multiplier = match season_of(now) {
            Season::Winter => cfg.winter_multiplier,
            Season::Spring => cfg.spring_multiplier,
            Season::Summer => cfg.summer_multiplier,
            Season::Autumn => cfg.autumn_multiplier,
        };

        let sorted: Vec<f64> = prices.iter().copied().sorted_by(f64::total_cmp).collect();

        let high = (percentile(&sorted, cfg.high_percentile) * multiplier)
            .clamp(cfg.high_min_pln_kwh, cfg.high_max_pln_kwh);
        let critical = (percentile(&sorted, cfg.critical_percentile) * multiplier)
            .clamp(cfg.critical_min_pln_kwh, cfg.critical_max_pln_kwh);
        // clip bounds can cross when the distribution collapses
        let critical = critical.min(high);

        let thresholds = Arc::new(Thresholds {
            high_price_pln_kwh: high,
            critical_charge_pln_kwh: critical,
            computed_at: now,
            sample_count: prices.len(),
        });

        info!(
            high = format_args!("{:.3}", high),
            critical = format_args!("{:.3}", critical),
            seasonal_multiplier = multiplier,
            samples = prices.len(),
            "updated adaptive thresholds"
        );
        debug!(retained = prices.len(), "threshold history size");

        *self.published.write() = thresholds;
        *self.last_refresh.write() = Some(now);
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() as f64) * p) as usize;
    sorted[idx.min(sorted.len() - 1)]
}
