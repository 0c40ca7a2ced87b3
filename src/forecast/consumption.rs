use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::VecDeque;

use crate::config::InterimCostConfig;

/// Rolling 7-day household consumption history, grouped by hour of day.
///
/// Feeds the interim-cost estimate of the charging engine and the
/// consumption forecast behind sell-then-buy prevention.
#[derive(Debug, Default)]
pub struct ConsumptionHistory {
    samples: VecDeque<(DateTime<Utc>, f64)>,
}

const RETENTION_DAYS: i64 = 7;

impl ConsumptionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, timestamp: DateTime<Utc>, load_kw: f64) {
        if !load_kw.is_finite() || load_kw < 0.0 {
            return;
        }
        self.samples.push_back((timestamp, load_kw));
        let cutoff = timestamp - Duration::days(RETENTION_DAYS);
        while matches!(self.samples.front(), Some((ts, _)) if *ts < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Span between oldest and newest sample.
    pub fn coverage(&self) -> Duration {
        match (self.samples.front(), self.samples.back()) {
            (Some((first, _)), Some((last, _))) => *last - *first,
            _ => Duration::zero(),
        }
    }

    fn hourly_mean(&self, hour: u32) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for (ts, kw) in &self.samples {
            if ts.hour() == hour {
                sum += kw;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    /// Expected consumption for a local hour of day, with the time-of-day
    /// factors applied (evening 18-22 up, night 22-06 down).
    pub fn expected_kw(&self, cfg: &InterimCostConfig, local_hour: u32) -> f64 {
        let base = if self.coverage() >= Duration::hours(cfg.min_history_hours) {
            self.hourly_mean(local_hour)
                .unwrap_or(cfg.fallback_consumption_kw)
        } else {
            cfg.fallback_consumption_kw
        };

        let factor = if (18..22).contains(&local_hour) {
            cfg.evening_multiplier
        } else if local_hour >= 22 || local_hour < 6 {
            cfg.night_multiplier
        } else {
            1.0
        };
        base * factor
    }

    /// Total expected consumption over the coming `hours`, hour by hour.
    pub fn forecast_total_kwh(
        &self,
        cfg: &InterimCostConfig,
        local_start_hour: u32,
        hours: i64,
    ) -> f64 {
        (0..hours)
            .map(|h| self.expected_kw(cfg, (local_start_hour + h as u32) % 24))
            .sum()
    }
}
