use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single market slot with its tariff-adjusted effective price.
///
/// The effective price is derived once by the tariff calculator and never
/// recomputed from a stored raw value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub market_price_pln_mwh: f64,
    pub effective_price_pln_kwh: f64,
}

/// Ordered, unique-by-timestamp sequence of price points.
///
/// Covers at least the next 24 h; may carry up to 7 days of history for
/// threshold learning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceCurve {
    points: Vec<PricePoint>,
}

impl PriceCurve {
    pub fn new(mut points: Vec<PricePoint>) -> Self {
        points.sort_by_key(|p| p.timestamp);
        points.dedup_by_key(|p| p.timestamp);
        Self { points }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Slot length inferred from point spacing; hourly when unknown.
    pub fn slot_duration(&self) -> Duration {
        self.points
            .windows(2)
            .map(|w| w[1].timestamp - w[0].timestamp)
            .min()
            .unwrap_or_else(|| Duration::hours(1))
    }

    /// The point whose slot covers `at`, if any.
    pub fn point_at(&self, at: DateTime<Utc>) -> Option<&PricePoint> {
        let slot = self.slot_duration();
        self.points
            .iter()
            .rev()
            .find(|p| p.timestamp <= at && at < p.timestamp + slot)
    }

    pub fn effective_at(&self, at: DateTime<Utc>) -> Option<f64> {
        self.point_at(at).map(|p| p.effective_price_pln_kwh)
    }

    /// Cheapest point strictly after `from` and no later than `to`.
    pub fn cheapest_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<&PricePoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp > from && p.timestamp <= to)
            .min_by(|a, b| {
                a.effective_price_pln_kwh
                    .total_cmp(&b.effective_price_pln_kwh)
            })
    }

    /// Highest-priced point strictly after `from` and no later than `to`.
    pub fn peak_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<&PricePoint> {
        self.points
            .iter()
            .filter(|p| p.timestamp > from && p.timestamp <= to)
            .max_by(|a, b| {
                a.effective_price_pln_kwh
                    .total_cmp(&b.effective_price_pln_kwh)
            })
    }

    pub fn points_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl Iterator<Item = &PricePoint> {
        self.points
            .iter()
            .filter(move |p| p.timestamp > from && p.timestamp <= to)
    }

    /// Mean effective price over [from, to), falling back to `None` when no
    /// slot overlaps the span.
    pub fn average_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<f64> {
        let prices: Vec<f64> = self
            .points
            .iter()
            .filter(|p| p.timestamp >= from && p.timestamp < to)
            .map(|p| p.effective_price_pln_kwh)
            .collect();
        if prices.is_empty() {
            return None;
        }
        Some(prices.iter().sum::<f64>() / prices.len() as f64)
    }

    /// How long prices stay at or below `cap` starting from the slot at
    /// `start` (inclusive). Zero when the starting slot is already above.
    pub fn contiguous_hours_below(&self, start: DateTime<Utc>, cap: f64) -> f64 {
        let slot = self.slot_duration();
        let slot_hours = slot.num_minutes() as f64 / 60.0;
        let mut hours = 0.0;
        let mut cursor = start;
        loop {
            match self.point_at(cursor) {
                Some(p) if p.effective_price_pln_kwh <= cap => {
                    hours += slot_hours;
                    cursor += slot;
                }
                _ => break,
            }
        }
        hours
    }

    /// Effective prices observed in the lookback window ending at `now`.
    pub fn recent_effective(&self, now: DateTime<Utc>, lookback: Duration) -> Vec<f64> {
        self.points
            .iter()
            .filter(|p| p.timestamp > now - lookback && p.timestamp <= now)
            .map(|p| p.effective_price_pln_kwh)
            .collect()
    }

    /// Insert new points, keeping the sequence ordered and unique.
    pub fn merge(&mut self, new_points: Vec<PricePoint>) {
        self.points.extend(new_points);
        self.points.sort_by_key(|p| p.timestamp);
        self.points.dedup_by_key(|p| p.timestamp);
    }

    /// Drop history older than `cutoff`.
    pub fn evict_before(&mut self, cutoff: DateTime<Utc>) {
        self.points.retain(|p| p.timestamp >= cutoff);
    }
}
