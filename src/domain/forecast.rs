use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One forecast slot from the price-forecast collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub timestamp: DateTime<Utc>,
    pub price_pln_kwh: f64,
    pub confidence: f64,
}

/// Mean confidence over a forecast slice; 0 when the forecast is absent or
/// empty, which makes the selling engine fall back to default margins.
pub fn forecast_confidence(points: &[ForecastPoint]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let sum: f64 = points.iter().map(|p| p.confidence).sum();
    (sum / points.len() as f64).clamp(0.0, 1.0)
}

/// Highest-priced forecast point within the window.
pub fn peak_within<'a>(
    points: &'a [ForecastPoint],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Option<&'a ForecastPoint> {
    points
        .iter()
        .filter(|p| p.timestamp > from && p.timestamp <= to)
        .max_by(|a, b| a.price_pln_kwh.total_cmp(&b.price_pln_kwh))
}

/// Maximum price anywhere in the forecast, at least `floor`.
pub fn max_price(points: &[ForecastPoint], floor: f64) -> f64 {
    points
        .iter()
        .map(|p| p.price_pln_kwh)
        .fold(floor, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn points(start: DateTime<Utc>, prices: &[(f64, f64)]) -> Vec<ForecastPoint> {
        prices
            .iter()
            .enumerate()
            .map(|(i, &(price, confidence))| ForecastPoint {
                timestamp: start + Duration::hours(i as i64 + 1),
                price_pln_kwh: price,
                confidence,
            })
            .collect()
    }

    #[test]
    fn empty_forecast_has_zero_confidence() {
        assert_eq!(forecast_confidence(&[]), 0.0);
    }

    #[test]
    fn confidence_is_mean() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let pts = points(start, &[(0.5, 0.8), (0.6, 0.6)]);
        assert!((forecast_confidence(&pts) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn peak_respects_window() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let pts = points(start, &[(0.5, 0.9), (1.2, 0.9), (2.0, 0.9)]);
        let peak = peak_within(&pts, start, start + Duration::hours(2)).unwrap();
        assert_eq!(peak.price_pln_kwh, 1.2);
    }

    #[test]
    fn max_price_respects_floor() {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        let pts = points(start, &[(0.5, 0.9)]);
        assert_eq!(max_price(&pts, 0.8), 0.8);
        assert_eq!(max_price(&pts, 0.2), 0.5);
    }
}
