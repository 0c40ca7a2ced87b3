use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{TariffConfig, TariffKind};

#[derive(Debug, Error)]
pub enum TariffError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Distribution signal published by the operator for signal-driven tariffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicySignal {
    S1,
    S2,
    S3,
    S4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Zone {
    OffPeak,
    Day,
    Peak,
}

/// Converts raw market prices into tariff-adjusted end-user prices.
///
/// Deterministic and free of I/O: the same `(market_price, timestamp)`
/// always yields the same effective price.
#[derive(Debug, Clone)]
pub struct TariffCalculator {
    cfg: TariffConfig,
    tz: Tz,
}

impl TariffCalculator {
    pub fn new(cfg: TariffConfig, tz: Tz) -> Self {
        Self { cfg, tz }
    }

    /// Effective end-user price in PLN/kWh for a market price in PLN/MWh.
    pub fn effective_price(
        &self,
        market_price_pln_mwh: f64,
        timestamp: DateTime<Utc>,
        signal: Option<PolicySignal>,
    ) -> Result<f64, TariffError> {
        if !market_price_pln_mwh.is_finite() {
            return Err(TariffError::InvalidInput(
                "market price is not finite".into(),
            ));
        }
        // Negative day-ahead prices are legal; anything far outside the
        // exchange collar is a parsing bug upstream.
        if !(-5000.0..=50_000.0).contains(&market_price_pln_mwh) {
            return Err(TariffError::InvalidInput(format!(
                "market price out of plausible range: {market_price_pln_mwh} PLN/MWh"
            )));
        }
        if self.cfg.kind == TariffKind::PolicySignal && signal.is_none() {
            return Err(TariffError::InvalidInput(
                "policy-signal tariff requires a signal".into(),
            ));
        }

        let market_kwh = market_price_pln_mwh / 1000.0;
        let zone = self.zone_at(timestamp, signal);
        let surcharge = match zone {
            Zone::OffPeak => self.cfg.off_peak_surcharge_pln_kwh,
            Zone::Day => self.cfg.day_surcharge_pln_kwh,
            Zone::Peak => self.cfg.peak_surcharge_pln_kwh,
        };

        let effective = market_kwh + surcharge + self.cfg.service_charge_pln_kwh;
        Ok(effective.max(self.cfg.minimum_price_floor_pln_kwh))
    }

    fn zone_at(&self, timestamp: DateTime<Utc>, signal: Option<PolicySignal>) -> Zone {
        let local = timestamp.with_timezone(&self.tz);
        let hour = local.hour();
        let weekend = matches!(local.weekday(), Weekday::Sat | Weekday::Sun);

        match self.cfg.kind {
            TariffKind::Flat => Zone::Day,
            TariffKind::TwoZone => {
                if weekend {
                    Zone::OffPeak
                } else if in_ranges(hour, &self.cfg.day_zone_hours) {
                    Zone::Day
                } else {
                    Zone::OffPeak
                }
            }
            TariffKind::ThreeZone => {
                if weekend {
                    Zone::OffPeak
                } else if in_ranges(hour, &self.cfg.peak_zone_hours) {
                    Zone::Peak
                } else if in_ranges(hour, &self.cfg.day_zone_hours) {
                    Zone::Day
                } else {
                    Zone::OffPeak
                }
            }
            TariffKind::PolicySignal => match signal {
                Some(PolicySignal::S1) => Zone::OffPeak,
                Some(PolicySignal::S2) | Some(PolicySignal::S3) => Zone::Day,
                Some(PolicySignal::S4) => Zone::Peak,
                // zone_at is only reached with a signal present for this kind
                None => Zone::Day,
            },
        }
    }
}

fn in_ranges(hour: u32, ranges: &[(u32, u32)]) -> bool {
    ranges.iter().any(|&(start, end)| hour >= start && hour < end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn calc(kind: TariffKind) -> TariffCalculator {
        let cfg = TariffConfig {
            kind,
            off_peak_surcharge_pln_kwh: 0.05,
            day_surcharge_pln_kwh: 0.10,
            peak_surcharge_pln_kwh: 0.18,
            service_charge_pln_kwh: 0.0892,
            minimum_price_floor_pln_kwh: 0.0050,
            day_zone_hours: vec![(6, 13), (15, 22)],
            peak_zone_hours: vec![(7, 10), (18, 21)],
        };
        TariffCalculator::new(cfg, chrono_tz::Europe::Warsaw)
    }

    /// 2025-06-02 is a Monday; 10:00 UTC = 12:00 local (CEST)
    fn weekday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 10, 0, 0).unwrap()
    }

    /// Monday 01:00 local
    fn weekday_night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 23, 0, 0).unwrap()
    }

    /// Saturday 12:00 local
    fn saturday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 7, 10, 0, 0).unwrap()
    }

    #[test]
    fn flat_tariff_applies_day_surcharge_always() {
        let calc = calc(TariffKind::Flat);
        let p = calc.effective_price(400.0, weekday_night(), None).unwrap();
        assert!((p - (0.4 + 0.10 + 0.0892)).abs() < 1e-9);
    }

    #[test]
    fn two_zone_day_and_night() {
        let calc = calc(TariffKind::TwoZone);
        let day = calc.effective_price(400.0, weekday_noon(), None).unwrap();
        let night = calc.effective_price(400.0, weekday_night(), None).unwrap();
        assert!((day - (0.4 + 0.10 + 0.0892)).abs() < 1e-9);
        assert!((night - (0.4 + 0.05 + 0.0892)).abs() < 1e-9);
    }

    #[test]
    fn weekend_collapses_to_off_peak() {
        let calc = calc(TariffKind::TwoZone);
        let p = calc.effective_price(400.0, saturday_noon(), None).unwrap();
        assert!((p - (0.4 + 0.05 + 0.0892)).abs() < 1e-9);
    }

    #[test]
    fn three_zone_peak_window() {
        let calc = calc(TariffKind::ThreeZone);
        // Monday 19:00 local = 17:00 UTC in June
        let peak_time = Utc.with_ymd_and_hms(2025, 6, 2, 17, 0, 0).unwrap();
        let p = calc.effective_price(400.0, peak_time, None).unwrap();
        assert!((p - (0.4 + 0.18 + 0.0892)).abs() < 1e-9);
    }

    #[rstest]
    #[case(PolicySignal::S1, 0.05)]
    #[case(PolicySignal::S2, 0.10)]
    #[case(PolicySignal::S3, 0.10)]
    #[case(PolicySignal::S4, 0.18)]
    fn policy_signal_selects_zone(#[case] signal: PolicySignal, #[case] surcharge: f64) {
        let calc = calc(TariffKind::PolicySignal);
        let p = calc
            .effective_price(400.0, weekday_noon(), Some(signal))
            .unwrap();
        assert!((p - (0.4 + surcharge + 0.0892)).abs() < 1e-9);
    }

    #[test]
    fn policy_signal_without_signal_is_invalid_input() {
        let calc = calc(TariffKind::PolicySignal);
        assert!(calc.effective_price(400.0, weekday_noon(), None).is_err());
    }

    #[test]
    fn floor_applies_to_deeply_negative_prices() {
        let calc = calc(TariffKind::TwoZone);
        let p = calc
            .effective_price(-1000.0, weekday_noon(), None)
            .unwrap();
        assert!((p - 0.0050).abs() < 1e-12);
    }

    #[test]
    fn non_finite_market_price_rejected() {
        let calc = calc(TariffKind::Flat);
        assert!(calc
            .effective_price(f64::NAN, weekday_noon(), None)
            .is_err());
        assert!(calc
            .effective_price(f64::INFINITY, weekday_noon(), None)
            .is_err());
    }

    #[test]
    fn calculator_is_deterministic() {
        let calc = calc(TariffKind::TwoZone);
        let a = calc.effective_price(512.3, weekday_noon(), None).unwrap();
        let b = calc.effective_price(512.3, weekday_noon(), None).unwrap();
        assert_eq!(a, b);
    }
}
