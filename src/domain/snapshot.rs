use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One consistent observation of the household, taken from the inverter.
///
/// `grid_power_w` is signed: import positive, export negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub soc_percent: f64,
    pub battery_temp_c: f64,
    pub pv_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
    pub grid_voltage_v: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Freshness {
    Fresh,
    /// Older than 2 min but still usable; decisions flag it
    Aging,
    /// Older than 10 min; the coordinator refuses to act
    Stale,
}

impl SystemSnapshot {
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        let age = now - self.timestamp;
        if age <= Duration::minutes(2) {
            Freshness::Fresh
        } else if age <= Duration::minutes(10) {
            Freshness::Aging
        } else {
            Freshness::Stale
        }
    }

    /// PV generation exceeding the house load, in watts (0 when PV covers less)
    pub fn pv_surplus_w(&self) -> f64 {
        (self.pv_power_w - self.load_power_w).max(0.0)
    }

    /// Grid import, in watts (0 when exporting)
    pub fn grid_import_w(&self) -> f64 {
        self.grid_power_w.max(0.0)
    }

    /// Rejects out-of-range or non-finite readings before they reach the engines.
    pub fn validate(&self) -> Result<(), String> {
        if !self.soc_percent.is_finite() || !(0.0..=100.0).contains(&self.soc_percent) {
            return Err(format!("soc_percent out of range: {}", self.soc_percent));
        }
        for (name, v) in [
            ("battery_temp_c", self.battery_temp_c),
            ("pv_power_w", self.pv_power_w),
            ("load_power_w", self.load_power_w),
            ("grid_power_w", self.grid_power_w),
            ("grid_voltage_v", self.grid_voltage_v),
        ] {
            if !v.is_finite() {
                return Err(format!("{name} is not finite"));
            }
        }
        if self.pv_power_w < 0.0 || self.load_power_w < 0.0 {
            return Err("pv_power_w and load_power_w must be non-negative".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot_at(timestamp: DateTime<Utc>) -> SystemSnapshot {
        SystemSnapshot {
            soc_percent: 50.0,
            battery_temp_c: 25.0,
            pv_power_w: 1200.0,
            load_power_w: 800.0,
            grid_power_w: -400.0,
            grid_voltage_v: 230.0,
            timestamp,
        }
    }

    #[test]
    fn freshness_bands() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(snapshot_at(now).freshness(now), Freshness::Fresh);
        assert_eq!(
            snapshot_at(now - Duration::minutes(2)).freshness(now),
            Freshness::Fresh
        );
        assert_eq!(
            snapshot_at(now - Duration::minutes(5)).freshness(now),
            Freshness::Aging
        );
        assert_eq!(
            snapshot_at(now - Duration::minutes(11)).freshness(now),
            Freshness::Stale
        );
    }

    #[test]
    fn pv_surplus_clamps_to_zero() {
        let now = Utc::now();
        let mut snap = snapshot_at(now);
        assert_eq!(snap.pv_surplus_w(), 400.0);
        snap.pv_power_w = 100.0;
        assert_eq!(snap.pv_surplus_w(), 0.0);
    }

    #[test]
    fn out_of_range_soc_rejected() {
        let mut snap = snapshot_at(Utc::now());
        snap.soc_percent = 140.0;
        assert!(snap.validate().is_err());
        snap.soc_percent = f64::NAN;
        assert!(snap.validate().is_err());
    }
}
