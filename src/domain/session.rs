use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A recorded intention to charge at a specific future window, paired with
/// a bounded postponement count so the engine cannot defer forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowCommitment {
    pub window_time: DateTime<Utc>,
    pub window_price_pln_kwh: f64,
}

/// An active grid-charging session. At most one exists at a time; only the
/// charging engine produces mutations for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSession {
    pub start_time: DateTime<Utc>,
    pub start_soc: f64,
    pub target_soc: f64,
    /// No price-based stop rule fires before this instant
    pub protected_until: DateTime<Utc>,
}

impl ChargingSession {
    pub fn is_protected(&self, now: DateTime<Utc>) -> bool {
        now < self.protected_until
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SellingStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

/// An active grid-export session, owned by the selling engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellingSession {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub start_soc: f64,
    /// Safety-margin SOC at which the session ends
    pub target_soc: f64,
    pub selling_power_w: f64,
    pub expected_revenue_pln: f64,
    pub status: SellingStatus,
}

impl SellingSession {
    /// Sessions stop once SOC falls to target + 1 % (hysteresis band so a
    /// noisy reading does not restart the export).
    pub fn reached_target(&self, soc_percent: f64) -> bool {
        soc_percent <= self.target_soc + 1.0
    }

    pub fn soc_drop(&self, end_soc: f64) -> f64 {
        (self.start_soc - end_soc).max(0.0)
    }
}
