use anyhow::Result;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

use crate::storage::write_atomic;

/// Daily SOC-drop ledger: how many battery percent each local date spent on
/// grid export. Entries older than 7 days are evicted; every mutation is
/// persisted via temp-file + rename.
pub struct SocDropLedger {
    path: PathBuf,
    entries: Mutex<BTreeMap<NaiveDate, f64>>,
}

const LEDGER_RETENTION_DAYS: i64 = 7;

impl SocDropLedger {
    pub fn load(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join("daily_soc_drops.json");
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "discarding unreadable SOC-drop ledger");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    pub fn drop_for(&self, date: NaiveDate) -> f64 {
        self.entries.lock().get(&date).copied().unwrap_or(0.0)
    }

    /// Book a finished selling session's SOC drop and persist atomically.
    pub fn record_drop(&self, date: NaiveDate, drop_percent: f64) -> Result<()> {
        if drop_percent <= 0.0 {
            return Ok(());
        }
        let snapshot = {
            let mut entries = self.entries.lock();
            *entries.entry(date).or_insert(0.0) += drop_percent;
            let cutoff = date - Duration::days(LEDGER_RETENTION_DAYS);
            *entries = entries.split_off(&cutoff);
            entries.clone()
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&snapshot)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PartialSessions {
    timestamps: Vec<DateTime<Utc>>,
}

/// Ledger of partial charging sessions, keyed by a local "charging day"
/// that rolls over at the configured reset hour (default 06:00), not at
/// midnight.
pub struct PartialSessionLedger {
    path: PathBuf,
    timestamps: Mutex<Vec<DateTime<Utc>>>,
}

impl PartialSessionLedger {
    pub fn load(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join("partial_charging_sessions.json");
        let timestamps = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<PartialSessions>(&bytes) {
                Ok(sessions) => sessions.timestamps,
                Err(e) => {
                    warn!(error = %e, "discarding unreadable partial-session ledger");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };
        Self {
            path,
            timestamps: Mutex::new(timestamps),
        }
    }

    /// The "charging day" a timestamp belongs to: local date, shifted back
    /// one day for times before the reset hour.
    fn charging_day(ts: DateTime<Utc>, tz: Tz, reset_hour: u32) -> NaiveDate {
        use chrono::Timelike;
        let local = ts.with_timezone(&tz);
        if local.hour() < reset_hour {
            local.date_naive() - Duration::days(1)
        } else {
            local.date_naive()
        }
    }

    pub fn count_today(&self, now: DateTime<Utc>, tz: Tz, reset_hour: u32) -> u32 {
        let today = Self::charging_day(now, tz, reset_hour);
        self.timestamps
            .lock()
            .iter()
            .filter(|ts| Self::charging_day(**ts, tz, reset_hour) == today)
            .count() as u32
    }

    pub fn record(&self, now: DateTime<Utc>, tz: Tz, reset_hour: u32) -> Result<()> {
        let snapshot = {
            let mut timestamps = self.timestamps.lock();
            timestamps.push(now);
            let today = Self::charging_day(now, tz, reset_hour);
            let cutoff = today - Duration::days(LEDGER_RETENTION_DAYS);
            timestamps.retain(|ts| Self::charging_day(*ts, tz, reset_hour) >= cutoff);
            PartialSessions {
                timestamps: timestamps.clone(),
            }
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&snapshot)?)
    }
}
