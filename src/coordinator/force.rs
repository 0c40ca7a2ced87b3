use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

use crate::storage::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForceCommand {
    Charge,
    Discharge,
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForceAction {
    pub command: ForceCommand,
    pub issued_at: DateTime<Utc>,
}

/// File-backed one-shot operator command.
///
/// Consumption is at-most-once: after a record is consumed, re-reading the
/// same file (same `issued_at`) is a no-op until a newer record replaces it.
pub struct ForceActionFile {
    path: PathBuf,
    last_consumed: Mutex<Option<DateTime<Utc>>>,
}

impl ForceActionFile {
    pub fn new(data_dir: &std::path::Path) -> Self {
        Self {
            path: data_dir.join("force_action.json"),
            last_consumed: Mutex::new(None),
        }
    }

    /// Write a new force action (HTTP control endpoint and tests).
    pub fn submit(&self, command: ForceCommand, now: DateTime<Utc>) -> anyhow::Result<()> {
        let action = ForceAction {
            command,
            issued_at: now,
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&action)?)
    }

    /// Take the pending action if one exists, is unexpired, and has not
    /// been consumed before.
    pub fn consume(&self, now: DateTime<Utc>, ttl: Duration) -> Option<ForceAction> {
        let bytes = std::fs::read(&self.path).ok()?;
        let action: ForceAction = match serde_json::from_slice(&bytes) {
            Ok(action) => action,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable force action file");
                return None;
            }
        };

        if now - action.issued_at > ttl {
            return None;
        }

        let mut last = self.last_consumed.lock();
        if *last == Some(action.issued_at) {
            return None;
        }
        *last = Some(action.issued_at);
        Some(action)
    }
}
