use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::domain::{DecisionKind, DecisionRecord, SystemSnapshot};

/// Persistence collaborator for the decision log and system-state history.
///
/// The core depends only on this trait; the shipped implementation appends
/// JSON lines under the data directory.
#[async_trait]
pub trait DecisionStore: Send + Sync {
    async fn append_decision(&self, record: &DecisionRecord) -> Result<()>;
    async fn append_system_state(&self, snapshot: &SystemSnapshot) -> Result<()>;
    async fn decisions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>>;
    async fn recent_system_state(&self, limit: usize) -> Result<Vec<SystemSnapshot>>;
    async fn monthly_summary(&self, year: i32, month: u32) -> Result<MonthlySummary>;
}

#[derive(Debug, Clone, Serialize)]
pub struct MonthlySummary {
    pub year: i32,
    pub month: u32,
    pub charge_decisions: u64,
    pub sell_decisions: u64,
    pub wait_decisions: u64,
    pub average_confidence: f64,
}

/// JSON-lines file store.
pub struct JsonlStore {
    decisions_path: PathBuf,
    state_path: PathBuf,
}

impl JsonlStore {
    pub fn new(data_dir: &std::path::Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("creating data directory {}", data_dir.display()))?;
        Ok(Self {
            decisions_path: data_dir.join("decisions.jsonl"),
            state_path: data_dir.join("system_state.jsonl"),
        })
    }

    async fn append_line<T: Serialize>(&self, path: &PathBuf, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn read_decisions(&self) -> Result<Vec<DecisionRecord>> {
        let content = match tokio::fs::read_to_string(&self.decisions_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading decision log"),
        };
        let mut records = Vec::new();
        for line in content.lines() {
            match serde_json::from_str::<DecisionRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => debug!(error = %e, "skipping unreadable decision line"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl DecisionStore for JsonlStore {
    async fn append_decision(&self, record: &DecisionRecord) -> Result<()> {
        self.append_line(&self.decisions_path, record).await
    }

    async fn append_system_state(&self, snapshot: &SystemSnapshot) -> Result<()> {
        self.append_line(&self.state_path, snapshot).await
    }

    async fn decisions_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DecisionRecord>> {
        Ok(self
            .read_decisions()
            .await?
            .into_iter()
            .filter(|r| r.timestamp >= from && r.timestamp <= to)
            .collect())
    }

    async fn recent_system_state(&self, limit: usize) -> Result<Vec<SystemSnapshot>> {
        let content = match tokio::fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading state log"),
        };
        let mut snapshots: Vec<SystemSnapshot> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        let keep_from = snapshots.len().saturating_sub(limit);
        Ok(snapshots.split_off(keep_from))
    }

    async fn monthly_summary(&self, year: i32, month: u32) -> Result<MonthlySummary> {
        let records = self.read_decisions().await?;
        let monthly: Vec<&DecisionRecord> = records
            .iter()
            .filter(|r| r.timestamp.year() == year && r.timestamp.month() == month)
            .collect();

        let count = |kind: DecisionKind| monthly.iter().filter(|r| r.kind == kind).count() as u64;
        let average_confidence = if monthly.is_empty() {
            0.0
        } else {
            monthly.iter().map(|r| r.confidence).sum::<f64>() / monthly.len() as f64
        };

        Ok(MonthlySummary {
            year,
            month,
            charge_decisions: count(DecisionKind::Charge),
            sell_decisions: count(DecisionKind::Sell),
            wait_decisions: count(DecisionKind::Wait),
            average_confidence,
        })
    }
}
