use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::domain::session::{SellingSession, WindowCommitment};
use crate::domain::snapshot::SystemSnapshot;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Priority {
    Emergency,
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DecisionKind {
    Charge,
    Sell,
    Wait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// State changes the charging engine wants applied.
///
/// The engine itself is pure; the coordinator applies these under a single
/// lock so concurrent readers never observe a half-updated session.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeMutation {
    StartSession {
        start_soc: f64,
        target_soc: f64,
        protected_until: DateTime<Utc>,
    },
    CloseSession,
    CommitWindow(WindowCommitment),
    ClearCommitment,
    IncrementPostponement,
    ClearDeferral,
    RecordPartialSession,
    IncrementDailySessions,
    MarkFullCharge {
        soc: f64,
    },
}

/// Outcome of one charging evaluation.
#[derive(Debug, Clone)]
pub struct ChargeDecision {
    pub should_charge: bool,
    pub target_soc: Option<f64>,
    pub reason: String,
    pub priority: Priority,
    pub confidence: f64,
    pub mutations: Vec<ChargeMutation>,
}

impl ChargeDecision {
    pub fn charge(reason: impl Into<String>, priority: Priority, confidence: f64) -> Self {
        Self {
            should_charge: true,
            target_soc: None,
            reason: reason.into(),
            priority,
            confidence,
            mutations: Vec::new(),
        }
    }

    pub fn wait(reason: impl Into<String>, priority: Priority, confidence: f64) -> Self {
        Self {
            should_charge: false,
            target_soc: None,
            reason: reason.into(),
            priority,
            confidence,
            mutations: Vec::new(),
        }
    }

    pub fn with_target(mut self, target_soc: f64) -> Self {
        self.target_soc = Some(target_soc);
        self
    }

    pub fn with_mutation(mut self, mutation: ChargeMutation) -> Self {
        self.mutations.push(mutation);
        self
    }
}

/// State changes the selling engine wants applied.
#[derive(Debug, Clone, PartialEq)]
pub enum SellMutation {
    StartSession(SellingSession),
    /// Close the active session and book its SOC drop into the daily ledger
    CloseSession {
        end_soc: f64,
        status: super::session::SellingStatus,
    },
    IncrementDailyCycles,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SellAction {
    Start {
        power_w: f64,
        min_soc: f64,
        estimated_duration_hours: f64,
    },
    Continue,
    Stop,
    Wait,
}

/// Outcome of one selling evaluation.
#[derive(Debug, Clone)]
pub struct SellDecision {
    pub action: SellAction,
    pub expected_revenue_pln: f64,
    pub reason: String,
    pub confidence: f64,
    pub risk_level: RiskLevel,
    pub mutations: Vec<SellMutation>,
}

impl SellDecision {
    pub fn wait(reason: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            action: SellAction::Wait,
            expected_revenue_pln: 0.0,
            reason: reason.into(),
            confidence: 0.0,
            risk_level,
            mutations: Vec::new(),
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self.action, SellAction::Start { .. })
    }
}

/// The single action the coordinator resolved this tick to.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedAction {
    Charge { target_soc: f64 },
    StartSelling { power_w: f64, min_soc: f64 },
    ContinueSelling,
    StopSelling,
    StopCharging,
    Wait,
}

/// Reporting metrics attached to every decision record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub current_price_pln_kwh: Option<f64>,
    pub high_price_threshold: f64,
    pub critical_charge_threshold: f64,
    pub efficiency_score: f64,
}

/// Append-only audit entry, consumed by the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: DecisionKind,
    pub action: String,
    pub reason: String,
    pub confidence: f64,
    pub priority: Priority,
    pub snapshot: SystemSnapshot,
    pub metrics: DerivedMetrics,
}
