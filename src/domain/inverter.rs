use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum_macros::Display;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::domain::snapshot::SystemSnapshot;

/// Inverter-specific errors
#[derive(Debug, Error)]
pub enum InverterError {
    #[error("Inverter unreachable: {0}")]
    Unreachable(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected: {0}")]
    CommandRejected(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationMode {
    /// Self-consumption default
    General,
    /// Discharge to grid up to the export limit
    EcoDischarge,
    /// Grid charging at the commanded power
    FastCharge,
}

/// Hybrid inverter driver - abstraction over the vendor protocol
#[async_trait]
pub trait Inverter: Send + Sync {
    async fn connect(&self) -> Result<(), InverterError>;
    async fn disconnect(&self) -> Result<(), InverterError>;
    async fn snapshot(&self) -> Result<SystemSnapshot, InverterError>;
    async fn set_operation_mode(
        &self,
        mode: OperationMode,
        power_percent: f64,
        min_soc: f64,
    ) -> Result<(), InverterError>;
    async fn set_grid_export_limit(&self, watts: f64) -> Result<(), InverterError>;
    async fn set_battery_dod(&self, percent: f64) -> Result<(), InverterError>;
    async fn start_fast_charge(&self) -> Result<(), InverterError>;
    async fn stop_fast_charge(&self) -> Result<(), InverterError>;
}

#[derive(Debug, Clone)]
struct SimulatedState {
    soc_percent: f64,
    battery_temp_c: f64,
    pv_power_w: f64,
    load_power_w: f64,
    grid_power_w: f64,
    grid_voltage_v: f64,
    mode: OperationMode,
    export_limit_w: f64,
    dod_percent: f64,
    fast_charging: bool,
}

/// Simulated inverter for development and tests
pub struct SimulatedInverter {
    state: Arc<RwLock<SimulatedState>>,
    connected: AtomicBool,
}

impl SimulatedInverter {
    pub fn new(initial_soc: f64) -> Self {
        Self {
            state: Arc::new(RwLock::new(SimulatedState {
                soc_percent: initial_soc,
                battery_temp_c: 25.0,
                pv_power_w: 0.0,
                load_power_w: 800.0,
                grid_power_w: 800.0,
                grid_voltage_v: 230.0,
                mode: OperationMode::General,
                export_limit_w: 0.0,
                dod_percent: 88.0,
                fast_charging: false,
            })),
            connected: AtomicBool::new(false),
        }
    }

    /// Drive the simulated household for tests and demo runs.
    pub async fn set_readings(&self, pv_power_w: f64, load_power_w: f64, soc_percent: f64) {
        let mut st = self.state.write().await;
        st.pv_power_w = pv_power_w;
        st.load_power_w = load_power_w;
        st.soc_percent = soc_percent.clamp(0.0, 100.0);
        st.grid_power_w = load_power_w - pv_power_w;
        // small measurement jitter keeps dashboards honest
        st.grid_voltage_v = 230.0 + (rand::random::<f64>() - 0.5) * 2.0;
    }

    pub async fn current_mode(&self) -> OperationMode {
        self.state.read().await.mode
    }

    pub async fn export_limit_w(&self) -> f64 {
        self.state.read().await.export_limit_w
    }

    pub async fn is_fast_charging(&self) -> bool {
        self.state.read().await.fast_charging
    }

    fn ensure_connected(&self) -> Result<(), InverterError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(InverterError::NotConnected)
        }
    }
}

#[async_trait]
impl Inverter for SimulatedInverter {
    async fn connect(&self) -> Result<(), InverterError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), InverterError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn snapshot(&self) -> Result<SystemSnapshot, InverterError> {
        self.ensure_connected()?;
        let st = self.state.read().await;
        Ok(SystemSnapshot {
            soc_percent: st.soc_percent,
            battery_temp_c: st.battery_temp_c,
            pv_power_w: st.pv_power_w,
            load_power_w: st.load_power_w,
            grid_power_w: st.grid_power_w,
            grid_voltage_v: st.grid_voltage_v,
            timestamp: Utc::now(),
        })
    }

    async fn set_operation_mode(
        &self,
        mode: OperationMode,
        power_percent: f64,
        min_soc: f64,
    ) -> Result<(), InverterError> {
        self.ensure_connected()?;
        if !(0.0..=100.0).contains(&power_percent) {
            return Err(InverterError::InvalidParameter(format!(
                "power_percent out of range: {power_percent}"
            )));
        }
        if !(0.0..=100.0).contains(&min_soc) {
            return Err(InverterError::InvalidParameter(format!(
                "min_soc out of range: {min_soc}"
            )));
        }
        let mut st = self.state.write().await;
        st.mode = mode;
        Ok(())
    }

    async fn set_grid_export_limit(&self, watts: f64) -> Result<(), InverterError> {
        self.ensure_connected()?;
        if !watts.is_finite() || watts < 0.0 {
            return Err(InverterError::InvalidParameter(format!(
                "export limit invalid: {watts}"
            )));
        }
        self.state.write().await.export_limit_w = watts;
        Ok(())
    }

    async fn set_battery_dod(&self, percent: f64) -> Result<(), InverterError> {
        self.ensure_connected()?;
        if !(0.0..=100.0).contains(&percent) {
            return Err(InverterError::InvalidParameter(format!(
                "dod out of range: {percent}"
            )));
        }
        self.state.write().await.dod_percent = percent;
        Ok(())
    }

    async fn start_fast_charge(&self) -> Result<(), InverterError> {
        self.ensure_connected()?;
        let mut st = self.state.write().await;
        st.fast_charging = true;
        st.mode = OperationMode::FastCharge;
        Ok(())
    }

    async fn stop_fast_charge(&self) -> Result<(), InverterError> {
        self.ensure_connected()?;
        let mut st = self.state.write().await;
        st.fast_charging = false;
        st.mode = OperationMode::General;
        Ok(())
    }
}

#[cfg(test)]
mockall::mock! {
    pub TestInverter {}

    #[async_trait]
    impl Inverter for TestInverter {
        async fn connect(&self) -> Result<(), InverterError>;
        async fn disconnect(&self) -> Result<(), InverterError>;
        async fn snapshot(&self) -> Result<SystemSnapshot, InverterError>;
        async fn set_operation_mode(
            &self,
            mode: OperationMode,
            power_percent: f64,
            min_soc: f64,
        ) -> Result<(), InverterError>;
        async fn set_grid_export_limit(&self, watts: f64) -> Result<(), InverterError>;
        async fn set_battery_dod(&self, percent: f64) -> Result<(), InverterError>;
        async fn start_fast_charge(&self) -> Result<(), InverterError>;
        async fn stop_fast_charge(&self) -> Result<(), InverterError>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn commands_require_connection() {
        let inverter = SimulatedInverter::new(50.0);
        assert!(matches!(
            inverter.snapshot().await,
            Err(InverterError::NotConnected)
        ));

        inverter.connect().await.unwrap();
        assert!(inverter.snapshot().await.is_ok());
    }

    #[tokio::test]
    async fn fast_charge_switches_mode() {
        let inverter = SimulatedInverter::new(50.0);
        inverter.connect().await.unwrap();

        inverter.start_fast_charge().await.unwrap();
        assert!(inverter.is_fast_charging().await);
        assert_eq!(inverter.current_mode().await, OperationMode::FastCharge);

        inverter.stop_fast_charge().await.unwrap();
        assert!(!inverter.is_fast_charging().await);
        assert_eq!(inverter.current_mode().await, OperationMode::General);
    }

    #[tokio::test]
    async fn export_limit_rejects_negative() {
        let inverter = SimulatedInverter::new(50.0);
        inverter.connect().await.unwrap();
        assert!(inverter.set_grid_export_limit(-100.0).await.is_err());
        inverter.set_grid_export_limit(5000.0).await.unwrap();
        assert_eq!(inverter.export_limit_w().await, 5000.0);
    }

    #[tokio::test]
    async fn mode_parameters_validated() {
        let inverter = SimulatedInverter::new(50.0);
        inverter.connect().await.unwrap();
        assert!(inverter
            .set_operation_mode(OperationMode::EcoDischarge, 120.0, 50.0)
            .await
            .is_err());
        assert!(inverter
            .set_operation_mode(OperationMode::EcoDischarge, 80.0, 50.0)
            .await
            .is_ok());
    }
}
