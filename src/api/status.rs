use axum::{extract::State, Json};
use chrono::Utc;
use serde::Serialize;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    coordinator::{AppState, CoordinatorStatus},
    domain::SystemSnapshot,
};

/// GET /api/v1/status - coordinator liveness, sessions, thresholds, cache ages
pub async fn get_status(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CoordinatorStatus>>, ApiError> {
    Ok(Json(ApiResponse::success(state.coordinator.status())))
}

#[derive(Debug, Serialize)]
pub struct CurrentState {
    pub snapshot: SystemSnapshot,
    pub current_price_pln_kwh: Option<f64>,
    pub high_price_threshold: f64,
    pub critical_charge_threshold: f64,
    pub efficiency_score: f64,
}

/// GET /api/v1/current-state - latest snapshot plus pricing and derived scores
pub async fn get_current_state(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<CurrentState>>, ApiError> {
    let coordinator = &state.coordinator;
    let snapshot = coordinator.latest_snapshot().ok_or_else(|| {
        ApiError::ServiceUnavailable("no inverter snapshot available yet".to_string())
    })?;

    let status = coordinator.status();
    let current_price = coordinator.price_curve().effective_at(Utc::now());

    Ok(Json(ApiResponse::success(CurrentState {
        snapshot,
        current_price_pln_kwh: current_price,
        high_price_threshold: status.high_price_threshold,
        critical_charge_threshold: status.critical_charge_threshold,
        efficiency_score: status.efficiency_score,
    })))
}
