use axum::{
    extract::{ConnectInfo, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    coordinator::{AppState, ForceCommand},
};

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub command: ForceCommand,
}

#[derive(Debug, Serialize)]
pub struct ControlAccepted {
    pub command: ForceCommand,
}

/// POST /api/v1/control - one-shot force action, accepted from localhost only
pub async fn post_control(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(request): Json<ControlRequest>,
) -> Result<Json<ApiResponse<ControlAccepted>>, ApiError> {
    require_loopback(addr)?;

    state
        .coordinator
        .submit_force_action(request.command)
        .map_err(|e| ApiError::InternalError(e.to_string()))?;
    info!(command = ?request.command, %addr, "force action accepted");

    Ok(Json(ApiResponse::success(ControlAccepted {
        command: request.command,
    })))
}

/// POST /api/v1/control/config - re-read configuration, accepted from localhost only
pub async fn post_config_reload(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<Json<ApiResponse<&'static str>>, ApiError> {
    require_loopback(addr)?;

    state
        .coordinator
        .reload_config()
        .map_err(|e| ApiError::BadRequest(format!("config reload failed: {e}")))?;
    Ok(Json(ApiResponse::success("configuration reloaded")))
}

fn require_loopback(addr: SocketAddr) -> Result<(), ApiError> {
    if addr.ip().is_loopback() {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}
