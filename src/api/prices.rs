use axum::{extract::State, Json};
use serde::Serialize;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    coordinator::AppState,
    domain::PricePoint,
};

#[derive(Debug, Serialize)]
pub struct PricesResponse {
    pub points: Vec<PricePoint>,
}

/// GET /api/v1/prices - today's normalised price curve
pub async fn get_prices(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<PricesResponse>>, ApiError> {
    let curve = state.coordinator.price_curve();
    if curve.is_empty() {
        return Err(ApiError::ServiceUnavailable(
            "price curve not loaded yet".to_string(),
        ));
    }
    Ok(Json(ApiResponse::success(PricesResponse {
        points: curve.points().to_vec(),
    })))
}
