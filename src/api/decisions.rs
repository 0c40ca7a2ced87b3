use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::{
    api::{error::ApiError, response::ApiResponse},
    coordinator::AppState,
    domain::DecisionRecord,
};

#[derive(Debug, Deserialize)]
pub struct DecisionsQuery {
    #[serde(default = "default_time_range")]
    pub time_range: String,
}

fn default_time_range() -> String {
    "24h".to_string()
}

/// GET /api/v1/decisions?time_range=24h|7d
pub async fn get_decisions(
    State(state): State<AppState>,
    Query(query): Query<DecisionsQuery>,
) -> Result<Json<ApiResponse<Vec<DecisionRecord>>>, ApiError> {
    let lookback = match query.time_range.as_str() {
        "24h" => Duration::hours(24),
        "7d" => Duration::days(7),
        other => {
            return Err(ApiError::BadRequest(format!(
                "unsupported time_range '{other}', expected 24h or 7d"
            )))
        }
    };

    let now = Utc::now();
    let records = state
        .coordinator
        .store()
        .decisions_between(now - lookback, now)
        .await?;
    Ok(Json(ApiResponse::success(records)))
}
