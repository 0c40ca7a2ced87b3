pub mod control;
pub mod decisions;
pub mod error;
pub mod prices;
pub mod response;
pub mod status;

use axum::routing::{get, post};
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::coordinator::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/status", get(status::get_status))
        .route("/api/v1/current-state", get(status::get_current_state))
        .route("/api/v1/decisions", get(decisions::get_decisions))
        .route("/api/v1/prices", get(prices::get_prices))
        .route("/api/v1/control", post(control::post_control))
        .route("/api/v1/control/config", post(control::post_config_reload))
        .route("/healthz", get(healthz))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn healthz() -> axum::http::StatusCode {
    axum::http::StatusCode::OK
}
