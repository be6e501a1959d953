use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::services::lifecycle::MapStatus;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub maps: usize,
    /// Maps with a warp in flight.
    pub warping: usize,
    pub persistent: bool,
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "OK", body = HealthResponse))
)]
pub(crate) async fn healthz_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let maps = state.maps.list();
    Json(HealthResponse {
        status: "ok".to_string(),
        maps: maps.len(),
        warping: maps
            .iter()
            .filter(|record| record.status == MapStatus::Warping)
            .count(),
        persistent: state.config.database_url.is_some(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz_handler))
}
