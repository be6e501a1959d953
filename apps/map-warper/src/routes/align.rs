use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::AppResult;
use crate::services::align::{AlignOutcome, AlignRequest};
use crate::services::rectify::{RectifyJob, RectifyOptions};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct AlignMapRequest {
    #[serde(flatten)]
    align: AlignRequest,
    /// Queue a rectification with the derived points right away.
    #[serde(default)]
    warp: bool,
    #[serde(default)]
    options: RectifyOptions,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct AlignMapResponse {
    alignment: AlignOutcome,
    job: Option<RectifyJob>,
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/align",
    tag = "align",
    request_body = AlignMapRequest,
    params(("id" = Uuid, Path, description = "Destination map id")),
    responses(
        (status = 200, description = "Control points derived", body = AlignMapResponse),
        (status = 409, description = "Destination busy, locked or not loaded"),
        (status = 422, description = "Unsupported direction or too few source control points")
    )
)]
pub(crate) async fn align_map(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<AlignMapRequest>,
) -> AppResult<Json<AlignMapResponse>> {
    let alignment = state.aligner.align_with(id, &payload.align)?;
    let job = if payload.warp {
        Some(state.rectifier.rectify(id, &payload.options)?)
    } else {
        None
    };
    Ok(Json(AlignMapResponse { alignment, job }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/maps/{id}/align", post(align_map))
}
