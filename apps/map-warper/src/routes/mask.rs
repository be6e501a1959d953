use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::AppResult;
use crate::routes::MessageResponse;
use crate::services::mask::MaskPolygon;
use crate::services::rectify::{RectifyJob, RectifyOptions};
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct MaskWarpRequest {
    mask: MaskPolygon,
    #[serde(default)]
    options: RectifyOptions,
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/mask",
    tag = "mask",
    request_body = MaskPolygon,
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Mask saved", body = MessageResponse),
        (status = 400, description = "Degenerate polygon"),
        (status = 409, description = "Map is busy or locked")
    )
)]
pub(crate) async fn save_mask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(polygon): Json<MaskPolygon>,
) -> AppResult<Json<MessageResponse>> {
    let message = state.masks.save(id, &polygon).await?;
    Ok(Json(MessageResponse::new(message)))
}

#[utoipa::path(
    delete,
    path = "/api/maps/{id}/mask",
    tag = "mask",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Mask removed", body = MessageResponse),
        (status = 409, description = "Map is busy or locked")
    )
)]
pub(crate) async fn delete_mask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    let message = state.masks.delete(id).await?;
    Ok(Json(MessageResponse::new(message)))
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/mask/apply",
    tag = "mask",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Masked raster produced", body = MessageResponse),
        (status = 422, description = "No mask saved"),
        (status = 502, description = "Mask tool failed; body carries its output")
    )
)]
pub(crate) async fn apply_mask(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    let message = state.masks.apply(id).await?;
    Ok(Json(MessageResponse::new(message)))
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/mask/warp",
    tag = "mask",
    request_body = MaskWarpRequest,
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 202, description = "Mask applied and warp queued", body = RectifyJob),
        (status = 409, description = "Map is busy or locked"),
        (status = 422, description = "Too few hard control points")
    )
)]
pub(crate) async fn mask_and_warp(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<MaskWarpRequest>,
) -> AppResult<(StatusCode, Json<RectifyJob>)> {
    let job = state
        .masks
        .save_and_warp(id, &payload.mask, payload.options)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/maps/{id}/mask", post(save_mask).delete(delete_mask))
        .route("/maps/{id}/mask/apply", post(apply_mask))
        .route("/maps/{id}/mask/warp", post(mask_and_warp))
}
