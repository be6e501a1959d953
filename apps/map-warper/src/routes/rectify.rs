use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::{AppResult, WarpError};
use crate::services::rectify::{RectifyJob, RectifyOptions};
use crate::state::AppState;

#[utoipa::path(
    post,
    path = "/api/maps/{id}/rectify",
    tag = "rectify",
    request_body = RectifyOptions,
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 202, description = "Warp queued; map is now warping", body = RectifyJob),
        (status = 409, description = "Map is busy, locked or not loaded"),
        (status = 422, description = "Too few hard control points, or no masked raster")
    )
)]
pub(crate) async fn start_rectify(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(options): Json<RectifyOptions>,
) -> AppResult<(StatusCode, Json<RectifyJob>)> {
    let job = state.rectifier.rectify(id, &options)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

#[utoipa::path(
    get,
    path = "/api/rectify/jobs/{job_id}",
    tag = "rectify",
    params(("job_id" = Uuid, Path, description = "Job id")),
    responses(
        (status = 200, description = "Job", body = RectifyJob),
        (status = 404, description = "Job not found")
    )
)]
pub(crate) async fn get_rectify_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<RectifyJob>> {
    let job = state
        .rectifier
        .get_job(job_id)
        .ok_or_else(|| WarpError::not_found(format!("rectify job {job_id}")))?;
    Ok(Json(job))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/maps/{id}/rectify", post(start_rectify))
        .route("/rectify/jobs/{job_id}", get(get_rectify_job))
}
