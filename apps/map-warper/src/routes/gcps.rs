use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::AppResult;
use crate::routes::MessageResponse;
use crate::services::gcps::{suggest_initial_placements, Gcp, GcpDraft, ResidualReport};
use crate::state::AppState;

#[derive(Debug, Clone, Default, serde::Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct GcpListQuery {
    /// Include soft (suggested) points.
    #[serde(default)]
    soft: bool,
}

#[utoipa::path(
    get,
    path = "/api/maps/{id}/gcps",
    tag = "gcps",
    params(("id" = Uuid, Path, description = "Map id"), GcpListQuery),
    responses(
        (status = 200, description = "Control points with residual error", body = ResidualReport),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn list_gcps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<GcpListQuery>,
) -> AppResult<Json<ResidualReport>> {
    let record = state.maps.get(id)?;
    let fit = record
        .transform_options
        .fit_kind(record.gcps.hard_count());
    Ok(Json(record.gcps.with_residual_error(fit, query.soft)))
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/gcps",
    tag = "gcps",
    request_body = GcpDraft,
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 201, description = "Created control point", body = Gcp),
        (status = 400, description = "Coordinates invalid or outside the raster"),
        (status = 409, description = "Map is busy or locked")
    )
)]
pub(crate) async fn create_gcp(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(draft): Json<GcpDraft>,
) -> AppResult<(StatusCode, Json<Gcp>)> {
    let gcp = state.maps.update(id, |record| {
        record.status.ensure_mutable()?;
        let (width, height) = record.dimensions()?;
        record.gcps.add_or_update(None, &draft, width, height)
    })?;
    Ok((StatusCode::CREATED, Json(gcp)))
}

#[utoipa::path(
    put,
    path = "/api/maps/{id}/gcps/{gcp_id}",
    tag = "gcps",
    request_body = GcpDraft,
    params(
        ("id" = Uuid, Path, description = "Map id"),
        ("gcp_id" = Uuid, Path, description = "Control point id")
    ),
    responses(
        (status = 200, description = "Updated control point", body = Gcp),
        (status = 404, description = "Map or control point not found"),
        (status = 409, description = "Map is busy or locked")
    )
)]
pub(crate) async fn update_gcp(
    State(state): State<AppState>,
    Path((id, gcp_id)): Path<(Uuid, Uuid)>,
    Json(draft): Json<GcpDraft>,
) -> AppResult<Json<Gcp>> {
    let gcp = state.maps.update(id, |record| {
        record.status.ensure_mutable()?;
        let (width, height) = record.dimensions()?;
        record.gcps.add_or_update(Some(gcp_id), &draft, width, height)
    })?;
    Ok(Json(gcp))
}

#[utoipa::path(
    delete,
    path = "/api/maps/{id}/gcps/{gcp_id}",
    tag = "gcps",
    params(
        ("id" = Uuid, Path, description = "Map id"),
        ("gcp_id" = Uuid, Path, description = "Control point id")
    ),
    responses(
        (status = 200, description = "Removed control point", body = Gcp),
        (status = 404, description = "Map or control point not found")
    )
)]
pub(crate) async fn delete_gcp(
    State(state): State<AppState>,
    Path((id, gcp_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<Gcp>> {
    let gcp = state.maps.update(id, |record| {
        record.status.ensure_mutable()?;
        record.gcps.remove(gcp_id)
    })?;
    Ok(Json(gcp))
}

#[utoipa::path(
    delete,
    path = "/api/maps/{id}/gcps",
    tag = "gcps",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "All control points removed", body = MessageResponse),
        (status = 409, description = "Map is busy or locked")
    )
)]
pub(crate) async fn clear_gcps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    let removed = state.maps.update(id, |record| {
        record.status.ensure_mutable()?;
        let removed = record.gcps.len();
        record.gcps.clear();
        Ok(removed)
    })?;
    Ok(Json(MessageResponse::new(format!(
        "{removed} control points removed"
    ))))
}

#[utoipa::path(
    get,
    path = "/api/maps/{id}/gcps/suggestions",
    tag = "gcps",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Suggested soft control points (may be empty)", body = Vec<Gcp>),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn suggest_gcps(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<Gcp>>> {
    let record = state.maps.get(id)?;
    let (width, height) = record.dimensions()?;
    let suggestions = suggest_initial_placements(
        &state.http,
        state.config.geocoder_url.as_deref(),
        &record.gcps,
        &record.title,
        record.description.as_deref(),
        width,
        height,
    )
    .await;
    Ok(Json(suggestions))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/maps/{id}/gcps",
            get(list_gcps).post(create_gcp).delete(clear_gcps),
        )
        .route("/maps/{id}/gcps/suggestions", get(suggest_gcps))
        .route(
            "/maps/{id}/gcps/{gcp_id}",
            put(update_gcp).delete(delete_gcp),
        )
}
