use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{AppResult, WarpError};
use crate::routes::MessageResponse;
use crate::services::maps::{MapView, NewMap, UploadedRaster};
use crate::state::AppState;

/// Raster handed over by the upload collaborator. Relative paths resolve
/// against the uploads directory.
#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UploadPayload {
    path: String,
    width: u32,
    height: u32,
}

impl UploadPayload {
    fn resolve(&self, state: &AppState) -> Result<UploadedRaster, WarpError> {
        let uploads = state.config.uploads_dir();
        let raw = PathBuf::from(self.path.trim());
        let path = if raw.is_absolute() {
            raw
        } else {
            uploads.join(raw)
        };
        UploadedRaster::validate(&path, self.width, self.height, &uploads)
    }
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct RegisterMapRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    srs: Option<String>,
    upload: UploadPayload,
}

#[utoipa::path(
    get,
    path = "/api/maps",
    tag = "maps",
    responses((status = 200, description = "Maps", body = Vec<MapView>))
)]
pub(crate) async fn list_maps(State(state): State<AppState>) -> Json<Vec<MapView>> {
    Json(state.maps.list().iter().map(|record| record.view()).collect())
}

#[utoipa::path(
    post,
    path = "/api/maps",
    tag = "maps",
    request_body = RegisterMapRequest,
    responses(
        (status = 201, description = "Registered map", body = MapView),
        (status = 400, description = "Invalid title or upload")
    )
)]
pub(crate) async fn create_map(
    State(state): State<AppState>,
    Json(payload): Json<RegisterMapRequest>,
) -> AppResult<(StatusCode, Json<MapView>)> {
    let upload = payload.upload.resolve(&state)?;
    let record = state.maps.register(
        NewMap {
            title: payload.title,
            description: payload.description,
            srs: payload.srs,
        },
        upload,
    )?;
    Ok((StatusCode::CREATED, Json(record.view())))
}

#[utoipa::path(
    get,
    path = "/api/maps/{id}",
    tag = "maps",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Map", body = MapView),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn get_map(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MapView>> {
    Ok(Json(state.maps.get(id)?.view()))
}

#[utoipa::path(
    delete,
    path = "/api/maps/{id}",
    tag = "maps",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Map destroyed", body = MessageResponse),
        (status = 404, description = "Map not found"),
        (status = 409, description = "Map is warping")
    )
)]
pub(crate) async fn delete_map(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MessageResponse>> {
    let record = state.maps.destroy(id)?;
    state.publisher.forget(id).await;
    Ok(Json(MessageResponse::new(format!(
        "Map '{}' deleted",
        record.title
    ))))
}

#[utoipa::path(
    put,
    path = "/api/maps/{id}/upload",
    tag = "maps",
    request_body = UploadPayload,
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Raster replaced; derived state discarded", body = MapView),
        (status = 409, description = "Map is warping")
    )
)]
pub(crate) async fn reupload_map(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UploadPayload>,
) -> AppResult<Json<MapView>> {
    let upload = payload.resolve(&state)?;
    let record = state.maps.reupload(id, upload)?;
    state.publisher.forget(id).await;
    Ok(Json(record.view()))
}

#[utoipa::path(
    get,
    path = "/api/maps/{id}/status",
    tag = "maps",
    params(("id" = Uuid, Path, description = "Map id")),
    responses(
        (status = 200, description = "Lifecycle status as plain text", body = String),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn map_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<&'static str> {
    Ok(state.maps.get(id)?.status.probe_text())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/maps", get(list_maps).post(create_map))
        .route("/maps/{id}", get(get_map).delete(delete_map))
        .route("/maps/{id}/upload", put(reupload_map))
        .route("/maps/{id}/status", get(map_status))
}
