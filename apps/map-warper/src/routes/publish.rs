use axum::extract::{Path, Query, State};
use axum::routing::post;
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::services::lifecycle::MapStatus;
use crate::state::AppState;

#[derive(Debug, Clone, serde::Deserialize, utoipa::IntoParams)]
#[into_params(parameter_in = Query)]
pub(crate) struct PublishQuery {
    /// `publish` or `unpublish`.
    to: String,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct PublishResponse {
    status: MapStatus,
}

#[utoipa::path(
    post,
    path = "/api/maps/{id}/publish",
    tag = "publish",
    params(("id" = Uuid, Path, description = "Map id"), PublishQuery),
    responses(
        (status = 200, description = "Status after the request; unchanged when not applicable", body = PublishResponse),
        (status = 400, description = "Unknown target"),
        (status = 404, description = "Map not found")
    )
)]
pub(crate) async fn publish_map(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<PublishQuery>,
) -> AppResult<Json<PublishResponse>> {
    let status = match query.to.trim().to_ascii_lowercase().as_str() {
        "publish" => state.publisher.publish(id)?,
        "unpublish" => state.publisher.unpublish(id).await?,
        other => {
            return Err(AppError::bad_request(format!(
                "unknown publish target '{other}'"
            )))
        }
    };
    Ok(Json(PublishResponse { status }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/maps/{id}/publish", post(publish_map))
}
