use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value as JsonValue;
use utoipa::OpenApi;

use crate::state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(title = "map-warper", description = "Map rectification and tile serving"),
    paths(
        crate::routes::health::healthz_handler,
        crate::routes::maps::list_maps,
        crate::routes::maps::create_map,
        crate::routes::maps::get_map,
        crate::routes::maps::delete_map,
        crate::routes::maps::reupload_map,
        crate::routes::maps::map_status,
        crate::routes::gcps::list_gcps,
        crate::routes::gcps::create_gcp,
        crate::routes::gcps::update_gcp,
        crate::routes::gcps::delete_gcp,
        crate::routes::gcps::clear_gcps,
        crate::routes::gcps::suggest_gcps,
        crate::routes::rectify::start_rectify,
        crate::routes::rectify::get_rectify_job,
        crate::routes::mask::save_mask,
        crate::routes::mask::delete_mask,
        crate::routes::mask::apply_mask,
        crate::routes::mask::mask_and_warp,
        crate::routes::align::align_map,
        crate::routes::publish::publish_map,
        crate::routes::ows::wms,
        crate::routes::ows::tile,
    ),
    components(schemas(
        crate::routes::health::HealthResponse,
        crate::routes::MessageResponse,
        crate::routes::maps::RegisterMapRequest,
        crate::routes::maps::UploadPayload,
        crate::routes::mask::MaskWarpRequest,
        crate::routes::align::AlignMapRequest,
        crate::routes::align::AlignMapResponse,
        crate::routes::publish::PublishResponse,
        crate::services::maps::MapView,
        crate::services::maps::NewMap,
        crate::services::maps::GeoBounds,
        crate::services::geotransform::BoundingBox,
        crate::services::lifecycle::MapStatus,
        crate::services::gcps::Gcp,
        crate::services::gcps::GcpKind,
        crate::services::gcps::GcpDraft,
        crate::services::gcps::GcpWithError,
        crate::services::gcps::ResidualReport,
        crate::services::rectify::RectifyOptions,
        crate::services::rectify::RectifyJob,
        crate::services::rectify::JobStatus,
        crate::services::mask::MaskPolygon,
        crate::services::align::AlignRequest,
        crate::services::align::AlignOutcome,
        crate::services::align::AlignDirection,
        crate::services::align::AlignType,
    )),
    tags(
        (name = "maps", description = "Map registration and lifecycle"),
        (name = "gcps", description = "Ground control points"),
        (name = "rectify", description = "Rectification jobs"),
        (name = "mask", description = "Clip masks"),
        (name = "align", description = "Edge alignment against another map"),
        (name = "publish", description = "Tile store publishing"),
        (name = "ows", description = "WMS and XYZ tiles")
    )
)]
pub struct ApiDoc;

pub fn openapi_json() -> JsonValue {
    match serde_json::to_value(ApiDoc::openapi()) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize OpenAPI document");
            JsonValue::Null
        }
    }
}

async fn openapi_handler() -> Json<JsonValue> {
    Json(openapi_json())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/openapi.json", get(openapi_handler))
}
