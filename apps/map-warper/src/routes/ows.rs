use axum::extract::{Path, RawQuery, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::{internal_error, AppError, AppResult};
use crate::services::geotransform::TileCoord;
use crate::services::lifecycle::MapStatus;
use crate::services::wms::{OwsRequest, StatusFilter};
use crate::state::AppState;

const PUBLISHED_TILE_CACHE: &str = "public, max-age=86400";
const RENDERED_CACHE: &str = "no-cache";

fn image_headers(content_type: &'static str, cache: &'static str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static(cache));
    headers
}

/// Accepts `7` and `7.png`.
fn parse_tile_row(value: &str) -> Option<u32> {
    let trimmed = value.trim();
    trimmed
        .strip_suffix(".png")
        .unwrap_or(trimmed)
        .parse()
        .ok()
}

#[utoipa::path(
    get,
    path = "/maps/{id}/wms",
    tag = "ows",
    params(
        ("id" = Uuid, Path, description = "Map id"),
        ("STATUS" = Option<String>, Query, description = "`warped` serves the rectified raster; anything else the original"),
        ("REQUEST" = Option<String>, Query, description = "GetMap or GetCapabilities"),
        ("BBOX" = Option<String>, Query, description = "minx,miny,maxx,maxy")
    ),
    responses(
        (status = 200, description = "Image bytes or capabilities XML"),
        (status = 400, description = "Malformed WMS request"),
        (status = 409, description = "Requested raster not available")
    )
)]
pub(crate) async fn wms(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    RawQuery(query): RawQuery,
) -> AppResult<impl IntoResponse> {
    let record = state.maps.get(id)?;
    let pairs: Vec<(String, String)> =
        url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
            .into_owned()
            .collect();
    let filter = StatusFilter::from_param(
        pairs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("status"))
            .map(|(_, value)| value.as_str()),
    );
    let ows = OwsRequest::from_pairs(pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let response = state.wms.dispatch(&record, &ows, filter).await?;
    Ok((
        image_headers(response.content_type, RENDERED_CACHE),
        response.bytes,
    ))
}

#[utoipa::path(
    get,
    path = "/maps/{id}/tile/{z}/{x}/{y}",
    tag = "ows",
    params(
        ("id" = Uuid, Path, description = "Map id"),
        ("z" = u32, Path, description = "Zoom"),
        ("x" = u32, Path, description = "Tile column"),
        ("y" = String, Path, description = "Tile row from the top, optionally suffixed with .png")
    ),
    responses(
        (status = 200, description = "256x256 PNG tile"),
        (status = 400, description = "Tile address out of range"),
        (status = 409, description = "Map is not warped")
    )
)]
pub(crate) async fn tile(
    State(state): State<AppState>,
    Path((id, z, x, y)): Path<(Uuid, u32, u32, String)>,
) -> AppResult<impl IntoResponse> {
    let y = parse_tile_row(&y).ok_or_else(|| AppError::bad_request("Invalid tile row"))?;
    let coord = TileCoord::new(z, x, y)?;
    let record = state.maps.get(id)?;

    if record.status == MapStatus::Published {
        let stored = state
            .publisher
            .read_tile(id, coord)
            .await
            .map_err(internal_error)?;
        if let Some(bytes) = stored {
            return Ok((image_headers("image/png", PUBLISHED_TILE_CACHE), bytes));
        }
        tracing::debug!(map_id = %id, z, x, y, "published tile missing; rendering");
    }

    let response = state.wms.tile(&record, x, y, z).await?;
    Ok((
        image_headers(response.content_type, RENDERED_CACHE),
        response.bytes,
    ))
}

/// Map viewers on other origins read tiles and WMS images.
pub fn router() -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);
    Router::new()
        .route("/maps/{id}/wms", get(wms))
        .route("/maps/{id}/tile/{z}/{x}/{y}", get(tile))
        .layer(cors)
}

#[cfg(test)]
mod tests {
    use super::parse_tile_row;

    #[test]
    fn tile_rows_accept_png_suffix() {
        assert_eq!(parse_tile_row("7"), Some(7));
        assert_eq!(parse_tile_row("7.png"), Some(7));
        assert_eq!(parse_tile_row("7.jpg"), None);
        assert_eq!(parse_tile_row("-1"), None);
    }
}
