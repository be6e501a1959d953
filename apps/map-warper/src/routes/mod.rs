pub mod align;
pub mod gcps;
pub mod health;
pub mod maps;
pub mod mask;
pub mod ows;
pub mod publish;
pub mod rectify;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(ows::router())
        .nest(
            "/api",
            Router::new()
                .merge(maps::router())
                .merge(gcps::router())
                .merge(rectify::router())
                .merge(mask::router())
                .merge(align::router())
                .merge(publish::router())
                .merge(crate::openapi::router()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{add_hard_gcps, register_map, test_state, warp_map};
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    async fn send(
        app: Router,
        method: Method,
        uri: &str,
        body: Option<JsonValue>,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, bytes.to_vec())
    }

    fn json(bytes: &[u8]) -> JsonValue {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let (state, _tools) = test_state();
        register_map(&state);
        let (status, _, body) = send(router(state), Method::GET, "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        let body = json(&body);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["maps"], 1);
        assert_eq!(body["warping"], 0);
        assert_eq!(body["persistent"], false);
    }

    #[tokio::test]
    async fn status_probe_is_plain_text() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let (status, headers, body) = send(
            router(state.clone()),
            Method::GET,
            &format!("/api/maps/{map_id}/status"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/plain"));
        assert_eq!(body, b"available");

        let (status, _, body) = send(
            router(state),
            Method::GET,
            &format!("/api/maps/{}/status", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json(&body)["stat"], "fail");
    }

    #[tokio::test]
    async fn registering_a_map_validates_the_upload() {
        let (state, _tools) = test_state();
        let upload = state.config.uploads_dir().join("scan.tif");
        std::fs::write(&upload, b"raster").unwrap();

        let (status, _, body) = send(
            router(state.clone()),
            Method::POST,
            "/api/maps",
            Some(serde_json::json!({
                "title": "Harbour 1850",
                "upload": {"path": "scan.tif", "width": 640, "height": 480}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let view = json(&body);
        assert_eq!(view["status"], "available");
        assert_eq!(view["width"], 640);

        let (status, _, _) = send(
            router(state),
            Method::POST,
            "/api/maps",
            Some(serde_json::json!({
                "title": "Escape",
                "upload": {"path": "../../etc/passwd", "width": 1, "height": 1}
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rectify_without_control_points_is_rejected() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 2);
        let (status, _, body) = send(
            router(state.clone()),
            Method::POST,
            &format!("/api/maps/{map_id}/rectify"),
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let body = json(&body);
        assert_eq!(body["stat"], "fail");
        assert!(body["message"].as_str().unwrap().contains('2'));
        assert_eq!(
            state.maps.get(map_id).unwrap().status,
            crate::services::lifecycle::MapStatus::Available
        );
    }

    #[tokio::test]
    async fn rectify_returns_a_queryable_job() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        add_hard_gcps(&state, map_id, 3);
        let (status, _, body) = send(
            router(state.clone()),
            Method::POST,
            &format!("/api/maps/{map_id}/rectify"),
            Some(serde_json::json!({"transform_options": "p1", "resample_options": "cubic"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let job = json(&body);
        assert_eq!(job["transform_options"], "p1");
        assert_eq!(job["resample_options"], "cubic");

        let job_id = job["id"].as_str().unwrap().to_string();
        let (status, _, body) = send(
            router(state),
            Method::GET,
            &format!("/api/rectify/jobs/{job_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["id"], job_id.as_str());
    }

    #[tokio::test]
    async fn gcp_crud_round_trips_through_residual_listing() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let (status, _, body) = send(
            router(state.clone()),
            Method::POST,
            &format!("/api/maps/{map_id}/gcps"),
            Some(serde_json::json!({
                "pixel_x": 10.0, "pixel_y": 20.0, "geo_x": 5.0, "geo_y": 50.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let created = json(&body);
        assert_eq!(created["kind"], "hard");

        let (status, _, _) = send(
            router(state.clone()),
            Method::POST,
            &format!("/api/maps/{map_id}/gcps"),
            Some(serde_json::json!({
                "pixel_x": 5000.0, "pixel_y": 20.0, "geo_x": 5.0, "geo_y": 50.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = send(
            router(state.clone()),
            Method::GET,
            &format!("/api/maps/{map_id}/gcps"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let report = json(&body);
        assert_eq!(report["items"].as_array().unwrap().len(), 1);
        assert!(report["items"][0]["error"].is_null());

        let gcp_id = created["id"].as_str().unwrap();
        let (status, _, _) = send(
            router(state.clone()),
            Method::DELETE,
            &format!("/api/maps/{map_id}/gcps/{gcp_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.maps.get(map_id).unwrap().gcps.is_empty());
    }

    #[tokio::test]
    async fn publish_target_must_be_known() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let (status, _, _) = send(
            router(state.clone()),
            Method::POST,
            &format!("/api/maps/{map_id}/publish?to=sideways"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, body) = send(
            router(state),
            Method::POST,
            &format!("/api/maps/{map_id}/publish?to=publish"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json(&body)["status"], "available");
    }

    #[tokio::test]
    async fn tiles_render_for_warped_maps() {
        let (state, tools) = test_state();
        let map_id = register_map(&state);

        let (status, _, _) = send(
            router(state.clone()),
            Method::GET,
            &format!("/maps/{map_id}/tile/0/0/0.png"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        warp_map(&state, map_id).await;
        let (status, headers, body) = send(
            router(state.clone()),
            Method::GET,
            &format!("/maps/{map_id}/tile/0/0/0.png"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "image/png");
        assert_eq!(body, tools.tile_bytes());

        let (status, _, _) = send(
            router(state),
            Method::GET,
            &format!("/maps/{map_id}/tile/1/5/0"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wms_capabilities_are_served_as_xml() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let (status, headers, body) = send(
            router(state),
            Method::GET,
            &format!("/maps/{map_id}/wms?service=WMS&request=GetCapabilities"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "application/vnd.ogc.wms_xml");
        assert!(String::from_utf8(body).unwrap().contains("<Name>image</Name>"));
    }

    #[tokio::test]
    async fn openapi_document_lists_routes() {
        let (state, _tools) = test_state();
        let (status, _, body) = send(router(state), Method::GET, "/api/openapi.json", None).await;
        assert_eq!(status, StatusCode::OK);
        let doc = json(&body);
        assert!(doc["paths"]["/api/maps/{id}/rectify"].is_object());
        assert!(doc["paths"]["/maps/{id}/tile/{z}/{x}/{y}"].is_object());
    }
}
