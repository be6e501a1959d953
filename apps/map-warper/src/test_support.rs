use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WarperConfig;
use crate::error::WarpError;
use crate::services::gcps::{GcpDraft, GcpKind};
use crate::services::geotransform::BoundingBox;
use crate::services::maps::{NewMap, UploadedRaster};
use crate::services::rectify::{JobStatus, RectifyOptions};
use crate::services::tools::{
    MaskRequest, RasterTools, RenderRequest, WarpOutput, WarpRequest,
};
use crate::state::AppState;

pub const TEST_RASTER_WIDTH: u32 = 1000;
pub const TEST_RASTER_HEIGHT: u32 = 800;

/// Pixel positions handed out by [`add_hard_gcps`], in order. No three of the
/// leading points are collinear.
const GCP_PIXELS: [(f64, f64); 12] = [
    (100.0, 100.0),
    (900.0, 120.0),
    (500.0, 700.0),
    (150.0, 650.0),
    (850.0, 600.0),
    (400.0, 300.0),
    (600.0, 450.0),
    (250.0, 400.0),
    (750.0, 250.0),
    (300.0, 150.0),
    (700.0, 700.0),
    (50.0, 500.0),
];

pub fn test_config() -> WarperConfig {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let data_root = tempdir.keep();
    let storage = data_root.join("storage/maps");

    let config = WarperConfig {
        database_url: None,
        data_root: data_root.clone(),
        map_storage_path: storage.clone(),
        mask_dir: storage.join("masks"),
        tile_store_path: data_root.join("storage/tiles"),
        gdal_bin_dir: None,
        warp_timeout_seconds: 30,
        max_concurrent_warps: 2,
        publish_min_zoom: 0,
        publish_max_zoom: 2,
        publish_max_tiles: 100,
        wms_cache_entries: 8,
        geocoder_url: None,
    };
    config.ensure_storage_dirs().expect("storage dirs");
    config
}

pub fn test_state() -> (AppState, Arc<FakeRasterTools>) {
    let tools = Arc::new(FakeRasterTools::default());
    let state = AppState::new(test_config(), None, tools.clone(), CancellationToken::new());
    (state, tools)
}

/// Registers a map backed by a fresh placeholder upload.
pub fn register_map(state: &AppState) -> Uuid {
    let uploads = state.config.uploads_dir();
    let path = uploads.join(format!("{}.tif", Uuid::new_v4()));
    std::fs::write(&path, b"raster").expect("write upload");
    let upload = UploadedRaster::validate(&path, TEST_RASTER_WIDTH, TEST_RASTER_HEIGHT, &uploads)
        .expect("valid upload");
    state
        .maps
        .register(
            NewMap {
                title: "Test map".to_string(),
                description: None,
                srs: None,
            },
            upload,
        )
        .expect("register map")
        .id
}

/// Adds `count` more hard points lying on an exact affine mapping.
pub fn add_hard_gcps(state: &AppState, map_id: Uuid, count: usize) {
    state
        .maps
        .update(map_id, |record| {
            let (width, height) = record.dimensions()?;
            let start = record.gcps.len();
            for (px, py) in GCP_PIXELS.iter().skip(start).take(count) {
                let draft = GcpDraft {
                    pixel_x: *px,
                    pixel_y: *py,
                    geo_x: 10.0 + px * 0.0005,
                    geo_y: 45.5 - py * 0.000625,
                    kind: Some(GcpKind::Hard),
                };
                record.gcps.add_or_update(None, &draft, width, height)?;
            }
            Ok(())
        })
        .expect("add gcps");
}

/// Drives a map to `warped` through the real rectification path.
pub async fn warp_map(state: &AppState, map_id: Uuid) {
    let hard = state.maps.get(map_id).expect("map").gcps.hard_count();
    if hard < 3 {
        add_hard_gcps(state, map_id, 3 - hard);
    }
    let prepared = state
        .rectifier
        .begin(map_id, &RectifyOptions::default())
        .expect("begin warp");
    let job = state.rectifier.execute(prepared).await;
    assert_eq!(job.status, JobStatus::Success, "warp failed: {:?}", job.output);
}

/// Scripted stand-in for the GDAL tools.
#[derive(Default)]
pub struct FakeRasterTools {
    failure: Mutex<Option<String>>,
    last_render: Mutex<Option<RenderRequest>>,
    pub warp_calls: AtomicUsize,
    pub mask_calls: AtomicUsize,
    pub render_calls: AtomicUsize,
}

impl FakeRasterTools {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(10.0, 45.0, 10.5, 45.5)
    }

    pub fn tile_bytes(&self) -> Vec<u8> {
        b"\x89PNG fake tile".to_vec()
    }

    /// Makes every following warp fail with `diagnostic`.
    pub fn fail_with(&self, diagnostic: &str) {
        *self.failure.lock().unwrap() = Some(diagnostic.to_string());
    }

    pub fn succeed(&self) {
        *self.failure.lock().unwrap() = None;
    }

    pub fn last_render(&self) -> Option<RenderRequest> {
        self.last_render.lock().unwrap().clone()
    }
}

impl RasterTools for FakeRasterTools {
    fn warp<'a>(
        &'a self,
        request: &'a WarpRequest,
        _cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<WarpOutput, WarpError>> {
        async move {
            self.warp_calls.fetch_add(1, Ordering::SeqCst);
            let failure = self.failure.lock().unwrap().clone();
            if let Some(diagnostic) = failure {
                return Err(WarpError::tool("gdalwarp", diagnostic));
            }
            tokio::fs::write(&request.output, b"warped")
                .await
                .map_err(|err| WarpError::Internal(err.into()))?;
            Ok(WarpOutput {
                raster: request.output.clone(),
                aux: None,
                bbox: self.bbox(),
                log: format!("warped {} control points", request.gcps.len()),
            })
        }
        .boxed()
    }

    fn apply_mask<'a>(&'a self, request: &'a MaskRequest) -> BoxFuture<'a, Result<(), WarpError>> {
        async move {
            self.mask_calls.fetch_add(1, Ordering::SeqCst);
            let mut raster = tokio::fs::read(&request.raster)
                .await
                .map_err(|err| WarpError::Internal(err.into()))?;
            let mask = tokio::fs::read(&request.mask)
                .await
                .map_err(|err| WarpError::Internal(err.into()))?;
            raster.extend_from_slice(&mask);
            tokio::fs::write(&request.raster, raster)
                .await
                .map_err(|err| WarpError::Internal(err.into()))
        }
        .boxed()
    }

    fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<Vec<u8>, WarpError>> {
        async move {
            self.render_calls.fetch_add(1, Ordering::SeqCst);
            *self.last_render.lock().unwrap() = Some(request.clone());
            Ok(self.tile_bytes())
        }
        .boxed()
    }
}
