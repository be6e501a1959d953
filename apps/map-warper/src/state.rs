use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::WarperConfig;
use crate::services::align::AlignmentEngine;
use crate::services::maps::MapRegistry;
use crate::services::mask::MaskManager;
use crate::services::publish::{PublishService, PublishSettings};
use crate::services::rectify::RectificationService;
use crate::services::tools::RasterTools;
use crate::services::wms::WmsDispatcher;

#[derive(Clone)]
pub struct AppState {
    pub config: WarperConfig,
    pub maps: MapRegistry,
    pub rectifier: RectificationService,
    pub masks: MaskManager,
    pub aligner: AlignmentEngine,
    pub wms: WmsDispatcher,
    pub publisher: PublishService,
    pub http: Client,
}

impl AppState {
    /// Wires every service against one registry and one set of raster tools.
    pub fn new(
        config: WarperConfig,
        db: Option<PgPool>,
        tools: Arc<dyn RasterTools>,
        cancel: CancellationToken,
    ) -> Self {
        let maps = MapRegistry::new(db);
        let rectifier = RectificationService::new(
            maps.clone(),
            tools.clone(),
            config.max_concurrent_warps,
            config.warped_dir(),
            config.work_dir(),
            cancel.clone(),
        );
        let masks = MaskManager::new(
            maps.clone(),
            tools.clone(),
            rectifier.clone(),
            config.mask_dir.clone(),
            config.masked_dir(),
        );
        let aligner = AlignmentEngine::new(maps.clone());
        let wms = WmsDispatcher::new(tools, config.work_dir(), config.wms_cache_entries);
        let publisher = PublishService::new(
            maps.clone(),
            wms.clone(),
            PublishSettings {
                tile_store: config.tile_store_path.clone(),
                min_zoom: config.publish_min_zoom,
                max_zoom: config.publish_max_zoom,
                max_tiles: config.publish_max_tiles,
            },
            cancel,
        );

        Self {
            config,
            maps,
            rectifier,
            masks,
            aligner,
            wms,
            publisher,
            http: Client::new(),
        }
    }
}
