use anyhow::{Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::geotransform::{tile_range, BoundingBox, TileCoord};
use crate::services::lifecycle::MapStatus;
use crate::services::maps::MapRegistry;
use crate::services::wms::WmsDispatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeedReport {
    pub written: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub tile_store: PathBuf,
    pub min_zoom: u32,
    pub max_zoom: u32,
    pub max_tiles: usize,
}

/// A running seed task. The generation tells a finishing task whether a
/// newer seed has replaced it.
struct ActiveSeed {
    generation: u64,
    token: CancellationToken,
}

/// Promotes warped maps to a seeded MBTiles store and back.
#[derive(Clone)]
pub struct PublishService {
    maps: MapRegistry,
    wms: WmsDispatcher,
    settings: Arc<PublishSettings>,
    active: Arc<Mutex<HashMap<Uuid, ActiveSeed>>>,
    generations: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl PublishService {
    pub fn new(
        maps: MapRegistry,
        wms: WmsDispatcher,
        settings: PublishSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            maps,
            wms,
            settings: Arc::new(settings),
            active: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    fn active_lock(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveSeed>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering publish task registry from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    pub fn mbtiles_path(&self, map_id: Uuid) -> PathBuf {
        self.settings.tile_store.join(format!("{map_id}.mbtiles"))
    }

    /// `warped -> publishing` and starts seeding. Any other state is left as is.
    pub fn publish(&self, map_id: Uuid) -> Result<MapStatus, WarpError> {
        let (started, status) = self.maps.update(map_id, |record| {
            if record.status != MapStatus::Warped {
                return Ok((false, record.status));
            }
            record.transition_to(MapStatus::Publishing)?;
            Ok((true, record.status))
        })?;
        if started {
            tracing::info!(map_id = %map_id, "publishing map");
            self.spawn_seed(map_id);
        } else {
            tracing::info!(map_id = %map_id, status = %status, "publish ignored");
        }
        Ok(status)
    }

    /// `publishing|published -> warped`, stops seeding and drops the tile store.
    pub async fn unpublish(&self, map_id: Uuid) -> Result<MapStatus, WarpError> {
        let (stopped, status) = self.maps.update(map_id, |record| {
            if !record.status.is_locked() {
                return Ok((false, record.status));
            }
            record.transition_to(MapStatus::Warped)?;
            Ok((true, record.status))
        })?;
        if stopped {
            self.forget(map_id).await;
            tracing::info!(map_id = %map_id, "map unpublished");
        }
        Ok(status)
    }

    /// Cancels any seeding for the map and removes its tile store.
    pub async fn forget(&self, map_id: Uuid) {
        let seeding = self.active_lock().remove(&map_id);
        if let Some(active) = seeding {
            active.token.cancel();
        }
        let path = self.mbtiles_path(map_id);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(map_id = %map_id, error = %err, "failed to remove tile store");
            }
        }
    }

    /// Registers a new seed for the map, cancelling the one it replaces.
    fn track_seed(&self, map_id: Uuid) -> (u64, CancellationToken) {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let token = self.cancel.child_token();
        let previous = self.active_lock().insert(
            map_id,
            ActiveSeed {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        (generation, token)
    }

    /// Drops the map's seed entry unless a newer seed owns it.
    fn finish_seed(&self, map_id: Uuid, generation: u64) {
        let mut active = self.active_lock();
        if active
            .get(&map_id)
            .is_some_and(|current| current.generation == generation)
        {
            active.remove(&map_id);
        }
    }

    fn spawn_seed(&self, map_id: Uuid) {
        let (generation, token) = self.track_seed(map_id);
        let service = self.clone();
        tokio::spawn(async move {
            let outcome = service.seed(map_id, &token).await;
            service.finish_seed(map_id, generation);
            match outcome {
                Ok(report) => {
                    tracing::info!(
                        map_id = %map_id,
                        written = report.written,
                        failed = report.failed,
                        cancelled = report.cancelled,
                        "tile seeding finished"
                    );
                }
                Err(err) => {
                    tracing::warn!(map_id = %map_id, error = %err, "tile seeding failed");
                }
            }
        });
    }

    /// Renders every tile over the map's footprint into its MBTiles file.
    pub async fn seed(&self, map_id: Uuid, token: &CancellationToken) -> Result<SeedReport> {
        let record = self.maps.get(map_id)?;
        let bounds = record
            .bbox
            .map(|b| b.bbox)
            .context("map has no bounding box to seed")?;
        if token.is_cancelled() {
            return Ok(SeedReport {
                cancelled: true,
                ..SeedReport::default()
            });
        }
        let path = self.mbtiles_path(map_id);
        let settings = self.settings.clone();
        {
            let path = path.clone();
            let title = record.title.clone();
            tokio::task::spawn_blocking(move || {
                if path.exists() {
                    std::fs::remove_file(&path)
                        .with_context(|| format!("failed to reset {}", path.display()))?;
                }
                let conn = Connection::open(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                init_mbtiles(&conn, &title, &bounds, settings.min_zoom, settings.max_zoom)
            })
            .await
            .context("mbtiles init task panicked")??;
        }

        let mut report = SeedReport::default();
        let mut budget = self.settings.max_tiles;
        'zooms: for z in self.settings.min_zoom..=self.settings.max_zoom {
            let (x0, x1, y0, y1) = tile_range(&bounds, z);
            let mut batch: Vec<(TileCoord, Vec<u8>)> = Vec::new();
            for x in x0..=x1 {
                for y in y0..=y1 {
                    if token.is_cancelled() {
                        report.cancelled = true;
                        break 'zooms;
                    }
                    if budget == 0 {
                        tracing::warn!(map_id = %map_id, z, "tile budget exhausted; stopping seed");
                        break 'zooms;
                    }
                    budget -= 1;
                    let Ok(coord) = TileCoord::new(z, x, y) else {
                        continue;
                    };
                    match self.wms.tile(&record, x, y, z).await {
                        Ok(tile) => batch.push((coord, tile.bytes)),
                        Err(err) => {
                            report.failed += 1;
                            tracing::warn!(map_id = %map_id, z, x, y, error = %err, "tile render failed");
                        }
                    }
                }
            }
            if token.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.written += write_batch(path.clone(), batch).await?;
        }

        if report.cancelled || token.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        self.maps.update(map_id, |record| {
            if record.status == MapStatus::Publishing {
                record.transition_to(MapStatus::Published)?;
            }
            Ok(())
        })?;
        Ok(report)
    }

    /// Reads a seeded tile (XYZ addressing) if the store has it.
    pub async fn read_tile(&self, map_id: Uuid, coord: TileCoord) -> Result<Option<Vec<u8>>> {
        let path = self.mbtiles_path(map_id);
        tokio::task::spawn_blocking(move || read_mbtiles_tile(&path, coord))
            .await
            .context("mbtiles read task panicked")?
    }

    /// Restarts seeding for maps that were publishing when the process stopped.
    pub fn resume_publishing(&self) -> usize {
        let ids: Vec<Uuid> = self
            .maps
            .list()
            .into_iter()
            .filter(|record| record.status == MapStatus::Publishing)
            .map(|record| record.id)
            .collect();
        if !ids.is_empty() {
            tracing::info!(count = ids.len(), "resuming tile seeding");
        }
        for id in &ids {
            self.spawn_seed(*id);
        }
        ids.len()
    }
}

async fn write_batch(path: PathBuf, batch: Vec<(TileCoord, Vec<u8>)>) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    tokio::task::spawn_blocking(move || {
        // The store is gone if the map was unpublished mid-seed.
        let mut conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_WRITE)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let tx = conn.transaction()?;
        for (coord, data) in &batch {
            insert_mbtiles_tile(&tx, coord, data)?;
        }
        tx.commit()?;
        Ok(batch.len())
    })
    .await
    .context("mbtiles write task panicked")?
}

fn init_mbtiles(
    conn: &Connection,
    name: &str,
    bounds: &BoundingBox,
    min_zoom: u32,
    max_zoom: u32,
) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS metadata (name TEXT PRIMARY KEY, value TEXT);
        CREATE TABLE IF NOT EXISTS tiles (
            zoom_level INTEGER,
            tile_column INTEGER,
            tile_row INTEGER,
            tile_data BLOB,
            PRIMARY KEY (zoom_level, tile_column, tile_row)
        );
        "#,
    )?;
    let metadata = [
        ("name", name.to_string()),
        ("type", "overlay".to_string()),
        ("format", "png".to_string()),
        (
            "bounds",
            format!(
                "{},{},{},{}",
                bounds.min_x, bounds.min_y, bounds.max_x, bounds.max_y
            ),
        ),
        ("minzoom", min_zoom.to_string()),
        ("maxzoom", max_zoom.to_string()),
    ];
    for (key, value) in metadata {
        conn.execute(
            "INSERT OR REPLACE INTO metadata (name, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
    }
    Ok(())
}

fn insert_mbtiles_tile(conn: &Connection, coord: &TileCoord, data: &[u8]) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?1, ?2, ?3, ?4)",
        params![coord.z, coord.x, coord.tms_row(), data],
    )?;
    Ok(())
}

fn read_mbtiles_tile(path: &Path, coord: TileCoord) -> Result<Option<Vec<u8>>> {
    if !path.exists() {
        return Ok(None);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let tile = conn
        .query_row(
            "SELECT tile_data FROM tiles WHERE zoom_level = ?1 AND tile_column = ?2 AND tile_row = ?3",
            params![coord.z, coord.x, coord.tms_row()],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?;
    Ok(tile)
}
