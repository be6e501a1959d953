use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::config::validate_and_canonicalize_path;
use crate::error::WarpError;
use crate::services::gcps::GcpStore;
use crate::services::geotransform::BoundingBox;
use crate::services::lifecycle::MapStatus;
use crate::services::rectify::{ResampleSpec, TransformSpec};
use crate::services::store::{MapStore, StoreWriter};

pub const DEFAULT_SRS: &str = "EPSG:4326";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct GeoBounds {
    pub bbox: BoundingBox,
    pub srid: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadedRaster {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl UploadedRaster {
    /// Accepts a raster handed over by the upload collaborator. The file must
    /// already exist under `uploads_root`.
    pub fn validate(
        path: &Path,
        width: u32,
        height: u32,
        uploads_root: &Path,
    ) -> Result<Self, WarpError> {
        if width == 0 || height == 0 {
            return Err(WarpError::invalid("raster width and height must be non-zero"));
        }
        let canonical =
            validate_and_canonicalize_path(path.to_path_buf(), Some(uploads_root), "upload path")
                .map_err(|err| WarpError::invalid(format!("{err:#}")))?;
        if !canonical.is_file() {
            return Err(WarpError::invalid(format!(
                "upload {} is not a file",
                canonical.display()
            )));
        }
        Ok(Self {
            path: canonical,
            width,
            height,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarpedArtifacts {
    pub raster: PathBuf,
    pub aux: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapRecord {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: MapStatus,
    pub transform_options: TransformSpec,
    pub resample_options: ResampleSpec,
    /// Reference system of the GCP geo coordinates.
    pub srs: String,
    pub bbox: Option<GeoBounds>,
    pub upload: Option<UploadedRaster>,
    pub gcps: GcpStore,
    pub mask: Option<PathBuf>,
    pub masked_raster: Option<PathBuf>,
    pub warped: Option<WarpedArtifacts>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MapRecord {
    fn new(new: NewMap) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: new.title.trim().to_string(),
            description: new
                .description
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
            status: MapStatus::Unloaded,
            transform_options: TransformSpec::default(),
            resample_options: ResampleSpec::default(),
            srs: new.srs.unwrap_or_else(|| DEFAULT_SRS.to_string()),
            bbox: None,
            upload: None,
            gcps: GcpStore::default(),
            mask: None,
            masked_raster: None,
            warped: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn dimensions(&self) -> Result<(u32, u32), WarpError> {
        self.upload
            .as_ref()
            .map(|u| (u.width, u.height))
            .ok_or(WarpError::Unavailable {
                status: self.status,
            })
    }

    /// Files owned by this map that go away with it.
    pub fn owned_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        files.extend(self.mask.clone());
        files.extend(self.masked_raster.clone());
        if let Some(warped) = &self.warped {
            files.push(warped.raster.clone());
            files.extend(warped.aux.clone());
        }
        files
    }

    pub fn view(&self) -> MapView {
        MapView {
            id: self.id,
            title: self.title.clone(),
            description: self.description.clone(),
            status: self.status,
            transform_options: self.transform_options.as_str().to_string(),
            resample_options: self.resample_options.as_str().to_string(),
            srs: self.srs.clone(),
            bbox: self.bbox,
            width: self.upload.as_ref().map(|u| u.width),
            height: self.upload.as_ref().map(|u| u.height),
            gcp_count: self.gcps.len(),
            hard_gcp_count: self.gcps.hard_count(),
            has_mask: self.mask.is_some(),
            masked: self.masked_raster.is_some(),
            updated_at: self.updated_at.to_rfc3339(),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(status: MapStatus) -> Self {
        let mut record = Self::new(NewMap {
            title: "test map".to_string(),
            description: None,
            srs: None,
        });
        record.status = status;
        record.upload = Some(UploadedRaster {
            path: PathBuf::from("/tmp/upload.tif"),
            width: 1000,
            height: 800,
        });
        record
    }
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct NewMap {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub srs: Option<String>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct MapView {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub status: MapStatus,
    pub transform_options: String,
    pub resample_options: String,
    pub srs: String,
    pub bbox: Option<GeoBounds>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub gcp_count: usize,
    pub hard_gcp_count: usize,
    pub has_mask: bool,
    pub masked: bool,
    pub updated_at: String,
}

pub struct MapEntry {
    record: Mutex<MapRecord>,
    raster_lock: Arc<tokio::sync::Mutex<()>>,
}

impl MapEntry {
    fn new(record: MapRecord) -> Self {
        Self {
            record: Mutex::new(record),
            raster_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    fn record_lock(&self) -> MutexGuard<'_, MapRecord> {
        match self.record.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering map record from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    /// Waits for exclusive use of the map's raster files.
    pub async fn lock_raster(&self) -> OwnedMutexGuard<()> {
        self.raster_lock.clone().lock_owned().await
    }
}

/// In-process registry of maps. Every status change happens while the
/// map's record lock is held, so check-and-transition is atomic per map.
#[derive(Clone)]
pub struct MapRegistry {
    maps: Arc<RwLock<HashMap<Uuid, Arc<MapEntry>>>>,
    store: Option<StoreWriter>,
}

impl MapRegistry {
    pub fn new(db: Option<PgPool>) -> Self {
        Self::with_store(db.map(|pool| Arc::new(pool) as Arc<dyn MapStore>))
    }

    pub fn with_store(store: Option<Arc<dyn MapStore>>) -> Self {
        Self {
            maps: Arc::new(RwLock::new(HashMap::new())),
            store: store.and_then(StoreWriter::spawn),
        }
    }

    /// Waits until every change made so far has reached the store.
    pub async fn flush(&self) {
        if let Some(store) = &self.store {
            store.flush().await;
        }
    }

    fn read_maps(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Arc<MapEntry>>> {
        self.maps.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_maps(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Arc<MapEntry>>> {
        self.maps.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds an already-built record (startup load).
    pub fn insert(&self, record: MapRecord) {
        self.write_maps()
            .insert(record.id, Arc::new(MapEntry::new(record)));
    }

    pub fn register(&self, new: NewMap, upload: UploadedRaster) -> Result<MapRecord, WarpError> {
        if new.title.trim().is_empty() {
            return Err(WarpError::invalid("title is required"));
        }
        let mut record = MapRecord::new(new);
        record.upload = Some(upload);
        record.transition_to(MapStatus::Available)?;
        // Queued before the map becomes visible so later saves follow it.
        self.persist(&record);
        self.insert(record.clone());
        tracing::info!(map_id = %record.id, title = %record.title, "registered map");
        Ok(record)
    }

    pub fn entry(&self, id: Uuid) -> Result<Arc<MapEntry>, WarpError> {
        self.read_maps()
            .get(&id)
            .cloned()
            .ok_or_else(|| WarpError::not_found(format!("map {id}")))
    }

    pub fn get(&self, id: Uuid) -> Result<MapRecord, WarpError> {
        let entry = self.entry(id)?;
        let record = entry.record_lock().clone();
        Ok(record)
    }

    pub fn list(&self) -> Vec<MapRecord> {
        let entries: Vec<Arc<MapEntry>> = self.read_maps().values().cloned().collect();
        let mut records: Vec<MapRecord> = entries
            .iter()
            .map(|entry| entry.record_lock().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Applies `f` to a copy of the record and commits only if it succeeds.
    pub fn update<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut MapRecord) -> Result<T, WarpError>,
    ) -> Result<T, WarpError> {
        let entry = self.entry(id)?;
        let mut guard = entry.record_lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        commit(&mut guard, draft);
        self.persist(&guard);
        Ok(value)
    }

    /// Like [`update`](Self::update), but also claims the map's raster lock.
    /// Fails with `Busy` when another operation holds the raster.
    pub fn update_exclusive<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut MapRecord) -> Result<T, WarpError>,
    ) -> Result<(T, OwnedMutexGuard<()>), WarpError> {
        let entry = self.entry(id)?;
        let mut guard = entry.record_lock();
        let mut draft = guard.clone();
        let value = f(&mut draft)?;
        let raster = entry
            .raster_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| WarpError::Busy)?;
        commit(&mut guard, draft);
        self.persist(&guard);
        Ok((value, raster))
    }

    /// Replaces the raster and discards everything derived from the old one.
    /// Returns the files that belonged to the previous raster.
    pub fn reupload(&self, id: Uuid, upload: UploadedRaster) -> Result<MapRecord, WarpError> {
        let mut stale = Vec::new();
        let record = self.update(id, |record| {
            if record.status == MapStatus::Warping {
                return Err(WarpError::Busy);
            }
            stale = record.owned_files();
            record.transition_to(MapStatus::Unloaded)?;
            record.gcps.clear();
            record.mask = None;
            record.masked_raster = None;
            record.warped = None;
            record.upload = Some(upload);
            record.transition_to(MapStatus::Available)?;
            Ok(record.clone())
        })?;
        remove_files(&stale);
        tracing::info!(map_id = %id, "map raster replaced");
        Ok(record)
    }

    /// Removes the map, its control points and its files.
    pub fn destroy(&self, id: Uuid) -> Result<MapRecord, WarpError> {
        let removed = {
            let mut maps = self.write_maps();
            let entry = maps
                .get(&id)
                .cloned()
                .ok_or_else(|| WarpError::not_found(format!("map {id}")))?;
            let record = entry.record_lock().clone();
            if record.status == MapStatus::Warping {
                return Err(WarpError::Busy);
            }
            maps.remove(&id);
            if let Some(store) = &self.store {
                store.delete(id);
            }
            record
        };
        remove_files(&removed.owned_files());
        tracing::info!(map_id = %id, "map destroyed");
        Ok(removed)
    }

    /// Queues a save. Callers hold the record lock so saves for one map
    /// are queued in revision order.
    fn persist(&self, record: &MapRecord) {
        if let Some(store) = &self.store {
            store.save(record);
        }
    }
}

fn commit(current: &mut MapRecord, mut next: MapRecord) {
    next.revision = current.revision + 1;
    next.updated_at = Utc::now();
    *current = next;
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove map file");
            }
        }
    }
}
