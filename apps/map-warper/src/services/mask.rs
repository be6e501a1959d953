use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::maps::MapRegistry;
use crate::services::rectify::{RectificationService, RectifyJob, RectifyOptions};
use crate::services::tools::{MaskRequest, RasterTools};

/// Clip polygon in raster pixel coordinates. The first ring is the outer
/// boundary; any further rings are holes.
#[derive(Debug, Clone, PartialEq, Deserialize, utoipa::ToSchema)]
pub struct MaskPolygon {
    #[schema(value_type = Vec<Vec<Vec<f64>>>)]
    pub rings: Vec<Vec<[f64; 2]>>,
}

impl MaskPolygon {
    /// Returns a copy with every ring closed, or an error for unusable rings.
    pub fn validated(&self) -> Result<Self, WarpError> {
        if self.rings.is_empty() {
            return Err(WarpError::invalid("mask polygon has no rings"));
        }
        let mut rings = Vec::with_capacity(self.rings.len());
        for (index, ring) in self.rings.iter().enumerate() {
            if ring.iter().flatten().any(|v| !v.is_finite()) {
                return Err(WarpError::invalid(format!(
                    "mask ring {index} has non-finite coordinates"
                )));
            }
            let mut distinct: Vec<[f64; 2]> = Vec::new();
            for point in ring {
                if !distinct.contains(point) {
                    distinct.push(*point);
                }
            }
            if distinct.len() < 3 {
                return Err(WarpError::invalid(format!(
                    "mask ring {index} needs at least 3 distinct points"
                )));
            }
            let mut closed = ring.clone();
            if closed.first() != closed.last() {
                closed.push(closed[0]);
            }
            rings.push(closed);
        }
        Ok(Self { rings })
    }

    pub fn to_geojson(&self) -> serde_json::Value {
        json!({
            "type": "FeatureCollection",
            "name": "mask",
            "features": [{
                "type": "Feature",
                "properties": {},
                "geometry": {
                    "type": "Polygon",
                    "coordinates": self.rings,
                }
            }]
        })
    }
}

#[derive(Clone)]
pub struct MaskManager {
    maps: MapRegistry,
    tools: Arc<dyn RasterTools>,
    rectifier: RectificationService,
    mask_dir: PathBuf,
    masked_dir: PathBuf,
}

impl MaskManager {
    pub fn new(
        maps: MapRegistry,
        tools: Arc<dyn RasterTools>,
        rectifier: RectificationService,
        mask_dir: PathBuf,
        masked_dir: PathBuf,
    ) -> Self {
        Self {
            maps,
            tools,
            rectifier,
            mask_dir,
            masked_dir,
        }
    }

    fn mask_path(&self, map_id: Uuid) -> PathBuf {
        self.mask_dir.join(format!("{map_id}.geojson"))
    }

    fn masked_raster_path(&self, map_id: Uuid) -> PathBuf {
        self.masked_dir.join(format!("{map_id}.tif"))
    }

    /// Writes the polygon as the map's mask, replacing any earlier one.
    pub async fn save(&self, map_id: Uuid, polygon: &MaskPolygon) -> Result<String, WarpError> {
        let polygon = polygon.validated()?;
        self.maps.get(map_id)?.status.ensure_mutable()?;

        let path = self.mask_path(map_id);
        let staging = self.mask_dir.join(format!("{map_id}.geojson.tmp"));
        let body = serde_json::to_vec_pretty(&polygon.to_geojson())
            .map_err(|err| WarpError::Internal(err.into()))?;
        tokio::fs::write(&staging, body)
            .await
            .map_err(|err| WarpError::Internal(err.into()))?;

        let result = self.maps.update(map_id, |record| {
            record.status.ensure_mutable()?;
            std::fs::rename(&staging, &path).map_err(|err| WarpError::Internal(err.into()))?;
            record.mask = Some(path.clone());
            Ok(())
        });
        if result.is_err() {
            let _ = tokio::fs::remove_file(&staging).await;
        }
        result?;
        tracing::info!(map_id = %map_id, "mask saved");
        Ok("Map clipping mask saved".to_string())
    }

    /// Burns the saved mask into a fresh copy of the uploaded raster.
    /// Always starts from the pristine upload, so repeated calls agree.
    pub async fn apply(&self, map_id: Uuid) -> Result<String, WarpError> {
        let ((upload, mask), _raster) = self.maps.update_exclusive(map_id, |record| {
            record.status.ensure_mutable()?;
            let mask = record
                .mask
                .clone()
                .filter(|path| path.is_file())
                .ok_or(WarpError::MaskNotFound)?;
            let upload = record
                .upload
                .as_ref()
                .map(|u| u.path.clone())
                .ok_or(WarpError::Unavailable {
                    status: record.status,
                })?;
            Ok((upload, mask))
        })?;

        let masked = self.masked_raster_path(map_id);
        tokio::fs::copy(&upload, &masked)
            .await
            .map_err(|err| WarpError::Internal(err.into()))?;

        let request = MaskRequest {
            raster: masked.clone(),
            mask,
        };
        if let Err(err) = self.tools.apply_mask(&request).await {
            tracing::warn!(map_id = %map_id, error = %err, "mask apply failed");
            let _ = tokio::fs::remove_file(&masked).await;
            let _ = self.maps.update(map_id, |record| {
                record.masked_raster = None;
                Ok(())
            });
            return Err(err);
        }

        self.maps.update(map_id, |record| {
            record.masked_raster = Some(masked.clone());
            Ok(())
        })?;
        tracing::info!(map_id = %map_id, "mask applied");
        Ok("Map masked".to_string())
    }

    /// Removes the mask and the masked raster derived from it.
    pub async fn delete(&self, map_id: Uuid) -> Result<String, WarpError> {
        let files = self.maps.update(map_id, |record| {
            record.status.ensure_mutable()?;
            let files: Vec<PathBuf> = record
                .mask
                .take()
                .into_iter()
                .chain(record.masked_raster.take())
                .collect();
            Ok(files)
        })?;
        for file in files {
            if let Err(err) = tokio::fs::remove_file(&file).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %file.display(), error = %err, "failed to remove mask file");
                }
            }
        }
        Ok("Mask deleted".to_string())
    }

    /// Saves and applies the mask, then rectifies from the masked raster.
    /// The mask never substitutes for the control point minimum.
    pub async fn save_and_warp(
        &self,
        map_id: Uuid,
        polygon: &MaskPolygon,
        options: RectifyOptions,
    ) -> Result<RectifyJob, WarpError> {
        let status = self.maps.get(map_id)?.status;
        if status.is_locked() {
            return Err(WarpError::Locked { status });
        }
        status.ensure_mutable()?;

        self.save(map_id, polygon).await?;
        self.apply(map_id).await?;
        self.rectifier.rectify(
            map_id,
            &RectifyOptions {
                use_mask: true,
                ..options
            },
        )
    }
}
