use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::services::gcps::{Gcp, GcpKind, GcpStore};
use crate::services::geotransform::BoundingBox;
use crate::services::lifecycle::MapStatus;
use crate::services::maps::{GeoBounds, MapRecord, UploadedRaster, WarpedArtifacts, DEFAULT_SRS};
use crate::services::rectify::{ResampleSpec, TransformSpec};

pub fn connect_lazy(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(8))
        .connect_lazy(database_url)
        .with_context(|| format!("Failed to create lazy database pool for {database_url}"))
}

pub async fn ensure_schema(db: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS maps (
            id UUID PRIMARY KEY,
            title TEXT NOT NULL,
            description TEXT,
            status TEXT,
            transform_options TEXT NOT NULL DEFAULT 'auto',
            resample_options TEXT NOT NULL DEFAULT 'near',
            srs TEXT NOT NULL DEFAULT 'EPSG:4326',
            bbox_min_x DOUBLE PRECISION,
            bbox_min_y DOUBLE PRECISION,
            bbox_max_x DOUBLE PRECISION,
            bbox_max_y DOUBLE PRECISION,
            bbox_srid INTEGER,
            upload_path TEXT,
            upload_width INTEGER,
            upload_height INTEGER,
            mask_path TEXT,
            masked_raster_path TEXT,
            warped_path TEXT,
            warped_aux_path TEXT,
            revision BIGINT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create maps table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS map_gcps (
            id UUID PRIMARY KEY,
            map_id UUID NOT NULL REFERENCES maps(id) ON DELETE CASCADE,
            position INTEGER NOT NULL,
            pixel_x DOUBLE PRECISION NOT NULL,
            pixel_y DOUBLE PRECISION NOT NULL,
            geo_x DOUBLE PRECISION NOT NULL,
            geo_y DOUBLE PRECISION NOT NULL,
            kind TEXT NOT NULL DEFAULT 'hard'
        )
        "#,
    )
    .execute(db)
    .await
    .context("failed to create map_gcps table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS map_gcps_map_id_idx ON map_gcps (map_id, position)")
        .execute(db)
        .await
        .context("failed to create map_gcps index")?;
    Ok(())
}

#[derive(sqlx::FromRow)]
struct MapRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    status: Option<String>,
    transform_options: String,
    resample_options: String,
    srs: String,
    bbox_min_x: Option<f64>,
    bbox_min_y: Option<f64>,
    bbox_max_x: Option<f64>,
    bbox_max_y: Option<f64>,
    bbox_srid: Option<i32>,
    upload_path: Option<String>,
    upload_width: Option<i32>,
    upload_height: Option<i32>,
    mask_path: Option<String>,
    masked_raster_path: Option<String>,
    warped_path: Option<String>,
    warped_aux_path: Option<String>,
    revision: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct GcpRow {
    id: Uuid,
    map_id: Uuid,
    pixel_x: f64,
    pixel_y: f64,
    geo_x: f64,
    geo_y: f64,
    kind: String,
}

impl MapRow {
    fn into_record(self, gcps: Vec<Gcp>) -> MapRecord {
        let status = MapStatus::from_db(self.status.as_deref());
        let bbox = match (
            self.bbox_min_x,
            self.bbox_min_y,
            self.bbox_max_x,
            self.bbox_max_y,
        ) {
            (Some(min_x), Some(min_y), Some(max_x), Some(max_y)) if status.has_bbox() => {
                Some(GeoBounds {
                    bbox: BoundingBox::new(min_x, min_y, max_x, max_y),
                    srid: self.bbox_srid.unwrap_or(4326),
                })
            }
            _ => None,
        };
        let upload = match (self.upload_path, self.upload_width, self.upload_height) {
            (Some(path), Some(width), Some(height)) if width > 0 && height > 0 => {
                Some(UploadedRaster {
                    path: PathBuf::from(path),
                    width: width as u32,
                    height: height as u32,
                })
            }
            _ => None,
        };
        // A warped state without its footprint cannot be served.
        let status = if status.has_bbox() && bbox.is_none() {
            MapStatus::Failed
        } else {
            status
        };
        MapRecord {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            transform_options: TransformSpec::parse(&self.transform_options),
            resample_options: ResampleSpec::parse(&self.resample_options),
            srs: if self.srs.trim().is_empty() {
                DEFAULT_SRS.to_string()
            } else {
                self.srs
            },
            bbox,
            upload,
            gcps: GcpStore::from_points(gcps),
            mask: self.mask_path.map(PathBuf::from),
            masked_raster: self.masked_raster_path.map(PathBuf::from),
            warped: self.warped_path.map(|raster| WarpedArtifacts {
                raster: PathBuf::from(raster),
                aux: self.warped_aux_path.map(PathBuf::from),
            }),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

pub async fn load_maps(db: &PgPool) -> Result<Vec<MapRecord>> {
    let rows: Vec<MapRow> = sqlx::query_as(
        r#"
        SELECT id, title, description, status, transform_options, resample_options, srs,
               bbox_min_x, bbox_min_y, bbox_max_x, bbox_max_y, bbox_srid,
               upload_path, upload_width, upload_height,
               mask_path, masked_raster_path, warped_path, warped_aux_path,
               revision, created_at, updated_at
        FROM maps
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(db)
    .await
    .context("failed to load maps")?;

    let gcp_rows: Vec<GcpRow> = sqlx::query_as(
        r#"
        SELECT id, map_id, pixel_x, pixel_y, geo_x, geo_y, kind
        FROM map_gcps
        ORDER BY map_id, position ASC
        "#,
    )
    .fetch_all(db)
    .await
    .context("failed to load map gcps")?;

    let mut by_map: std::collections::HashMap<Uuid, Vec<Gcp>> = std::collections::HashMap::new();
    for row in gcp_rows {
        by_map.entry(row.map_id).or_default().push(Gcp {
            id: row.id,
            pixel_x: row.pixel_x,
            pixel_y: row.pixel_y,
            geo_x: row.geo_x,
            geo_y: row.geo_y,
            kind: GcpKind::from_db(&row.kind),
        });
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let gcps = by_map.remove(&row.id).unwrap_or_default();
            row.into_record(gcps)
        })
        .collect())
}

fn path_text(path: Option<&PathBuf>) -> Option<String> {
    path.map(|p| p.to_string_lossy().into_owned())
}

/// Upserts the map and rewrites its control points. Older revisions never
/// overwrite newer ones.
pub async fn save_map(db: &PgPool, record: &MapRecord) -> Result<()> {
    let mut tx = db.begin().await.context("failed to begin map save")?;
    let bbox = record.bbox.map(|b| b.bbox);
    let result = sqlx::query(
        r#"
        INSERT INTO maps (
            id, title, description, status, transform_options, resample_options, srs,
            bbox_min_x, bbox_min_y, bbox_max_x, bbox_max_y, bbox_srid,
            upload_path, upload_width, upload_height,
            mask_path, masked_raster_path, warped_path, warped_aux_path,
            revision, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            description = EXCLUDED.description,
            status = EXCLUDED.status,
            transform_options = EXCLUDED.transform_options,
            resample_options = EXCLUDED.resample_options,
            srs = EXCLUDED.srs,
            bbox_min_x = EXCLUDED.bbox_min_x,
            bbox_min_y = EXCLUDED.bbox_min_y,
            bbox_max_x = EXCLUDED.bbox_max_x,
            bbox_max_y = EXCLUDED.bbox_max_y,
            bbox_srid = EXCLUDED.bbox_srid,
            upload_path = EXCLUDED.upload_path,
            upload_width = EXCLUDED.upload_width,
            upload_height = EXCLUDED.upload_height,
            mask_path = EXCLUDED.mask_path,
            masked_raster_path = EXCLUDED.masked_raster_path,
            warped_path = EXCLUDED.warped_path,
            warped_aux_path = EXCLUDED.warped_aux_path,
            revision = EXCLUDED.revision,
            updated_at = EXCLUDED.updated_at
        WHERE maps.revision <= EXCLUDED.revision
        "#,
    )
    .bind(record.id)
    .bind(&record.title)
    .bind(record.description.as_deref())
    .bind(record.status.as_str())
    .bind(record.transform_options.as_str())
    .bind(record.resample_options.as_str())
    .bind(&record.srs)
    .bind(bbox.map(|b| b.min_x))
    .bind(bbox.map(|b| b.min_y))
    .bind(bbox.map(|b| b.max_x))
    .bind(bbox.map(|b| b.max_y))
    .bind(record.bbox.map(|b| b.srid))
    .bind(path_text(record.upload.as_ref().map(|u| &u.path)))
    .bind(record.upload.as_ref().map(|u| u.width as i32))
    .bind(record.upload.as_ref().map(|u| u.height as i32))
    .bind(path_text(record.mask.as_ref()))
    .bind(path_text(record.masked_raster.as_ref()))
    .bind(path_text(record.warped.as_ref().map(|w| &w.raster)))
    .bind(path_text(record.warped.as_ref().and_then(|w| w.aux.as_ref())))
    .bind(record.revision)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut *tx)
    .await
    .context("failed to upsert map")?;

    if result.rows_affected() == 0 {
        // A newer revision is already stored.
        tx.rollback().await.ok();
        return Ok(());
    }

    sqlx::query("DELETE FROM map_gcps WHERE map_id = $1")
        .bind(record.id)
        .execute(&mut *tx)
        .await
        .context("failed to clear map gcps")?;
    for (position, gcp) in record.gcps.points().iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO map_gcps (id, map_id, position, pixel_x, pixel_y, geo_x, geo_y, kind)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(gcp.id)
        .bind(record.id)
        .bind(position as i32)
        .bind(gcp.pixel_x)
        .bind(gcp.pixel_y)
        .bind(gcp.geo_x)
        .bind(gcp.geo_y)
        .bind(gcp.kind.as_str())
        .execute(&mut *tx)
        .await
        .context("failed to insert map gcp")?;
    }

    tx.commit().await.context("failed to commit map save")?;
    Ok(())
}

pub async fn delete_map(db: &PgPool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM maps WHERE id = $1")
        .bind(id)
        .execute(db)
        .await
        .context("failed to delete map")?;
    Ok(())
}
