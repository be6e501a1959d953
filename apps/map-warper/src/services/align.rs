use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::gcps::{Gcp, GcpKind};
use crate::services::geotransform::{ControlPair, PolynomialFit};
use crate::services::maps::{MapRecord, MapRegistry};
use crate::services::rectify::MIN_HARD_GCPS;
use crate::services::tools::WARP_TARGET_SRS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, utoipa::ToSchema)]
pub enum AlignDirection {
    North,
    South,
    East,
    West,
}

impl AlignDirection {
    pub fn parse(value: &str) -> Result<Self, WarpError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "n" | "north" => Ok(AlignDirection::North),
            "s" | "south" => Ok(AlignDirection::South),
            "e" | "east" => Ok(AlignDirection::East),
            "w" | "west" => Ok(AlignDirection::West),
            _ => Err(WarpError::UnsupportedAlignment(value.to_string())),
        }
    }

    /// Where the destination's pixel origin lands in the source's pixel space
    /// when the destination abuts the source on this side.
    pub fn origin_offset(self, source: (u32, u32), dest: (u32, u32)) -> [f64; 2] {
        let (src_w, src_h) = (f64::from(source.0), f64::from(source.1));
        let (dest_w, dest_h) = (f64::from(dest.0), f64::from(dest.1));
        match self {
            AlignDirection::East => [src_w, 0.0],
            AlignDirection::West => [-dest_w, 0.0],
            AlignDirection::North => [0.0, -dest_h],
            AlignDirection::South => [0.0, src_h],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AlignType {
    /// Place against the source's control points on its unwarped raster.
    #[default]
    Original,
    /// Place against the source's warped footprint.
    Warped,
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct AlignRequest {
    pub source_map_id: Uuid,
    pub direction: String,
    #[serde(default)]
    pub append: bool,
    #[serde(default)]
    pub align_type: AlignType,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct AlignOutcome {
    pub direction: AlignDirection,
    pub align_type: AlignType,
    /// Destination pixel origin in source pixel space.
    #[schema(value_type = Vec<f64>)]
    pub offset: [f64; 2],
    pub srs: String,
    pub gcps: Vec<Gcp>,
}

fn corners(width: u32, height: u32) -> [[f64; 2]; 4] {
    let (w, h) = (f64::from(width), f64::from(height));
    [[0.0, 0.0], [w, 0.0], [0.0, h], [w, h]]
}

/// Geo coordinates for source-space pixels, plus the reference system they are in.
fn project_from_source(
    source: &MapRecord,
    align_type: AlignType,
    pixels: &[[f64; 2]],
) -> Result<(Vec<[f64; 2]>, String), WarpError> {
    match align_type {
        AlignType::Original => {
            let pairs: Vec<ControlPair> = source
                .gcps
                .hard_points()
                .map(|g| ControlPair {
                    pixel: [g.pixel_x, g.pixel_y],
                    geo: [g.geo_x, g.geo_y],
                })
                .collect();
            let hard = pairs.len();
            if hard < MIN_HARD_GCPS {
                return Err(WarpError::InsufficientControlPoints { hard });
            }
            let fit = PolynomialFit::fit(1, &pairs)
                .ok_or_else(|| WarpError::invalid("source control points are collinear"))?;
            let geo = pixels.iter().map(|p| fit.evaluate(*p)).collect();
            Ok((geo, source.srs.clone()))
        }
        AlignType::Warped => {
            let bounds = source
                .bbox
                .filter(|_| source.status.has_bbox())
                .ok_or(WarpError::Unavailable {
                    status: source.status,
                })?;
            let (src_w, src_h) = source.dimensions()?;
            let bbox = bounds.bbox;
            let geo = pixels
                .iter()
                .map(|[px, py]| {
                    [
                        bbox.min_x + px / f64::from(src_w) * bbox.width(),
                        bbox.max_y - py / f64::from(src_h) * bbox.height(),
                    ]
                })
                .collect();
            Ok((geo, WARP_TARGET_SRS.to_string()))
        }
    }
}

#[derive(Clone)]
pub struct AlignmentEngine {
    maps: MapRegistry,
}

impl AlignmentEngine {
    pub fn new(maps: MapRegistry) -> Self {
        Self { maps }
    }

    /// Derives hard control points for `dest_id` by abutting it against
    /// `request.source_map_id` on the requested side.
    pub fn align_with(&self, dest_id: Uuid, request: &AlignRequest) -> Result<AlignOutcome, WarpError> {
        let direction = AlignDirection::parse(&request.direction)?;
        if request.source_map_id == dest_id {
            return Err(WarpError::invalid("a map cannot be aligned against itself"));
        }
        let source = self.maps.get(request.source_map_id)?;
        let source_dims = source.dimensions()?;

        let outcome = self.maps.update(dest_id, |dest| {
            dest.status.ensure_mutable()?;
            let dest_dims = dest.dimensions()?;
            let offset = direction.origin_offset(source_dims, dest_dims);
            let dest_corners = corners(dest_dims.0, dest_dims.1);
            let in_source: Vec<[f64; 2]> = dest_corners
                .iter()
                .map(|[x, y]| [x + offset[0], y + offset[1]])
                .collect();
            let (geo, srs) = project_from_source(&source, request.align_type, &in_source)?;
            if request.append
                && !dest.gcps.is_empty()
                && !dest.srs.trim().eq_ignore_ascii_case(srs.trim())
            {
                return Err(WarpError::invalid(format!(
                    "cannot append {srs} control points to a map referenced in {}; replace them instead",
                    dest.srs
                )));
            }

            let gcps: Vec<Gcp> = dest_corners
                .iter()
                .zip(geo)
                .map(|([px, py], [gx, gy])| Gcp {
                    id: Uuid::new_v4(),
                    pixel_x: *px,
                    pixel_y: *py,
                    geo_x: gx,
                    geo_y: gy,
                    kind: GcpKind::Hard,
                })
                .collect();

            if !request.append {
                dest.gcps.clear();
            }
            dest.gcps.extend(gcps.clone());
            dest.srs = srs.clone();
            Ok(AlignOutcome {
                direction,
                align_type: request.align_type,
                offset,
                srs,
                gcps,
            })
        })?;

        tracing::info!(
            map_id = %dest_id,
            source_map_id = %request.source_map_id,
            direction = ?direction,
            align_type = ?request.align_type,
            "map aligned"
        );
        Ok(outcome)
    }
}
